use super::eager::{self, EagerLoadPlan};
use super::{Related, RelationKind, related_query};
use crate::error::{NebulaError, NebulaResult};
use crate::executor::Executor;
use crate::model::Entity;
use crate::query::QueryBuilder;
use crate::value::Value;

impl Entity {
    /// A query for the named relation of this entity, pre-filtered by key.
    ///
    /// The caller may chain more predicates before running it. Without a
    /// key the query matches nothing.
    pub fn related(&self, executor: &Executor, name: &str) -> NebulaResult<QueryBuilder<Entity>> {
        let descriptor = self.entity_type().relation(name)?;
        let key = self
            .get(descriptor.local_key())
            .filter(|value| !value.is_null())
            .cloned();

        let (query, filter_column) = if descriptor.kind() == RelationKind::MorphTo {
            let class = self
                .get(&descriptor.morph_class_column())
                .and_then(Value::as_str)
                .ok_or_else(|| descriptor.config_error())?;
            let target = descriptor.morph_target(class)?;
            (executor.entity_query(target), target.primary_key().to_owned())
        } else {
            let related = descriptor.related_type()?;
            (
                related_query(executor, descriptor, related),
                descriptor.filter_column(),
            )
        };

        Ok(match key {
            Some(key) => query.where_eq(&filter_column, key),
            None => query.where_in(&filter_column, Vec::<Value>::new()),
        })
    }

    /// Loads and caches relations, then returns the first one named.
    ///
    /// Accepts the same paths as [`QueryBuilder::with`]. Relations already
    /// cached are reused until [`refresh_relation`](Self::refresh_relation);
    /// nested paths still apply to their cached children.
    pub async fn load(&mut self, executor: &Executor, relations: &str) -> NebulaResult<&Related> {
        let plan = EagerLoadPlan::parse(relations);
        let Some(head) = plan.relations().first().map(|(name, _)| name.clone()) else {
            return Err(NebulaError::argument("load requires a relation name"));
        };

        eager::load_missing(executor, std::slice::from_mut(self), &plan).await?;

        self.relation(&head)
            .ok_or_else(|| NebulaError::relationship(self.entity_type().class_name(), &head))
    }

    /// Drops the cached value of `name` and loads it again.
    pub async fn refresh_relation(&mut self, executor: &Executor, name: &str) -> NebulaResult<&Related> {
        self.forget_relation(name);
        self.load(executor, name).await
    }
}
