use super::{PivotTable, RelationDescriptor};
use crate::error::{NebulaError, NebulaResult};
use crate::executor::Executor;
use crate::model::Entity;
use crate::query::QueryBuilder;
use crate::value::{Record, Value};

impl Entity {
    /// Replaces the pivot rows of a many-to-many relation with `ids`.
    ///
    /// Deletes every pivot row of this owner, inserts one row per id and
    /// reloads the relation. An empty `ids` only deletes.
    pub async fn sync<I, V>(&mut self, executor: &Executor, name: &str, ids: I) -> NebulaResult<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let ids: Vec<Value> = ids.into_iter().map(Into::into).collect();
        let (descriptor, pivot, owner_key) = self.pivot_target(name)?;

        pivot_query(executor, descriptor, pivot)
            .where_eq(&pivot.local_key, owner_key.clone())
            .delete()
            .await?;

        let rows = ids
            .into_iter()
            .map(|id| pivot_row(pivot, &owner_key, id, Record::new()))
            .collect::<Vec<_>>();
        if !rows.is_empty() {
            pivot_query(executor, descriptor, pivot)
                .insert_plain(rows)
                .await?;
        }

        self.refresh_relation(executor, name).await?;
        Ok(())
    }

    /// Adds one pivot row, merging `extra` pivot columns, and reloads.
    pub async fn attach(
        &mut self,
        executor: &Executor,
        name: &str,
        id: impl Into<Value>,
        extra: Record,
    ) -> NebulaResult<()> {
        let id = id.into();
        let (descriptor, pivot, owner_key) = self.pivot_target(name)?;
        pivot_query(executor, descriptor, pivot)
            .insert_plain(vec![pivot_row(pivot, &owner_key, id, extra)])
            .await?;
        self.refresh_relation(executor, name).await?;
        Ok(())
    }

    /// Removes the pivot row linking this owner to `id`, and reloads.
    pub async fn detach(
        &mut self,
        executor: &Executor,
        name: &str,
        id: impl Into<Value>,
    ) -> NebulaResult<()> {
        let id = id.into();
        let (descriptor, pivot, owner_key) = self.pivot_target(name)?;
        pivot_query(executor, descriptor, pivot)
            .where_eq(&pivot.local_key, owner_key)
            .where_eq(&pivot.related_key, id)
            .delete()
            .await?;
        self.refresh_relation(executor, name).await?;
        Ok(())
    }

    fn pivot_target(
        &self,
        name: &str,
    ) -> NebulaResult<(&'static RelationDescriptor, &'static PivotTable, Value)> {
        let descriptor = self.entity_type().relation(name)?;
        let pivot = descriptor.pivot().ok_or_else(|| descriptor.config_error())?;
        let owner_key = self
            .get(descriptor.local_key())
            .filter(|value| !value.is_null())
            .cloned()
            .ok_or_else(|| {
                NebulaError::argument(format!(
                    "`{}` needs a saved {}",
                    name,
                    self.entity_type().class_name()
                ))
            })?;
        Ok((descriptor, pivot, owner_key))
    }
}

fn pivot_query(
    executor: &Executor,
    descriptor: &RelationDescriptor,
    pivot: &PivotTable,
) -> QueryBuilder<Record> {
    let schema = descriptor
        .related_type()
        .ok()
        .and_then(|ty| ty.schema())
        .unwrap_or(executor.schema());
    executor.table(&pivot.table).connection(schema)
}

fn pivot_row(pivot: &PivotTable, owner_key: &Value, id: Value, extra: Record) -> Record {
    let mut row = extra;
    row.insert(pivot.local_key.clone(), owner_key.clone());
    row.insert(pivot.related_key.clone(), id);
    row
}
