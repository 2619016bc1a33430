//! Relationship descriptors and the values they resolve to.
//!
//! Relations are declared once per model in [`Model::relations`] and looked up
//! by name afterwards. Resolution lives in the submodules: `lazy` returns a
//! pre-filtered query for one entity, `eager` batches one query per relation
//! across many entities, `pivot` mutates many-to-many join rows.

pub(crate) mod eager;
mod lazy;
mod pivot;

pub use eager::EagerLoadPlan;

use serde::{Serialize, Serializer};

use crate::collection::Collection;
use crate::dialect;
use crate::error::{NebulaError, NebulaResult};
use crate::executor::Executor;
use crate::model::{Entity, EntityType, Model};
use crate::query::QueryBuilder;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    BelongsTo,
    HasOne,
    HasMany,
    BelongsToMany,
    MorphTo,
}

impl RelationKind {
    /// `true` for kinds that resolve to a collection.
    pub fn is_many(self) -> bool {
        matches!(self, RelationKind::HasMany | RelationKind::BelongsToMany)
    }
}

/// Join table of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotTable {
    pub table: String,
    /// Pivot column holding the owner's key.
    pub local_key: String,
    /// Pivot column holding the related entity's key.
    pub related_key: String,
    /// Extra pivot columns selected alongside the keys.
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RelationDescriptor {
    owner: &'static str,
    name: String,
    kind: RelationKind,
    related: Option<fn() -> EntityType>,
    local_key: String,
    foreign_key: String,
    pivot: Option<PivotTable>,
    morph_targets: Vec<fn() -> EntityType>,
}

impl RelationDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    /// Column on the owning entity that holds the matching key.
    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    /// Column on the related table matched against [`local_key`](Self::local_key).
    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    pub fn pivot(&self) -> Option<&PivotTable> {
        self.pivot.as_ref()
    }

    /// Declares extra pivot columns to select with a many-to-many relation.
    pub fn with_pivot(&mut self, columns: &[&str]) -> &mut Self {
        if let Some(pivot) = self.pivot.as_mut() {
            pivot
                .columns
                .extend(columns.iter().map(|column| (*column).to_owned()));
        }
        self
    }

    /// Uses `column` on the owner instead of its primary key.
    pub fn using_local_key(&mut self, column: &str) -> &mut Self {
        self.local_key = column.to_owned();
        self
    }

    /// Registers a possible target type of a morphTo relation.
    pub fn target<M: Model>(&mut self) -> &mut Self {
        self.morph_targets.push(M::entity_type);
        self
    }

    pub(crate) fn related_type(&self) -> NebulaResult<EntityType> {
        self.related
            .map(|related| related())
            .ok_or_else(|| NebulaError::relationship(self.owner, &self.name))
    }

    /// `<name>_class`, the discriminator column of a morphTo relation.
    pub(crate) fn morph_class_column(&self) -> String {
        format!("{}_class", self.name)
    }

    pub(crate) fn morph_target(&self, class_name: &str) -> NebulaResult<EntityType> {
        self.morph_targets
            .iter()
            .map(|target| target())
            .find(|ty| ty.class_name() == class_name)
            .ok_or_else(|| NebulaError::relationship(self.owner, &self.name))
    }

    pub(crate) fn config_error(&self) -> NebulaError {
        NebulaError::relationship(self.owner, &self.name)
    }

    /// Column the related query filters on.
    pub(crate) fn filter_column(&self) -> String {
        match &self.pivot {
            Some(pivot) => format!("{}.{}", pivot.table, pivot.local_key),
            None => self.foreign_key.clone(),
        }
    }

    /// Value on a fetched child that points back to its owner.
    pub(crate) fn child_key<'e>(&self, child: &'e Entity) -> Option<&'e Value> {
        match &self.pivot {
            Some(pivot) => child.pivot()?.get(&pivot.local_key),
            None => child.get(&self.foreign_key),
        }
    }
}

/// Per-type relation table, filled by [`Model::relations`].
#[derive(Debug, Clone)]
pub struct RelationRegistry {
    owner: &'static str,
    owner_key: &'static str,
    relations: Vec<RelationDescriptor>,
}

impl RelationRegistry {
    pub(crate) fn new(owner: &'static str, owner_key: &'static str) -> Self {
        Self {
            owner,
            owner_key,
            relations: Vec::new(),
        }
    }

    /// The owner holds `local_key`, pointing at `M`'s primary key.
    pub fn belongs_to<M: Model>(&mut self, name: &str, local_key: &str) -> &mut RelationDescriptor {
        self.add(name, RelationKind::BelongsTo, Some(M::entity_type), local_key, M::primary_key())
    }

    /// `M` holds `foreign_key`, pointing at the owner's primary key.
    pub fn has_one<M: Model>(&mut self, name: &str, foreign_key: &str) -> &mut RelationDescriptor {
        let owner_key = self.owner_key;
        self.add(name, RelationKind::HasOne, Some(M::entity_type), owner_key, foreign_key)
    }

    pub fn has_many<M: Model>(&mut self, name: &str, foreign_key: &str) -> &mut RelationDescriptor {
        let owner_key = self.owner_key;
        self.add(name, RelationKind::HasMany, Some(M::entity_type), owner_key, foreign_key)
    }

    /// Many-to-many through `pivot_table`, whose `pivot_local` column holds
    /// the owner key and `pivot_related` the key of `M`.
    pub fn belongs_to_many<M: Model>(
        &mut self,
        name: &str,
        pivot_table: &str,
        pivot_local: &str,
        pivot_related: &str,
    ) -> &mut RelationDescriptor {
        let owner_key = self.owner_key;
        let descriptor = self.add(
            name,
            RelationKind::BelongsToMany,
            Some(M::entity_type),
            owner_key,
            M::primary_key(),
        );
        descriptor.pivot = Some(PivotTable {
            table: pivot_table.to_owned(),
            local_key: pivot_local.to_owned(),
            related_key: pivot_related.to_owned(),
            columns: Vec::new(),
        });
        descriptor
    }

    /// Polymorphic owner reference stored in `<name>_class` / `<name>_id`.
    /// Possible targets are added with [`RelationDescriptor::target`].
    pub fn morph_to(&mut self, name: &str) -> &mut RelationDescriptor {
        let local_key = format!("{}_id", name);
        self.add(name, RelationKind::MorphTo, None, &local_key, "")
    }

    pub fn get(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.iter().find(|relation| relation.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.relations.iter().map(|relation| relation.name.as_str())
    }

    fn add(
        &mut self,
        name: &str,
        kind: RelationKind,
        related: Option<fn() -> EntityType>,
        local_key: &str,
        foreign_key: &str,
    ) -> &mut RelationDescriptor {
        self.relations.retain(|relation| relation.name != name);
        let index = self.relations.len();
        self.relations.push(RelationDescriptor {
            owner: self.owner,
            name: name.to_owned(),
            kind,
            related,
            local_key: local_key.to_owned(),
            foreign_key: foreign_key.to_owned(),
            pivot: None,
            morph_targets: Vec::new(),
        });
        &mut self.relations[index]
    }
}

/// A resolved relation as cached on an [`Entity`].
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Option<Box<Entity>>),
    Many(Collection<Entity>),
}

impl Related {
    pub fn as_one(&self) -> Option<&Entity> {
        match self {
            Related::One(entity) => entity.as_deref(),
            Related::Many(_) => None,
        }
    }

    pub fn as_many(&self) -> Option<&Collection<Entity>> {
        match self {
            Related::Many(entities) => Some(entities),
            Related::One(_) => None,
        }
    }

    /// Every resolved entity, whatever the arity.
    pub fn entities(&self) -> Vec<&Entity> {
        match self {
            Related::One(entity) => entity.as_deref().into_iter().collect(),
            Related::Many(entities) => entities.iter().collect(),
        }
    }

    pub(crate) fn clean(&self) -> serde_json::Value {
        match self {
            Related::One(Some(entity)) => entity.clean(),
            Related::One(None) => serde_json::Value::Null,
            Related::Many(entities) => {
                serde_json::Value::Array(entities.iter().map(Entity::clean).collect())
            }
        }
    }
}

impl Serialize for Related {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Related::One(Some(entity)) => entity.serialize(serializer),
            Related::One(None) => serializer.serialize_none(),
            Related::Many(entities) => entities.serialize(serializer),
        }
    }
}

/// Query over `ty`, joined to the pivot table for many-to-many relations.
pub(crate) fn related_query(
    executor: &Executor,
    descriptor: &RelationDescriptor,
    ty: EntityType,
) -> QueryBuilder<Entity> {
    let query = executor.entity_query(ty);
    let Some(pivot) = descriptor.pivot() else {
        return query;
    };

    let schema = ty.schema().unwrap_or(executor.schema());
    let mut columns = vec![format!("{}.*", ty.table())];
    let pivot_columns = [&pivot.local_key, &pivot.related_key]
        .into_iter()
        .chain(pivot.columns.iter());
    for column in pivot_columns {
        columns.push(format!(
            "{}.{} AS \"{}{}\"",
            pivot.table,
            column,
            crate::model::PIVOT_PREFIX,
            column
        ));
    }
    query.select(columns).join(
        &dialect::qualified(schema, &pivot.table),
        &format!("{}.{}", pivot.table, pivot.related_key),
        "=",
        &format!("{}.{}", ty.table(), ty.primary_key()),
    )
}
