use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Mutex, OnceLock, PoisonError};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::dialect;
use crate::error::{NebulaError, NebulaResult};
use crate::executor::Executor;
use crate::query::QueryBuilder;
use crate::relation::{Related, RelationDescriptor, RelationRegistry};
use crate::value::{Record, Value};

pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";

/// Column prefix under which many-to-many queries select pivot columns.
pub(crate) const PIVOT_PREFIX: &str = "pivot.";

/// Describes one entity type: its table, keys and relations.
///
/// Implemented by zero-sized marker types; rows are carried by [`Entity`].
///
/// ```no_run
/// use nebula_core::{Model, RelationRegistry};
///
/// struct Post;
/// struct Comment;
///
/// impl Model for Post {
///     fn table_name() -> &'static str {
///         "posts"
///     }
///
///     fn relations(registry: &mut RelationRegistry) {
///         registry.has_many::<Comment>("comments", "post_id");
///     }
/// }
///
/// impl Model for Comment {
///     fn table_name() -> &'static str {
///         "comments"
///     }
/// }
/// ```
pub trait Model: Sized + 'static {
    fn table_name() -> &'static str;

    /// Name stored in morphTo discriminator columns. Defaults to the type name
    /// without its module path.
    fn class_name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    fn primary_key() -> &'static str {
        "id"
    }

    /// Overrides the executor's schema for this type.
    fn schema() -> Option<&'static str> {
        None
    }

    /// Maintain `created_at` / `updated_at` on save.
    fn timestamps() -> bool {
        true
    }

    /// Attributes left out of [`Entity::clean`].
    fn hidden() -> &'static [&'static str] {
        &[]
    }

    fn relations(_registry: &mut RelationRegistry) {}

    fn entity_type() -> EntityType {
        EntityType::of::<Self>()
    }

    fn query(executor: &Executor) -> QueryBuilder<Entity> {
        executor.entity_query(Self::entity_type())
    }

    /// An unsaved entity with every attribute marked dirty.
    fn make(attributes: Record) -> Entity {
        Entity::new(Self::entity_type(), attributes)
    }

    fn with(executor: &Executor, relations: &str) -> QueryBuilder<Entity> {
        Self::query(executor).with(relations)
    }

    fn find(
        executor: &Executor,
        id: impl Into<Value>,
    ) -> impl Future<Output = NebulaResult<Option<Entity>>> + Send {
        let query = Self::query(executor);
        let id = id.into();
        async move { query.find(id).await }
    }

    fn find_or_fail(
        executor: &Executor,
        id: impl Into<Value>,
    ) -> impl Future<Output = NebulaResult<Entity>> + Send {
        let query = Self::query(executor);
        let id = id.into();
        async move { query.find_or_fail(id).await }
    }

    /// Inserts `attributes` and returns the stored entity, key included.
    fn create(
        executor: &Executor,
        attributes: Record,
    ) -> impl Future<Output = NebulaResult<Entity>> + Send {
        let executor = executor.clone();
        let mut entity = Self::make(attributes);
        async move {
            entity.save(&executor).await?;
            Ok(entity)
        }
    }
}

#[derive(Debug)]
struct EntityMeta {
    class_name: &'static str,
    table: &'static str,
    primary_key: &'static str,
    schema: Option<&'static str>,
    timestamps: bool,
    hidden: &'static [&'static str],
    relations: RelationRegistry,
}

static ENTITY_TYPES: OnceLock<Mutex<HashMap<TypeId, &'static EntityMeta>>> = OnceLock::new();

/// Runtime handle to a [`Model`] implementation.
///
/// Built once per type and shared for the life of the process.
#[derive(Clone, Copy)]
pub struct EntityType(&'static EntityMeta);

impl EntityType {
    pub fn of<M: Model>() -> Self {
        let id = TypeId::of::<M>();
        let types = ENTITY_TYPES.get_or_init(|| Mutex::new(HashMap::new()));
        if let Some(meta) = types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
        {
            return Self(meta);
        }

        // Built outside the lock: relation declarations may touch other types.
        let mut relations = RelationRegistry::new(M::class_name(), M::primary_key());
        M::relations(&mut relations);
        let meta = EntityMeta {
            class_name: M::class_name(),
            table: M::table_name(),
            primary_key: M::primary_key(),
            schema: M::schema(),
            timestamps: M::timestamps(),
            hidden: M::hidden(),
            relations,
        };

        let mut guard = types.lock().unwrap_or_else(PoisonError::into_inner);
        let meta: &'static EntityMeta = guard
            .entry(id)
            .or_insert_with(|| Box::leak(Box::new(meta)));
        Self(meta)
    }

    pub fn class_name(self) -> &'static str {
        self.0.class_name
    }

    pub fn table(self) -> &'static str {
        self.0.table
    }

    pub fn primary_key(self) -> &'static str {
        self.0.primary_key
    }

    pub fn schema(self) -> Option<&'static str> {
        self.0.schema
    }

    pub fn timestamps(self) -> bool {
        self.0.timestamps
    }

    pub fn hidden(self) -> &'static [&'static str] {
        self.0.hidden
    }

    pub fn relations(self) -> &'static RelationRegistry {
        &self.0.relations
    }

    /// Looks a relation up by name; unknown names are a
    /// [`NebulaError::RelationshipConfig`].
    pub fn relation(self, name: &str) -> NebulaResult<&'static RelationDescriptor> {
        self.0
            .relations
            .get(name)
            .ok_or_else(|| NebulaError::relationship(self.0.class_name, name))
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for EntityType {}

impl std::fmt::Debug for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.class_name)
    }
}

/// A hydrated row of some [`Model`] with dirty tracking and a relation cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    ty: EntityType,
    attributes: Record,
    changed: BTreeSet<String>,
    relations: BTreeMap<String, Related>,
    pivot: Option<Record>,
}

impl Entity {
    /// A new, unsaved entity. Every attribute starts dirty.
    pub fn new(ty: EntityType, attributes: Record) -> Self {
        let changed = attributes.keys().cloned().collect();
        Self {
            ty,
            attributes,
            changed,
            relations: BTreeMap::new(),
            pivot: None,
        }
    }

    /// Builds a clean entity from a fetched row, moving `pivot.`-prefixed
    /// columns into the pivot record.
    pub(crate) fn hydrate(ty: EntityType, row: Record) -> Self {
        let mut attributes = Record::new();
        let mut pivot = Record::new();
        for (column, value) in row {
            if column.starts_with(PIVOT_PREFIX) {
                pivot.insert(column[PIVOT_PREFIX.len()..].to_owned(), value);
            } else {
                attributes.insert(column, value);
            }
        }
        Self {
            ty,
            attributes,
            changed: BTreeSet::new(),
            relations: BTreeMap::new(),
            pivot: (!pivot.is_empty()).then_some(pivot),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.ty
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    /// Sets an attribute and marks it dirty.
    pub fn set(&mut self, attribute: &str, value: impl Into<Value>) -> &mut Self {
        self.attributes.insert(attribute.to_owned(), value.into());
        self.changed.insert(attribute.to_owned());
        self
    }

    pub fn fill(&mut self, attributes: Record) -> &mut Self {
        for (attribute, value) in attributes {
            self.changed.insert(attribute.clone());
            self.attributes.insert(attribute, value);
        }
        self
    }

    pub fn attributes(&self) -> &Record {
        &self.attributes
    }

    /// Names of attributes set since the last save.
    pub fn changed(&self) -> &BTreeSet<String> {
        &self.changed
    }

    pub fn is_dirty(&self) -> bool {
        !self.changed.is_empty()
    }

    /// The primary key value, if the entity has one.
    pub fn key(&self) -> Option<&Value> {
        self.attributes
            .get(self.ty.primary_key())
            .filter(|value| !value.is_null())
    }

    /// Pivot columns when fetched through a many-to-many relation.
    pub fn pivot(&self) -> Option<&Record> {
        self.pivot.as_ref()
    }

    /// The cached value of a loaded relation.
    pub fn relation(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    pub fn set_relation(&mut self, name: &str, related: Related) {
        self.relations.insert(name.to_owned(), related);
    }

    pub fn forget_relation(&mut self, name: &str) -> Option<Related> {
        self.relations.remove(name)
    }

    /// Persists the entity.
    ///
    /// An entity with a key issues an UPDATE of its dirty attributes only, and
    /// nothing at all when none are dirty. An entity without a key is inserted
    /// and re-hydrated from the stored row.
    #[tracing::instrument(skip_all, fields(entity = self.ty.class_name()))]
    pub async fn save(&mut self, executor: &Executor) -> NebulaResult<()> {
        let ty = self.ty;
        match self.key().cloned() {
            Some(key) => {
                if self.changed.is_empty() {
                    return Ok(());
                }
                if ty.timestamps() && !self.changed.contains(UPDATED_AT) {
                    self.attributes
                        .insert(UPDATED_AT.to_owned(), Value::from(dialect::now_timestamp()));
                    self.changed.insert(UPDATED_AT.to_owned());
                }
                let assignments: Record = self
                    .changed
                    .iter()
                    .filter_map(|column| Some((column.clone(), self.attributes.get(column)?.clone())))
                    .collect();
                executor
                    .entity_query(ty)
                    .where_eq(ty.primary_key(), key)
                    .update_plain(assignments)
                    .await?;
            }
            None => {
                let mut row = self.attributes.clone();
                row.remove(ty.primary_key());
                if ty.timestamps() {
                    let now = Value::from(dialect::now_timestamp());
                    for column in [CREATED_AT, UPDATED_AT] {
                        if row.get(column).is_none_or(Value::is_null) {
                            row.insert(column.to_owned(), now.clone());
                        }
                    }
                }
                let stored = executor.entity_query(ty).insert_records(vec![row]).await?;
                match stored.into_iter().next() {
                    Some(stored) => self.attributes = stored,
                    None => {
                        return Err(NebulaError::argument(format!(
                            "insert into {} returned no row",
                            ty.table()
                        )));
                    }
                }
            }
        }
        self.changed.clear();
        Ok(())
    }

    /// Deletes the row by primary key.
    pub async fn delete(&self, executor: &Executor) -> NebulaResult<u64> {
        let key = self.key().cloned().ok_or_else(|| {
            NebulaError::argument(format!(
                "cannot delete an unsaved {}",
                self.ty.class_name()
            ))
        })?;
        executor
            .entity_query(self.ty)
            .where_eq(self.ty.primary_key(), key)
            .delete()
            .await
    }

    /// JSON without hidden attributes or pivot data; loaded relations are
    /// cleaned the same way.
    pub fn clean(&self) -> serde_json::Value {
        let hidden = self.ty.hidden();
        let mut map: serde_json::Map<String, serde_json::Value> = self
            .attributes
            .iter()
            .filter(|(column, _)| !hidden.contains(&column.as_str()))
            .map(|(column, value)| (column.clone(), value.to_json()))
            .collect();
        for (name, related) in &self.relations {
            map.insert(name.clone(), related.clean());
        }
        serde_json::Value::Object(map)
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.attributes.len() + usize::from(self.pivot.is_some()) + self.relations.len();
        let mut map = serializer.serialize_map(Some(len))?;
        for (column, value) in &self.attributes {
            map.serialize_entry(column, value)?;
        }
        if let Some(pivot) = &self.pivot {
            map.serialize_entry("pivot", pivot)?;
        }
        for (name, related) in &self.relations {
            map.serialize_entry(name, related)?;
        }
        map.end()
    }
}
