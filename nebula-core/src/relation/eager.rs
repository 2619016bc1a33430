use std::collections::{HashMap, HashSet};

use futures_util::future::BoxFuture;

use super::{Related, RelationDescriptor, RelationKind, related_query};
use crate::error::NebulaResult;
use crate::executor::Executor;
use crate::model::Entity;
use crate::value::Value;

/// Relations to load after a fetch, each with the plan for its own children.
///
/// `"comments.author"` loads `comments`, then `author` on every loaded
/// comment. The first path segment may list siblings: `"tags,comments.author"`
/// loads `author` under both `tags` and `comments`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EagerLoadPlan {
    relations: Vec<(String, EagerLoadPlan)>,
}

impl EagerLoadPlan {
    pub fn parse(path: &str) -> Self {
        let mut plan = Self::default();
        let path = path.trim();
        if path.is_empty() {
            return plan;
        }
        let (heads, rest) = match path.split_once('.') {
            Some((heads, rest)) => (heads, rest),
            None => (path, ""),
        };
        for head in heads.split(',').map(str::trim).filter(|head| !head.is_empty()) {
            plan.push(head.to_owned(), Self::parse(rest));
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn relations(&self) -> &[(String, EagerLoadPlan)] {
        &self.relations
    }

    /// Adds a relation, merging its nested plan into an existing entry.
    pub fn push(&mut self, name: String, nested: EagerLoadPlan) {
        match self.relations.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, existing)) => existing.merge(nested),
            None => self.relations.push((name, nested)),
        }
    }

    pub fn merge(&mut self, other: EagerLoadPlan) {
        for (name, nested) in other.relations {
            self.push(name, nested);
        }
    }
}

/// Loads `plan` onto `entities`, which must share one entity type.
///
/// Each relation costs one query per plan level (one per target class for
/// morphTo), however many entities there are.
pub(crate) fn load_many<'a>(
    executor: &'a Executor,
    entities: &'a mut [Entity],
    plan: &'a EagerLoadPlan,
) -> BoxFuture<'a, NebulaResult<()>> {
    Box::pin(async move {
        let Some(ty) = entities.first().map(Entity::entity_type) else {
            return Ok(());
        };
        for (name, nested) in &plan.relations {
            let descriptor = ty.relation(name)?;
            if descriptor.kind() == RelationKind::MorphTo {
                load_morph(executor, entities, descriptor, nested).await?;
            } else {
                load_keyed(executor, entities, descriptor, nested).await?;
            }
        }
        Ok(())
    })
}

/// Like [`load_many`], but relations already cached on every entity are kept
/// and only their nested plans are applied to the cached children.
pub(crate) fn load_missing<'a>(
    executor: &'a Executor,
    entities: &'a mut [Entity],
    plan: &'a EagerLoadPlan,
) -> BoxFuture<'a, NebulaResult<()>> {
    Box::pin(async move {
        let mut pending = EagerLoadPlan::default();
        for (name, nested) in &plan.relations {
            if !entities.iter().all(|entity| entity.relation(name).is_some()) {
                pending.push(name.clone(), nested.clone());
            } else if !nested.is_empty() {
                load_cached(executor, entities, name, nested).await?;
            }
        }
        if pending.is_empty() {
            return Ok(());
        }
        load_many(executor, entities, &pending).await
    })
}

enum Cached {
    Many(Vec<(usize, usize)>),
    One((usize, usize)),
    Untouched(Option<Related>),
}

/// Applies `nested` to the children cached under `name`, batched per entity
/// type, and puts every child back where it was.
fn load_cached<'a>(
    executor: &'a Executor,
    entities: &'a mut [Entity],
    name: &'a str,
    nested: &'a EagerLoadPlan,
) -> BoxFuture<'a, NebulaResult<()>> {
    Box::pin(async move {
        let mut groups: Vec<Vec<Entity>> = Vec::new();
        let cached: Vec<Cached> = entities
            .iter_mut()
            .map(|entity| match entity.forget_relation(name) {
                Some(Related::Many(items)) => Cached::Many(
                    items
                        .into_vec()
                        .into_iter()
                        .map(|child| stash(&mut groups, child))
                        .collect(),
                ),
                Some(Related::One(Some(child))) => Cached::One(stash(&mut groups, *child)),
                other => Cached::Untouched(other),
            })
            .collect();

        let mut outcome = Ok(());
        for group in groups.iter_mut() {
            outcome = load_missing(executor, group, nested).await;
            if outcome.is_err() {
                break;
            }
        }

        let mut slots: Vec<Vec<Option<Entity>>> = groups
            .into_iter()
            .map(|group| group.into_iter().map(Some).collect())
            .collect();
        let mut take = |(group, index): (usize, usize)| slots[group][index].take();
        for (entity, cached) in entities.iter_mut().zip(cached) {
            let related = match cached {
                Cached::Many(positions) => Some(Related::Many(
                    positions.into_iter().filter_map(&mut take).collect(),
                )),
                Cached::One(position) => Some(Related::One(take(position).map(Box::new))),
                Cached::Untouched(related) => related,
            };
            if let Some(related) = related {
                entity.set_relation(name, related);
            }
        }
        outcome
    })
}

/// Files `child` under the group of its entity type, returning its position.
fn stash(groups: &mut Vec<Vec<Entity>>, child: Entity) -> (usize, usize) {
    let class = child.entity_type().class_name();
    let group = match groups.iter().position(|group| {
        group
            .first()
            .is_some_and(|first| first.entity_type().class_name() == class)
    }) {
        Some(group) => group,
        None => {
            groups.push(Vec::new());
            groups.len() - 1
        }
    };
    groups[group].push(child);
    (group, groups[group].len() - 1)
}

async fn load_keyed(
    executor: &Executor,
    entities: &mut [Entity],
    descriptor: &RelationDescriptor,
    nested: &EagerLoadPlan,
) -> NebulaResult<()> {
    let related = descriptor.related_type()?;
    let keys = distinct_keys(entities.iter().filter_map(|entity| entity.get(descriptor.local_key())));

    let mut children = Vec::new();
    if !keys.is_empty() {
        children = related_query(executor, descriptor, related)
            .where_in(&descriptor.filter_column(), keys)
            .fetch_entities()
            .await?;
    }
    if !nested.is_empty() && !children.is_empty() {
        load_many(executor, &mut children, nested).await?;
    }

    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (position, child) in children.iter().enumerate() {
        if let Some(key) = descriptor.child_key(child).and_then(Value::key_string) {
            index.entry(key).or_default().push(position);
        }
    }

    for entity in entities.iter_mut() {
        let matched: &[usize] = entity
            .get(descriptor.local_key())
            .and_then(Value::key_string)
            .and_then(|key| index.get(&key))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let resolved = if descriptor.kind().is_many() {
            Related::Many(matched.iter().map(|&i| children[i].clone()).collect())
        } else {
            Related::One(matched.first().map(|&i| Box::new(children[i].clone())))
        };
        entity.set_relation(descriptor.name(), resolved);
    }
    Ok(())
}

async fn load_morph(
    executor: &Executor,
    entities: &mut [Entity],
    descriptor: &RelationDescriptor,
    nested: &EagerLoadPlan,
) -> NebulaResult<()> {
    let class_column = descriptor.morph_class_column();
    let id_column = descriptor.local_key();

    let mut classes: Vec<&str> = Vec::new();
    for entity in entities.iter() {
        if let Some(class) = entity.get(&class_column).and_then(Value::as_str) {
            if !classes.contains(&class) {
                classes.push(class);
            }
        }
    }

    let mut resolved: HashMap<(String, String), Entity> = HashMap::new();
    for class in classes {
        let target = descriptor.morph_target(class)?;
        let keys = distinct_keys(
            entities
                .iter()
                .filter(|entity| entity.get(&class_column).and_then(Value::as_str) == Some(class))
                .filter_map(|entity| entity.get(id_column)),
        );
        if keys.is_empty() {
            continue;
        }
        let mut children = executor
            .entity_query(target)
            .where_in(target.primary_key(), keys)
            .fetch_entities()
            .await?;
        if !nested.is_empty() && !children.is_empty() {
            load_many(executor, &mut children, nested).await?;
        }
        for child in children {
            if let Some(key) = child.key().and_then(Value::key_string) {
                resolved.entry((class.to_owned(), key)).or_insert(child);
            }
        }
    }

    for entity in entities.iter_mut() {
        let class = entity.get(&class_column).and_then(Value::as_str);
        let key = entity.get(id_column).and_then(Value::key_string);
        let found = match (class, key) {
            (Some(class), Some(key)) => resolved.get(&(class.to_owned(), key)).cloned(),
            _ => None,
        };
        entity.set_relation(descriptor.name(), Related::One(found.map(Box::new)));
    }
    Ok(())
}

/// Non-null values in first-appearance order, deduplicated by key text.
fn distinct_keys<'v>(values: impl Iterator<Item = &'v Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .filter(|value| value.key_string().is_some_and(|key| seen.insert(key)))
        .cloned()
        .collect()
}
