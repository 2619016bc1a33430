use std::collections::HashMap;
use std::ops::Index;

use serde::Serialize;

use crate::clause::{Direction, Op};
use crate::error::{NebulaError, NebulaResult};
use crate::executor::Executor;
use crate::model::Entity;
use crate::relation::eager::{self, EagerLoadPlan};
use crate::value::{Record, Value};

/// Read access to named attributes, implemented by every collection item
/// type that can be filtered, grouped, sorted or plucked.
pub trait Attributes {
    fn attribute(&self, name: &str) -> Option<&Value>;

    /// Class name used by [`Collection::where_class`].
    fn class_name(&self) -> Option<&str> {
        None
    }

    /// JSON form without pivot data or hidden attributes.
    fn to_clean_json(&self) -> serde_json::Value;
}

impl Attributes for Record {
    fn attribute(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }

    fn to_clean_json(&self) -> serde_json::Value {
        let map = self
            .iter()
            .filter(|(column, _)| !column.starts_with("pivot."))
            .map(|(column, value)| (column.clone(), value.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl Attributes for Entity {
    fn attribute(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }

    fn class_name(&self) -> Option<&str> {
        Some(self.entity_type().class_name())
    }

    fn to_clean_json(&self) -> serde_json::Value {
        self.clean()
    }
}

/// An ordered list of rows or entities with query-like helpers.
///
/// Every derived collection (`where_eq`, `group_by`, `sort_by`, ...) is a new
/// value; the receiver is left untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Collection<T> {
    items: Vec<T>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Collection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> &[T] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn first(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn has(&self, index: usize) -> bool {
        index < self.items.len()
    }

    /// `true` when every index is present.
    pub fn has_all(&self, indexes: &[usize]) -> bool {
        indexes.iter().all(|index| self.has(*index))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_not_empty(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }
}

impl<T: Attributes + Clone> Collection<T> {
    /// One value per item; items lacking the attribute yield `Null`.
    pub fn pluck(&self, attribute: &str) -> Collection<Value> {
        self.items
            .iter()
            .map(|item| item.attribute(attribute).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// One record per item holding only the named attributes.
    pub fn pluck_many(&self, attributes: &[&str]) -> Collection<Record> {
        self.items
            .iter()
            .map(|item| {
                attributes
                    .iter()
                    .map(|name| {
                        let value = item.attribute(name).cloned().unwrap_or(Value::Null);
                        ((*name).to_owned(), value)
                    })
                    .collect()
            })
            .collect()
    }

    pub fn where_eq(&self, attribute: &str, value: impl Into<Value>) -> Collection<T> {
        let value = value.into();
        self.filter(|item| {
            item.attribute(attribute)
                .is_some_and(|actual| actual.loose_eq(&value))
        })
    }

    /// Filters by `attribute <op> value` for `=, <, >, <=, >=, !=`.
    ///
    /// Items lacking the attribute never match.
    pub fn where_op(
        &self,
        attribute: &str,
        op: &str,
        value: impl Into<Value>,
    ) -> NebulaResult<Collection<T>> {
        let op = op.parse::<Op>()?;
        if matches!(op, Op::Like) {
            return Err(NebulaError::argument(
                "`like` is not supported when filtering collections",
            ));
        }
        let value = value.into();
        Ok(self.filter(|item| {
            let Some(actual) = item.attribute(attribute) else {
                return false;
            };
            let ordering = actual.loose_cmp(&value);
            match op {
                Op::Eq => ordering.is_some_and(|o| o.is_eq()),
                Op::Ne | Op::NotEq => !ordering.is_some_and(|o| o.is_eq()),
                Op::Lt => ordering.is_some_and(|o| o.is_lt()),
                Op::Gt => ordering.is_some_and(|o| o.is_gt()),
                Op::Le => ordering.is_some_and(|o| o.is_le()),
                Op::Ge => ordering.is_some_and(|o| o.is_ge()),
                Op::Like => false,
            }
        }))
    }

    /// Partitions items by the attribute's value, in first-appearance order.
    pub fn group_by(&self, attribute: &str) -> Collection<Collection<T>> {
        let mut groups: Vec<(Value, Collection<T>)> = Vec::new();
        for item in &self.items {
            let key = item.attribute(attribute).cloned().unwrap_or(Value::Null);
            match groups.iter_mut().find(|(seen, _)| seen.loose_eq(&key)) {
                Some((_, group)) => group.push(item.clone()),
                None => groups.push((key, Collection::from(vec![item.clone()]))),
            }
        }
        groups.into_iter().map(|(_, group)| group).collect()
    }

    pub fn sort_by(&self, attribute: &str) -> Collection<T> {
        self.sorted(&[(attribute, Direction::Asc)])
    }

    pub fn sort_by_desc(&self, attribute: &str) -> Collection<T> {
        self.sorted(&[(attribute, Direction::Desc)])
    }

    /// Sorts by a primary key, ties broken by a secondary key. Stable.
    pub fn sort_by_multi(
        &self,
        primary: (&str, Direction),
        secondary: (&str, Direction),
    ) -> Collection<T> {
        self.sorted(&[primary, secondary])
    }

    /// JSON array of the items without pivot data.
    pub fn clean(&self) -> serde_json::Value {
        serde_json::Value::Array(self.items.iter().map(Attributes::to_clean_json).collect())
    }

    fn filter<F>(&self, keep: F) -> Collection<T>
    where
        F: Fn(&T) -> bool,
    {
        self.items.iter().filter(|item| keep(item)).cloned().collect()
    }

    fn sorted(&self, keys: &[(&str, Direction)]) -> Collection<T> {
        let mut items = self.items.clone();
        items.sort_by(|a, b| {
            keys.iter()
                .map(|(attribute, direction)| {
                    let ordering = Value::sort_cmp(a.attribute(attribute), b.attribute(attribute));
                    match direction {
                        Direction::Asc => ordering,
                        Direction::Desc => ordering.reverse(),
                    }
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Collection::from(items)
    }
}

impl Collection<Entity> {
    /// Entities whose type carries the given class name.
    pub fn where_class(&self, class_name: &str) -> Collection<Entity> {
        self.filter(|entity| entity.entity_type().class_name() == class_name)
    }

    /// Eager loads `relations` onto every entity with one query per relation
    /// level. Relations already loaded everywhere are kept, and nested paths
    /// are applied to their cached children.
    pub async fn load(&mut self, executor: &Executor, relations: &str) -> NebulaResult<()> {
        let plan = EagerLoadPlan::parse(relations);
        eager::load_missing(executor, &mut self.items, &plan).await
    }

    /// Keys of every entity, in order, skipping unsaved ones.
    pub fn keys(&self) -> Vec<Value> {
        self.items
            .iter()
            .filter_map(|entity| entity.key().cloned())
            .collect()
    }

    /// Indexes entities by primary key.
    pub fn key_by_primary(&self) -> HashMap<String, &Entity> {
        self.items
            .iter()
            .filter_map(|entity| Some((entity.key()?.key_string()?, entity)))
            .collect()
    }
}

impl<T> From<Vec<T>> for Collection<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items }
    }
}

impl<T> FromIterator<T> for Collection<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T> IntoIterator for Collection<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Collection<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T> Index<usize> for Collection<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        &self.items[index]
    }
}
