use std::fmt::Write;
use std::marker::PhantomData;

use crate::clause::{Clause, Condition, Conjunction, Direction, Node, Op, Predicate, render_where};
use crate::collection::Collection;
use crate::dialect;
use crate::error::{NebulaError, NebulaResult};
use crate::executor::Executor;
use crate::model::{Entity, EntityType};
use crate::relation::eager::{self, EagerLoadPlan};
use crate::value::{Record, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinKind {
    Inner,
    Left,
    Right,
}

impl JoinKind {
    fn keyword(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
        }
    }
}

#[derive(Debug, Clone)]
struct Join {
    kind: JoinKind,
    table: String,
    first: String,
    second: String,
}

#[derive(Debug, Clone)]
enum Order {
    Column(String, Direction),
    Random,
}

/// A fluent, single-use SQL query builder.
///
/// Chain methods take the builder by value and return it; terminal methods
/// (`get`, `first`, `insert`, `update`, `delete`, aggregates) consume it, so
/// every query chain starts from fresh state.
///
/// `T` selects what rows hydrate into: [`Record`] for plain tables from
/// [`Executor::table`], [`Entity`] for model queries.
///
/// Argument errors found while chaining (an unknown operator, a join on
/// anything but `=`) are held back and returned by the terminal call.
pub struct QueryBuilder<T = Record> {
    executor: Executor,
    schema: String,
    table: String,
    primary_key: Option<String>,
    entity: Option<EntityType>,
    selects: Vec<String>,
    joins: Vec<Join>,
    frames: Vec<Vec<Clause>>,
    order: Option<Order>,
    limit: Option<u64>,
    plan: EagerLoadPlan,
    error: Option<NebulaError>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for QueryBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("table", &self.qualified_table())
            .field("sql", &self.to_sql())
            .finish()
    }
}

impl<T> QueryBuilder<T> {
    pub(crate) fn new(
        executor: Executor,
        schema: &str,
        table: &str,
        primary_key: Option<String>,
    ) -> Self {
        Self {
            executor,
            schema: schema.to_owned(),
            table: table.to_owned(),
            primary_key,
            entity: None,
            selects: Vec::new(),
            joins: Vec::new(),
            frames: vec![Vec::with_capacity(4)],
            order: None,
            limit: None,
            plan: EagerLoadPlan::default(),
            error: None,
            _marker: PhantomData,
        }
    }

    /// Replaces the selected columns. An empty list selects `*`.
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selects = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Qualifies the table with another schema (an attached database).
    pub fn connection(mut self, schema: &str) -> Self {
        self.schema = schema.to_owned();
        self
    }

    /// `column = value`.
    pub fn where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(Conjunction::And, column, Op::Eq, value.into())
    }

    /// `column <op> value`; `op` is one of `=, <, >, <=, >=, !=, <>, like`.
    pub fn where_op(self, column: &str, op: &str, value: impl Into<Value>) -> Self {
        match op.parse::<Op>() {
            Ok(op) => self.compare(Conjunction::And, column, op, value.into()),
            Err(err) => self.fail(err),
        }
    }

    pub fn or_where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(Conjunction::Or, column, Op::Eq, value.into())
    }

    pub fn or_where_op(self, column: &str, op: &str, value: impl Into<Value>) -> Self {
        match op.parse::<Op>() {
            Ok(op) => self.compare(Conjunction::Or, column, op, value.into()),
            Err(err) => self.fail(err),
        }
    }

    /// ANDs every condition inside one parenthesized group.
    pub fn where_all<I>(self, conditions: I) -> Self
    where
        I: IntoIterator<Item = Condition>,
    {
        self.group(Conjunction::And, |query| fold_conditions(query, conditions))
    }

    pub fn or_where_all<I>(self, conditions: I) -> Self
    where
        I: IntoIterator<Item = Condition>,
    {
        self.group(Conjunction::Or, |query| fold_conditions(query, conditions))
    }

    /// Collects the predicates added by `build` into a parenthesized group.
    ///
    /// ```no_run
    /// # async fn demo(db: nebula_core::Executor) {
    /// // SELECT * FROM main.users WHERE active = ? AND (role = ? OR role = ?)
    /// let query = db
    ///     .table("users")
    ///     .where_eq("active", true)
    ///     .where_group(|q| q.where_eq("role", "admin").or_where_eq("role", "owner"));
    /// # }
    /// ```
    pub fn where_group<F>(self, build: F) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        self.group(Conjunction::And, build)
    }

    pub fn or_where_group<F>(self, build: F) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        self.group(Conjunction::Or, build)
    }

    pub fn where_null(self, column: &str) -> Self {
        self.null_check(Conjunction::And, column, false)
    }

    pub fn or_where_null(self, column: &str) -> Self {
        self.null_check(Conjunction::Or, column, false)
    }

    pub fn where_not_null(self, column: &str) -> Self {
        self.null_check(Conjunction::And, column, true)
    }

    pub fn or_where_not_null(self, column: &str) -> Self {
        self.null_check(Conjunction::Or, column, true)
    }

    /// Matches the calendar date part of a date/time column.
    pub fn where_date(self, column: &str, date: impl Into<Value>) -> Self {
        let value = date.into();
        if value.is_null() {
            return self.fail(NebulaError::argument(format!(
                "where_date on `{}` requires a date",
                column
            )));
        }
        self.predicate(
            Conjunction::And,
            column,
            Predicate::Date {
                column: column.to_owned(),
                value,
            },
        )
    }

    pub fn where_year(self, column: &str, year: i64) -> Self {
        self.predicate(
            Conjunction::And,
            column,
            Predicate::Year {
                column: column.to_owned(),
                year,
            },
        )
    }

    pub fn where_between(self, column: &str, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        self.between(column, low.into(), high.into(), false)
    }

    pub fn where_not_between(
        self,
        column: &str,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.between(column, low.into(), high.into(), true)
    }

    /// `column IN (?,?,..)`. An empty set renders `1=0` and matches no rows.
    pub fn where_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.membership(column, values.into_iter().map(Into::into).collect(), false)
    }

    /// `column NOT IN (?,?,..)`. An empty set renders `1=1` and matches every row.
    pub fn where_not_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.membership(column, values.into_iter().map(Into::into).collect(), true)
    }

    pub fn join(self, table: &str, first: &str, op: &str, second: &str) -> Self {
        self.add_join(JoinKind::Inner, table, first, op, second)
    }

    pub fn left_join(self, table: &str, first: &str, op: &str, second: &str) -> Self {
        self.add_join(JoinKind::Left, table, first, op, second)
    }

    pub fn right_join(self, table: &str, first: &str, op: &str, second: &str) -> Self {
        self.add_join(JoinKind::Right, table, first, op, second)
    }

    pub fn order_by(mut self, column: &str, direction: Direction) -> Self {
        self.order = Some(Order::Column(column.to_owned(), direction));
        self
    }

    pub fn order_by_rand(mut self) -> Self {
        self.order = Some(Order::Random);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The SELECT statement this chain would run.
    pub fn to_sql(&self) -> String {
        let mut sql = String::with_capacity(128);
        let mut params = Vec::new();
        self.render_select(&mut sql, &mut params);
        sql
    }

    /// Bound parameters of [`to_sql`](Self::to_sql), in placeholder order.
    pub fn bindings(&self) -> Vec<Value> {
        let mut sql = String::with_capacity(128);
        let mut params = Vec::new();
        self.render_select(&mut sql, &mut params);
        params
    }

    /// The UPDATE statement that `update(assignments)` would run.
    pub fn to_update_sql(&self, assignments: &Record) -> String {
        self.render_update(assignments).0
    }

    /// The DELETE statement that `delete()` would run.
    pub fn to_delete_sql(&self) -> String {
        self.render_delete().0
    }

    /// Removes every row matching the current WHERE state.
    #[tracing::instrument(skip(self), fields(table = %self.table))]
    pub async fn delete(mut self) -> NebulaResult<u64> {
        self.check()?;
        let (sql, params) = self.render_delete();
        self.executor
            .execute("delete", &self.table, &sql, params)
            .await
    }

    pub async fn avg(self, column: &str) -> NebulaResult<Option<Value>> {
        self.aggregate("AVG", column).await
    }

    pub async fn max(self, column: &str) -> NebulaResult<Option<Value>> {
        self.aggregate("MAX", column).await
    }

    pub async fn min(self, column: &str) -> NebulaResult<Option<Value>> {
        self.aggregate("MIN", column).await
    }

    /// Sum of `column`, `0` when no row matches.
    pub async fn sum(self, column: &str) -> NebulaResult<Value> {
        self.sum_or(column, 0).await
    }

    pub async fn sum_or(self, column: &str, default: impl Into<Value>) -> NebulaResult<Value> {
        let default = default.into();
        Ok(self.aggregate("SUM", column).await?.unwrap_or(default))
    }

    pub async fn count(self) -> NebulaResult<i64> {
        Ok(self
            .aggregate("COUNT", "*")
            .await?
            .and_then(|value| value.as_i64())
            .unwrap_or(0))
    }

    fn compare(self, conjunction: Conjunction, column: &str, op: Op, value: Value) -> Self {
        if value.is_null() {
            return self.fail(NebulaError::argument(format!(
                "comparison on `{}` is missing a value; use where_null for NULL tests",
                column
            )));
        }
        self.predicate(
            conjunction,
            column,
            Predicate::Compare {
                column: column.to_owned(),
                op,
                value,
            },
        )
    }

    fn null_check(self, conjunction: Conjunction, column: &str, negated: bool) -> Self {
        self.predicate(
            conjunction,
            column,
            Predicate::Null {
                column: column.to_owned(),
                negated,
            },
        )
    }

    fn between(self, column: &str, low: Value, high: Value, negated: bool) -> Self {
        if low.is_null() || high.is_null() {
            return self.fail(NebulaError::argument(format!(
                "between on `{}` needs exactly two non-null bounds",
                column
            )));
        }
        self.predicate(
            Conjunction::And,
            column,
            Predicate::Between {
                column: column.to_owned(),
                low,
                high,
                negated,
            },
        )
    }

    fn membership(self, column: &str, values: Vec<Value>, negated: bool) -> Self {
        self.predicate(
            Conjunction::And,
            column,
            Predicate::In {
                column: column.to_owned(),
                values,
                negated,
            },
        )
    }

    fn predicate(self, conjunction: Conjunction, column: &str, predicate: Predicate) -> Self {
        if column.trim().is_empty() {
            return self.fail(NebulaError::argument("predicate column must not be empty"));
        }
        self.push_node(conjunction, Node::Predicate(predicate))
    }

    fn push_node(mut self, conjunction: Conjunction, node: Node) -> Self {
        if let Some(frame) = self.frames.last_mut() {
            frame.push(Clause { conjunction, node });
        }
        self
    }

    fn group<F>(mut self, conjunction: Conjunction, build: F) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        let depth = self.frames.len();
        self.frames.push(Vec::new());
        let mut built = build(self);
        if built.frames.len() <= depth {
            return built;
        }
        let children = built.frames.pop().unwrap_or_default();
        if children.is_empty() {
            return built;
        }
        built.push_node(conjunction, Node::Group(children))
    }

    fn add_join(mut self, kind: JoinKind, table: &str, first: &str, op: &str, second: &str) -> Self {
        if op.trim() != "=" {
            return self.fail(NebulaError::argument(format!(
                "join on `{}` must use `=`, got `{}`",
                table, op
            )));
        }
        self.joins.push(Join {
            kind,
            table: table.to_owned(),
            first: first.to_owned(),
            second: second.to_owned(),
        });
        self
    }

    fn fail(mut self, err: NebulaError) -> Self {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self
    }

    fn check(&mut self) -> NebulaResult<()> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn root(&self) -> &[Clause] {
        self.frames.first().map(Vec::as_slice).unwrap_or(&[])
    }

    fn qualified_table(&self) -> String {
        dialect::qualified(&self.schema, &self.table)
    }

    fn render_joins(&self, sql: &mut String) {
        for join in &self.joins {
            let _ = write!(
                sql,
                " {} {} ON {} = {}",
                join.kind.keyword(),
                join.table,
                join.first,
                join.second
            );
        }
    }

    fn render_select(&self, sql: &mut String, params: &mut Vec<Value>) {
        sql.push_str("SELECT ");
        if self.selects.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&self.selects.join(", "));
        }
        sql.push_str(" FROM ");
        sql.push_str(&self.qualified_table());
        self.render_joins(sql);
        render_where(self.root(), sql, params);

        match &self.order {
            Some(Order::Column(column, direction)) => {
                let _ = write!(sql, " ORDER BY {} {}", column, direction.as_sql());
            }
            Some(Order::Random) => {
                let _ = write!(sql, " ORDER BY {}", dialect::random_order());
            }
            None => {}
        }
        if let Some(limit) = self.limit {
            let _ = write!(sql, " LIMIT {}", limit);
        }
    }

    // SET parameters come before WHERE parameters.
    fn render_update(&self, assignments: &Record) -> (String, Vec<Value>) {
        let mut sql = String::with_capacity(128);
        let mut params = Vec::with_capacity(assignments.len());
        let _ = write!(sql, "UPDATE {} SET ", self.qualified_table());
        for (i, (column, value)) in assignments.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "{} = ?", column);
            params.push(value.clone());
        }
        render_where(self.root(), &mut sql, &mut params);
        (sql, params)
    }

    fn render_delete(&self) -> (String, Vec<Value>) {
        let mut sql = String::with_capacity(64);
        let mut params = Vec::new();
        let _ = write!(sql, "DELETE FROM {}", self.qualified_table());
        render_where(self.root(), &mut sql, &mut params);
        (sql, params)
    }

    async fn fetch_rows(mut self) -> NebulaResult<Vec<Record>> {
        self.check()?;
        let mut sql = String::with_capacity(128);
        let mut params = Vec::new();
        self.render_select(&mut sql, &mut params);
        self.executor
            .fetch_all("select", &self.table, &sql, params)
            .await
    }

    async fn aggregate(mut self, function: &str, column: &str) -> NebulaResult<Option<Value>> {
        self.check()?;
        let mut sql = String::with_capacity(128);
        let mut params = Vec::new();
        let _ = write!(
            sql,
            "SELECT {}({}) AS aggregate FROM {}",
            function,
            column,
            self.qualified_table()
        );
        self.render_joins(&mut sql);
        render_where(self.root(), &mut sql, &mut params);

        let row = self
            .executor
            .fetch_optional("aggregate", &self.table, &sql, params)
            .await?;
        Ok(row
            .and_then(|mut row| row.remove("aggregate"))
            .filter(|value| !value.is_null()))
    }

    async fn resolve_primary_key(&self) -> NebulaResult<Option<String>> {
        match &self.primary_key {
            Some(key) => Ok(Some(key.clone())),
            None => self.executor.primary_key_of(&self.schema, &self.table).await,
        }
    }

    async fn select_keys(&self, primary_key: &str, keys: Vec<Value>) -> NebulaResult<Vec<Record>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} IN ({})",
            self.qualified_table(),
            primary_key,
            dialect::placeholders(keys.len())
        );
        self.executor
            .fetch_all("select", &self.table, &sql, keys)
            .await
    }

    /// Inserts one statement per row and returns the stored rows.
    ///
    /// Keys of rows without an explicit primary key are recovered by reading
    /// the newest key right after each INSERT. A concurrent writer on the same
    /// table can slip its own row in between, so the recovered set is a best
    /// effort and not a guarantee.
    pub(crate) async fn insert_records(mut self, rows: Vec<Record>) -> NebulaResult<Vec<Record>> {
        self.check()?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let primary_key = self.resolve_primary_key().await?;
        let table = self.qualified_table();
        let mut keys = Vec::with_capacity(rows.len());

        for row in &rows {
            let (sql, params) = render_insert(&table, row)?;
            self.executor
                .execute("insert", &self.table, &sql, params)
                .await?;

            let Some(pk) = primary_key.as_deref() else {
                continue;
            };
            match row.get(pk).filter(|value| !value.is_null()) {
                Some(key) => keys.push(key.clone()),
                None => {
                    let sql = format!("SELECT {pk} FROM {table} ORDER BY {pk} desc LIMIT 1");
                    let latest = self
                        .executor
                        .fetch_optional("insert_key", &self.table, &sql, Vec::new())
                        .await?;
                    if let Some(key) = latest.and_then(|mut latest| latest.remove(pk)) {
                        keys.push(key);
                    }
                }
            }
        }

        match primary_key {
            Some(pk) if !keys.is_empty() => self.select_keys(&pk, keys).await,
            _ => Ok(rows),
        }
    }

    /// Inserts one statement per row without reading anything back.
    pub(crate) async fn insert_plain(mut self, rows: Vec<Record>) -> NebulaResult<u64> {
        self.check()?;
        let table = self.qualified_table();
        let mut affected = 0;
        for row in &rows {
            let (sql, params) = render_insert(&table, row)?;
            affected += self
                .executor
                .execute("insert", &self.table, &sql, params)
                .await?;
        }
        Ok(affected)
    }

    /// Runs one UPDATE and returns the affected rows as stored afterwards.
    ///
    /// The affected keys are captured with a `json_group_array` over the same
    /// WHERE state just before the UPDATE runs. Rows written concurrently
    /// between the two statements can be missed or reported wrongly.
    pub(crate) async fn update_records(mut self, assignments: Record) -> NebulaResult<Vec<Record>> {
        self.check()?;
        if assignments.is_empty() {
            return Err(NebulaError::argument(
                "update requires at least one assignment",
            ));
        }
        let primary_key = self.resolve_primary_key().await?;

        let mut captured = Vec::new();
        if let Some(pk) = primary_key.as_deref() {
            let mut sql = format!(
                "SELECT {} AS captured FROM {}",
                dialect::key_list_aggregate(pk),
                self.qualified_table()
            );
            let mut params = Vec::new();
            render_where(self.root(), &mut sql, &mut params);
            let row = self
                .executor
                .fetch_optional("update_keys", &self.table, &sql, params)
                .await?;
            if let Some(list) = row.as_ref().and_then(|row| row.get("captured")) {
                captured = decode_key_list(list)?;
            }
        }

        let (sql, params) = self.render_update(&assignments);
        self.executor
            .execute("update", &self.table, &sql, params)
            .await?;

        match primary_key {
            Some(pk) if !captured.is_empty() => self.select_keys(&pk, captured).await,
            _ => Ok(Vec::new()),
        }
    }

    /// Runs one UPDATE and returns the number of affected rows.
    pub(crate) async fn update_plain(mut self, assignments: Record) -> NebulaResult<u64> {
        self.check()?;
        if assignments.is_empty() {
            return Err(NebulaError::argument(
                "update requires at least one assignment",
            ));
        }
        let (sql, params) = self.render_update(&assignments);
        self.executor
            .execute("update", &self.table, &sql, params)
            .await
    }
}

impl QueryBuilder<Record> {
    #[tracing::instrument(skip(self), fields(table = %self.table))]
    pub async fn get(self) -> NebulaResult<Collection<Record>> {
        Ok(Collection::from(self.fetch_rows().await?))
    }

    pub async fn first(self) -> NebulaResult<Option<Record>> {
        Ok(self.limit(1).fetch_rows().await?.into_iter().next())
    }

    #[tracing::instrument(skip(self, rows), fields(table = %self.table, rows = rows.len()))]
    pub async fn insert(self, rows: Vec<Record>) -> NebulaResult<Collection<Record>> {
        Ok(Collection::from(self.insert_records(rows).await?))
    }

    #[tracing::instrument(skip(self, assignments), fields(table = %self.table))]
    pub async fn update(self, assignments: Record) -> NebulaResult<Collection<Record>> {
        Ok(Collection::from(self.update_records(assignments).await?))
    }
}

impl QueryBuilder<Entity> {
    pub(crate) fn for_entity(executor: Executor, schema: &str, ty: EntityType) -> Self {
        let mut query = Self::new(
            executor,
            schema,
            ty.table(),
            Some(ty.primary_key().to_owned()),
        );
        query.entity = Some(ty);
        query
    }

    /// Eager loads relations once the rows are fetched.
    ///
    /// Accepts dot paths for nested relations and comma lists for siblings:
    /// `"comments.author"`, `"tags,comments"`.
    pub fn with(mut self, relations: &str) -> Self {
        self.plan.merge(EagerLoadPlan::parse(relations));
        self
    }

    #[tracing::instrument(skip(self), fields(table = %self.table))]
    pub async fn get(mut self) -> NebulaResult<Collection<Entity>> {
        let plan = std::mem::take(&mut self.plan);
        let executor = self.executor.clone();
        let mut entities = self.fetch_entities().await?;
        if !plan.is_empty() {
            eager::load_many(&executor, &mut entities, &plan).await?;
        }
        Ok(Collection::from(entities))
    }

    pub async fn first(self) -> NebulaResult<Option<Entity>> {
        Ok(self.limit(1).get().await?.into_iter().next())
    }

    /// Looks an entity up by primary key.
    ///
    /// The key column is qualified with the table name, so a joined pivot
    /// table with its own `id` does not make the filter ambiguous.
    pub async fn find(self, id: impl Into<Value>) -> NebulaResult<Option<Entity>> {
        let primary_key = self.primary_key.as_deref().unwrap_or("id");
        let column = format!("{}.{}", self.table, primary_key);
        self.where_eq(&column, id).first().await
    }

    /// Like [`find`](Self::find) but a missing row is an
    /// [`NebulaError::EntityNotFound`].
    pub async fn find_or_fail(self, id: impl Into<Value>) -> NebulaResult<Entity> {
        let id = id.into();
        let entity = self.entity.map(|ty| ty.class_name()).unwrap_or("entity");
        let key = id.to_string();
        self.find(id)
            .await?
            .ok_or_else(|| NebulaError::EntityNotFound {
                entity: entity.to_owned(),
                key,
            })
    }

    pub async fn insert(self, rows: Vec<Record>) -> NebulaResult<Collection<Entity>> {
        let ty = self.entity_type()?;
        let stored = self.insert_records(rows).await?;
        Ok(stored
            .into_iter()
            .map(|row| Entity::hydrate(ty, row))
            .collect())
    }

    pub async fn update(self, assignments: Record) -> NebulaResult<Collection<Entity>> {
        let ty = self.entity_type()?;
        let stored = self.update_records(assignments).await?;
        Ok(stored
            .into_iter()
            .map(|row| Entity::hydrate(ty, row))
            .collect())
    }

    /// Runs the SELECT and hydrates rows without eager loading.
    pub(crate) async fn fetch_entities(self) -> NebulaResult<Vec<Entity>> {
        let ty = self.entity_type()?;
        let rows = self.fetch_rows().await?;
        Ok(rows
            .into_iter()
            .map(|row| Entity::hydrate(ty, row))
            .collect())
    }

    fn entity_type(&self) -> NebulaResult<EntityType> {
        self.entity
            .ok_or_else(|| NebulaError::argument("query is not bound to an entity type"))
    }
}

fn fold_conditions<T, I>(query: QueryBuilder<T>, conditions: I) -> QueryBuilder<T>
where
    I: IntoIterator<Item = Condition>,
{
    conditions.into_iter().fold(query, |query, condition| {
        query.where_op(&condition.column, &condition.op, condition.value)
    })
}

fn render_insert(table: &str, row: &Record) -> NebulaResult<(String, Vec<Value>)> {
    if row.is_empty() {
        return Err(NebulaError::argument("cannot insert an empty row"));
    }
    let columns: Vec<&str> = row.keys().map(String::as_str).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        dialect::placeholders(row.len())
    );
    Ok((sql, row.values().cloned().collect()))
}

fn decode_key_list(list: &Value) -> NebulaResult<Vec<Value>> {
    match list {
        Value::String(json) => serde_json::from_str::<Vec<serde_json::Value>>(json)
            .map(|keys| keys.into_iter().map(Value::from).collect())
            .map_err(|err| NebulaError::argument(format!("unreadable key list: {}", err))),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![other.clone()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    async fn executor() -> Executor {
        Executor::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn renders_basic_select() {
        let db = executor().await;
        let query = db
            .table("users")
            .connection("db")
            .where_eq("status", "active")
            .order_by("id", Direction::Desc)
            .limit(10);
        assert_eq!(
            query.to_sql(),
            "SELECT * FROM db.users WHERE status = ? ORDER BY id desc LIMIT 10"
        );
        assert_eq!(query.bindings(), vec![Value::from("active")]);
    }

    #[tokio::test]
    async fn or_where_never_emits_and_or() {
        let db = executor().await;
        let query = db
            .table("users")
            .where_eq("a", 1)
            .or_where_group(|q| q.where_eq("b", 2).where_op("c", ">", 3))
            .or_where_eq("d", 4);
        let sql = query.to_sql();
        assert_eq!(
            sql,
            "SELECT * FROM main.users WHERE a = ? OR (b = ? AND c > ?) OR d = ?"
        );
        assert!(!sql.contains("AND OR"));
        assert_eq!(
            query.bindings(),
            vec![Value::I64(1), Value::I64(2), Value::I64(3), Value::I64(4)]
        );
    }

    #[tokio::test]
    async fn leading_group_and_implicit_and_group() {
        let db = executor().await;
        let query = db
            .table("posts")
            .where_group(|q| q.where_eq("a", 1).or_where_eq("b", 2))
            .or_where_all([Condition::eq("c", 3), Condition::new("d", "<=", 4)]);
        assert_eq!(
            query.to_sql(),
            "SELECT * FROM main.posts WHERE (a = ? OR b = ?) OR (c = ? AND d <= ?)"
        );
    }

    #[tokio::test]
    async fn empty_groups_are_skipped() {
        let db = executor().await;
        let query = db.table("posts").where_group(|q| q).where_eq("a", 1);
        assert_eq!(query.to_sql(), "SELECT * FROM main.posts WHERE a = ?");
    }

    #[tokio::test]
    async fn renders_every_predicate_kind() {
        let db = executor().await;
        let query = db
            .table("events")
            .select(["id", "name"])
            .where_null("deleted_at")
            .or_where_not_null("archived_at")
            .where_date("starts_at", "2024-01-02")
            .where_year("starts_at", 2024)
            .where_between("seats", 10, 20)
            .where_not_between("price", 1.5, 9.5)
            .where_in("kind", ["a", "b"])
            .where_not_in("id", Vec::<i64>::new())
            .where_op("name", "like", "%conf%")
            .order_by_rand();
        assert_eq!(
            query.to_sql(),
            "SELECT id, name FROM main.events WHERE deleted_at IS NULL OR archived_at IS NOT NULL \
             AND date(starts_at) = ? AND CAST(strftime('%Y', starts_at) AS INTEGER) = ? \
             AND seats BETWEEN ? AND ? AND price NOT BETWEEN ? AND ? AND kind IN (?,?) \
             AND 1=1 AND name LIKE ? ORDER BY RANDOM()"
        );
        assert_eq!(query.bindings().len(), 9);
    }

    #[tokio::test]
    async fn renders_joins() {
        let db = executor().await;
        let query = db
            .table("posts")
            .join("users", "users.id", "=", "posts.user_id")
            .left_join("images", "images.post_id", "=", "posts.id")
            .right_join("tags", "tags.id", "=", "posts.tag_id");
        assert_eq!(
            query.to_sql(),
            "SELECT * FROM main.posts INNER JOIN users ON users.id = posts.user_id \
             LEFT JOIN images ON images.post_id = posts.id \
             RIGHT JOIN tags ON tags.id = posts.tag_id"
        );
    }

    #[tokio::test]
    async fn update_parameters_precede_where_parameters() {
        let db = executor().await;
        let query = db.table("users").where_eq("id", 5).limit(3);
        let sql = query.to_update_sql(&record! { "name" => "x", "age" => 3 });
        assert_eq!(sql, "UPDATE main.users SET age = ?, name = ? WHERE id = ?");
        assert_eq!(query.to_delete_sql(), "DELETE FROM main.users WHERE id = ?");
    }

    #[tokio::test]
    async fn argument_errors_surface_at_the_terminal_call() {
        let db = executor().await;
        let err = db
            .table("users")
            .where_op("id", "=>", 1)
            .get()
            .await
            .unwrap_err();
        assert!(matches!(err, NebulaError::QueryArgument(_)));

        let err = db
            .table("users")
            .join("posts", "posts.user_id", ">", "users.id")
            .delete()
            .await
            .unwrap_err();
        assert!(matches!(err, NebulaError::QueryArgument(_)));

        let err = db
            .table("users")
            .where_eq("name", Value::Null)
            .count()
            .await
            .unwrap_err();
        assert!(matches!(err, NebulaError::QueryArgument(_)));
    }

    #[test]
    fn key_lists_keep_their_types() {
        assert_eq!(
            decode_key_list(&Value::from("[1,2,30]")).unwrap(),
            vec![Value::I64(1), Value::I64(2), Value::I64(30)]
        );
        assert_eq!(
            decode_key_list(&Value::from(r#"["007","a,b"]"#)).unwrap(),
            vec![Value::from("007"), Value::from("a,b")]
        );
        assert!(decode_key_list(&Value::from("[]")).unwrap().is_empty());
        assert!(decode_key_list(&Value::Null).unwrap().is_empty());
        assert!(decode_key_list(&Value::from("1,2")).is_err());
    }

    #[test]
    fn insert_rejects_empty_rows() {
        assert!(render_insert("main.users", &Record::new()).is_err());
        let (sql, params) = render_insert("main.users", &record! { "b" => 2, "a" => 1 }).unwrap();
        assert_eq!(sql, "INSERT INTO main.users (a, b) VALUES (?,?)");
        assert_eq!(params, vec![Value::I64(1), Value::I64(2)]);
    }
}
