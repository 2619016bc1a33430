use std::fmt::Write;
use std::str::FromStr;

use crate::dialect;
use crate::error::NebulaError;
use crate::value::Value;

/// Comparison operators accepted by `where` predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
    Ne,
    /// `<>`, kept distinct from `!=` so the SQL reads as written.
    NotEq,
    Like,
}

impl Op {
    pub fn as_sql(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Lt => "<",
            Op::Gt => ">",
            Op::Le => "<=",
            Op::Ge => ">=",
            Op::Ne => "!=",
            Op::NotEq => "<>",
            Op::Like => "LIKE",
        }
    }
}

impl FromStr for Op {
    type Err = NebulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" => Ok(Op::Eq),
            "<" => Ok(Op::Lt),
            ">" => Ok(Op::Gt),
            "<=" => Ok(Op::Le),
            ">=" => Ok(Op::Ge),
            "!=" => Ok(Op::Ne),
            "<>" => Ok(Op::NotEq),
            "like" => Ok(Op::Like),
            other => Err(NebulaError::argument(format!(
                "unsupported comparison operator `{}`",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Sort direction for `ORDER BY` and collection sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

impl FromStr for Direction {
    type Err = NebulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            other => Err(NebulaError::argument(format!(
                "order direction must be `asc` or `desc`, got `{}`",
                other
            ))),
        }
    }
}

/// One `[attribute, operator, value]` triple of an implicit AND group.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: String,
    pub value: Value,
}

impl Condition {
    pub fn new(column: &str, op: &str, value: impl Into<Value>) -> Self {
        Self {
            column: column.to_owned(),
            op: op.to_owned(),
            value: value.into(),
        }
    }

    /// Shorthand for the default `=` operator.
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::new(column, "=", value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Conjunction {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Predicate {
    Compare {
        column: String,
        op: Op,
        value: Value,
    },
    Null {
        column: String,
        negated: bool,
    },
    Date {
        column: String,
        value: Value,
    },
    Year {
        column: String,
        year: i64,
    },
    Between {
        column: String,
        low: Value,
        high: Value,
        negated: bool,
    },
    In {
        column: String,
        values: Vec<Value>,
        negated: bool,
    },
}

impl Predicate {
    fn render_into(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Predicate::Compare { column, op, value } => {
                let _ = write!(sql, "{} {} ?", column, op.as_sql());
                params.push(value.clone());
            }
            Predicate::Null { column, negated } => {
                let test = if *negated { "IS NOT NULL" } else { "IS NULL" };
                let _ = write!(sql, "{} {}", column, test);
            }
            Predicate::Date { column, value } => {
                dialect::write_date_of(sql, column);
                sql.push_str(" = ?");
                params.push(value.clone());
            }
            Predicate::Year { column, year } => {
                dialect::write_year_of(sql, column);
                sql.push_str(" = ?");
                params.push(Value::I64(*year));
            }
            Predicate::Between {
                column,
                low,
                high,
                negated,
            } => {
                let keyword = if *negated { "NOT BETWEEN" } else { "BETWEEN" };
                let _ = write!(sql, "{} {} ? AND ?", column, keyword);
                params.push(low.clone());
                params.push(high.clone());
            }
            Predicate::In {
                column,
                values,
                negated,
            } => {
                // An empty set matches nothing (`IN`) or everything (`NOT IN`).
                if values.is_empty() {
                    sql.push_str(if *negated { "1=1" } else { "1=0" });
                    return;
                }
                let keyword = if *negated { "NOT IN" } else { "IN" };
                let _ = write!(
                    sql,
                    "{} {} ({})",
                    column,
                    keyword,
                    dialect::placeholders(values.len())
                );
                params.extend(values.iter().cloned());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Predicate(Predicate),
    Group(Vec<Clause>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Clause {
    pub(crate) conjunction: Conjunction,
    pub(crate) node: Node,
}

/// Writes `clauses` joined by their conjunctions. The conjunction of the
/// first clause in every level is dropped.
pub(crate) fn render_clauses(clauses: &[Clause], sql: &mut String, params: &mut Vec<Value>) {
    for (i, clause) in clauses.iter().enumerate() {
        if i > 0 {
            sql.push_str(match clause.conjunction {
                Conjunction::And => " AND ",
                Conjunction::Or => " OR ",
            });
        }
        match &clause.node {
            Node::Predicate(predicate) => predicate.render_into(sql, params),
            Node::Group(children) => {
                sql.push('(');
                render_clauses(children, sql, params);
                sql.push(')');
            }
        }
    }
}

pub(crate) fn render_where(clauses: &[Clause], sql: &mut String, params: &mut Vec<Value>) {
    if clauses.is_empty() {
        return;
    }
    sql.push_str(" WHERE ");
    render_clauses(clauses, sql, params);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicate(conjunction: Conjunction, column: &str, value: i64) -> Clause {
        Clause {
            conjunction,
            node: Node::Predicate(Predicate::Compare {
                column: column.to_owned(),
                op: Op::Eq,
                value: Value::I64(value),
            }),
        }
    }

    #[test]
    fn parses_every_supported_operator() {
        for (raw, op) in [
            ("=", Op::Eq),
            ("<", Op::Lt),
            (">", Op::Gt),
            ("<=", Op::Le),
            (">=", Op::Ge),
            ("!=", Op::Ne),
            ("<>", Op::NotEq),
            ("LIKE", Op::Like),
            ("like", Op::Like),
        ] {
            assert_eq!(raw.parse::<Op>().unwrap(), op);
        }
        assert!(matches!(
            "=>".parse::<Op>(),
            Err(NebulaError::QueryArgument(_))
        ));
    }

    #[test]
    fn direction_accepts_only_asc_and_desc() {
        assert_eq!("DESC".parse::<Direction>().unwrap(), Direction::Desc);
        assert_eq!("asc".parse::<Direction>().unwrap(), Direction::Asc);
        assert!("random".parse::<Direction>().is_err());
    }

    #[test]
    fn leading_or_is_dropped() {
        let clauses = vec![
            predicate(Conjunction::Or, "a", 1),
            predicate(Conjunction::Or, "b", 2),
        ];
        let mut sql = String::new();
        let mut params = Vec::new();
        render_where(&clauses, &mut sql, &mut params);
        assert_eq!(sql, " WHERE a = ? OR b = ?");
        assert_eq!(params, vec![Value::I64(1), Value::I64(2)]);
    }

    #[test]
    fn nested_groups_keep_parameter_order() {
        let clauses = vec![
            predicate(Conjunction::And, "a", 1),
            Clause {
                conjunction: Conjunction::Or,
                node: Node::Group(vec![
                    predicate(Conjunction::And, "b", 2),
                    Clause {
                        conjunction: Conjunction::And,
                        node: Node::Group(vec![
                            predicate(Conjunction::And, "c", 3),
                            predicate(Conjunction::Or, "d", 4),
                        ]),
                    },
                ]),
            },
        ];
        let mut sql = String::new();
        let mut params = Vec::new();
        render_where(&clauses, &mut sql, &mut params);
        assert_eq!(sql, " WHERE a = ? OR (b = ? AND (c = ? OR d = ?))");
        assert_eq!(
            params,
            vec![Value::I64(1), Value::I64(2), Value::I64(3), Value::I64(4)]
        );
        assert!(!sql.contains("AND OR"));
    }

    #[test]
    fn empty_in_sets_are_constant() {
        let mut sql = String::new();
        let mut params = Vec::new();
        Predicate::In {
            column: "id".to_owned(),
            values: Vec::new(),
            negated: false,
        }
        .render_into(&mut sql, &mut params);
        sql.push_str(" | ");
        Predicate::In {
            column: "id".to_owned(),
            values: Vec::new(),
            negated: true,
        }
        .render_into(&mut sql, &mut params);
        assert_eq!(sql, "1=0 | 1=1");
        assert!(params.is_empty());
    }

    #[test]
    fn between_and_year_fragments() {
        let mut sql = String::new();
        let mut params = Vec::new();
        Predicate::Between {
            column: "age".to_owned(),
            low: Value::I64(18),
            high: Value::I64(30),
            negated: true,
        }
        .render_into(&mut sql, &mut params);
        assert_eq!(sql, "age NOT BETWEEN ? AND ?");
        sql.clear();
        Predicate::Year {
            column: "created_at".to_owned(),
            year: 2024,
        }
        .render_into(&mut sql, &mut params);
        assert_eq!(sql, "CAST(strftime('%Y', created_at) AS INTEGER) = ?");
        assert_eq!(
            params,
            vec![Value::I64(18), Value::I64(30), Value::I64(2024)]
        );
    }
}
