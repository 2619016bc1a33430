//! SQL fragments for the single supported dialect (SQLite).

use std::fmt::Write;

/// Name of the primary database of every SQLite connection.
pub const DEFAULT_SCHEMA: &str = "main";

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Storage format of `created_at` / `updated_at`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn qualified(schema: &str, table: &str) -> String {
    let mut out = String::with_capacity(schema.len() + table.len() + 1);
    out.push_str(schema);
    out.push('.');
    out.push_str(table);
    out
}

/// `?,?,?` for `count` positional parameters.
pub(crate) fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 2);
    for i in 0..count {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}

pub(crate) fn random_order() -> &'static str {
    "RANDOM()"
}

pub(crate) fn write_date_of(sql: &mut String, column: &str) {
    let _ = write!(sql, "date({})", column);
}

pub(crate) fn write_year_of(sql: &mut String, column: &str) {
    let _ = write!(sql, "CAST(strftime('%Y', {}) AS INTEGER)", column);
}

/// Aggregate that folds a key column into one JSON array, keeping each key's type.
pub(crate) fn key_list_aggregate(column: &str) -> String {
    format!("json_group_array({})", column)
}

pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
}
