use crate::error::NebulaResult;
use crate::executor::Executor;
use crate::model::Model;
use crate::record;

/// One SQL migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub filename: String,
    pub sql: String,
}

impl Migration {
    pub fn new(filename: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            sql: sql.into(),
        }
    }
}

/// Row of the `migrations` bookkeeping table.
pub struct MigrationRecord;

impl Model for MigrationRecord {
    fn table_name() -> &'static str {
        "migrations"
    }
}

const CREATE_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL UNIQUE,
    created_at TEXT,
    updated_at TEXT
)";

/// Applies SQL files in filename order, each at most once.
pub struct Migrator {
    executor: Executor,
}

impl Migrator {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    pub async fn ensure_table(&self) -> NebulaResult<()> {
        self.executor.execute_script(CREATE_MIGRATIONS_TABLE).await?;
        Ok(())
    }

    /// Filenames already recorded, in application order.
    pub async fn applied(&self) -> NebulaResult<Vec<String>> {
        self.ensure_table().await?;
        let rows = MigrationRecord::query(&self.executor)
            .order_by("id", crate::Direction::Asc)
            .get()
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("filename").and_then(|v| v.as_str()).map(str::to_owned))
            .collect())
    }

    /// Runs every pending migration and returns the filenames applied.
    pub async fn run(&self, mut migrations: Vec<Migration>) -> NebulaResult<Vec<String>> {
        let applied = self.applied().await?;
        migrations.sort_by(|a, b| a.filename.cmp(&b.filename));

        let mut ran = Vec::new();
        for migration in migrations {
            if applied.contains(&migration.filename) {
                continue;
            }
            tracing::info!(
                operation = "migration_apply",
                filename = %migration.filename,
                "nebula migration"
            );
            self.executor.execute_script(&migration.sql).await?;
            MigrationRecord::create(&self.executor, record! { "filename" => migration.filename.as_str() })
                .await?;
            ran.push(migration.filename);
        }
        Ok(ran)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn applies_in_filename_order_once() {
        let executor = Executor::in_memory().await.unwrap();
        let migrator = Migrator::new(executor.clone());
        let migrations = vec![
            Migration::new(
                "002_posts.sql",
                "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id));",
            ),
            Migration::new("001_users.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);"),
        ];

        let ran = migrator.run(migrations.clone()).await.unwrap();
        assert_eq!(ran, vec!["001_users.sql", "002_posts.sql"]);
        assert_eq!(migrator.applied().await.unwrap(), ran);

        let again = migrator.run(migrations).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn failed_migrations_are_not_recorded() {
        let executor = Executor::in_memory().await.unwrap();
        let migrator = Migrator::new(executor);
        let err = migrator
            .run(vec![Migration::new("001_bad.sql", "CREATE TABLE (")])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::NebulaError::Driver { .. }));
        assert!(migrator.applied().await.unwrap().is_empty());
    }
}
