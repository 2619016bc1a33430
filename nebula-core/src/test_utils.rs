use crate::error::NebulaResult;
use crate::executor::Executor;

/// In-memory SQLite database for tests, optionally seeded with a schema.
pub struct MockDatabase {
    executor: Executor,
}

impl MockDatabase {
    pub async fn new_sqlite() -> NebulaResult<Self> {
        Ok(Self {
            executor: Executor::in_memory().await?,
        })
    }

    /// Runs `sql` (any number of `;` separated statements) against the database.
    pub async fn with_schema(self, sql: &str) -> NebulaResult<Self> {
        self.executor.execute_script(sql).await?;
        Ok(self)
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn into_executor(self) -> Executor {
        self.executor
    }
}
