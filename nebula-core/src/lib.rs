//! Data-access core: a fluent SQL query builder, entity hydration with dirty
//! tracking, relationship resolution with batched eager loading, and an
//! in-memory [`Collection`] type, all over SQLite through sqlx.
//!
//! ```no_run
//! use nebula_core::prelude::*;
//!
//! # async fn demo() -> NebulaResult<()> {
//! let db = Executor::connect(&DatabaseConfig::from_env()?).await?;
//! let active = db
//!     .table("users")
//!     .where_eq("status", "active")
//!     .order_by("id", Direction::Desc)
//!     .limit(10)
//!     .get()
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub use sqlx;

pub mod clause;
pub mod collection;
pub mod config;
pub mod dialect;
pub mod error;
pub mod executor;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod migrator;
pub mod model;
pub mod query;
pub mod relation;
pub mod test_utils;
pub mod value;
pub mod worker;

pub use clause::{Condition, Direction, Op};
pub use collection::{Attributes, Collection};
pub use config::DatabaseConfig;
pub use error::{NebulaError, NebulaResult};
pub use executor::{Executor, LoggedQuery};
pub use migrator::{Migration, MigrationRecord, Migrator};
pub use model::{CREATED_AT, Entity, EntityType, Model, UPDATED_AT};
pub use query::QueryBuilder;
pub use relation::{
    EagerLoadPlan, PivotTable, Related, RelationDescriptor, RelationKind, RelationRegistry,
};
pub use value::{Record, Value};
pub use worker::{
    FailedJob, Job, JobHandler, JobOutcome, JobResult, Worker, WorkerReport, dispatch,
    install_queue_tables,
};

pub mod prelude {
    pub use crate::{
        Collection, Condition, DatabaseConfig, Direction, Entity, Executor, Model, NebulaError,
        NebulaResult, QueryBuilder, Record, Related, RelationRegistry, Value, record,
    };
}
