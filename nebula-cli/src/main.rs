use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use nebula_core::{DatabaseConfig, Executor, Migration, Migrator, Worker, install_queue_tables};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "nebula")]
#[command(about = "Nebula ORM console: migrations and the job queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending SQL migrations
    #[command(name = "db:migrate")]
    DbMigrate {
        /// Directory holding `*.sql` migration files
        #[arg(short, long, default_value = "database/migrations")]
        path: String,
        /// Database URL (falls back to DATABASE_URL)
        #[arg(short, long)]
        database: Option<String>,
    },
    /// Create the `jobs` and `failed_jobs` tables
    #[command(name = "queue:migrate")]
    QueueMigrate {
        #[arg(short, long)]
        database: Option<String>,
    },
    /// Process jobs from a queue until stopped
    #[command(name = "queue:work")]
    QueueWork {
        #[arg(default_value = "default")]
        queue: String,
        #[arg(short, long)]
        database: Option<String>,
        /// Stop after this many seconds
        #[arg(long)]
        max_runtime: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    run_cli(cli).await
}

async fn run_cli(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::DbMigrate { path, database } => {
            let executor = connect(database).await?;
            let migrations = load_migrations(Path::new(&path))?;
            if migrations.is_empty() {
                println!("No migrations found in {}", path);
                return Ok(());
            }
            let ran = Migrator::new(executor).run(migrations).await?;
            if ran.is_empty() {
                println!("Nothing to migrate.");
            }
            for filename in &ran {
                println!("Migrated: {}", filename);
            }
        }
        Commands::QueueMigrate { database } => {
            let executor = connect(database).await?;
            if install_queue_tables(&executor).await? {
                println!("Queue tables created.");
            } else {
                println!("Queue tables already exist.");
            }
        }
        Commands::QueueWork {
            queue,
            database,
            max_runtime,
        } => {
            let executor = connect(database).await?;
            let shutdown = Arc::new(AtomicBool::new(false));
            let mut worker = Worker::new(executor, &queue).with_shutdown_flag(Arc::clone(&shutdown));
            if let Some(secs) = max_runtime {
                worker = worker.max_runtime(Duration::from_secs(secs));
            }

            let listener = tokio::spawn(wait_for_shutdown(shutdown));
            let report = worker.run().await;
            listener.abort();

            let report = report?;
            println!(
                "Worker stopped: {} processed, {} failed",
                report.processed, report.failed
            );
        }
    }
    Ok(())
}

fn resolve_config(database: Option<String>) -> CliResult<DatabaseConfig> {
    let mut config = DatabaseConfig::from_env()?;
    if let Some(url) = database {
        config.url = url;
    }
    Ok(config)
}

async fn connect(database: Option<String>) -> CliResult<Executor> {
    let config = resolve_config(database)?;
    tracing::debug!(url = %config.url, schema = %config.schema, "nebula connect");
    Ok(Executor::connect(&config).await?)
}

#[cfg(unix)]
async fn wait_for_shutdown(flag: Arc<AtomicBool>) {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    tracing::info!(operation = "worker_shutdown", "nebula worker");
    flag.store(true, Ordering::SeqCst);
}

#[cfg(not(unix))]
async fn wait_for_shutdown(flag: Arc<AtomicBool>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!(operation = "worker_shutdown", "nebula worker");
    flag.store(true, Ordering::SeqCst);
}

/// Reads every `*.sql` file directly inside `dir`, sorted by filename.
/// A missing directory yields no migrations.
fn load_migrations(dir: &Path) -> CliResult<Vec<Migration>> {
    let mut migrations = Vec::new();
    if !dir.exists() {
        return Ok(migrations);
    }

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|s| s.to_str()) != Some("sql") {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().to_string();
        let sql = fs::read_to_string(path)?;
        migrations.push(Migration::new(filename, sql));
    }

    migrations.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(migrations)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{SystemTime, UNIX_EPOCH};

    use nebula_core::record;

    use super::*;

    static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn make_temp_dir() -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let count = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("nebula_cli_test_{}_{}", nanos, count));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sqlite_test_url(root: &Path) -> String {
        let db_path = root.join("test.db");
        format!("sqlite:{}", db_path.to_string_lossy().replace('\\', "/"))
    }

    fn stamped(name: &str, offset_secs: i64) -> String {
        let at = chrono::Utc::now() + chrono::Duration::seconds(offset_secs);
        format!("{}_{}.sql", at.format("%Y%m%d%H%M%S"), name)
    }

    #[test]
    fn load_migrations_empty_dir() {
        let dir = make_temp_dir();
        let migrations = load_migrations(&dir).unwrap();
        assert!(migrations.is_empty());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_migrations_sorts_by_filename() {
        let dir = make_temp_dir();
        fs::write(dir.join("002_posts.sql"), "CREATE TABLE posts (id INTEGER PRIMARY KEY);").unwrap();
        fs::write(dir.join("001_users.sql"), "CREATE TABLE users (id INTEGER PRIMARY KEY);").unwrap();

        let migrations = load_migrations(&dir).unwrap();
        let names: Vec<_> = migrations.iter().map(|m| m.filename.as_str()).collect();
        assert_eq!(names, vec!["001_users.sql", "002_posts.sql"]);
        assert!(migrations[0].sql.contains("users"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_migrations_ignores_non_sql_and_nested_files() {
        let dir = make_temp_dir();
        fs::write(dir.join("001_note.txt"), "hello").unwrap();
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested").join("002_inner.sql"), "SELECT 1;").unwrap();

        let migrations = load_migrations(&dir).unwrap();
        assert!(migrations.is_empty());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_migrations_missing_dir_returns_empty() {
        let dir = make_temp_dir();
        fs::remove_dir_all(&dir).unwrap();
        let migrations = load_migrations(&dir).unwrap();
        assert!(migrations.is_empty());
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["nebula", "db:migrate", "--path", "sql", "-d", "sqlite::memory:"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::DbMigrate { ref path, database: Some(ref url) } if path == "sql" && url == "sqlite::memory:"
        ));

        let cli = Cli::try_parse_from(["nebula", "db:migrate"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::DbMigrate { ref path, database: None } if path == "database/migrations"
        ));

        let cli = Cli::try_parse_from(["nebula", "queue:migrate"]).unwrap();
        assert!(matches!(cli.command, Commands::QueueMigrate { database: None }));

        let cli = Cli::try_parse_from(["nebula", "queue:work", "mail", "--max-runtime", "30"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::QueueWork { ref queue, max_runtime: Some(30), .. } if queue == "mail"
        ));

        let cli = Cli::try_parse_from(["nebula", "queue:work"]).unwrap();
        assert!(matches!(cli.command, Commands::QueueWork { ref queue, .. } if queue == "default"));

        assert!(Cli::try_parse_from(["nebula", "db:rollback"]).is_err());
    }

    #[test]
    fn database_flag_overrides_environment() {
        let config = resolve_config(Some("sqlite::memory:".to_owned())).unwrap();
        assert_eq!(config.url, "sqlite::memory:");
    }

    #[tokio::test]
    async fn db_migrate_applies_pending_files_once() {
        let root = make_temp_dir();
        let migrations_dir = root.join("migrations");
        fs::create_dir_all(&migrations_dir).unwrap();
        fs::write(
            migrations_dir.join(stamped("create_users", 0)),
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);",
        )
        .unwrap();
        fs::write(
            migrations_dir.join(stamped("create_posts", 1)),
            "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER);",
        )
        .unwrap();
        let url = sqlite_test_url(&root);

        for _ in 0..2 {
            run_cli(Cli {
                command: Commands::DbMigrate {
                    path: migrations_dir.to_string_lossy().to_string(),
                    database: Some(url.clone()),
                },
            })
            .await
            .unwrap();
        }

        let executor = Executor::connect(&DatabaseConfig::new(url)).await.unwrap();
        let applied = Migrator::new(executor.clone()).applied().await.unwrap();
        assert_eq!(applied.len(), 2);
        assert!(applied[0].ends_with("_create_users.sql"));
        assert_eq!(executor.table("posts").count().await.unwrap(), 0);

        executor.pool().close().await;
        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn queue_commands_install_tables_and_drain_unknown_jobs() {
        let root = make_temp_dir();
        let url = sqlite_test_url(&root);

        run_cli(Cli {
            command: Commands::QueueMigrate {
                database: Some(url.clone()),
            },
        })
        .await
        .unwrap();

        let executor = Executor::connect(&DatabaseConfig::new(url.clone())).await.unwrap();
        assert!(!install_queue_tables(&executor).await.unwrap());
        executor
            .table("jobs")
            .insert(vec![record! {
                "queue" => "default",
                "class" => "SendWelcome",
                "payload" => "{}",
                "in_process" => 0,
            }])
            .await
            .unwrap();

        run_cli(Cli {
            command: Commands::QueueWork {
                queue: "default".to_owned(),
                database: Some(url),
                max_runtime: Some(0),
            },
        })
        .await
        .unwrap();
        assert_eq!(executor.table("jobs").count().await.unwrap(), 1);

        let worker = Worker::new(executor.clone(), "default");
        assert!(worker.run_once().await.unwrap().is_some());
        assert_eq!(executor.table("jobs").count().await.unwrap(), 0);
        assert_eq!(executor.table("failed_jobs").count().await.unwrap(), 1);

        executor.pool().close().await;
        fs::remove_dir_all(&root).unwrap();
    }
}
