use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info, warn};

const SCHEMA_SCRIPTS: &[(&str, &str)] = &[
    (
        "001_follows.sql",
        include_str!("../../sql/schema/001_follows.sql"),
    ),
    (
        "002_subscriptions.sql",
        include_str!("../../sql/schema/002_subscriptions.sql"),
    ),
    (
        "003_polling.sql",
        include_str!("../../sql/schema/003_polling.sql"),
    ),
    (
        "004_deliveries.sql",
        include_str!("../../sql/schema/004_deliveries.sql"),
    ),
    (
        "005_credentials.sql",
        include_str!("../../sql/schema/005_credentials.sql"),
    ),
];

const INDEX_SCRIPTS: &[(&str, &str)] = &[(
    "001_indexes.sql",
    include_str!("../../sql/indexes/001_indexes.sql"),
)];

const STAGES: &[(ScriptStage, &[(&str, &str)])] = &[
    (ScriptStage::Schema, SCHEMA_SCRIPTS),
    (ScriptStage::Indexes, INDEX_SCRIPTS),
];

/// Tables that must exist before the relay can serve traffic.
const REQUIRED_TABLES: &[&str] = &[
    "desired_follows",
    "remote_subscriptions",
    "poll_checkpoints",
    "delivery_records",
    "cooldown_marks",
    "platform_credentials",
];

#[derive(Debug, Clone, Copy)]
enum ScriptStage {
    Schema,
    Indexes,
}

impl ScriptStage {
    fn label(self) -> &'static str {
        match self {
            ScriptStage::Schema => "schema",
            ScriptStage::Indexes => "indexes",
        }
    }
}

impl std::fmt::Display for ScriptStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database error executing {stage}/{script}: {source}")]
    Sql {
        stage: &'static str,
        script: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("database is missing required tables: {0:?}")]
    MissingTables(Vec<String>),
}

/// Apply every bootstrap script, stage by stage, each in its own transaction.
///
/// Scripts are idempotent so this runs on every startup.
pub async fn run(pool: &SqlitePool) -> Result<(), BootstrapError> {
    info!("running database bootstrap");

    for (stage, scripts) in STAGES {
        if scripts.is_empty() {
            debug!(stage = %stage, "no bootstrap scripts found for stage");
            continue;
        }

        info!(stage = %stage, count = scripts.len(), "applying bootstrap scripts");
        for (name, sql) in *scripts {
            apply_script(pool, *stage, name, sql).await?;
        }
    }

    Ok(())
}

/// Simple liveness check used during startup.
pub async fn ensure_liveness(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// Readiness probe: the database answers and the relay tables exist.
pub async fn ensure_readiness(pool: &SqlitePool) -> Result<(), BootstrapError> {
    let present: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(pool)
            .await
            .map_err(|source| BootstrapError::Sql {
                stage: "readiness",
                script: "sqlite_master",
                source,
            })?;

    let missing: Vec<String> = REQUIRED_TABLES
        .iter()
        .filter(|table| !present.iter().any(|name| name == *table))
        .map(|table| (*table).to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(BootstrapError::MissingTables(missing))
    }
}

async fn apply_script(
    pool: &SqlitePool,
    stage: ScriptStage,
    script: &'static str,
    sql: &str,
) -> Result<(), BootstrapError> {
    let to_error = |source| BootstrapError::Sql {
        stage: stage.label(),
        script,
        source,
    };

    let trimmed = sql.trim();
    if trimmed.is_empty() {
        warn!(stage = %stage, script, "skipping empty bootstrap script");
        return Ok(());
    }

    let mut transaction = pool.begin().await.map_err(to_error)?;

    debug!(stage = %stage, script, "executing bootstrap script");
    sqlx::raw_sql(trimmed)
        .execute(&mut *transaction)
        .await
        .map_err(to_error)?;

    transaction.commit().await.map_err(to_error)
}
