use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use tracing::{info, instrument};

use crate::config::{DbMode, DbSettings};
use crate::database_ops::embedded_store::EmbeddedWarehouse;
use crate::database_ops::pg_store::PgWarehouse;
use crate::database_ops::warehouse::Warehouse;
use crate::error::{PipelineError, StoreError};
use crate::models::seed_games;
use crate::util::env::env_flag;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");
        Ok(Self { pool })
    }
}

/// Open the configured backend. Schema creation is left to [`prepare_warehouse`].
pub async fn open_warehouse(settings: &DbSettings) -> Result<Arc<dyn Warehouse>> {
    match settings.mode {
        DbMode::Embedded => {
            let wh = if settings.embedded_path.as_os_str() == ":memory:" {
                EmbeddedWarehouse::open_in_memory()
            } else {
                EmbeddedWarehouse::open(&settings.embedded_path)
            }
            .with_context(|| {
                format!("opening embedded warehouse at {}", settings.embedded_path.display())
            })?;
            Ok(Arc::new(wh))
        }
        DbMode::ClientServer => {
            let url = settings
                .url
                .as_deref()
                .context("client-server mode without a database URL")?;
            let db = Db::connect(url, settings.max_connections)
                .await
                .context("connecting to postgres warehouse")?;
            Ok(Arc::new(PgWarehouse::new(db.pool)))
        }
    }
}

/// Create tables if absent and insert missing reference games.
pub async fn prepare_warehouse(warehouse: &dyn Warehouse) -> Result<usize, PipelineError> {
    let to_pipeline = |e: StoreError| match e {
        StoreError::Schema(msg) => PipelineError::SchemaViolation(msg),
        other => PipelineError::Store(other),
    };
    warehouse.ensure_schema().await.map_err(to_pipeline)?;
    let seeded = warehouse.seed_games(&seed_games()).await.map_err(to_pipeline)?;
    info!(backend = warehouse.backend(), seeded, "warehouse ready");
    Ok(seeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn embedded(path: PathBuf) -> DbSettings {
        DbSettings {
            mode: DbMode::Embedded,
            embedded_path: path,
            url: None,
            max_connections: 1,
        }
    }

    #[tokio::test]
    async fn prepares_an_in_memory_warehouse() {
        let wh = open_warehouse(&embedded(PathBuf::from(":memory:"))).await.unwrap();
        assert_eq!(prepare_warehouse(wh.as_ref()).await.unwrap(), 6);
        assert_eq!(prepare_warehouse(wh.as_ref()).await.unwrap(), 0);
        assert_eq!(wh.backend(), "embedded");
    }

    #[tokio::test]
    async fn creates_the_embedded_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("gaming_pipeline.sqlite");
        let wh = open_warehouse(&embedded(path.clone())).await.unwrap();
        prepare_warehouse(wh.as_ref()).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn client_server_without_url_fails() {
        let settings = DbSettings {
            mode: DbMode::ClientServer,
            embedded_path: PathBuf::new(),
            url: None,
            max_connections: 1,
        };
        assert!(open_warehouse(&settings).await.is_err());
    }
}
