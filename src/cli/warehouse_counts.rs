use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use crate::config::DbSettings;
use crate::database_ops::warehouse::{Warehouse, TABLES};
use crate::error::StoreError;
use crate::util::db::open_warehouse;

#[derive(Debug, Clone, Default)]
pub struct WarehouseCountsConfig {
    /// Optional override for the client-server connection string.
    pub database_url: Option<String>,
    /// Emit JSON instead of the aligned text table.
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCount {
    pub table: &'static str,
    /// `None` when the table does not exist.
    pub rows: Option<i64>,
}

/// Row count per warehouse table. A missing table is reported, not raised.
pub async fn collect(warehouse: &dyn Warehouse) -> Result<Vec<TableCount>, StoreError> {
    let mut out = Vec::with_capacity(TABLES.len());
    for table in TABLES {
        let rows = match warehouse.count_rows(table).await {
            Ok(n) => Some(n),
            Err(StoreError::Schema(msg)) => {
                warn!(table, error = %msg, "table missing");
                None
            }
            Err(e) => return Err(e),
        };
        out.push(TableCount { table, rows });
    }
    Ok(out)
}

pub fn render(counts: &[TableCount], backend: &str) -> String {
    let mut out = format!("warehouse ({backend})\n");
    for c in counts {
        let rows = c
            .rows
            .map(|n| n.to_string())
            .unwrap_or_else(|| "missing".to_string());
        out.push_str(&format!("  {:<14} {:>10}\n", c.table, rows));
    }
    out
}

pub async fn run(cfg: WarehouseCountsConfig) -> Result<()> {
    crate::util::env::init_env();
    let mut settings = DbSettings::from_env()?;
    if let Some(url) = cfg.database_url {
        settings.mode = crate::config::DbMode::ClientServer;
        settings.url = Some(url);
    }
    let warehouse = open_warehouse(&settings).await?;
    let counts = collect(warehouse.as_ref()).await?;
    if cfg.json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
    } else {
        print!("{}", render(&counts, warehouse.backend()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::embedded_store::EmbeddedWarehouse;
    use crate::models::seed_games;

    #[tokio::test]
    async fn missing_tables_are_reported_not_raised() {
        let wh = EmbeddedWarehouse::open_in_memory().unwrap();
        let counts = collect(&wh).await.unwrap();
        assert_eq!(counts.len(), 6);
        assert!(counts.iter().all(|c| c.rows.is_none()));
        assert!(render(&counts, "embedded").contains("missing"));
    }

    #[tokio::test]
    async fn counts_seeded_games() {
        let wh = EmbeddedWarehouse::open_in_memory().unwrap();
        wh.ensure_schema().await.unwrap();
        wh.seed_games(&seed_games()).await.unwrap();
        let counts = collect(&wh).await.unwrap();
        assert_eq!(counts[0], TableCount { table: "games", rows: Some(6) });
        assert_eq!(counts[5].rows, Some(0));
    }
}
