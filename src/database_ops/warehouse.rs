use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;

use crate::error::StoreError;
use crate::forecasting::model::HistoryPoint;
use crate::models::{Forecast, Game, GameEvent, Match, MatchSpan, Metric, Player, PlayerStat};

/// Warehouse tables in parent-before-child order.
pub const TABLES: [&str; 6] = [
    "games",
    "players",
    "matches",
    "player_stats",
    "game_events",
    "forecasts",
];

/// Outcome of a single-row write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// Row already present and unchanged.
    Skipped,
}

/// Query interface shared by the embedded and client-server backends.
///
/// Each write is atomic on its own; callers get per-row isolation by handling
/// errors row by row.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Create tables and indexes when absent.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Insert reference games that are not present yet. Returns rows inserted.
    async fn seed_games(&self, games: &[Game]) -> Result<usize, StoreError>;

    async fn list_games(&self) -> Result<Vec<Game>, StoreError>;

    async fn game_exists(&self, game_id: &str) -> Result<bool, StoreError>;

    async fn player_exists(&self, player_id: &str) -> Result<bool, StoreError>;

    /// Insert, or update the username of an existing player.
    async fn upsert_player(&self, player: &Player) -> Result<WriteOutcome, StoreError>;

    /// Insert-if-absent; an existing match is left untouched.
    async fn insert_match(&self, m: &Match) -> Result<WriteOutcome, StoreError>;

    async fn match_span(&self, match_id: &str) -> Result<Option<MatchSpan>, StoreError>;

    /// Insert-if-absent keyed by `(player_id, match_id)`.
    async fn insert_player_stat(&self, stat: &PlayerStat) -> Result<WriteOutcome, StoreError>;

    async fn insert_game_event(&self, event: &GameEvent) -> Result<WriteOutcome, StoreError>;

    /// Daily observed values for `since..=until`, ordered by date. Days with no
    /// matches are absent.
    async fn daily_history(
        &self,
        game_id: &str,
        metric: Metric,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<HistoryPoint>, StoreError>;

    /// Upsert on `(game_id, forecast_date, predicted_metric, model_version)`.
    async fn upsert_forecast(&self, forecast: &Forecast) -> Result<WriteOutcome, StoreError>;

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError>;
}

pub(crate) fn known_table(table: &str) -> Result<&'static str, StoreError> {
    TABLES
        .iter()
        .copied()
        .find(|t| *t == table)
        .ok_or_else(|| StoreError::Schema(format!("unknown table {table}")))
}

/// Matches with this type are population snapshots, not played matches.
pub(crate) const SNAPSHOT_MATCH_TYPE: &str = "population_snapshot";
