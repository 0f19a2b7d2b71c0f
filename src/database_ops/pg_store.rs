//! Postgres warehouse (`DB_MODE=client_server`).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::forecasting::model::HistoryPoint;
use crate::models::{Forecast, Game, GameEvent, Match, MatchSpan, Metric, Player, PlayerStat};

use super::warehouse::{known_table, Warehouse, WriteOutcome, SNAPSHOT_MATCH_TYPE};

const SCHEMA_SQL: &str = include_str!("../../migrations/postgres/0001_warehouse.sql");

#[derive(Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// SQLSTATE class 23 is integrity-constraint violation. 42P01 undefined table,
/// 42703 undefined column, 42804 datatype mismatch.
pub(crate) fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if code.starts_with("23") {
                StoreError::Conflict(db.message().to_string())
            } else if matches!(code.as_str(), "42P01" | "42703" | "42804" | "42883") {
                StoreError::Schema(format!("{code}: {}", db.message()))
            } else {
                StoreError::Backend(format!("{code}: {}", db.message()))
            }
        }
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. } => StoreError::Schema(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

fn outcome(rows_affected: u64) -> WriteOutcome {
    if rows_affected == 1 {
        WriteOutcome::Inserted
    } else {
        WriteOutcome::Skipped
    }
}

fn history_sql(metric: Metric) -> String {
    let (value, from) = match metric {
        Metric::MatchCount => ("COUNT(*)::float8", "matches m"),
        Metric::AvgDuration => ("AVG(m.duration_minutes)::float8", "matches m"),
        Metric::ActivePlayers => (
            "COUNT(DISTINCT ps.player_id)::float8",
            "player_stats ps JOIN matches m ON m.match_id = ps.match_id",
        ),
    };
    format!(
        "SELECT (m.match_date AT TIME ZONE 'UTC')::date AS day, {value} AS value FROM {from} \
         WHERE m.game_id = $1 AND m.match_type IS DISTINCT FROM '{SNAPSHOT_MATCH_TYPE}' \
           AND m.duration_minutes IS NOT NULL \
           AND (m.match_date AT TIME ZONE 'UTC')::date BETWEEN $2 AND $3 \
         GROUP BY day ORDER BY day"
    )
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn backend(&self) -> &'static str {
        "client_server"
    }

    #[instrument(skip(self))]
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        debug!("postgres schema ensured");
        Ok(())
    }

    async fn seed_games(&self, games: &[Game]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut inserted = 0usize;
        for g in games {
            let res = sqlx::query(
                "INSERT INTO games (game_id, game_name, platform, genre) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (game_id) DO NOTHING",
            )
            .bind(&g.game_id)
            .bind(&g.game_name)
            .bind(&g.platform)
            .bind(&g.genre)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
            inserted += res.rows_affected() as usize;
        }
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(inserted)
    }

    async fn list_games(&self) -> Result<Vec<Game>, StoreError> {
        let rows = sqlx::query(
            "SELECT game_id, game_name, COALESCE(platform, '') AS platform, COALESCE(genre, '') AS genre \
             FROM games ORDER BY game_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.iter()
            .map(|row| -> Result<Game, sqlx::Error> {
                Ok(Game {
                    game_id: row.try_get("game_id")?,
                    game_name: row.try_get("game_name")?,
                    platform: row.try_get("platform")?,
                    genre: row.try_get("genre")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sqlx_err)
    }

    async fn game_exists(&self, game_id: &str) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM games WHERE game_id = $1)")
            .bind(game_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }

    async fn player_exists(&self, player_id: &str) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM players WHERE player_id = $1)")
            .bind(player_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }

    async fn upsert_player(&self, player: &Player) -> Result<WriteOutcome, StoreError> {
        // No row back means the username was already current.
        let inserted = sqlx::query_scalar::<_, bool>(
            "INSERT INTO players (player_id, username, game_id, platform_id) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (player_id) DO UPDATE SET username = EXCLUDED.username \
             WHERE players.username IS DISTINCT FROM EXCLUDED.username \
             RETURNING (xmax = 0)",
        )
        .bind(&player.player_id)
        .bind(&player.username)
        .bind(&player.game_id)
        .bind(&player.platform_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(match inserted {
            None => WriteOutcome::Skipped,
            Some(true) => WriteOutcome::Inserted,
            Some(false) => WriteOutcome::Updated,
        })
    }

    async fn insert_match(&self, m: &Match) -> Result<WriteOutcome, StoreError> {
        let res = sqlx::query(
            "INSERT INTO matches (match_id, game_id, match_date, duration_minutes, match_type, platform, source, additional_data) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (match_id) DO NOTHING",
        )
        .bind(&m.match_id)
        .bind(&m.game_id)
        .bind(m.match_date)
        .bind(m.duration_minutes as i32)
        .bind(&m.match_type)
        .bind(&m.platform)
        .bind(&m.source)
        .bind(Json(&m.additional_data))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(outcome(res.rows_affected()))
    }

    async fn match_span(&self, match_id: &str) -> Result<Option<MatchSpan>, StoreError> {
        let row = sqlx::query(
            "SELECT match_date, COALESCE(duration_minutes, 0)::bigint AS duration_minutes \
             FROM matches WHERE match_id = $1",
        )
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.map(|row| -> Result<MatchSpan, sqlx::Error> {
            let start: DateTime<Utc> = row.try_get("match_date")?;
            let duration_minutes: i64 = row.try_get("duration_minutes")?;
            Ok(MatchSpan {
                start,
                duration_minutes,
            })
        })
        .transpose()
        .map_err(map_sqlx_err)
    }

    async fn insert_player_stat(&self, stat: &PlayerStat) -> Result<WriteOutcome, StoreError> {
        let res = sqlx::query(
            "INSERT INTO player_stats (stat_id, player_id, match_id, kills, deaths, assists, score, rank, additional_stats) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT DO NOTHING",
        )
        .bind(&stat.stat_id)
        .bind(&stat.player_id)
        .bind(&stat.match_id)
        .bind(stat.kills as i32)
        .bind(stat.deaths as i32)
        .bind(stat.assists as i32)
        .bind(stat.score)
        .bind(stat.rank.map(|r| r as i32))
        .bind(Json(&stat.additional_stats))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(outcome(res.rows_affected()))
    }

    async fn insert_game_event(&self, event: &GameEvent) -> Result<WriteOutcome, StoreError> {
        let res = sqlx::query(
            "INSERT INTO game_events (event_id, match_id, game_id, event_type, event_timestamp, event_data) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(&event.event_id)
        .bind(&event.match_id)
        .bind(&event.game_id)
        .bind(&event.event_type)
        .bind(event.event_timestamp)
        .bind(Json(&event.event_data))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(outcome(res.rows_affected()))
    }

    async fn daily_history(
        &self,
        game_id: &str,
        metric: Metric,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<HistoryPoint>, StoreError> {
        let rows = sqlx::query(&history_sql(metric))
            .bind(game_id)
            .bind(since)
            .bind(until)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let day: NaiveDate = row.try_get("day").map_err(map_sqlx_err)?;
            let value: Option<f64> = row.try_get("value").map_err(map_sqlx_err)?;
            if let Some(value) = value {
                out.push(HistoryPoint::new(day, value));
            }
        }
        Ok(out)
    }

    async fn upsert_forecast(&self, f: &Forecast) -> Result<WriteOutcome, StoreError> {
        let inserted = sqlx::query_scalar::<_, bool>(
            "INSERT INTO forecasts (forecast_id, game_id, forecast_date, predicted_metric, predicted_value, \
                 confidence_interval_lower, confidence_interval_upper, model_version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (game_id, forecast_date, predicted_metric, model_version) DO UPDATE SET \
                 predicted_value = EXCLUDED.predicted_value, \
                 confidence_interval_lower = EXCLUDED.confidence_interval_lower, \
                 confidence_interval_upper = EXCLUDED.confidence_interval_upper, \
                 created_at = now() \
             RETURNING (xmax = 0)",
        )
        .bind(&f.forecast_id)
        .bind(&f.game_id)
        .bind(f.forecast_date)
        .bind(&f.predicted_metric)
        .bind(f.predicted_value)
        .bind(f.confidence_interval_lower)
        .bind(f.confidence_interval_upper)
        .bind(&f.model_version)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(if inserted {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::Updated
        })
    }

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        let table = known_table(table)?;
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*)::bigint FROM {table}"))
            .persistent(false)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }
}
