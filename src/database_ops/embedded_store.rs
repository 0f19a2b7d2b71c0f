//! Single-file warehouse backed by SQLite (`DB_MODE=embedded`).
//!
//! Statements run synchronously under a mutex; each call is one short
//! statement or transaction so holding the lock inside an async fn is fine.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::forecasting::model::HistoryPoint;
use crate::models::{
    ExtraFields, Forecast, Game, GameEvent, Match, MatchSpan, Metric, Player, PlayerStat,
};

use super::warehouse::{known_table, Warehouse, WriteOutcome, SNAPSHOT_MATCH_TYPE};

const SCHEMA_SQL: &str = include_str!("../../migrations/embedded/0001_warehouse.sql");

pub struct EmbeddedWarehouse {
    conn: Mutex<Connection>,
}

impl EmbeddedWarehouse {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(map_sqlite_err)?;
        apply_pragmas(&conn, true)?;
        info!(path = %path.display(), "opened embedded warehouse");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_err)?;
        apply_pragmas(&conn, false)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("embedded connection mutex poisoned".into()))
    }
}

fn apply_pragmas(conn: &Connection, on_disk: bool) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 3000;
"#,
    )
    .map_err(map_sqlite_err)?;
    if on_disk {
        // journal_mode returns a row, so it cannot go through execute_batch.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(map_sqlite_err)?;
    }
    Ok(())
}

/// Constraint failures are per-row conflicts; missing tables or columns and
/// type mismatches mean the schema is broken.
fn map_sqlite_err(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict(msg.clone().unwrap_or_else(|| err.to_string()))
        }
        rusqlite::Error::SqliteFailure(_, Some(msg))
            if msg.contains("no such table") || msg.contains("no such column") =>
        {
            StoreError::Schema(msg.clone())
        }
        rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::InvalidColumnName(_)
        | rusqlite::Error::FromSqlConversionFailure(..) => StoreError::Schema(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Schema(format!("bad stored timestamp '{raw}': {e}")))
}

fn extras_json(extras: &ExtraFields) -> Result<String, StoreError> {
    serde_json::to_string(extras).map_err(|e| StoreError::Backend(e.to_string()))
}

fn history_sql(metric: Metric) -> String {
    let (value, from) = match metric {
        Metric::MatchCount => ("CAST(COUNT(*) AS REAL)", "matches m"),
        Metric::AvgDuration => ("AVG(m.duration_minutes)", "matches m"),
        Metric::ActivePlayers => (
            "CAST(COUNT(DISTINCT ps.player_id) AS REAL)",
            "player_stats ps JOIN matches m ON m.match_id = ps.match_id",
        ),
    };
    format!(
        "SELECT substr(m.match_date, 1, 10) AS day, {value} FROM {from} \
         WHERE m.game_id = ?1 AND m.match_type IS NOT '{SNAPSHOT_MATCH_TYPE}' \
           AND m.duration_minutes IS NOT NULL \
           AND substr(m.match_date, 1, 10) BETWEEN ?2 AND ?3 \
         GROUP BY day ORDER BY day"
    )
}

#[async_trait]
impl Warehouse for EmbeddedWarehouse {
    fn backend(&self) -> &'static str {
        "embedded"
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL).map_err(map_sqlite_err)?;
        debug!("embedded schema ensured");
        Ok(())
    }

    async fn seed_games(&self, games: &[Game]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        let mut inserted = 0;
        for g in games {
            inserted += tx
                .execute(
                    "INSERT INTO games (game_id, game_name, platform, genre) VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(game_id) DO NOTHING",
                    params![g.game_id, g.game_name, g.platform, g.genre],
                )
                .map_err(map_sqlite_err)?;
        }
        tx.commit().map_err(map_sqlite_err)?;
        Ok(inserted)
    }

    async fn list_games(&self) -> Result<Vec<Game>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT game_id, game_name, COALESCE(platform, ''), COALESCE(genre, '') \
                 FROM games ORDER BY game_id",
            )
            .map_err(map_sqlite_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Game {
                    game_id: row.get(0)?,
                    game_name: row.get(1)?,
                    platform: row.get(2)?,
                    genre: row.get(3)?,
                })
            })
            .map_err(map_sqlite_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite_err)
    }

    async fn game_exists(&self, game_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1 FROM games WHERE game_id = ?1", [game_id], |_| Ok(()))
            .optional()
            .map(|r| r.is_some())
            .map_err(map_sqlite_err)
    }

    async fn player_exists(&self, player_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1 FROM players WHERE player_id = ?1", [player_id], |_| Ok(()))
            .optional()
            .map(|r| r.is_some())
            .map_err(map_sqlite_err)
    }

    async fn upsert_player(&self, player: &Player) -> Result<WriteOutcome, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        let existing: Option<Option<String>> = tx
            .query_row(
                "SELECT username FROM players WHERE player_id = ?1",
                [&player.player_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqlite_err)?;
        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO players (player_id, username, game_id, platform_id) VALUES (?1, ?2, ?3, ?4)",
                    params![player.player_id, player.username, player.game_id, player.platform_id],
                )
                .map_err(map_sqlite_err)?;
                WriteOutcome::Inserted
            }
            Some(Some(name)) if name == player.username => WriteOutcome::Skipped,
            Some(_) => {
                tx.execute(
                    "UPDATE players SET username = ?2 WHERE player_id = ?1",
                    params![player.player_id, player.username],
                )
                .map_err(map_sqlite_err)?;
                WriteOutcome::Updated
            }
        };
        tx.commit().map_err(map_sqlite_err)?;
        Ok(outcome)
    }

    async fn insert_match(&self, m: &Match) -> Result<WriteOutcome, StoreError> {
        let data = extras_json(&m.additional_data)?;
        let conn = self.lock()?;
        let n = conn
            .execute(
                "INSERT INTO matches (match_id, game_id, match_date, duration_minutes, match_type, platform, source, additional_data) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) ON CONFLICT(match_id) DO NOTHING",
                params![
                    m.match_id,
                    m.game_id,
                    ts(&m.match_date),
                    m.duration_minutes,
                    m.match_type,
                    m.platform,
                    m.source,
                    data
                ],
            )
            .map_err(map_sqlite_err)?;
        Ok(if n == 1 {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::Skipped
        })
    }

    async fn match_span(&self, match_id: &str) -> Result<Option<MatchSpan>, StoreError> {
        let row: Option<(String, Option<i64>)> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT match_date, duration_minutes FROM matches WHERE match_id = ?1",
                [match_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(map_sqlite_err)?
        };
        row.map(|(date, minutes)| -> Result<MatchSpan, StoreError> {
            Ok(MatchSpan {
                start: parse_ts(&date)?,
                duration_minutes: minutes.unwrap_or(0),
            })
        })
        .transpose()
    }

    async fn insert_player_stat(&self, stat: &PlayerStat) -> Result<WriteOutcome, StoreError> {
        let extras = extras_json(&stat.additional_stats)?;
        let conn = self.lock()?;
        let n = conn
            .execute(
                "INSERT INTO player_stats (stat_id, player_id, match_id, kills, deaths, assists, score, rank, additional_stats) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) ON CONFLICT DO NOTHING",
                params![
                    stat.stat_id,
                    stat.player_id,
                    stat.match_id,
                    stat.kills,
                    stat.deaths,
                    stat.assists,
                    stat.score,
                    stat.rank,
                    extras
                ],
            )
            .map_err(map_sqlite_err)?;
        Ok(if n == 1 {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::Skipped
        })
    }

    async fn insert_game_event(&self, event: &GameEvent) -> Result<WriteOutcome, StoreError> {
        let data = extras_json(&event.event_data)?;
        let conn = self.lock()?;
        let n = conn
            .execute(
                "INSERT INTO game_events (event_id, match_id, game_id, event_type, event_timestamp, event_data) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT(event_id) DO NOTHING",
                params![
                    event.event_id,
                    event.match_id,
                    event.game_id,
                    event.event_type,
                    ts(&event.event_timestamp),
                    data
                ],
            )
            .map_err(map_sqlite_err)?;
        Ok(if n == 1 {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::Skipped
        })
    }

    async fn daily_history(
        &self,
        game_id: &str,
        metric: Metric,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<HistoryPoint>, StoreError> {
        let rows: Vec<(String, Option<f64>)> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(&history_sql(metric)).map_err(map_sqlite_err)?;
            let mapped = stmt
                .query_map(
                    params![
                        game_id,
                        since.format("%Y-%m-%d").to_string(),
                        until.format("%Y-%m-%d").to_string()
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(map_sqlite_err)?;
            mapped.collect::<Result<_, _>>().map_err(map_sqlite_err)?
        };
        rows.into_iter()
            .filter_map(|(day, value)| value.map(|v| (day, v)))
            .map(|(day, value)| {
                NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                    .map(|date| HistoryPoint::new(date, value))
                    .map_err(|e| StoreError::Schema(format!("bad stored day '{day}': {e}")))
            })
            .collect()
    }

    async fn upsert_forecast(&self, f: &Forecast) -> Result<WriteOutcome, StoreError> {
        let date = f.forecast_date.format("%Y-%m-%d").to_string();
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        let existed = tx
            .query_row(
                "SELECT 1 FROM forecasts WHERE game_id = ?1 AND forecast_date = ?2 \
                 AND predicted_metric = ?3 AND model_version = ?4",
                params![f.game_id, date, f.predicted_metric, f.model_version],
                |_| Ok(()),
            )
            .optional()
            .map_err(map_sqlite_err)?
            .is_some();
        tx.execute(
            "INSERT INTO forecasts (forecast_id, game_id, forecast_date, predicted_metric, predicted_value, \
                 confidence_interval_lower, confidence_interval_upper, model_version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(game_id, forecast_date, predicted_metric, model_version) DO UPDATE SET \
                 predicted_value = excluded.predicted_value, \
                 confidence_interval_lower = excluded.confidence_interval_lower, \
                 confidence_interval_upper = excluded.confidence_interval_upper, \
                 created_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
            params![
                f.forecast_id,
                f.game_id,
                date,
                f.predicted_metric,
                f.predicted_value,
                f.confidence_interval_lower,
                f.confidence_interval_upper,
                f.model_version
            ],
        )
        .map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(if existed {
            WriteOutcome::Updated
        } else {
            WriteOutcome::Inserted
        })
    }

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        let table = known_table(table)?;
        let conn = self.lock()?;
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .map_err(map_sqlite_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::seed_games;
    use chrono::Duration;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    async fn store() -> EmbeddedWarehouse {
        let wh = EmbeddedWarehouse::open_in_memory().unwrap();
        wh.ensure_schema().await.unwrap();
        wh.seed_games(&seed_games()).await.unwrap();
        wh
    }

    fn sample_match(id: &str, start: &str, minutes: i64, match_type: &str) -> Match {
        Match {
            match_id: id.into(),
            game_id: "dota2".into(),
            match_date: at(start),
            duration_minutes: minutes,
            match_type: match_type.into(),
            platform: "pc".into(),
            source: "opendota".into(),
            additional_data: ExtraFields::new().with("radiant_win", true),
        }
    }

    fn player(id: &str, name: &str) -> Player {
        Player {
            player_id: id.into(),
            username: name.into(),
            game_id: "dota2".into(),
            platform_id: None,
        }
    }

    fn stat(player_id: &str, match_id: &str) -> PlayerStat {
        PlayerStat {
            stat_id: PlayerStat::stat_id_for(match_id, player_id),
            player_id: player_id.into(),
            match_id: match_id.into(),
            game_id: "dota2".into(),
            kills: 7,
            deaths: 2,
            assists: 11,
            score: 14_000,
            rank: Some(42),
            additional_stats: ExtraFields::new().with("gpm", 512i64),
        }
    }

    #[tokio::test]
    async fn schema_and_seed_are_idempotent() {
        let wh = store().await;
        wh.ensure_schema().await.unwrap();
        assert_eq!(wh.seed_games(&seed_games()).await.unwrap(), 0);
        assert_eq!(wh.count_rows("games").await.unwrap(), 6);
        assert!(wh.game_exists("valorant").await.unwrap());
        assert!(!wh.game_exists("minecraft").await.unwrap());
        let ids: Vec<_> = wh.list_games().await.unwrap().into_iter().map(|g| g.game_id).collect();
        assert!(ids.contains(&"dota2".to_string()));
    }

    #[tokio::test]
    async fn second_match_insert_is_skipped() {
        let wh = store().await;
        let m = sample_match("opendota_1", "2024-01-01T10:00:00Z", 42, "ranked");
        assert_eq!(wh.insert_match(&m).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(wh.insert_match(&m).await.unwrap(), WriteOutcome::Skipped);
        assert_eq!(wh.count_rows("matches").await.unwrap(), 1);
        let span = wh.match_span("opendota_1").await.unwrap().unwrap();
        assert_eq!(span.start, m.match_date);
        assert_eq!(span.duration_minutes, 42);
        assert!(wh.match_span("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn username_changes_update_the_player() {
        let wh = store().await;
        assert_eq!(wh.upsert_player(&player("p1", "alice")).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(wh.upsert_player(&player("p1", "alice")).await.unwrap(), WriteOutcome::Skipped);
        assert_eq!(wh.upsert_player(&player("p1", "alice2")).await.unwrap(), WriteOutcome::Updated);
        assert!(wh.player_exists("p1").await.unwrap());
        assert_eq!(wh.count_rows("players").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stat_without_parent_match_is_a_conflict() {
        let wh = store().await;
        wh.upsert_player(&player("p1", "alice")).await.unwrap();
        let err = wh.insert_player_stat(&stat("p1", "nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "{err:?}");
    }

    #[tokio::test]
    async fn stats_and_events_are_insert_if_absent() {
        let wh = store().await;
        let m = sample_match("m1", "2024-01-01T10:00:00Z", 30, "ranked");
        wh.insert_match(&m).await.unwrap();
        wh.upsert_player(&player("p1", "alice")).await.unwrap();
        assert_eq!(wh.insert_player_stat(&stat("p1", "m1")).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(wh.insert_player_stat(&stat("p1", "m1")).await.unwrap(), WriteOutcome::Skipped);

        let event = GameEvent {
            event_id: "m1_obj_0".into(),
            match_id: "m1".into(),
            game_id: "dota2".into(),
            event_type: "building_kill".into(),
            event_timestamp: m.match_date + Duration::minutes(12),
            event_data: ExtraFields::new().with("team", 2i64),
        };
        assert_eq!(wh.insert_game_event(&event).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(wh.insert_game_event(&event).await.unwrap(), WriteOutcome::Skipped);
        assert_eq!(wh.count_rows("game_events").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn daily_history_groups_by_day_and_ignores_snapshots() {
        let wh = store().await;
        wh.upsert_player(&player("p1", "alice")).await.unwrap();
        wh.upsert_player(&player("p2", "bob")).await.unwrap();
        for (id, start, minutes) in [
            ("m1", "2024-01-01T10:00:00Z", 30),
            ("m2", "2024-01-01T18:00:00Z", 50),
            ("m3", "2024-01-03T09:00:00Z", 40),
        ] {
            wh.insert_match(&sample_match(id, start, minutes, "ranked")).await.unwrap();
        }
        wh.insert_match(&sample_match("snap", "2024-01-02T00:00:00Z", 0, SNAPSHOT_MATCH_TYPE))
            .await
            .unwrap();
        for (p, m) in [("p1", "m1"), ("p2", "m1"), ("p1", "m2"), ("p2", "m3")] {
            wh.insert_player_stat(&stat(p, m)).await.unwrap();
        }

        let since = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let until = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let counts = wh.daily_history("dota2", Metric::MatchCount, since, until).await.unwrap();
        assert_eq!(
            counts.iter().map(|p| (p.date.to_string(), p.value)).collect::<Vec<_>>(),
            vec![("2024-01-01".to_string(), 2.0), ("2024-01-03".to_string(), 1.0)]
        );
        let players = wh.daily_history("dota2", Metric::ActivePlayers, since, until).await.unwrap();
        assert_eq!(players[0].value, 2.0);
        assert_eq!(players[1].value, 1.0);
        let durations = wh.daily_history("dota2", Metric::AvgDuration, since, until).await.unwrap();
        assert_eq!(durations[0].value, 40.0);
    }

    #[tokio::test]
    async fn forecast_rerun_updates_in_place() {
        let wh = store().await;
        let mut f = Forecast {
            forecast_id: "fc_1".into(),
            game_id: "dota2".into(),
            forecast_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            predicted_metric: "active_players".into(),
            predicted_value: 120.0,
            confidence_interval_lower: 100.0,
            confidence_interval_upper: 140.0,
            model_version: "v1".into(),
        };
        assert_eq!(wh.upsert_forecast(&f).await.unwrap(), WriteOutcome::Inserted);
        f.predicted_value = 121.0;
        f.confidence_interval_upper = 141.0;
        assert_eq!(wh.upsert_forecast(&f).await.unwrap(), WriteOutcome::Updated);
        assert_eq!(wh.count_rows("forecasts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_table_is_a_schema_error() {
        let wh = store().await;
        let err = wh.count_rows("users; DROP TABLE games").await.unwrap_err();
        assert!(matches!(err, StoreError::Schema(_)));
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("warehouse.sqlite");
        {
            let wh = EmbeddedWarehouse::open(&path).unwrap();
            wh.ensure_schema().await.unwrap();
            wh.seed_games(&seed_games()).await.unwrap();
        }
        let wh = EmbeddedWarehouse::open(&path).unwrap();
        wh.ensure_schema().await.unwrap();
        assert_eq!(wh.count_rows("games").await.unwrap(), 6);
    }
}
