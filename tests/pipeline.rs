//! End-to-end runs against the in-memory embedded warehouse with scripted
//! connectors standing in for the upstream APIs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use game_pulse::config::PipelineConfig;
use game_pulse::database_ops::embedded_store::EmbeddedWarehouse;
use game_pulse::database_ops::rate_limit::{BudgetSpec, SourceGate};
use game_pulse::database_ops::source::SourceConnector;
use game_pulse::database_ops::warehouse::Warehouse;
use game_pulse::error::{PipelineError, RejectReason, SourceError};
use game_pulse::models::{FetchWindow, RawKind, RawRecord};
use game_pulse::orchestrator::{Pipeline, RunState};
use game_pulse::report::{RunStatus, SourceStatus};
use game_pulse::util::db::prepare_warehouse;
use serde_json::json;
use tokio::sync::watch;

const SCRIPTED: &str = "scripted";

enum Script {
    Records(Vec<RawRecord>),
    Fail(SourceError),
    /// Never answers.
    Hang,
}

struct ScriptedConnector {
    game_id: &'static str,
    script: Script,
    calls: AtomicU32,
}

impl ScriptedConnector {
    fn new(game_id: &'static str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            game_id,
            script,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl SourceConnector for ScriptedConnector {
    fn source(&self) -> &'static str {
        SCRIPTED
    }

    fn budget(&self) -> BudgetSpec {
        BudgetSpec::per_minute(60)
    }

    fn supports(&self, game_id: &str) -> bool {
        game_id == self.game_id
    }

    async fn fetch(
        &self,
        _game_id: &str,
        _window: &FetchWindow,
        gate: &SourceGate,
    ) -> Result<Vec<RawRecord>, SourceError> {
        gate.call(move || async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Records(records) => Ok(records.clone()),
                Script::Fail(err) => Err(err.clone()),
                Script::Hang => std::future::pending().await,
            }
        })
        .await
    }
}

fn as_of() -> DateTime<Utc> {
    "2024-03-10T12:00:00Z".parse().unwrap()
}

fn rfc(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// One dota2 match with two players and an objective.
fn dota_batch() -> Vec<RawRecord> {
    let start = as_of() - Duration::hours(2);
    let fetched = as_of();
    vec![
        RawRecord::new(SCRIPTED, "dota2", RawKind::Match, fetched, json!({
            "match_id": "scripted_1",
            "match_timestamp": rfc(start),
            "duration_seconds": 2_400,
            "match_type": "ranked",
            "platform": "pc",
        })),
        RawRecord::new(SCRIPTED, "dota2", RawKind::PlayerStat, fetched, json!({
            "match_id": "scripted_1",
            "player_id": "scripted_player_1",
            "username": "sniper_main",
            "kills": 12, "deaths": 3, "assists": 9, "score": 21_000,
        })),
        RawRecord::new(SCRIPTED, "dota2", RawKind::PlayerStat, fetched, json!({
            "match_id": "scripted_1",
            "player_id": "scripted_player_2",
            "kills": "4", "deaths": 7, "assists": 15, "score": 9_500,
        })),
        RawRecord::new(SCRIPTED, "dota2", RawKind::GameEvent, fetched, json!({
            "event_id": "scripted_1_obj_0",
            "match_id": "scripted_1",
            "event_type": "objective",
            "event_timestamp": rfc(start + Duration::minutes(20)),
        })),
    ]
}

async fn prepared_warehouse() -> Arc<dyn Warehouse> {
    let wh: Arc<dyn Warehouse> = Arc::new(EmbeddedWarehouse::open_in_memory().unwrap());
    prepare_warehouse(wh.as_ref()).await.unwrap();
    wh
}

fn config(mock_enabled: bool) -> PipelineConfig {
    let mut cfg = PipelineConfig::for_tests();
    cfg.sources.mock_enabled = mock_enabled;
    cfg.run.retry.jitter = false;
    cfg
}

#[tokio::test(start_paused = true)]
async fn happy_path_loads_every_entity_and_completes() {
    let wh = prepared_warehouse().await;
    let connector = ScriptedConnector::new("dota2", Script::Records(dota_batch()));
    let pipeline = Pipeline::new(
        wh.clone(),
        vec![connector.clone() as Arc<dyn SourceConnector>],
        config(true),
    );

    let report = pipeline.run_once(as_of()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(
        report.states,
        vec![
            RunState::Idle,
            RunState::Extracting,
            RunState::Transforming,
            RunState::Loading,
            RunState::Forecasting,
            RunState::Completed,
        ]
    );
    let row = report.source("dota2", SCRIPTED).unwrap();
    assert_eq!(row.status, SourceStatus::Ok);
    assert!(!row.mock);
    assert_eq!((row.extracted, row.validated, row.rejected), (4, 4, 0));
    // match + two players + two stats + event
    assert_eq!(row.inserted, 6);
    assert_eq!(row.failed, 0);

    // Games without a real connector are served by the mock generator.
    let pubg = report.source("pubg", "mock").unwrap();
    assert!(pubg.mock);
    assert_eq!(pubg.status, SourceStatus::Ok);
    assert!(pubg.inserted > 0);
    assert!(report.source("dota2", "mock").is_none());

    // A single day of history is not enough to forecast anything.
    assert_eq!(report.forecasts.len(), 6 * 3);
    assert!(report.forecasts.iter().all(|f| !f.is_written()));
    assert_eq!(wh.count_rows("forecasts").await.unwrap(), 0);
    assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn record_without_identity_is_rejected_and_reported() {
    let wh = prepared_warehouse().await;
    let mut batch = dota_batch();
    batch.push(RawRecord::new(SCRIPTED, "dota2", RawKind::PlayerStat, as_of(), json!({
        "match_id": "scripted_1",
        "player_id": "",
        "kills": 1,
    })));
    let connector = ScriptedConnector::new("dota2", Script::Records(batch));
    let pipeline = Pipeline::new(
        wh.clone(),
        vec![connector as Arc<dyn SourceConnector>],
        config(false),
    );

    let report = pipeline.run_once(as_of()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let row = report.source("dota2", SCRIPTED).unwrap();
    assert_eq!((row.extracted, row.validated, row.rejected), (5, 4, 1));
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].reason, RejectReason::MissingIdentity);
    assert_eq!(wh.count_rows("player_stats").await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_source_degrades_and_falls_back_to_mock() {
    let wh = prepared_warehouse().await;
    let limited = ScriptedConnector::new(
        "valorant",
        Script::Fail(SourceError::RateLimited { retry_after: None }),
    );
    let healthy = ScriptedConnector::new("dota2", Script::Records(dota_batch()));
    let pipeline = Pipeline::new(
        wh.clone(),
        vec![limited.clone() as Arc<dyn SourceConnector>, healthy],
        config(true),
    );

    let report = pipeline.run_once(as_of()).await.unwrap();

    assert_eq!(report.status, RunStatus::CompletedDegraded);
    assert!(report.states.contains(&RunState::Degraded));
    assert_eq!(report.states.last(), Some(&RunState::Completed));
    // first attempt plus three retries
    assert_eq!(limited.calls.load(Ordering::SeqCst), 4);

    let degraded = report.source("valorant", SCRIPTED).unwrap();
    assert_eq!(degraded.status, SourceStatus::Degraded);
    assert!(degraded.cause.as_deref().unwrap().starts_with("rate_limited"));
    assert_eq!(degraded.inserted, 0);

    let fallback = report.source("valorant", "mock").unwrap();
    assert_eq!(fallback.status, SourceStatus::Fallback);
    assert!(fallback.inserted > 0);

    let healthy_row = report.source("dota2", SCRIPTED).unwrap();
    assert_eq!(healthy_row.status, SourceStatus::Ok);
    assert_eq!(healthy_row.inserted, 6);
}

#[tokio::test(start_paused = true)]
async fn degraded_source_without_mock_fallback_loads_nothing_for_that_game() {
    let wh = prepared_warehouse().await;
    let down = ScriptedConnector::new(
        "dota2",
        Script::Fail(SourceError::unavailable("missing api key")),
    );
    let pipeline = Pipeline::new(
        wh.clone(),
        vec![down.clone() as Arc<dyn SourceConnector>],
        config(false),
    );

    let report = pipeline.run_once(as_of()).await.unwrap();

    assert_eq!(report.status, RunStatus::CompletedDegraded);
    // Non-transient failures are not retried.
    assert_eq!(down.calls.load(Ordering::SeqCst), 1);
    assert!(report.sources.iter().all(|s| !s.mock));
    assert_eq!(wh.count_rows("matches").await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn rerun_with_same_input_changes_nothing() {
    let wh = prepared_warehouse().await;
    let connector = ScriptedConnector::new("dota2", Script::Records(dota_batch()));
    let pipeline = Pipeline::new(
        wh.clone(),
        vec![connector as Arc<dyn SourceConnector>],
        config(false),
    );

    pipeline.run_once(as_of()).await.unwrap();
    let mut before = Vec::new();
    for table in ["players", "matches", "player_stats", "game_events", "forecasts"] {
        before.push(wh.count_rows(table).await.unwrap());
    }

    let second = pipeline.run_once(as_of()).await.unwrap();
    let row = second.source("dota2", SCRIPTED).unwrap();
    assert_eq!((row.inserted, row.updated, row.skipped, row.failed), (0, 0, 6, 0));

    let mut after = Vec::new();
    for table in ["players", "matches", "player_stats", "game_events", "forecasts"] {
        after.push(wh.count_rows(table).await.unwrap());
    }
    assert_eq!(before, after);
    assert_eq!(after[1], 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_writes_nothing() {
    let wh = prepared_warehouse().await;
    let connector = ScriptedConnector::new("dota2", Script::Records(dota_batch()));
    let pipeline = Pipeline::new(
        wh.clone(),
        vec![connector.clone() as Arc<dyn SourceConnector>],
        config(true),
    );

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let report = pipeline.run_once_with_cancel(as_of(), rx).await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.states, vec![RunState::Idle, RunState::Cancelled]);
    assert!(report.finished_at.is_some());
    assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    assert_eq!(wh.count_rows("matches").await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_schema_aborts_the_run() {
    let wh: Arc<dyn Warehouse> = Arc::new(EmbeddedWarehouse::open_in_memory().unwrap());
    let connector = ScriptedConnector::new("dota2", Script::Records(dota_batch()));
    let pipeline = Pipeline::new(wh, vec![connector as Arc<dyn SourceConnector>], config(true));

    let err = pipeline.run_once(as_of()).await.unwrap_err();
    assert!(matches!(err, PipelineError::SchemaViolation(_)));
}

#[tokio::test(start_paused = true)]
async fn forecast_only_can_target_one_game() {
    let wh = prepared_warehouse().await;
    let pipeline = Pipeline::new(wh, Vec::new(), config(false));

    let outcomes = pipeline.forecast_only(as_of(), Some("dota2")).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| !o.is_written()));
}

#[tokio::test(start_paused = true)]
async fn hung_source_times_out_and_degrades() {
    let wh = prepared_warehouse().await;
    let hung = ScriptedConnector::new("dota2", Script::Hang);
    let mut cfg = config(false);
    cfg.run.source_timeout = std::time::Duration::from_secs(5);
    let pipeline = Pipeline::new(wh.clone(), vec![hung.clone() as Arc<dyn SourceConnector>], cfg);

    let report = pipeline.run_once(as_of()).await.unwrap();

    assert_eq!(report.status, RunStatus::CompletedDegraded);
    assert!(report.states.contains(&RunState::Degraded));
    let row = report.source("dota2", SCRIPTED).unwrap();
    assert_eq!(row.status, SourceStatus::Degraded);
    assert_eq!(
        row.cause.as_deref(),
        Some("source_unavailable: timed out after 5s")
    );
    assert_eq!(hung.calls.load(Ordering::SeqCst), 1);
    assert_eq!(wh.count_rows("matches").await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_extraction_discards_fetched_records() {
    let wh = prepared_warehouse().await;
    let hung = ScriptedConnector::new("dota2", Script::Hang);
    let pipeline = Pipeline::new(
        wh.clone(),
        vec![hung.clone() as Arc<dyn SourceConnector>],
        config(true),
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        tx.send(true).unwrap();
    });
    let report = pipeline.run_once_with_cancel(as_of(), rx).await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(
        report.states,
        vec![RunState::Idle, RunState::Extracting, RunState::Cancelled]
    );
    assert_eq!(hung.calls.load(Ordering::SeqCst), 1);
    // Mock pairs for the other games finished before the cancel, but
    // nothing reaches the warehouse.
    assert_eq!(wh.count_rows("matches").await.unwrap(), 0);
    assert_eq!(wh.count_rows("player_stats").await.unwrap(), 0);
}
