//! One orchestrated run: extract every game×source pair, normalize per game,
//! load per game, then forecast. A degraded source never fails the run; only
//! a schema violation does.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::database_ops::mock::provider::MockProvider;
use crate::database_ops::rate_limit::{RateLimiter, SourceGate};
use crate::database_ops::source::SourceConnector;
use crate::database_ops::warehouse::Warehouse;
use crate::database_ops::worker_manager::{GameWorker, LoadWorker, WorkerManager};
use crate::error::{PipelineError, SourceError, StoreError};
use crate::forecasting::{ForecastEngine, ForecastOutcome, LinearTrendModel};
use crate::models::{CanonicalRecord, FetchWindow, Game, RawRecord};
use crate::normalization::Transformer;
use crate::report::{RunReport, RunStatus, SourceStatus};

/// How far back each extraction looks.
const EXTRACT_LOOKBACK_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Extracting,
    Transforming,
    Loading,
    Forecasting,
    Completed,
    /// Side state: at least one source failed but the run goes on.
    Degraded,
    Cancelled,
}

enum PairOutcome {
    Fetched(Vec<RawRecord>),
    Failed(String),
    Cancelled,
}

pub struct Pipeline {
    warehouse: Arc<dyn Warehouse>,
    connectors: Vec<Arc<dyn SourceConnector>>,
    mock: Arc<MockProvider>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        connectors: Vec<Arc<dyn SourceConnector>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            warehouse,
            connectors,
            mock: Arc::new(MockProvider::new()),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_once(&self, as_of: DateTime<Utc>) -> Result<RunReport, PipelineError> {
        let (_tx, rx) = watch::channel(false);
        self.run_once_with_cancel(as_of, rx).await
    }

    /// Run with a cancellation signal. Cancellation is honoured between
    /// stages and abandons in-flight extractions; nothing is written before
    /// the load stage.
    pub async fn run_once_with_cancel(
        &self,
        as_of: DateTime<Utc>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::new(as_of);
        info!(run_id = %report.run_id, %as_of, "run started");

        let games = self.warehouse.list_games().await.map_err(schema_abort)?;
        if cancelled(&cancel, &mut report) {
            return Ok(report);
        }

        report.record_state(RunState::Extracting);
        let raw_by_game = match self.extract(&games, as_of, &cancel, &mut report).await {
            Some(raw) => raw,
            None => {
                finish_cancelled(&mut report);
                return Ok(report);
            }
        };
        if cancelled(&cancel, &mut report) {
            return Ok(report);
        }

        report.record_state(RunState::Transforming);
        let transformer = Transformer::new(&games, self.config.run.clock_skew);
        let mut canonical: Vec<(String, Vec<CanonicalRecord>)> = Vec::new();
        for (game_id, raw) in raw_by_game {
            let output = transformer.normalize(&raw, as_of);
            info!(
                game_id = %game_id,
                raw = raw.len(),
                canonical = output.entities.len(),
                rejected = output.rejected.len(),
                superseded = output.superseded,
                "batch normalized"
            );
            report.record_transform(&output);
            if !output.entities.is_empty() {
                canonical.push((game_id, output.entities));
            }
        }
        if cancelled(&cancel, &mut report) {
            return Ok(report);
        }

        report.record_state(RunState::Loading);
        let game_ids: Vec<String> = canonical.iter().map(|(g, _)| g.clone()).collect();
        let workers: Vec<Box<dyn GameWorker>> = canonical
            .into_iter()
            .map(|(game_id, records)| {
                Box::new(LoadWorker::new(game_id, records)) as Box<dyn GameWorker>
            })
            .collect();
        let loaded = WorkerManager::new(self.warehouse.clone())
            .run_all(workers)
            .await
            .map_err(|e| {
                error!(run_id = %report.run_id, error = %e, "load stage aborted");
                e
            })?;
        for (game_id, (_, result)) in game_ids.iter().zip(loaded) {
            report.record_load(game_id, result);
        }
        if cancelled(&cancel, &mut report) {
            return Ok(report);
        }

        report.record_state(RunState::Forecasting);
        let outcomes = self.forecast_games(&games, as_of).await?;
        report.record_forecasts(outcomes);

        report.record_state(RunState::Completed);
        let status = if report.is_degraded() {
            RunStatus::CompletedDegraded
        } else {
            RunStatus::Completed
        };
        report.finish(status);
        info!(run_id = %report.run_id, "{}", report.summary_line());
        Ok(report)
    }

    /// Forecast stage on its own, for every game or just `only`.
    pub async fn forecast_only(
        &self,
        as_of: DateTime<Utc>,
        only: Option<&str>,
    ) -> Result<Vec<ForecastOutcome>, PipelineError> {
        let games: Vec<Game> = self
            .warehouse
            .list_games()
            .await
            .map_err(schema_abort)?
            .into_iter()
            .filter(|g| only.map_or(true, |id| g.game_id == id))
            .collect();
        self.forecast_games(&games, as_of).await
    }

    async fn forecast_games(
        &self,
        games: &[Game],
        as_of: DateTime<Utc>,
    ) -> Result<Vec<ForecastOutcome>, PipelineError> {
        let settings = &self.config.forecast;
        let engine = ForecastEngine::new(
            self.warehouse.clone(),
            LinearTrendModel::new(settings.min_window),
            settings.horizon_days,
            settings.lookback_days,
        );
        let mut outcomes = Vec::new();
        for game in games {
            let game_outcomes = engine
                .run_game(&game.game_id, &settings.metrics, as_of.date_naive())
                .await
                .map_err(|e| {
                    error!(game_id = %game.game_id, error = %e, "forecast stage aborted");
                    e
                })?;
            outcomes.extend(game_outcomes);
        }
        Ok(outcomes)
    }

    /// Connectors for a game; mock stands in when no real connector supports it.
    fn pairs(&self, games: &[Game]) -> Vec<(String, Arc<dyn SourceConnector>)> {
        let mut pairs = Vec::new();
        for game in games {
            let before = pairs.len();
            for connector in self.connectors.iter().filter(|c| c.supports(&game.game_id)) {
                pairs.push((game.game_id.clone(), connector.clone()));
            }
            if pairs.len() == before && self.config.sources.mock_enabled {
                pairs.push((game.game_id.clone(), self.mock.clone() as Arc<dyn SourceConnector>));
            }
        }
        pairs
    }

    /// `None` when the run was cancelled mid-extraction.
    async fn extract(
        &self,
        games: &[Game],
        as_of: DateTime<Utc>,
        cancel: &watch::Receiver<bool>,
        report: &mut RunReport,
    ) -> Option<BTreeMap<String, Vec<RawRecord>>> {
        let run = &self.config.run;
        let window = FetchWindow {
            since: as_of - ChronoDuration::hours(EXTRACT_LOOKBACK_HOURS),
            until: as_of,
            limit: run.limit_per_game,
            detail_limit: run.detail_matches,
        };
        // Fresh budgets every run.
        let limiter = RateLimiter::shared();

        let results: Vec<(String, &'static str, PairOutcome)> = stream::iter(self.pairs(games))
            .map(|(game_id, connector)| {
                let gate = SourceGate::new(
                    connector.source(),
                    limiter.clone(),
                    connector.budget(),
                    run.retry.clone(),
                );
                let window = window.clone();
                let cancel = cancel.clone();
                async move {
                    let source = connector.source();
                    let fetch = tokio::time::timeout(
                        run.source_timeout,
                        connector.fetch(&game_id, &window, &gate),
                    );
                    let outcome = tokio::select! {
                        res = fetch => match res {
                            Ok(Ok(records)) => PairOutcome::Fetched(records),
                            Ok(Err(err)) => PairOutcome::Failed(describe(&err)),
                            Err(_) => PairOutcome::Failed(format!(
                                "source_unavailable: timed out after {}s",
                                run.source_timeout.as_secs()
                            )),
                        },
                        _ = wait_cancelled(cancel) => PairOutcome::Cancelled,
                    };
                    (game_id, source, outcome)
                }
            })
            .buffer_unordered(run.max_workers.max(1))
            .collect()
            .await;

        let mut raw_by_game: BTreeMap<String, Vec<RawRecord>> = BTreeMap::new();
        let mut fallback: BTreeSet<String> = BTreeSet::new();
        let mut was_cancelled = false;
        for (game_id, source, outcome) in results {
            match outcome {
                PairOutcome::Fetched(records) => {
                    info!(game_id = %game_id, source, extracted = records.len(), "source extracted");
                    report.record_extracted(&game_id, source, SourceStatus::Ok, records.len());
                    raw_by_game.entry(game_id).or_default().extend(records);
                }
                PairOutcome::Failed(cause) => {
                    warn!(game_id = %game_id, source, %cause, "source degraded");
                    report.record_source_failure(&game_id, source, cause);
                    report.record_state(RunState::Degraded);
                    fallback.insert(game_id);
                }
                PairOutcome::Cancelled => was_cancelled = true,
            }
        }
        if was_cancelled {
            warn!(run_id = %report.run_id, "extraction cancelled; partial results discarded");
            return None;
        }

        if self.config.sources.mock_enabled {
            for game_id in fallback {
                let records = self.mock.generate(&game_id, as_of, run.limit_per_game);
                info!(game_id = %game_id, extracted = records.len(), "mock fallback engaged");
                report.record_extracted(
                    &game_id,
                    crate::database_ops::mock::provider::SOURCE,
                    SourceStatus::Fallback,
                    records.len(),
                );
                raw_by_game.entry(game_id).or_default().extend(records);
            }
        }
        Some(raw_by_game)
    }
}

fn describe(err: &SourceError) -> String {
    format!("{}: {err}", err.kind())
}

fn schema_abort(err: StoreError) -> PipelineError {
    match err {
        StoreError::Schema(msg) => {
            error!(error = %msg, "warehouse schema violation");
            PipelineError::SchemaViolation(msg)
        }
        other => PipelineError::Store(other),
    }
}

async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: cancellation can no longer happen.
            std::future::pending::<()>().await;
        }
    }
}

fn cancelled(cancel: &watch::Receiver<bool>, report: &mut RunReport) -> bool {
    if *cancel.borrow() {
        finish_cancelled(report);
        true
    } else {
        false
    }
}

fn finish_cancelled(report: &mut RunReport) {
    report.record_state(RunState::Cancelled);
    report.finish(RunStatus::Cancelled);
    warn!(run_id = %report.run_id, "run cancelled");
}
