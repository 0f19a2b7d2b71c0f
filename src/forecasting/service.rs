use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::database_ops::warehouse::{Warehouse, WriteOutcome};
use crate::error::{ForecastError, PipelineError, StoreError};
use crate::forecasting::model::{ForecastResult, HistoryPoint, LinearTrendModel};
use crate::models::{Forecast, Metric};

/// What happened for one (game, metric) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ForecastOutcome {
    Written {
        game_id: String,
        metric: Metric,
        inserted: usize,
        updated: usize,
    },
    InsufficientHistory {
        game_id: String,
        metric: Metric,
        have: usize,
        need: usize,
    },
    Failed {
        game_id: String,
        metric: Metric,
        cause: String,
    },
}

impl ForecastOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

/// Deterministic id for the upsert key.
pub fn forecast_id(game_id: &str, date: NaiveDate, metric: Metric, model_version: &str) -> String {
    let key = format!("{game_id}|{date}|{}|{model_version}", metric.as_str());
    let digest = Sha1::digest(key.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("fc_{}", &hex[..16])
}

/// Dense daily series for count metrics: every day from the first
/// observation through `until` is present, zero when nothing was observed.
pub fn zero_fill(points: &[HistoryPoint], until: NaiveDate) -> Vec<HistoryPoint> {
    let Some(first) = points.first().map(|p| p.date) else {
        return Vec::new();
    };
    let observed: BTreeMap<NaiveDate, f64> = points.iter().map(|p| (p.date, p.value)).collect();
    first
        .iter_days()
        .take_while(|d| *d <= until)
        .map(|d| HistoryPoint::new(d, observed.get(&d).copied().unwrap_or(0.0)))
        .collect()
}

fn densify(metric: Metric, observed: Vec<HistoryPoint>, as_of: NaiveDate) -> Vec<HistoryPoint> {
    if metric.is_count() {
        zero_fill(&observed, as_of)
    } else {
        observed
    }
}

fn insufficient(game_id: &str, metric: Metric, have: usize, need: usize) -> ForecastOutcome {
    info!(game_id, %metric, have, need, "skipping forecast: insufficient history");
    ForecastOutcome::InsufficientHistory {
        game_id: game_id.to_string(),
        metric,
        have,
        need,
    }
}

pub struct ForecastEngine {
    warehouse: Arc<dyn Warehouse>,
    model: LinearTrendModel,
    horizon_days: u32,
    lookback_days: u32,
}

impl ForecastEngine {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        model: LinearTrendModel,
        horizon_days: u32,
        lookback_days: u32,
    ) -> Self {
        Self {
            warehouse,
            model,
            horizon_days: horizon_days.max(1),
            lookback_days,
        }
    }

    /// Days with at least one observation in `[as_of - lookback, as_of]`.
    pub async fn observed(
        &self,
        game_id: &str,
        metric: Metric,
        as_of: NaiveDate,
    ) -> Result<Vec<HistoryPoint>, StoreError> {
        let since = as_of - Duration::days(i64::from(self.lookback_days));
        self.warehouse.daily_history(game_id, metric, since, as_of).await
    }

    /// Model input: observed days, zero-filled through `as_of` for count metrics.
    pub async fn history(
        &self,
        game_id: &str,
        metric: Metric,
        as_of: NaiveDate,
    ) -> Result<Vec<HistoryPoint>, StoreError> {
        let observed = self.observed(game_id, metric, as_of).await?;
        Ok(densify(metric, observed, as_of))
    }

    pub fn forecast(
        &self,
        game_id: &str,
        metric: Metric,
        history: &[HistoryPoint],
        target: NaiveDate,
    ) -> Result<ForecastResult, ForecastError> {
        let result = self.model.forecast(history, target)?;
        debug!(game_id, %metric, %target, predicted = result.predicted_value, "forecast computed");
        Ok(result)
    }

    /// One row per horizon day after `as_of`.
    pub fn forecast_rows(
        &self,
        game_id: &str,
        metric: Metric,
        history: &[HistoryPoint],
        as_of: NaiveDate,
    ) -> Result<Vec<Forecast>, ForecastError> {
        (1..=i64::from(self.horizon_days))
            .map(|ahead| {
                let date = as_of + Duration::days(ahead);
                let r = self.forecast(game_id, metric, history, date)?;
                Ok(Forecast {
                    forecast_id: forecast_id(game_id, date, metric, &r.model_version),
                    game_id: game_id.to_string(),
                    forecast_date: date,
                    predicted_metric: metric.as_str().to_string(),
                    predicted_value: r.predicted_value,
                    confidence_interval_lower: r.ci_lower,
                    confidence_interval_upper: r.ci_upper,
                    model_version: r.model_version,
                })
            })
            .collect()
    }

    /// Forecast each metric for a game. Only a schema violation is returned
    /// as an error; everything else becomes an outcome.
    pub async fn run_game(
        &self,
        game_id: &str,
        metrics: &[Metric],
        as_of: NaiveDate,
    ) -> Result<Vec<ForecastOutcome>, PipelineError> {
        let mut outcomes = Vec::with_capacity(metrics.len());
        for &metric in metrics {
            let outcome = match self.run_metric(game_id, metric, as_of).await {
                Ok(outcome) => outcome,
                Err(StoreError::Schema(msg)) => return Err(PipelineError::SchemaViolation(msg)),
                Err(err) => {
                    warn!(game_id, %metric, error = %err, "forecast failed");
                    ForecastOutcome::Failed {
                        game_id: game_id.to_string(),
                        metric,
                        cause: err.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn run_metric(
        &self,
        game_id: &str,
        metric: Metric,
        as_of: NaiveDate,
    ) -> Result<ForecastOutcome, StoreError> {
        // The window is counted on observed days; zero-filled gaps are not data.
        let observed = self.observed(game_id, metric, as_of).await?;
        let need = self.model.min_window();
        if observed.len() < need {
            return Ok(insufficient(game_id, metric, observed.len(), need));
        }
        let history = densify(metric, observed, as_of);
        let rows = match self.forecast_rows(game_id, metric, &history, as_of) {
            Ok(rows) => rows,
            Err(ForecastError::InsufficientHistory { have, need }) => {
                return Ok(insufficient(game_id, metric, have, need));
            }
            Err(err @ ForecastError::DegenerateHistory { .. }) => {
                warn!(game_id, %metric, error = %err, "skipping forecast");
                return Ok(ForecastOutcome::Failed {
                    game_id: game_id.to_string(),
                    metric,
                    cause: err.to_string(),
                });
            }
        };
        let (mut inserted, mut updated) = (0, 0);
        for row in &rows {
            match self.warehouse.upsert_forecast(row).await? {
                WriteOutcome::Inserted => inserted += 1,
                WriteOutcome::Updated | WriteOutcome::Skipped => updated += 1,
            }
        }
        info!(game_id, %metric, inserted, updated, "forecasts written");
        Ok(ForecastOutcome::Written {
            game_id: game_id.to_string(),
            metric,
            inserted,
            updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::embedded_store::EmbeddedWarehouse;
    use crate::models::{seed_games, ExtraFields, Match, Player, PlayerStat};
    use chrono::{TimeZone, Utc};

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, n).unwrap()
    }

    async fn warehouse_with_history(days: u32) -> Arc<dyn Warehouse> {
        warehouse_with_days(&(1..=days).collect::<Vec<_>>()).await
    }

    /// Day `d` gets `d` matches, each with one player stat.
    async fn warehouse_with_days(days: &[u32]) -> Arc<dyn Warehouse> {
        let wh = EmbeddedWarehouse::open_in_memory().unwrap();
        wh.ensure_schema().await.unwrap();
        wh.seed_games(&seed_games()).await.unwrap();
        for &d in days {
            for i in 0..d {
                let match_id = format!("m_{d}_{i}");
                wh.insert_match(&Match {
                    match_id: match_id.clone(),
                    game_id: "dota2".into(),
                    match_date: Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap(),
                    duration_minutes: 30 + i64::from(i),
                    match_type: "ranked".into(),
                    platform: "pc".into(),
                    source: "mock".into(),
                    additional_data: ExtraFields::new(),
                })
                .await
                .unwrap();
                let player_id = format!("p_{i}");
                wh.upsert_player(&Player {
                    player_id: player_id.clone(),
                    username: player_id.clone(),
                    game_id: "dota2".into(),
                    platform_id: None,
                })
                .await
                .unwrap();
                wh.insert_player_stat(&PlayerStat {
                    stat_id: PlayerStat::stat_id_for(&match_id, &player_id),
                    player_id,
                    match_id,
                    game_id: "dota2".into(),
                    kills: 1,
                    deaths: 1,
                    assists: 1,
                    score: 100,
                    rank: None,
                    additional_stats: ExtraFields::new(),
                })
                .await
                .unwrap();
            }
        }
        Arc::new(wh)
    }

    #[test]
    fn zero_fill_covers_gaps_through_as_of() {
        let filled = zero_fill(
            &[HistoryPoint::new(day(1), 3.0), HistoryPoint::new(day(3), 5.0)],
            day(5),
        );
        let values: Vec<f64> = filled.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![3.0, 0.0, 5.0, 0.0, 0.0]);
        assert!(zero_fill(&[], day(5)).is_empty());
    }

    #[test]
    fn forecast_id_is_stable_per_key() {
        let a = forecast_id("dota2", day(1), Metric::ActivePlayers, "v1");
        assert_eq!(a, forecast_id("dota2", day(1), Metric::ActivePlayers, "v1"));
        assert_ne!(a, forecast_id("dota2", day(2), Metric::ActivePlayers, "v1"));
        assert!(a.starts_with("fc_"));
    }

    #[tokio::test]
    async fn writes_one_row_per_horizon_day() {
        let wh = warehouse_with_history(10).await;
        let engine = ForecastEngine::new(wh.clone(), LinearTrendModel::new(7), 7, 30);
        let outcomes = engine.run_game("dota2", &[Metric::MatchCount], day(10)).await.unwrap();
        assert_eq!(
            outcomes,
            vec![ForecastOutcome::Written {
                game_id: "dota2".into(),
                metric: Metric::MatchCount,
                inserted: 7,
                updated: 0,
            }]
        );
        assert_eq!(wh.count_rows("forecasts").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn rerun_with_same_history_upserts_without_new_rows() {
        let wh = warehouse_with_history(10).await;
        let engine = ForecastEngine::new(wh.clone(), LinearTrendModel::new(7), 3, 30);
        let history = engine.history("dota2", Metric::ActivePlayers, day(10)).await.unwrap();
        let first = engine
            .forecast_rows("dota2", Metric::ActivePlayers, &history, day(10))
            .unwrap();
        let second = engine
            .forecast_rows("dota2", Metric::ActivePlayers, &history, day(10))
            .unwrap();
        assert_eq!(first, second);

        engine.run_game("dota2", &[Metric::ActivePlayers], day(10)).await.unwrap();
        let rerun = engine.run_game("dota2", &[Metric::ActivePlayers], day(10)).await.unwrap();
        assert!(matches!(
            rerun[0],
            ForecastOutcome::Written { inserted: 0, updated: 3, .. }
        ));
        assert_eq!(wh.count_rows("forecasts").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn short_history_writes_nothing() {
        let wh = warehouse_with_history(3).await;
        let engine = ForecastEngine::new(wh.clone(), LinearTrendModel::new(7), 7, 30);
        let outcomes = engine.run_game("dota2", &Metric::ALL, day(3)).await.unwrap();
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, ForecastOutcome::InsufficientHistory { need: 7, .. })));
        assert_eq!(wh.count_rows("forecasts").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sparse_days_are_not_padded_into_a_window() {
        let wh = warehouse_with_days(&[1, 10]).await;
        let engine = ForecastEngine::new(wh.clone(), LinearTrendModel::new(7), 7, 30);
        let outcomes = engine.run_game("dota2", &Metric::ALL, day(10)).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        for outcome in &outcomes {
            assert!(
                matches!(outcome, ForecastOutcome::InsufficientHistory { have: 2, need: 7, .. }),
                "{outcome:?}"
            );
        }
        assert_eq!(wh.count_rows("forecasts").await.unwrap(), 0);
        // The dense series still spans every calendar day for the model.
        let dense = engine.history("dota2", Metric::MatchCount, day(10)).await.unwrap();
        assert_eq!(dense.len(), 10);
    }

    #[tokio::test]
    async fn gaps_are_zero_filled_once_enough_days_are_observed() {
        let wh = warehouse_with_days(&[1, 3, 5, 7, 9, 11, 13]).await;
        let engine = ForecastEngine::new(wh.clone(), LinearTrendModel::new(7), 2, 30);
        let outcomes = engine.run_game("dota2", &[Metric::MatchCount], day(14)).await.unwrap();
        assert!(matches!(
            outcomes[0],
            ForecastOutcome::Written { inserted: 2, updated: 0, .. }
        ));
        let history = engine.history("dota2", Metric::MatchCount, day(14)).await.unwrap();
        assert_eq!(history.len(), 14);
        assert_eq!(history.iter().filter(|p| p.value == 0.0).count(), 7);
    }
}
