//! Per-run report: what each game×source produced, what was rejected or
//! failed, and which forecasts were written.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::database_ops::loader::{LoadCounts, LoadFailure, LoadResult};
use crate::forecasting::ForecastOutcome;
use crate::models::CanonicalEntity;
use crate::normalization::{RejectedRecord, TransformOutput};
use crate::orchestrator::RunState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    /// Completed, but at least one source degraded or was replaced by mock data.
    CompletedDegraded,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    Degraded,
    /// Mock data standing in for a degraded source.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub game_id: String,
    pub source: String,
    pub status: SourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub mock: bool,
    pub extracted: usize,
    pub validated: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SourceReport {
    fn new(game_id: &str, source: &str) -> Self {
        Self {
            game_id: game_id.to_string(),
            source: source.to_string(),
            status: SourceStatus::Ok,
            cause: None,
            mock: source == crate::database_ops::mock::provider::SOURCE,
            extracted: 0,
            validated: 0,
            rejected: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
        }
    }

    fn add_load(&mut self, counts: &LoadCounts) {
        self.inserted += counts.inserted;
        self.updated += counts.updated;
        self.skipped += counts.skipped;
        self.failed += counts.failed;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub as_of: DateTime<Utc>,
    pub status: RunStatus,
    pub states: Vec<RunState>,
    pub sources: Vec<SourceReport>,
    pub rejected: Vec<RejectedRecord>,
    pub load_failures: Vec<LoadFailure>,
    pub auto_created_players: usize,
    pub forecasts: Vec<ForecastOutcome>,
}

impl RunReport {
    pub fn new(as_of: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            as_of,
            status: RunStatus::Running,
            states: vec![RunState::Idle],
            sources: Vec::new(),
            rejected: Vec::new(),
            load_failures: Vec::new(),
            auto_created_players: 0,
            forecasts: Vec::new(),
        }
    }

    pub fn source(&self, game_id: &str, source: &str) -> Option<&SourceReport> {
        self.sources
            .iter()
            .find(|s| s.game_id == game_id && s.source == source)
    }

    fn source_mut(&mut self, game_id: &str, source: &str) -> &mut SourceReport {
        let idx = match self
            .sources
            .iter()
            .position(|s| s.game_id == game_id && s.source == source)
        {
            Some(idx) => idx,
            None => {
                self.sources.push(SourceReport::new(game_id, source));
                self.sources.len() - 1
            }
        };
        &mut self.sources[idx]
    }

    pub fn record_state(&mut self, state: RunState) {
        if self.states.last() != Some(&state) {
            self.states.push(state);
        }
    }

    pub fn record_extracted(
        &mut self,
        game_id: &str,
        source: &str,
        status: SourceStatus,
        count: usize,
    ) {
        let row = self.source_mut(game_id, source);
        row.status = status;
        row.extracted += count;
    }

    pub fn record_source_failure(&mut self, game_id: &str, source: &str, cause: impl Into<String>) {
        let row = self.source_mut(game_id, source);
        row.status = SourceStatus::Degraded;
        row.cause = Some(cause.into());
    }

    pub fn record_transform(&mut self, output: &TransformOutput) {
        for record in &output.entities {
            if matches!(record.entity, CanonicalEntity::Player(_)) {
                continue;
            }
            self.source_mut(record.entity.game_id(), &record.source).validated += 1;
        }
        for rejected in &output.rejected {
            self.source_mut(&rejected.game_id, &rejected.source).rejected += 1;
        }
        self.rejected.extend(output.rejected.iter().cloned());
    }

    pub fn record_load(&mut self, game_id: &str, result: LoadResult) {
        for (source, counts) in &result.per_source {
            self.source_mut(game_id, source).add_load(counts);
        }
        self.auto_created_players += result.auto_created_players;
        self.load_failures.extend(result.failures);
    }

    pub fn record_forecasts(&mut self, outcomes: Vec<ForecastOutcome>) {
        self.forecasts.extend(outcomes);
    }

    pub fn is_degraded(&self) -> bool {
        self.sources
            .iter()
            .any(|s| s.status != SourceStatus::Ok)
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn totals(&self) -> SourceTotals {
        let mut t = SourceTotals::default();
        for s in &self.sources {
            t.extracted += s.extracted;
            t.validated += s.validated;
            t.rejected += s.rejected;
            t.inserted += s.inserted;
            t.updated += s.updated;
            t.skipped += s.skipped;
            t.failed += s.failed;
        }
        t
    }

    pub fn summary_line(&self) -> String {
        let t = self.totals();
        let written = self.forecasts.iter().filter(|f| f.is_written()).count();
        let degraded = self
            .sources
            .iter()
            .filter(|s| s.status == SourceStatus::Degraded)
            .count();
        format!(
            "run {} {:?}: extracted={} validated={} rejected={} inserted={} updated={} skipped={} failed={} degraded_sources={} forecasts_written={}/{}",
            self.run_id,
            self.status,
            t.extracted,
            t.validated,
            t.rejected,
            t.inserted,
            t.updated,
            t.skipped,
            t.failed,
            degraded,
            written,
            self.forecasts.len()
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceTotals {
    pub extracted: usize,
    pub validated: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}
