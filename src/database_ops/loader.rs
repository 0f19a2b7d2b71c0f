//! Writes canonical entities into the warehouse, parents first, one row at a
//! time. A row that fails is recorded and skipped; only a schema violation
//! stops the batch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, StoreError};
use crate::models::{CanonicalEntity, CanonicalRecord, GameEvent, MatchSpan, Player, PlayerStat};

use super::warehouse::{Warehouse, WriteOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadCounts {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl LoadCounts {
    fn add(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted => self.inserted += 1,
            WriteOutcome::Updated => self.updated += 1,
            WriteOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: &LoadCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadFailure {
    pub source: String,
    pub entity: &'static str,
    pub key: String,
    /// `unknown_game`, `missing_parent_match`, `event_outside_match_window`,
    /// `load_conflict` or `backend_error`.
    pub code: &'static str,
    pub cause: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadResult {
    pub per_source: BTreeMap<String, LoadCounts>,
    pub failures: Vec<LoadFailure>,
    pub auto_created_players: usize,
}

impl LoadResult {
    pub fn totals(&self) -> LoadCounts {
        let mut total = LoadCounts::default();
        for counts in self.per_source.values() {
            total.merge(counts);
        }
        total
    }

    pub fn counts_for(&self, source: &str) -> LoadCounts {
        self.per_source.get(source).copied().unwrap_or_default()
    }

    pub fn merge(&mut self, other: LoadResult) {
        for (source, counts) in other.per_source {
            self.per_source.entry(source).or_default().merge(&counts);
        }
        self.failures.extend(other.failures);
        self.auto_created_players += other.auto_created_players;
    }

    fn fail(&mut self, record: &CanonicalRecord, code: &'static str, cause: impl Into<String>) {
        let cause = cause.into();
        warn!(
            source = %record.source,
            entity = record.entity.kind(),
            key = %record.entity.natural_key(),
            code,
            %cause,
            "row failed to load"
        );
        self.per_source.entry(record.source.clone()).or_default().failed += 1;
        self.failures.push(LoadFailure {
            source: record.source.clone(),
            entity: record.entity.kind(),
            key: record.entity.natural_key(),
            code,
            cause,
        });
    }
}

#[derive(Clone)]
pub struct Loader {
    warehouse: Arc<dyn Warehouse>,
}

/// Per-batch lookups so each parent is fetched at most once.
#[derive(Default)]
struct BatchCache {
    games: HashMap<String, bool>,
    spans: HashMap<String, Option<MatchSpan>>,
    players: HashSet<String>,
}

impl Loader {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    pub async fn load(&self, records: &[CanonicalRecord]) -> Result<LoadResult, PipelineError> {
        let mut ordered: Vec<&CanonicalRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.entity.load_rank());

        let mut result = LoadResult::default();
        let mut cache = BatchCache::default();
        for record in ordered {
            match self.known_game(&mut cache, record.entity.game_id()).await {
                Ok(true) => {}
                Ok(false) => {
                    let game = record.entity.game_id().to_string();
                    result.fail(record, "unknown_game", format!("game '{game}' is not registered"));
                    continue;
                }
                Err(err) => {
                    settle(&mut result, record, Err(err))?;
                    continue;
                }
            }
            let written = match &record.entity {
                CanonicalEntity::Player(p) => {
                    let res = self.warehouse.upsert_player(p).await;
                    if res.is_ok() {
                        cache.players.insert(p.player_id.clone());
                    }
                    res
                }
                CanonicalEntity::Match(m) => {
                    let res = self.warehouse.insert_match(m).await;
                    match res {
                        Ok(WriteOutcome::Inserted) => {
                            cache.spans.insert(m.match_id.clone(), Some(m.span()));
                        }
                        // Stored match wins; look it up on demand.
                        _ => {
                            cache.spans.remove(&m.match_id);
                        }
                    }
                    res
                }
                CanonicalEntity::PlayerStat(s) => {
                    match self.write_stat(&mut cache, &mut result, record, s).await? {
                        Some(res) => res,
                        None => continue,
                    }
                }
                CanonicalEntity::GameEvent(e) => {
                    match self.write_event(&mut cache, &mut result, record, e).await? {
                        Some(res) => res,
                        None => continue,
                    }
                }
            };
            settle(&mut result, record, written)?;
        }

        let totals = result.totals();
        info!(
            inserted = totals.inserted,
            updated = totals.updated,
            skipped = totals.skipped,
            failed = totals.failed,
            auto_created_players = result.auto_created_players,
            "batch loaded"
        );
        Ok(result)
    }

    /// `None` when the row was already recorded as failed.
    async fn write_stat(
        &self,
        cache: &mut BatchCache,
        result: &mut LoadResult,
        record: &CanonicalRecord,
        stat: &PlayerStat,
    ) -> Result<Option<Result<WriteOutcome, StoreError>>, PipelineError> {
        let span = match self.span(cache, &stat.match_id).await {
            Ok(span) => span,
            Err(err) => return Ok(Some(Err(err))),
        };
        if span.is_none() {
            result.fail(
                record,
                "missing_parent_match",
                format!("match '{}' not found", stat.match_id),
            );
            return Ok(None);
        }
        if !cache.players.contains(&stat.player_id) {
            let exists = match self.warehouse.player_exists(&stat.player_id).await {
                Ok(exists) => exists,
                Err(StoreError::Schema(msg)) => return Err(PipelineError::SchemaViolation(msg)),
                Err(err) => return Ok(Some(Err(err))),
            };
            if !exists {
                let player = Player {
                    player_id: stat.player_id.clone(),
                    username: stat.player_id.clone(),
                    game_id: stat.game_id.clone(),
                    platform_id: None,
                };
                match self.warehouse.upsert_player(&player).await {
                    Ok(_) => {
                        debug!(player_id = %stat.player_id, "auto-created player");
                        result.auto_created_players += 1;
                    }
                    Err(StoreError::Schema(msg)) => {
                        return Err(PipelineError::SchemaViolation(msg))
                    }
                    Err(err) => return Ok(Some(Err(err))),
                }
            }
            cache.players.insert(stat.player_id.clone());
        }
        Ok(Some(self.warehouse.insert_player_stat(stat).await))
    }

    async fn write_event(
        &self,
        cache: &mut BatchCache,
        result: &mut LoadResult,
        record: &CanonicalRecord,
        event: &GameEvent,
    ) -> Result<Option<Result<WriteOutcome, StoreError>>, PipelineError> {
        let span = match self.span(cache, &event.match_id).await {
            Ok(span) => span,
            Err(err) => return Ok(Some(Err(err))),
        };
        match span {
            None => {
                result.fail(
                    record,
                    "missing_parent_match",
                    format!("match '{}' not found", event.match_id),
                );
                Ok(None)
            }
            Some(span) if !span.contains(event.event_timestamp) => {
                result.fail(
                    record,
                    "event_outside_match_window",
                    format!(
                        "{} not within {}..{}",
                        event.event_timestamp,
                        span.start,
                        span.end()
                    ),
                );
                Ok(None)
            }
            Some(_) => Ok(Some(self.warehouse.insert_game_event(event).await)),
        }
    }

    /// Lookup failures are not cached, so a later row retries the query.
    async fn known_game(&self, cache: &mut BatchCache, game_id: &str) -> Result<bool, StoreError> {
        if let Some(known) = cache.games.get(game_id) {
            return Ok(*known);
        }
        let known = self.warehouse.game_exists(game_id).await?;
        cache.games.insert(game_id.to_string(), known);
        Ok(known)
    }

    async fn span(
        &self,
        cache: &mut BatchCache,
        match_id: &str,
    ) -> Result<Option<MatchSpan>, StoreError> {
        if let Some(span) = cache.spans.get(match_id) {
            return Ok(*span);
        }
        let span = self.warehouse.match_span(match_id).await?;
        cache.spans.insert(match_id.to_string(), span);
        Ok(span)
    }
}

/// Record a per-row outcome. Only a schema violation escapes.
fn settle(
    result: &mut LoadResult,
    record: &CanonicalRecord,
    written: Result<WriteOutcome, StoreError>,
) -> Result<(), PipelineError> {
    match written {
        Ok(outcome) => {
            result.per_source.entry(record.source.clone()).or_default().add(outcome);
            Ok(())
        }
        Err(StoreError::Schema(msg)) => Err(PipelineError::SchemaViolation(msg)),
        Err(StoreError::Conflict(msg)) => {
            result.fail(record, "load_conflict", msg);
            Ok(())
        }
        Err(StoreError::Backend(msg)) => {
            result.fail(record, "backend_error", msg);
            Ok(())
        }
    }
}
