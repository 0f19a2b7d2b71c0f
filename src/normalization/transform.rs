//! Validation, deduplication and normalization of raw connector output.
//!
//! `Transformer::normalize` is a pure function of its inputs: the batch and the
//! reference instant used for future-dating checks. Input order never changes
//! the output.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::RejectReason;
use crate::models::{
    CanonicalEntity, CanonicalRecord, ExtraFields, Game, GameEvent, Match, Player, PlayerStat,
    RawKind, RawRecord,
};
use crate::normalization::fields::{read_counter, read_text, DurationMapper, FieldError};
use crate::normalization::game_key::GameResolver;
use crate::normalization::timestamp::parse_timestamp;

const MAX_COUNTER: i64 = 100_000;
const MAX_SCORE: i64 = 100_000_000;
const MAX_RANK: i64 = 1_000_000;

/// A raw record excluded from load, with the reason it failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRecord {
    pub source: String,
    pub game_id: String,
    pub kind: RawKind,
    pub natural_key: Option<String>,
    pub reason: RejectReason,
    pub detail: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutput {
    /// Sorted parent-before-child, then by natural key.
    pub entities: Vec<CanonicalRecord>,
    pub rejected: Vec<RejectedRecord>,
    /// Valid records dropped because a later duplicate won.
    pub superseded: usize,
}

impl TransformOutput {
    pub fn rejected_count(&self, game_id: &str, source: &str) -> usize {
        self.rejected
            .iter()
            .filter(|r| r.game_id == game_id && r.source == source)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct Transformer {
    clock_skew: Duration,
    games: GameResolver,
    durations: DurationMapper,
}

/// Validated record waiting for deduplication. Ordering of `rank` decides
/// the winner among duplicates: latest fetch, then source, then payload text.
#[derive(Debug, Clone)]
struct Candidate {
    source: String,
    entity: CanonicalEntity,
    rank: (DateTime<Utc>, String, String),
    player: Option<Player>,
}

type Rejection = (RejectReason, String, Option<String>);

impl Transformer {
    pub fn new(games: &[Game], clock_skew: Duration) -> Self {
        Self {
            clock_skew,
            games: GameResolver::new(games),
            durations: DurationMapper::with_defaults(),
        }
    }

    pub fn normalize(&self, records: &[RawRecord], as_of: DateTime<Utc>) -> TransformOutput {
        let horizon = as_of + self.clock_skew;
        let mut rejected = Vec::new();
        let mut winners: BTreeMap<(u8, String), Candidate> = BTreeMap::new();
        let mut superseded = 0usize;

        for record in records {
            let result = match record.kind {
                RawKind::Match => self.match_candidate(record, horizon),
                RawKind::PlayerStat => self.stat_candidate(record),
                RawKind::GameEvent => self.event_candidate(record, horizon),
            };
            let candidate = match result {
                Ok(c) => c,
                Err((reason, detail, key)) => {
                    rejected.push(reject(record, reason, detail, key));
                    continue;
                }
            };
            let slot = (candidate.entity.load_rank(), candidate.entity.natural_key());
            match winners.get(&slot) {
                Some(existing) if existing.rank >= candidate.rank => {
                    superseded += 1;
                }
                Some(_) => {
                    superseded += 1;
                    winners.insert(slot, candidate);
                }
                None => {
                    winners.insert(slot, candidate);
                }
            }
        }

        // Events are checked against the winning match of the same batch.
        // Events for matches outside the batch are checked by the loader.
        let spans: BTreeMap<String, _> = winners
            .values()
            .filter_map(|c| match &c.entity {
                CanonicalEntity::Match(m) => Some((m.match_id.clone(), m.span())),
                _ => None,
            })
            .collect();
        let mut entities = Vec::with_capacity(winners.len());
        let mut players: BTreeMap<String, Candidate> = BTreeMap::new();
        for candidate in winners.into_values() {
            if let CanonicalEntity::GameEvent(e) = &candidate.entity {
                if let Some(span) = spans.get(&e.match_id) {
                    if !span.contains(e.event_timestamp) {
                        rejected.push(RejectedRecord {
                            source: candidate.source.clone(),
                            game_id: e.game_id.clone(),
                            kind: RawKind::GameEvent,
                            natural_key: Some(e.event_id.clone()),
                            reason: RejectReason::EventOutsideMatchWindow,
                            detail: format!(
                                "event at {} outside match window {}..{}",
                                e.event_timestamp,
                                span.start,
                                span.end()
                            ),
                            fetched_at: candidate.rank.0,
                            payload: serde_json::to_value(e).unwrap_or(Value::Null),
                        });
                        continue;
                    }
                }
            }
            if let Some(player) = &candidate.player {
                let replace = players
                    .get(&player.player_id)
                    .map_or(true, |existing| existing.rank < candidate.rank);
                if replace {
                    players.insert(
                        player.player_id.clone(),
                        Candidate {
                            source: candidate.source.clone(),
                            entity: CanonicalEntity::Player(player.clone()),
                            rank: candidate.rank.clone(),
                            player: None,
                        },
                    );
                }
            }
            entities.push(CanonicalRecord {
                source: candidate.source,
                entity: candidate.entity,
            });
        }

        let mut all: Vec<CanonicalRecord> = players
            .into_values()
            .map(|c| CanonicalRecord {
                source: c.source,
                entity: c.entity,
            })
            .collect();
        all.extend(entities);

        rejected.sort_by(|a, b| {
            (&a.source, a.kind, &a.natural_key, a.reason, a.payload.to_string()).cmp(&(
                &b.source,
                b.kind,
                &b.natural_key,
                b.reason,
                b.payload.to_string(),
            ))
        });

        TransformOutput {
            entities: all
                .into_iter()
                .sorted_by(|a, b| {
                    (a.entity.load_rank(), a.entity.natural_key())
                        .cmp(&(b.entity.load_rank(), b.entity.natural_key()))
                })
                .collect(),
            rejected,
            superseded,
        }
    }

    fn resolve_game(&self, record: &RawRecord) -> String {
        read_text(&record.payload, "game")
            .and_then(|label| self.games.resolve(&label))
            .or_else(|| self.games.resolve(&record.game_id))
            .unwrap_or_else(|| record.game_id.clone())
    }

    fn match_candidate(
        &self,
        record: &RawRecord,
        horizon: DateTime<Utc>,
    ) -> Result<Candidate, Rejection> {
        let p = &record.payload;
        let match_id = require_id(p, "match_id", None)?;
        let key = Some(match_id.clone());
        let match_date = timestamp(p, "match_timestamp", key.clone())?;
        if match_date > horizon {
            return Err((
                RejectReason::FutureTimestamp,
                format!("match_timestamp {match_date} is after {horizon}"),
                key,
            ));
        }
        let duration_minutes = self
            .durations
            .map(p)
            .map_err(|e| field_rejection(e, key.clone()))?
            .unwrap_or(0);

        let m = Match {
            match_id,
            game_id: self.resolve_game(record),
            match_date,
            duration_minutes,
            match_type: read_text(p, "match_type").unwrap_or_else(|| "unknown".into()),
            platform: read_text(p, "platform").unwrap_or_else(|| record.source.clone()),
            source: record.source.clone(),
            additional_data: extras(p, "additional_data"),
        };
        Ok(candidate(record, CanonicalEntity::Match(m), None))
    }

    fn stat_candidate(&self, record: &RawRecord) -> Result<Candidate, Rejection> {
        let p = &record.payload;
        let match_id = require_id(p, "match_id", None)?;
        let player_id = require_id(p, "player_id", Some(match_id.clone()))?;
        let key = Some(format!("{player_id}|{match_id}"));
        let counter = |field, max| {
            read_counter(p, field, Some(0), max).map_err(|e| field_rejection(e, key.clone()))
        };
        let kills = counter("kills", MAX_COUNTER)?.unwrap_or(0);
        let deaths = counter("deaths", MAX_COUNTER)?.unwrap_or(0);
        let assists = counter("assists", MAX_COUNTER)?.unwrap_or(0);
        let score = counter("score", MAX_SCORE)?.unwrap_or(0);
        let rank = read_counter(p, "rank", None, MAX_RANK)
            .map_err(|e| field_rejection(e, key.clone()))?;

        let game_id = self.resolve_game(record);
        let player = Player {
            player_id: player_id.clone(),
            username: read_text(p, "username").unwrap_or_else(|| player_id.clone()),
            game_id: game_id.clone(),
            platform_id: read_text(p, "platform_id"),
        };
        let stat = PlayerStat {
            stat_id: PlayerStat::stat_id_for(&match_id, &player_id),
            player_id,
            match_id,
            game_id,
            kills,
            deaths,
            assists,
            score,
            rank,
            additional_stats: extras(p, "additional_stats"),
        };
        Ok(candidate(record, CanonicalEntity::PlayerStat(stat), Some(player)))
    }

    fn event_candidate(
        &self,
        record: &RawRecord,
        horizon: DateTime<Utc>,
    ) -> Result<Candidate, Rejection> {
        let p = &record.payload;
        let event_id = require_id(p, "event_id", None)?;
        let key = Some(event_id.clone());
        let match_id = require_id(p, "match_id", key.clone())?;
        let event_type = read_text(p, "event_type").ok_or_else(|| {
            (RejectReason::MissingField, "event_type is missing".to_string(), key.clone())
        })?;
        let event_timestamp = timestamp(p, "event_timestamp", key.clone())?;
        if event_timestamp > horizon {
            return Err((
                RejectReason::FutureTimestamp,
                format!("event_timestamp {event_timestamp} is after {horizon}"),
                key,
            ));
        }
        let e = GameEvent {
            event_id,
            match_id,
            game_id: self.resolve_game(record),
            event_type,
            event_timestamp,
            event_data: extras(p, "event_data"),
        };
        Ok(candidate(record, CanonicalEntity::GameEvent(e), None))
    }
}

fn candidate(record: &RawRecord, entity: CanonicalEntity, player: Option<Player>) -> Candidate {
    Candidate {
        source: record.source.clone(),
        entity,
        rank: (
            record.fetched_at,
            record.source.clone(),
            Value::Object(record.payload.clone()).to_string(),
        ),
        player,
    }
}

fn require_id(
    p: &Map<String, Value>,
    field: &str,
    key: Option<String>,
) -> Result<String, Rejection> {
    read_text(p, field).ok_or_else(|| {
        (
            RejectReason::MissingIdentity,
            format!("{field} is missing or empty"),
            key,
        )
    })
}

fn timestamp(
    p: &Map<String, Value>,
    field: &str,
    key: Option<String>,
) -> Result<DateTime<Utc>, Rejection> {
    match p.get(field).filter(|v| !v.is_null()) {
        None => Err((RejectReason::MissingField, format!("{field} is missing"), key)),
        Some(v) => parse_timestamp(v).ok_or_else(|| {
            (
                RejectReason::UnparseableTimestamp,
                format!("{field} {v} is not a timestamp"),
                key,
            )
        }),
    }
}

fn field_rejection(err: FieldError, key: Option<String>) -> Rejection {
    match err {
        FieldError::NotNumeric(f) => {
            (RejectReason::InvalidNumeric, format!("{f} is not numeric"), key)
        }
        FieldError::Negative(f) => (RejectReason::OutOfBounds, format!("{f} is negative"), key),
        FieldError::TooLarge(f) => {
            (RejectReason::OutOfBounds, format!("{f} exceeds its bound"), key)
        }
    }
}

fn extras(p: &Map<String, Value>, field: &str) -> ExtraFields {
    match p.get(field) {
        Some(Value::Object(map)) => ExtraFields::from_json_object(map),
        _ => ExtraFields::new(),
    }
}

fn reject(
    record: &RawRecord,
    reason: RejectReason,
    detail: String,
    key: Option<String>,
) -> RejectedRecord {
    RejectedRecord {
        source: record.source.clone(),
        game_id: record.game_id.clone(),
        kind: record.kind,
        natural_key: key,
        reason,
        detail,
        fetched_at: record.fetched_at,
        payload: Value::Object(record.payload.clone()),
    }
}
