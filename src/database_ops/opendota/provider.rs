use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::database_ops::http::get_json;
use crate::database_ops::rate_limit::{BudgetSpec, SourceGate};
use crate::database_ops::source::SourceConnector;
use crate::error::SourceError;
use crate::models::{FetchWindow, RawKind, RawRecord};

pub const OPENDOTA_API_BASE_URL: &str = "https://api.opendota.com/api";
pub const SOURCE: &str = "opendota";

/// Public Dota 2 stats API. Works without a key; a key only raises quotas.
#[derive(Debug, Clone)]
pub struct OpenDotaProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenDotaProvider {
    pub fn new(http: Client, base_url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url
                .unwrap_or_else(|| OPENDOTA_API_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
        }
    }

    fn query(&self, mut pairs: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        if let Some(key) = &self.api_key {
            pairs.push(("api_key", key.clone()));
        }
        pairs
    }

    async fn public_matches(
        &self,
        limit: usize,
        gate: &SourceGate,
    ) -> Result<Vec<Value>, SourceError> {
        let url = format!("{}/publicMatches", self.base_url);
        let query = self.query(vec![("limit", (limit * 2).clamp(1, 100).to_string())]);
        let body = gate.call(|| get_json(&self.http, &url, &query, &[])).await?;
        match body {
            Value::Array(items) => Ok(items),
            other => Err(SourceError::unavailable(format!(
                "unexpected publicMatches payload: {}",
                type_name(&other)
            ))),
        }
    }

    async fn match_details(&self, match_id: i64, gate: &SourceGate) -> Result<Value, SourceError> {
        let url = format!("{}/matches/{}", self.base_url, match_id);
        let query = self.query(Vec::new());
        gate.call(|| get_json(&self.http, &url, &query, &[])).await
    }
}

#[async_trait]
impl SourceConnector for OpenDotaProvider {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn budget(&self) -> BudgetSpec {
        BudgetSpec::per_minute(60)
    }

    fn supports(&self, game_id: &str) -> bool {
        game_id == "dota2"
    }

    #[instrument(skip(self, window, gate), fields(source = SOURCE))]
    async fn fetch(
        &self,
        game_id: &str,
        window: &FetchWindow,
        gate: &SourceGate,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let listed = self.public_matches(window.limit, gate).await?;
        let since = window.since.timestamp();
        let mut out = Vec::new();
        let mut detail_ids = Vec::new();

        for m in listed.iter() {
            let start = m.get("start_time").and_then(Value::as_i64).unwrap_or_default();
            if start != 0 && start < since {
                continue;
            }
            if out.len() >= window.limit {
                break;
            }
            let fetched_at = Utc::now();
            out.push(RawRecord::new(SOURCE, game_id, RawKind::Match, fetched_at, match_payload(m)));
            if let Some(id) = m.get("match_id").and_then(Value::as_i64) {
                detail_ids.push(id);
            }
        }

        for id in detail_ids.into_iter().take(window.detail_limit) {
            let details = match self.match_details(id, gate).await {
                Ok(v) => v,
                Err(e @ SourceError::RateLimited { .. }) => {
                    warn!(match_id = id, error = %e, "detail budget exhausted; keeping listed matches");
                    break;
                }
                Err(e) => {
                    warn!(match_id = id, error = %e, "match details unavailable");
                    continue;
                }
            };
            let fetched_at = Utc::now();
            let (stats, events) = detail_payloads(id, &details);
            debug!(match_id = id, players = stats.len(), events = events.len(), "match details");
            out.extend(
                stats
                    .into_iter()
                    .map(|p| RawRecord::new(SOURCE, game_id, RawKind::PlayerStat, fetched_at, p)),
            );
            out.extend(
                events
                    .into_iter()
                    .map(|p| RawRecord::new(SOURCE, game_id, RawKind::GameEvent, fetched_at, p)),
            );
        }

        info!(game_id, records = out.len(), "opendota fetch complete");
        Ok(out)
    }
}

pub fn lobby_type_name(lobby_type: i64) -> &'static str {
    match lobby_type {
        1 => "practice",
        2 => "tournament",
        3 => "tutorial",
        4 => "coop_bot",
        5 => "team_match",
        6 => "solo_queue",
        7 => "ranked",
        _ => "public",
    }
}

fn match_payload(m: &Value) -> Value {
    let lobby_type = m.get("lobby_type").and_then(Value::as_i64).unwrap_or_default();
    let match_id = m
        .get("match_id")
        .and_then(Value::as_i64)
        .map(|id| format!("opendota_{id}"));
    let mut extras = Map::new();
    for key in [
        "game_mode",
        "radiant_win",
        "radiant_score",
        "dire_score",
        "avg_rank_tier",
        "cluster",
        "region",
        "lobby_type",
    ] {
        if let Some(v) = m.get(key).filter(|v| !v.is_null()) {
            extras.insert(key.to_string(), v.clone());
        }
    }
    json!({
        "match_id": match_id,
        "game": "dota2",
        "match_timestamp": m.get("start_time").cloned().unwrap_or(Value::Null),
        "duration_seconds": m.get("duration").cloned().unwrap_or(Value::Null),
        "match_type": lobby_type_name(lobby_type),
        "platform": "pc",
        "additional_data": extras,
    })
}

const PLAYER_EXTRAS: [&str; 9] = [
    "hero_id",
    "gold_per_min",
    "xp_per_min",
    "last_hits",
    "denies",
    "net_worth",
    "hero_damage",
    "tower_damage",
    "player_slot",
];

/// Split a `/matches/{id}` document into player-stat and event payloads.
fn detail_payloads(match_id: i64, details: &Value) -> (Vec<Value>, Vec<Value>) {
    let qualified = format!("opendota_{match_id}");
    let start = details.get("start_time").and_then(Value::as_i64);

    let stats = details
        .get("players")
        .and_then(Value::as_array)
        .map(|players| {
            players
                .iter()
                .map(|p| {
                    let slot = p.get("player_slot").and_then(Value::as_i64).unwrap_or_default();
                    let player_id = match p.get("account_id").and_then(Value::as_i64) {
                        Some(acc) if acc > 0 => format!("opendota_player_{acc}"),
                        _ => format!("opendota_anon_{match_id}_{slot}"),
                    };
                    let mut extras = Map::new();
                    for key in PLAYER_EXTRAS {
                        if let Some(v) = p.get(key).filter(|v| !v.is_null()) {
                            extras.insert(key.to_string(), v.clone());
                        }
                    }
                    json!({
                        "match_id": qualified,
                        "player_id": player_id,
                        "username": p.get("personaname").cloned().unwrap_or(Value::Null),
                        "platform_id": p.get("account_id").cloned().unwrap_or(Value::Null),
                        "kills": p.get("kills").cloned().unwrap_or(Value::Null),
                        "deaths": p.get("deaths").cloned().unwrap_or(Value::Null),
                        "assists": p.get("assists").cloned().unwrap_or(Value::Null),
                        "score": p.get("total_gold").cloned().unwrap_or(Value::Null),
                        "rank": p.get("rank_tier").cloned().unwrap_or(Value::Null),
                        "additional_stats": extras,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let events = match (start, details.get("objectives").and_then(Value::as_array)) {
        (Some(start), Some(objectives)) => objectives
            .iter()
            .enumerate()
            .filter_map(|(idx, o)| {
                let offset = o.get("time").and_then(Value::as_i64)?;
                let mut data = Map::new();
                for key in ["type", "key", "slot", "team", "unit"] {
                    if let Some(v) = o.get(key).filter(|v| !v.is_null()) {
                        data.insert(key.to_string(), v.clone());
                    }
                }
                Some(json!({
                    "event_id": format!("{qualified}_obj_{idx}"),
                    "match_id": qualified,
                    "event_type": "objective",
                    "event_timestamp": start + offset,
                    "event_data": data,
                }))
            })
            .collect(),
        _ => Vec::new(),
    };

    (stats, events)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
