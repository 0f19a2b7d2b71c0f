use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

use crate::database_ops::http::get_json;
use crate::database_ops::rate_limit::{BudgetSpec, SourceGate};
use crate::database_ops::source::SourceConnector;
use crate::error::SourceError;
use crate::models::{FetchWindow, RawKind, RawRecord};

pub const RIOT_API_BASE_URL: &str = "https://na.api.riotgames.com";
pub const SOURCE: &str = "riot";

/// Key-required Valorant match API. Match history is only reachable per
/// player, so the provider follows a configured list of PUUIDs.
#[derive(Debug, Clone)]
pub struct RiotProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    puuids: Vec<String>,
}

impl RiotProvider {
    pub fn new(
        http: Client,
        base_url: Option<String>,
        api_key: Option<String>,
        puuids: Vec<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url
                .unwrap_or_else(|| RIOT_API_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            puuids,
        }
    }

    async fn get(&self, path: &str, key: &str, gate: &SourceGate) -> Result<Value, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let headers = vec![("X-Riot-Token", key.to_string())];
        gate.call(|| get_json(&self.http, &url, &[], &headers)).await
    }
}

#[async_trait]
impl SourceConnector for RiotProvider {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn budget(&self) -> BudgetSpec {
        BudgetSpec::new(100, Duration::from_secs(120))
    }

    fn supports(&self, game_id: &str) -> bool {
        game_id == "valorant"
    }

    #[instrument(skip(self, window, gate), fields(source = SOURCE))]
    async fn fetch(
        &self,
        game_id: &str,
        window: &FetchWindow,
        gate: &SourceGate,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(SourceError::unavailable("RIOT_API_KEY not configured"));
        };
        if self.puuids.is_empty() {
            warn!("no RIOT_PUUIDS configured; nothing to follow");
            return Ok(Vec::new());
        }

        let since_ms = window.since.timestamp_millis();
        let mut match_ids: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for puuid in &self.puuids {
            let history = self
                .get(&format!("/val/match/v1/matchlists/by-puuid/{puuid}"), key, gate)
                .await?;
            for entry in history
                .get("history")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let started = entry
                    .get("gameStartTimeMillis")
                    .and_then(Value::as_i64)
                    .unwrap_or_default();
                if started != 0 && started < since_ms {
                    continue;
                }
                if let Some(id) = entry.get("matchId").and_then(Value::as_str) {
                    if seen.insert(id.to_string()) {
                        match_ids.push(id.to_string());
                    }
                }
            }
        }

        let mut out = Vec::new();
        for id in match_ids.into_iter().take(window.limit) {
            let doc = match self.get(&format!("/val/match/v1/matches/{id}"), key, gate).await {
                Ok(doc) => doc,
                Err(e @ SourceError::RateLimited { .. }) => return Err(e),
                Err(e) => {
                    warn!(match_id = %id, error = %e, "riot match unavailable");
                    continue;
                }
            };
            let fetched_at = Utc::now();
            let (m, stats) = match_payloads(&doc);
            if let Some(m) = m {
                out.push(RawRecord::new(SOURCE, game_id, RawKind::Match, fetched_at, m));
            }
            out.extend(
                stats
                    .into_iter()
                    .map(|s| RawRecord::new(SOURCE, game_id, RawKind::PlayerStat, fetched_at, s)),
            );
        }
        info!(game_id, records = out.len(), "riot fetch complete");
        Ok(out)
    }
}

/// Map a Valorant match document onto match and player-stat payloads.
fn match_payloads(doc: &Value) -> (Option<Value>, Vec<Value>) {
    let Some(info) = doc.get("matchInfo") else {
        return (None, Vec::new());
    };
    let match_id = info
        .get("matchId")
        .and_then(Value::as_str)
        .map(|id| format!("riot_{id}"));

    let mut extras = Map::new();
    for (from, to) in [
        ("mapId", "map_id"),
        ("gameMode", "game_mode"),
        ("isRanked", "is_ranked"),
        ("seasonId", "season_id"),
    ] {
        if let Some(v) = info.get(from).filter(|v| !v.is_null()) {
            extras.insert(to.to_string(), v.clone());
        }
    }
    let queue = info
        .get("queueId")
        .and_then(Value::as_str)
        .filter(|q| !q.is_empty())
        .unwrap_or("custom");

    let m = json!({
        "match_id": match_id,
        "game": "valorant",
        "match_timestamp": info.get("gameStartMillis").cloned().unwrap_or(Value::Null),
        "duration_millis": info.get("gameLengthMillis").cloned().unwrap_or(Value::Null),
        "match_type": queue,
        "platform": "pc",
        "additional_data": extras,
    });

    let stats = doc
        .get("players")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|p| {
            let puuid = p.get("puuid").and_then(Value::as_str)?;
            let s = p.get("stats").cloned().unwrap_or(Value::Null);
            let username = match (
                p.get("gameName").and_then(Value::as_str),
                p.get("tagLine").and_then(Value::as_str),
            ) {
                (Some(name), Some(tag)) => Value::from(format!("{name}#{tag}")),
                (Some(name), None) => Value::from(name),
                _ => Value::Null,
            };
            let mut extras = Map::new();
            for (from, to) in [
                ("characterId", "agent_id"),
                ("teamId", "team_id"),
                ("partyId", "party_id"),
            ] {
                if let Some(v) = p.get(from).filter(|v| !v.is_null()) {
                    extras.insert(to.to_string(), v.clone());
                }
            }
            if let Some(rounds) = s.get("roundsPlayed") {
                extras.insert("rounds_played".into(), rounds.clone());
            }
            Some(json!({
                "match_id": match_id,
                "player_id": format!("riot_player_{puuid}"),
                "username": username,
                "platform_id": puuid,
                "kills": s.get("kills").cloned().unwrap_or(Value::Null),
                "deaths": s.get("deaths").cloned().unwrap_or(Value::Null),
                "assists": s.get("assists").cloned().unwrap_or(Value::Null),
                "score": s.get("score").cloned().unwrap_or(Value::Null),
                "rank": p.get("competitiveTier").cloned().unwrap_or(Value::Null),
                "additional_stats": extras,
            }))
        })
        .collect();

    (Some(m), stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_match_document() {
        let doc = json!({
            "matchInfo": {"matchId": "abc-123", "gameStartMillis": 1_704_103_200_000i64, "gameLengthMillis": 2_100_000, "queueId": "competitive", "mapId": "/Game/Maps/Ascent"},
            "players": [
                {"puuid": "p1", "gameName": "tenz", "tagLine": "NA1", "characterId": "jett", "competitiveTier": 24,
                 "stats": {"score": 6200, "roundsPlayed": 22, "kills": 25, "deaths": 14, "assists": 4}},
                {"gameName": "no-puuid"}
            ]
        });
        let (m, stats) = match_payloads(&doc);
        let m = m.unwrap();
        assert_eq!(m["match_id"], "riot_abc-123");
        assert_eq!(m["duration_millis"], 2_100_000);
        assert_eq!(m["match_type"], "competitive");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0]["player_id"], "riot_player_p1");
        assert_eq!(stats[0]["username"], "tenz#NA1");
        assert_eq!(stats[0]["rank"], 24);
        assert_eq!(stats[0]["additional_stats"]["agent_id"], "jett");
    }

    #[test]
    fn document_without_match_info_is_empty() {
        let (m, stats) = match_payloads(&json!({"players": []}));
        assert!(m.is_none());
        assert!(stats.is_empty());
    }
}
