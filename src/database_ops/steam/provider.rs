use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::database_ops::http::get_json;
use crate::database_ops::rate_limit::{BudgetSpec, SourceGate};
use crate::database_ops::source::SourceConnector;
use crate::error::SourceError;
use crate::models::{FetchWindow, RawKind, RawRecord};

pub const STEAM_API_BASE_URL: &str = "https://api.steampowered.com";
pub const SOURCE: &str = "steam";

/// Steam app ids for the titles this source can report on.
pub fn app_id(game_id: &str) -> Option<u32> {
    match game_id {
        "dota2" => Some(570),
        "csgo" => Some(730),
        "gta5" => Some(271_590),
        _ => None,
    }
}

/// Key-required Steam Web API source.
///
/// Steam exposes no public match history without player ids, so each fetch
/// records an hourly population snapshot per title.
#[derive(Debug, Clone)]
pub struct SteamProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl SteamProvider {
    pub fn new(http: Client, base_url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url
                .unwrap_or_else(|| STEAM_API_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
        }
    }

    async fn current_players(
        &self,
        appid: u32,
        key: &str,
        gate: &SourceGate,
    ) -> Result<i64, SourceError> {
        let url = format!(
            "{}/ISteamUserStats/GetNumberOfCurrentPlayers/v1/",
            self.base_url
        );
        let query = vec![("appid", appid.to_string()), ("key", key.to_string())];
        let body = gate.call(|| get_json(&self.http, &url, &query, &[])).await?;
        let response = body.get("response");
        let ok = response
            .and_then(|r| r.get("result"))
            .and_then(Value::as_i64)
            .unwrap_or(1);
        if ok != 1 {
            return Err(SourceError::unavailable(format!(
                "steam reported result={ok} for appid {appid}"
            )));
        }
        response
            .and_then(|r| r.get("player_count"))
            .and_then(Value::as_i64)
            .ok_or_else(|| SourceError::unavailable("steam response missing player_count"))
    }
}

/// Start of the UTC hour containing `ts`.
fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

fn snapshot_payload(game_id: &str, appid: u32, bucket: DateTime<Utc>, players: i64) -> Value {
    json!({
        "match_id": format!("steam_{game_id}_{appid}_{}", bucket.format("%Y%m%d%H")),
        "game": game_id,
        "match_timestamp": bucket.to_rfc3339(),
        "duration_minutes": 0,
        "match_type": "population_snapshot",
        "platform": "steam",
        "additional_data": {
            "appid": appid,
            "current_players": players,
        },
    })
}

#[async_trait]
impl SourceConnector for SteamProvider {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn budget(&self) -> BudgetSpec {
        BudgetSpec::per_day(100_000)
    }

    fn supports(&self, game_id: &str) -> bool {
        app_id(game_id).is_some()
    }

    #[instrument(skip(self, window, gate), fields(source = SOURCE))]
    async fn fetch(
        &self,
        game_id: &str,
        window: &FetchWindow,
        gate: &SourceGate,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(SourceError::unavailable("STEAM_API_KEY not configured"));
        };
        let appid = app_id(game_id)
            .ok_or_else(|| SourceError::unavailable(format!("no steam app id for {game_id}")))?;

        let players = self.current_players(appid, key, gate).await?;
        let bucket = hour_bucket(window.until);
        info!(game_id, appid, players, "steam population snapshot");
        Ok(vec![RawRecord::new(
            SOURCE,
            game_id,
            RawKind::Match,
            Utc::now(),
            snapshot_payload(game_id, appid, bucket, players),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::rate_limit::{RateLimiter, RetryPolicy};
    use chrono::Duration;

    #[test]
    fn known_app_ids() {
        assert_eq!(app_id("dota2"), Some(570));
        assert_eq!(app_id("csgo"), Some(730));
        assert_eq!(app_id("gta5"), Some(271_590));
        assert_eq!(app_id("valorant"), None);
    }

    #[test]
    fn snapshot_ids_are_stable_within_an_hour() {
        let t = DateTime::parse_from_rfc3339("2024-03-05T14:37:12Z")
            .unwrap()
            .with_timezone(&Utc);
        let bucket = hour_bucket(t);
        assert_eq!(bucket, hour_bucket(t + Duration::minutes(20)));
        let p = snapshot_payload("csgo", 730, bucket, 812_345);
        assert_eq!(p["match_id"], "steam_csgo_730_2024030514");
        assert_eq!(p["additional_data"]["current_players"], 812_345);
        assert_eq!(p["duration_minutes"], 0);
    }

    #[tokio::test]
    async fn missing_key_is_unavailable_without_network() {
        let provider = SteamProvider::new(Client::new(), Some("http://127.0.0.1:9".into()), None);
        let gate = SourceGate::new(
            SOURCE,
            RateLimiter::shared(),
            provider.budget(),
            RetryPolicy::default(),
        );
        let now = Utc::now();
        let window = FetchWindow {
            since: now - Duration::hours(1),
            until: now,
            limit: 10,
            detail_limit: 5,
        };
        let err = provider.fetch("dota2", &window, &gate).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { transient: false, .. }));
    }
}
