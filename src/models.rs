//! Canonical warehouse entities and the raw record shape produced by connectors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single scalar value inside an open-ended per-game field bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ScalarValue {
    /// Convert a JSON value. Nested arrays/objects are kept as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

/// Typed string-keyed bag (`additional_data`, `additional_stats`, `event_data`).
/// Values are only interpreted when a typed getter asks for them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtraFields(BTreeMap<String, ScalarValue>);

impl ExtraFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_object(map: &Map<String, Value>) -> Self {
        Self(
            map.iter()
                .map(|(k, v)| (k.clone(), ScalarValue::from_json(v)))
                .collect(),
        )
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ScalarValue) {
        self.0.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        self.insert(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&ScalarValue> {
        self.0.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            ScalarValue::Int(i) => Some(*i),
            ScalarValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            ScalarValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            ScalarValue::Int(i) => Some(*i as f64),
            ScalarValue::Float(f) => Some(*f),
            ScalarValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            ScalarValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub game_id: String,
    pub game_name: String,
    pub platform: String,
    pub genre: String,
}

impl Game {
    fn seed(game_id: &str, game_name: &str, platform: &str, genre: &str) -> Self {
        Self {
            game_id: game_id.into(),
            game_name: game_name.into(),
            platform: platform.into(),
            genre: genre.into(),
        }
    }
}

/// Reference games seeded into a fresh warehouse.
pub fn seed_games() -> Vec<Game> {
    vec![
        Game::seed("dota2", "Dota 2", "steam", "MOBA"),
        Game::seed("csgo", "Counter-Strike: Global Offensive", "steam", "FPS"),
        Game::seed("valorant", "Valorant", "riot", "FPS"),
        Game::seed("gta5", "Grand Theft Auto V", "steam", "Action"),
        Game::seed("pubg", "PlayerUnknown's Battlegrounds", "steam", "Battle Royale"),
        Game::seed("cod", "Call of Duty", "activision", "FPS"),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub player_id: String,
    pub username: String,
    pub game_id: String,
    pub platform_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub match_id: String,
    pub game_id: String,
    pub match_date: DateTime<Utc>,
    pub duration_minutes: i64,
    pub match_type: String,
    pub platform: String,
    pub source: String,
    pub additional_data: ExtraFields,
}

impl Match {
    pub fn span(&self) -> MatchSpan {
        MatchSpan {
            start: self.match_date,
            duration_minutes: self.duration_minutes,
        }
    }
}

/// Time window a match occupies; events must fall inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchSpan {
    pub start: DateTime<Utc>,
    pub duration_minutes: i64,
}

impl MatchSpan {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::minutes(self.duration_minutes)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end()
    }
}

/// One row per (player_id, match_id). `game_id` is carried for player
/// auto-creation and is not persisted on the stat row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStat {
    pub stat_id: String,
    pub player_id: String,
    pub match_id: String,
    pub game_id: String,
    pub kills: i64,
    pub deaths: i64,
    pub assists: i64,
    pub score: i64,
    pub rank: Option<i64>,
    pub additional_stats: ExtraFields,
}

impl PlayerStat {
    pub fn stat_id_for(match_id: &str, player_id: &str) -> String {
        format!("stat_{match_id}_{player_id}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    pub event_id: String,
    pub match_id: String,
    pub game_id: String,
    pub event_type: String,
    pub event_timestamp: DateTime<Utc>,
    pub event_data: ExtraFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub forecast_id: String,
    pub game_id: String,
    pub forecast_date: NaiveDate,
    pub predicted_metric: String,
    pub predicted_value: f64,
    pub confidence_interval_lower: f64,
    pub confidence_interval_upper: f64,
    pub model_version: String,
}

/// Forecastable per-game daily metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ActivePlayers,
    MatchCount,
    AvgDuration,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::ActivePlayers, Metric::MatchCount, Metric::AvgDuration];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActivePlayers => "active_players",
            Self::MatchCount => "match_count",
            Self::AvgDuration => "avg_duration",
        }
    }

    /// Count metrics read zero on days with no observations.
    pub fn is_count(&self) -> bool {
        matches!(self, Self::ActivePlayers | Self::MatchCount)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active_players" | "player_count" => Ok(Self::ActivePlayers),
            "match_count" | "matches" => Ok(Self::MatchCount),
            "avg_duration" | "avg_match_duration" => Ok(Self::AvgDuration),
            other => Err(format!("unknown metric '{other}'")),
        }
    }
}

/// A normalized entity ready for loading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum CanonicalEntity {
    Player(Player),
    Match(Match),
    PlayerStat(PlayerStat),
    GameEvent(GameEvent),
}

impl CanonicalEntity {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Player(_) => "player",
            Self::Match(_) => "match",
            Self::PlayerStat(_) => "player_stat",
            Self::GameEvent(_) => "game_event",
        }
    }

    pub fn natural_key(&self) -> String {
        match self {
            Self::Player(p) => p.player_id.clone(),
            Self::Match(m) => m.match_id.clone(),
            Self::PlayerStat(s) => format!("{}|{}", s.player_id, s.match_id),
            Self::GameEvent(e) => e.event_id.clone(),
        }
    }

    pub fn game_id(&self) -> &str {
        match self {
            Self::Player(p) => &p.game_id,
            Self::Match(m) => &m.game_id,
            Self::PlayerStat(s) => &s.game_id,
            Self::GameEvent(e) => &e.game_id,
        }
    }

    /// Parent-before-child load order.
    pub fn load_rank(&self) -> u8 {
        match self {
            Self::Player(_) => 0,
            Self::Match(_) => 1,
            Self::PlayerStat(_) => 2,
            Self::GameEvent(_) => 3,
        }
    }
}

/// Canonical entity tagged with the connector that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub source: String,
    #[serde(flatten)]
    pub entity: CanonicalEntity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawKind {
    Match,
    PlayerStat,
    GameEvent,
}

impl RawKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::PlayerStat => "player_stat",
            Self::GameEvent => "game_event",
        }
    }
}

/// Unvalidated payload as returned by a source connector.
///
/// Connectors map their response shapes onto a shared key vocabulary
/// (`match_id`, `match_timestamp`, `duration_*`, `player_id`, `kills`, ...)
/// but leave values untyped; validation happens in the transformer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRecord {
    pub source: String,
    pub game_id: String,
    pub kind: RawKind,
    pub fetched_at: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl RawRecord {
    pub fn new(
        source: &str,
        game_id: &str,
        kind: RawKind,
        fetched_at: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        Self {
            source: source.to_string(),
            game_id: game_id.to_string(),
            kind,
            fetched_at,
            payload,
        }
    }
}

/// Bounds for a single connector fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub limit: usize,
    /// How many listed matches to expand into per-player detail.
    pub detail_limit: usize,
}
