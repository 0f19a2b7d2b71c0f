use strsim::jaro_winkler;

use crate::models::Game;

/// Minimum Jaro-Winkler similarity for a raw label to match a known game.
pub const MIN_GAME_SIMILARITY: f64 = 0.90;

/// Canonicalized game label used for fuzzy comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameKey {
    normalized: String,
    numeric_sig: Option<String>,
}

impl GameKey {
    /// Build a comparison key from a raw game label.
    ///
    /// - lowercase, drop punctuation and whitespace
    /// - turn a trailing roman numeral into digits ("GTA V" → "gta5")
    /// - expand common abbreviations ("CS:GO", "GTA", "COD")
    /// - record the numeric signature so "Dota 2" never matches "Dota"
    pub fn new(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        let with_digits = roman_suffix_to_digits(&lowered);
        let alnum_only: String = with_digits
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        let expanded = expand_common_abbreviations(&alnum_only);
        let digits: String = expanded.chars().filter(|c| c.is_ascii_digit()).collect();
        Self {
            normalized: expanded,
            numeric_sig: (!digits.is_empty()).then_some(digits),
        }
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn numeric_compatible(&self, other: &Self) -> bool {
        match (&self.numeric_sig, &other.numeric_sig) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    pub fn similarity(&self, other: &Self) -> f64 {
        jaro_winkler(self.normalized(), other.normalized())
    }
}

fn roman_suffix_to_digits(input: &str) -> String {
    const NUMERALS: [(&str, &str); 5] = [
        (" v", " 5"),
        (" iv", " 4"),
        (" iii", " 3"),
        (" ii", " 2"),
        (" vi", " 6"),
    ];
    for (roman, digit) in NUMERALS {
        if let Some(stem) = input.strip_suffix(roman) {
            return format!("{stem}{digit}");
        }
    }
    input.to_string()
}

fn expand_common_abbreviations(input: &str) -> String {
    match input {
        "csgo" | "cs" | "counterstrike" | "counterstrikego" => {
            "counterstrikeglobaloffensive".into()
        }
        "gta5" | "gtav" => "grandtheftauto5".into(),
        "cod" => "callofduty".into(),
        "pubg" => "playerunknownsbattlegrounds".into(),
        "dota" => "dota".into(),
        other => other.to_string(),
    }
}

/// Resolves raw game labels to seeded game slugs.
#[derive(Debug, Clone, Default)]
pub struct GameResolver {
    known: Vec<(String, Vec<GameKey>)>,
}

impl GameResolver {
    pub fn new(games: &[Game]) -> Self {
        let known = games
            .iter()
            .map(|g| {
                (
                    g.game_id.clone(),
                    vec![GameKey::new(&g.game_id), GameKey::new(&g.game_name)],
                )
            })
            .collect();
        Self { known }
    }

    /// Exact slug match first, then the closest key above the similarity floor.
    pub fn resolve(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if let Some((id, _)) = self.known.iter().find(|(id, _)| id == trimmed) {
            return Some(id.clone());
        }
        let key = GameKey::new(trimmed);
        if key.normalized().is_empty() {
            return None;
        }
        let mut best: Option<(&str, f64)> = None;
        for (id, keys) in &self.known {
            for candidate in keys {
                if !key.numeric_compatible(candidate) {
                    continue;
                }
                let score = key.similarity(candidate);
                if score >= MIN_GAME_SIMILARITY && best.map_or(true, |(_, s)| score > s) {
                    best = Some((id.as_str(), score));
                }
            }
        }
        best.map(|(id, _)| id.to_string())
    }
}
