use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub mod api;

pub type Phone = String;
pub type TagId = String;

/// Challenge groups are numbered `1..=GROUP_COUNT`.
pub const GROUP_COUNT: u8 = 5;
pub const INITIAL_SKIP_POINTS: u32 = 3;
/// Skip allowance handed back after a penalized skip.
pub const SKIP_RESET_POINTS: u32 = 1;
pub const DEFAULT_SKIP_PENALTY: i64 = 5;
pub const DEFAULT_RANKING_LIMIT: usize = 10;
pub const SWIPE_THRESHOLD_PX: f64 = 80.0;
pub const MINUTES_PER_BAND: u32 = 15;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub phone: Phone,
    pub nickname: String,
    pub score: i64,
    pub skip_points: u32,
    #[serde(default)]
    pub last_challenger_phone: Phone,
}

impl Player {
    pub fn new(phone: impl Into<Phone>, nickname: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            nickname: nickname.into(),
            score: 0,
            skip_points: INITIAL_SKIP_POINTS,
            last_challenger_phone: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QrLink {
    #[serde(rename = "tagID")]
    pub tag_id: TagId,
    pub phone: Phone,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengeEntry {
    pub challenge: String,
    pub description: String,
    #[serde(default)]
    pub shareable: bool,
    #[serde(default)]
    pub points: i64,
}

impl ChallengeEntry {
    pub fn challenge_text(&self) -> String {
        render_line_breaks(&self.challenge)
    }

    pub fn description_text(&self) -> String {
        render_line_breaks(&self.description)
    }
}

/// Replaces `<br>` markers (any case) with newlines.
pub fn render_line_breaks(text: &str) -> String {
    const MARKER: &str = "<br>";
    // ASCII lowercasing keeps byte offsets aligned with `text`.
    let lower = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(found) = lower[cursor..].find(MARKER) {
        out.push_str(&text[cursor..cursor + found]);
        out.push('\n');
        cursor += found + MARKER.len();
    }
    out.push_str(&text[cursor..]);
    out
}

/// Challenge group selector, always within `1..=GROUP_COUNT`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub struct Reference(u8);

impl Reference {
    pub fn new(value: u8) -> Result<Self, CoreError> {
        if (1..=GROUP_COUNT).contains(&value) {
            Ok(Self(value))
        } else {
            Err(CoreError::InvalidReference(value.to_string()))
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let raw = raw.trim();
        raw.parse::<u8>()
            .map_err(|_| CoreError::InvalidReference(raw.to_string()))
            .and_then(Self::new)
    }

    /// Base reference as scanned from the tag; anything missing, unparseable
    /// or below 1 counts as group 1.
    pub fn base(raw: Option<&str>) -> u32 {
        raw.and_then(parse_int_prefix)
            .filter(|value| *value >= 1)
            .map(|value| value.min(u32::MAX as i64) as u32)
            .unwrap_or(1)
    }

    /// Time-rotated reference: each 15 minute band of the hour moves the
    /// group forward by one, clamped to the last group.
    pub fn rotated(base: Option<&str>, minute: u32) -> Self {
        let weight = (minute % 60) / MINUTES_PER_BAND;
        let value = Self::base(base)
            .saturating_add(weight)
            .clamp(1, GROUP_COUNT as u32);
        Self(value as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn key(self) -> String {
        self.0.to_string()
    }
}

impl TryFrom<u8> for Reference {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Reference> for u8 {
    fn from(reference: Reference) -> Self {
        reference.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire form of challenge groups, keyed by the group number as a string.
pub type ChallengeList = BTreeMap<String, Vec<ChallengeEntry>>;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(try_from = "BTreeMap<u8, Vec<ChallengeEntry>>")]
pub struct ChallengeCatalog {
    groups: BTreeMap<u8, Vec<ChallengeEntry>>,
}

impl TryFrom<BTreeMap<u8, Vec<ChallengeEntry>>> for ChallengeCatalog {
    type Error = CoreError;

    fn try_from(groups: BTreeMap<u8, Vec<ChallengeEntry>>) -> Result<Self, Self::Error> {
        if let Some(bad) = groups.keys().find(|group| !(1..=GROUP_COUNT).contains(*group)) {
            return Err(CoreError::UnknownGroup(*bad));
        }
        Ok(Self { groups })
    }
}

impl ChallengeCatalog {
    pub fn with_group(mut self, reference: Reference, entries: Vec<ChallengeEntry>) -> Self {
        self.groups.insert(reference.get(), entries);
        self
    }

    pub fn group(&self, reference: Reference) -> &[ChallengeEntry] {
        self.groups
            .get(&reference.get())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The single group for `reference`, shaped for the `challengeList` reply.
    pub fn list_for(&self, reference: Reference) -> ChallengeList {
        let mut list = ChallengeList::new();
        list.insert(reference.key(), self.group(reference).to_vec());
        list
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Picks a random entry from the `reference` group, falling back to the
/// `fallback` group when the first one is missing or empty.
pub fn pick_challenge<'a, R: Rng + ?Sized>(
    list: &'a ChallengeList,
    reference: Reference,
    fallback: Reference,
    rng: &mut R,
) -> Option<&'a ChallengeEntry> {
    let group = list
        .get(&reference.key())
        .filter(|entries| !entries.is_empty())
        .or_else(|| list.get(&fallback.key()))?;
    if group.is_empty() {
        return None;
    }
    group.get(rng.gen_range(0..group.len()))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipOutcome {
    FreeSkip,
    Penalized,
}

pub fn accept_challenge(challenged: &mut Player, challenger_phone: &str, points: i64) {
    challenged.score = challenged.score.saturating_add(points);
    challenged.last_challenger_phone = challenger_phone.to_string();
}

pub fn skip_challenge(challenged: &mut Player, challenger_phone: &str, penalty: i64) -> SkipOutcome {
    let outcome = if challenged.skip_points > 0 {
        challenged.skip_points -= 1;
        SkipOutcome::FreeSkip
    } else {
        challenged.score = challenged.score.saturating_sub(penalty);
        challenged.skip_points = SKIP_RESET_POINTS;
        SkipOutcome::Penalized
    };
    challenged.last_challenger_phone = challenger_phone.to_string();
    outcome
}

/// Leading-integer parse: optional sign followed by decimal digits, trailing
/// garbage ignored. `"12pts"` is 12, `"pts"` is `None`. Digit runs too long
/// for `i64` saturate.
pub fn parse_int_prefix(raw: &str) -> Option<i64> {
    let raw = raw.trim_start();
    let (negative, digits) = match raw.as_bytes().first() {
        Some(b'-') => (true, &raw[1..]),
        Some(b'+') => (false, &raw[1..]),
        _ => (false, raw),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let magnitude = digits[..end].bytes().fold(0i64, |acc, digit| {
        acc.saturating_mul(10)
            .saturating_add(i64::from(digit - b'0'))
    });
    Some(if negative { -magnitude } else { magnitude })
}

pub fn accept_points(raw: Option<&str>) -> i64 {
    raw.and_then(parse_int_prefix).unwrap_or(0)
}

pub fn skip_penalty(raw: Option<&str>) -> i64 {
    match raw.and_then(parse_int_prefix) {
        Some(penalty) if penalty > 0 => penalty,
        _ => DEFAULT_SKIP_PENALTY,
    }
}

pub fn ranking_limit(raw: Option<&str>) -> usize {
    match raw.and_then(parse_int_prefix) {
        Some(limit) if limit > 0 => limit as usize,
        _ => DEFAULT_RANKING_LIMIT,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankingEntry {
    pub position: usize,
    pub nickname: String,
    pub score: i64,
    pub phone: Phone,
}

/// Orders players by score, highest first. Ties keep their table order.
pub fn rank_players(mut players: Vec<Player>, limit: usize) -> Vec<RankingEntry> {
    players.sort_by(|a, b| b.score.cmp(&a.score));
    players
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(index, player)| RankingEntry {
            position: index + 1,
            nickname: if player.nickname.trim().is_empty() {
                "Player".to_string()
            } else {
                player.nickname
            },
            score: player.score,
            phone: player.phone,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SwipeIntent {
    Accept,
    Skip,
}

impl SwipeIntent {
    pub fn function(self) -> api::Function {
        match self {
            SwipeIntent::Accept => api::Function::AcceptChallenge,
            SwipeIntent::Skip => api::Function::SkipChallenge,
        }
    }
}

/// Horizontal drag past the threshold to the right accepts, to the left skips.
pub fn classify_swipe(delta_x: f64) -> Option<SwipeIntent> {
    if delta_x > SWIPE_THRESHOLD_PX {
        Some(SwipeIntent::Accept)
    } else if delta_x < -SWIPE_THRESHOLD_PX {
        Some(SwipeIntent::Skip)
    } else {
        None
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("reference must be between 1 and 5, got '{0}'")]
    InvalidReference(String),
    #[error("catalog group {0} is outside 1..=5")]
    UnknownGroup(u8),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
}
