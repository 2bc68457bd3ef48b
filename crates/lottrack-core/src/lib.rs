//! Canonical draw model and per-game domain rules for lottrack.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "lottrack-core";

pub const DEFAULT_MAIN_COUNT: usize = 5;

fn default_main_count() -> usize {
    DEFAULT_MAIN_COUNT
}

/// Static numeric and scheduling rules for one lottery game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotteryDomain {
    pub key: String,
    pub name: String,
    #[serde(default = "default_main_count")]
    pub main_count: usize,
    pub main_max: u8,
    pub bonus_max: u8,
    pub draw_weekdays: Vec<Weekday>,
    pub draw_time: NaiveTime,
}

impl LotteryDomain {
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        main_max: u8,
        bonus_max: u8,
        draw_weekdays: impl IntoIterator<Item = Weekday>,
        draw_time: NaiveTime,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            main_count: DEFAULT_MAIN_COUNT,
            main_max,
            bonus_max,
            draw_weekdays: draw_weekdays.into_iter().collect(),
            draw_time,
        }
    }

    /// File name of this game's draw history inside the data directory.
    pub fn store_file_name(&self) -> String {
        format!("{}.json", self.key.to_ascii_lowercase())
    }

    pub fn is_draw_day(&self, date: NaiveDate) -> bool {
        self.draw_weekdays.contains(&date.weekday())
    }

    pub fn validate(&self, draw: &Draw) -> Result<(), ValidationError> {
        if draw.main.len() != self.main_count {
            return Err(ValidationError::WrongCount {
                lottery: self.key.clone(),
                expected: self.main_count,
                actual: draw.main.len(),
            });
        }

        let mut seen = BTreeSet::new();
        for &number in &draw.main {
            if !seen.insert(number) {
                return Err(ValidationError::DuplicateNumber {
                    lottery: self.key.clone(),
                    number,
                });
            }
            if number == 0 || number > self.main_max {
                return Err(ValidationError::MainOutOfRange {
                    lottery: self.key.clone(),
                    number,
                    max: self.main_max,
                });
            }
        }

        if draw.bonus == 0 || draw.bonus > self.bonus_max {
            return Err(ValidationError::BonusOutOfRange {
                lottery: self.key.clone(),
                number: draw.bonus,
                max: self.bonus_max,
            });
        }

        if !self.is_draw_day(draw.date) {
            return Err(ValidationError::NotADrawDay {
                lottery: self.key.clone(),
                date: draw.date,
                weekday: draw.date.weekday(),
            });
        }

        Ok(())
    }

    /// Most recent draw day on or before `date`, used when a source page carries no date.
    pub fn latest_draw_day_on_or_before(&self, date: NaiveDate) -> Option<NaiveDate> {
        (0..7u64)
            .filter_map(|offset| date.checked_sub_days(Days::new(offset)))
            .find(|candidate| self.is_draw_day(*candidate))
    }

    /// First scheduled draw strictly after `now`.
    pub fn next_draw_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        (0..=7u64)
            .filter_map(|offset| now.date().checked_add_days(Days::new(offset)))
            .filter(|day| self.is_draw_day(*day))
            .map(|day| day.and_time(self.draw_time))
            .find(|draw_at| *draw_at > now)
    }
}

/// One official result. `main` is kept sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Draw {
    pub date: NaiveDate,
    pub main: Vec<u8>,
    pub bonus: u8,
}

impl Draw {
    pub fn new(date: NaiveDate, main: impl IntoIterator<Item = u8>, bonus: u8) -> Self {
        let mut main: Vec<u8> = main.into_iter().collect();
        main.sort_unstable();
        Self { date, main, bonus }
    }

    pub fn same_numbers(&self, other: &Draw) -> bool {
        self.main == other.main && self.bonus == other.bonus
    }
}

impl fmt::Display for Draw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} + {}", self.date, self.main, self.bonus)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{lottery}: expected {expected} main numbers, got {actual}")]
    WrongCount {
        lottery: String,
        expected: usize,
        actual: usize,
    },
    #[error("{lottery}: main number {number} appears more than once")]
    DuplicateNumber { lottery: String, number: u8 },
    #[error("{lottery}: main number {number} outside 1..={max}")]
    MainOutOfRange { lottery: String, number: u8, max: u8 },
    #[error("{lottery}: bonus number {number} outside 1..={max}")]
    BonusOutOfRange { lottery: String, number: u8, max: u8 },
    #[error("{lottery}: {date} is a {weekday}, not a draw day")]
    NotADrawDay {
        lottery: String,
        date: NaiveDate,
        weekday: Weekday,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Timeout,
    Parse,
    Validation,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Network => "network error",
            FailureKind::Timeout => "timeout",
            FailureKind::Parse => "parse error",
            FailureKind::Validation => "validation error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SourceFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Output of a single adapter attempt within one update cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceResult<T> {
    pub source_id: String,
    /// Static rank of the source; lower is more trusted.
    pub priority: u32,
    pub outcome: Result<T, SourceFailure>,
}

impl<T> SourceResult<T> {
    pub fn ok(source_id: impl Into<String>, priority: u32, value: T) -> Self {
        Self {
            source_id: source_id.into(),
            priority,
            outcome: Ok(value),
        }
    }

    pub fn failed(source_id: impl Into<String>, priority: u32, failure: SourceFailure) -> Self {
        Self {
            source_id: source_id.into(),
            priority,
            outcome: Err(failure),
        }
    }

    pub fn candidate(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }
}

pub type DrawResult = SourceResult<Draw>;
pub type JackpotResult = SourceResult<JackpotQuote>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Agreed,
    Fallback,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Agreed => f.write_str("agreed"),
            Confidence::Fallback => f.write_str("fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedRecord {
    pub draw: Draw,
    pub verified_by: Vec<String>,
    pub confidence: Confidence,
}

/// Advertised prize as reported by a single jackpot source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JackpotQuote {
    pub amount: String,
    pub cash_value: u64,
}

/// Current jackpot state for one game; replaced on every successful fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JackpotSnapshot {
    pub amount: String,
    pub cash_value: u64,
    #[serde(default)]
    pub next_draw: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A draw as persisted in a history file, with optional verification audit fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDraw {
    #[serde(flatten)]
    pub draw: Draw,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_by: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
}

impl From<&VerifiedRecord> for StoredDraw {
    fn from(record: &VerifiedRecord) -> Self {
        Self {
            draw: record.draw.clone(),
            verified_by: Some(record.verified_by.clone()),
            confidence: Some(record.confidence),
        }
    }
}

impl From<Draw> for StoredDraw {
    fn from(draw: Draw) -> Self {
        Self {
            draw,
            verified_by: None,
            confidence: None,
        }
    }
}

/// Persisted per-game history, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawHistory {
    #[serde(alias = "lottery")]
    pub name: String,
    #[serde(default)]
    pub abbreviation: String,
    #[serde(default)]
    pub draws: Vec<StoredDraw>,
    #[serde(default)]
    pub last_updated: Option<NaiveDateTime>,
}

impl DrawHistory {
    pub fn empty(domain: &LotteryDomain) -> Self {
        Self {
            name: domain.name.clone(),
            abbreviation: domain.key.clone(),
            draws: Vec::new(),
            last_updated: None,
        }
    }

    pub fn latest(&self) -> Option<&Draw> {
        self.draws.first().map(|stored| &stored.draw)
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.draws.iter().any(|stored| stored.draw.date == date)
    }

    /// Existing entry carrying the same main and bonus numbers, under any date.
    pub fn find_numbers(&self, draw: &Draw) -> Option<&Draw> {
        self.draws
            .iter()
            .map(|stored| &stored.draw)
            .find(|existing| existing.same_numbers(draw))
    }

    /// Index that keeps the sequence strictly newest-first once `date` is inserted there.
    pub fn insertion_index(&self, date: NaiveDate) -> usize {
        self.draws.partition_point(|stored| stored.draw.date > date)
    }

    pub fn is_newest_first(&self) -> bool {
        self.draws
            .windows(2)
            .all(|pair| pair[0].draw.date > pair[1].draw.date)
    }
}
