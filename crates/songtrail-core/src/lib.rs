//! Core domain model for chart-driven song aggregation.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "songtrail-core";

/// Identity of a song across charts and weeks: `artist + "_" + title`, exact strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SongKey(String);

impl SongKey {
    pub fn new(artist: &str, title: &str) -> Self {
        Self(format!("{artist}_{title}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SongKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One song line of a published chart week.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartEntry {
    pub artist: String,
    pub title: String,
    pub featuring: Option<String>,
    pub chart_name: String,
    pub rank: u32,
    pub peak_rank: u32,
    pub week: NaiveDate,
}

impl ChartEntry {
    pub fn key(&self) -> SongKey {
        SongKey::new(&self.artist, &self.title)
    }
}

/// Splits a chart credit such as `"Drake Featuring Lil Wayne"` into main artist and guest.
pub fn split_featuring(credit: &str) -> (String, Option<String>) {
    for marker in [" Featuring ", " featuring ", " Feat. ", " feat. "] {
        if let Some((main, guest)) = credit.split_once(marker) {
            let guest = guest.trim();
            let guest = (!guest.is_empty()).then(|| guest.to_string());
            return (main.trim().to_string(), guest);
        }
    }
    (credit.trim().to_string(), None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceId {
    Billboard,
    AzLyrics,
    Genius,
    LyricWiki,
    Spotify,
}

impl SourceId {
    /// Song sources in the order their facts are merged into a record.
    pub const SONG_SOURCES: [SourceId; 4] = [
        SourceId::Genius,
        SourceId::LyricWiki,
        SourceId::AzLyrics,
        SourceId::Spotify,
    ];

    /// Collaborator name used in usage reports.
    pub fn label(self) -> &'static str {
        match self {
            SourceId::Billboard => "Billboard",
            SourceId::AzLyrics => "AZLyrics",
            SourceId::Genius => "Genius",
            SourceId::LyricWiki => "Wikia",
            SourceId::Spotify => "Spotify",
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            SourceId::Billboard => "BB",
            SourceId::AzLyrics => "AZ",
            SourceId::Genius => "Genius",
            SourceId::LyricWiki => "Wikia",
            SourceId::Spotify => "Spotify",
        }
    }

    pub fn field_prefix(self) -> String {
        format!("{}_", self.short_name())
    }

    /// Field that is always present in a merged record, empty when the source had nothing.
    pub fn primary_field(self) -> &'static str {
        match self {
            SourceId::Billboard => "Song_Title",
            SourceId::Spotify => "Artist_ID",
            SourceId::AzLyrics | SourceId::Genius | SourceId::LyricWiki => "Lyrics",
        }
    }

    pub fn carries_lyrics(self) -> bool {
        matches!(
            self,
            SourceId::AzLyrics | SourceId::Genius | SourceId::LyricWiki
        )
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl FactValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FactValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for FactValue {
    fn from(value: &str) -> Self {
        FactValue::Text(value.to_string())
    }
}

impl From<String> for FactValue {
    fn from(value: String) -> Self {
        FactValue::Text(value)
    }
}

impl From<i64> for FactValue {
    fn from(value: i64) -> Self {
        FactValue::Integer(value)
    }
}

impl From<Vec<String>> for FactValue {
    fn from(value: Vec<String>) -> Self {
        FactValue::List(value)
    }
}

pub const LYRICS_FIELD: &str = "Lyrics";
pub const LINE_COUNT_FIELD: &str = "Line_Count";

/// Unprefixed facts one source returned for one song. Empty means "no match".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFacts {
    pub source: SourceId,
    pub fields: BTreeMap<String, FactValue>,
}

impl SourceFacts {
    pub fn empty(source: SourceId) -> Self {
        Self {
            source,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<FactValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<FactValue>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FactValue> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn lyrics(&self) -> Option<&str> {
        self.get(LYRICS_FIELD).and_then(FactValue::as_text)
    }

    /// Line count of the lyrics as published, before any flattening.
    pub fn lyric_line_count(&self) -> Option<usize> {
        match self.get(LINE_COUNT_FIELD) {
            Some(FactValue::Integer(lines)) => usize::try_from(*lines).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Matched,
    NoMatch,
    Unavailable,
    TimedOut,
}

impl FetchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchStatus::Matched => "matched",
            FetchStatus::NoMatch => "no_match",
            FetchStatus::Unavailable => "unavailable",
            FetchStatus::TimedOut => "timed_out",
        }
    }
}

/// What a single song lookup against one source produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub status: FetchStatus,
    pub facts: SourceFacts,
}

impl SourceOutcome {
    pub fn from_facts(facts: SourceFacts) -> Self {
        let status = if facts.is_empty() {
            FetchStatus::NoMatch
        } else {
            FetchStatus::Matched
        };
        Self { status, facts }
    }

    pub fn failed(source: SourceId, status: FetchStatus) -> Self {
        Self {
            status,
            facts: SourceFacts::empty(source),
        }
    }

    pub fn source(&self) -> SourceId {
        self.facts.source
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartDiscovery {
    #[serde(rename = "Chart_Name")]
    pub chart_name: String,
    #[serde(rename = "Peak_Position")]
    pub peak_position: u32,
    #[serde(rename = "Date")]
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LyricStats {
    pub word_count: usize,
    pub unique_word_count: usize,
    pub vocabulary_richness: f64,
    pub average_word_length: f64,
    pub line_count: usize,
}

/// Merged output for one song: chart discovery context, prefixed source facts, lyric statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedSongRecord {
    #[serde(rename = "BB_Artist")]
    pub artist: String,
    #[serde(rename = "BB_Featuring")]
    pub featuring: Option<String>,
    #[serde(rename = "BB_Song_Title")]
    pub title: String,
    #[serde(rename = "BB_Chart_Discovered")]
    pub discovered: ChartDiscovery,
    #[serde(flatten)]
    pub facts: BTreeMap<String, FactValue>,
    #[serde(rename = "Lyric_Stats", default)]
    pub lyric_stats: BTreeMap<String, LyricStats>,
}

impl UnifiedSongRecord {
    pub fn key(&self) -> SongKey {
        SongKey::new(&self.artist, &self.title)
    }

    pub fn fact(&self, name: &str) -> Option<&FactValue> {
        self.facts.get(name)
    }

    pub fn status_of(&self, source: SourceId) -> Option<&str> {
        self.fact(&format!("{}Status", source.field_prefix()))
            .and_then(FactValue::as_text)
    }
}

/// Records produced for one (chart, week), in chart rank order.
#[derive(Debug, Clone, PartialEq)]
pub struct WeekBatch {
    pub chart_name: String,
    pub week: NaiveDate,
    records: IndexMap<SongKey, UnifiedSongRecord>,
}

impl WeekBatch {
    pub fn new(chart_name: impl Into<String>, week: NaiveDate) -> Self {
        Self {
            chart_name: chart_name.into(),
            week,
            records: IndexMap::new(),
        }
    }

    pub fn contains(&self, key: &SongKey) -> bool {
        self.records.contains_key(key)
    }

    /// Adds a record unless its key is already present. Returns whether it was added.
    pub fn insert(&mut self, record: UnifiedSongRecord) -> bool {
        let key = record.key();
        if self.records.contains_key(&key) {
            return false;
        }
        self.records.insert(key, record);
        true
    }

    pub fn records(&self) -> &IndexMap<SongKey, UnifiedSongRecord> {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorUsage {
    pub calls: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub elapsed_secs: f64,
}

/// Per-collaborator call, error and latency totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageCounters(BTreeMap<String, CollaboratorUsage>);

impl UsageCounters {
    pub fn record(&mut self, collaborator: &str, elapsed: Duration, outcome: CallOutcome) {
        let entry = self.0.entry(collaborator.to_string()).or_default();
        entry.calls += 1;
        entry.elapsed_secs += elapsed.as_secs_f64();
        match outcome {
            CallOutcome::Ok => {}
            CallOutcome::Error => entry.errors += 1,
            CallOutcome::Timeout => {
                entry.errors += 1;
                entry.timeouts += 1;
            }
        }
    }

    pub fn get(&self, collaborator: &str) -> Option<&CollaboratorUsage> {
        self.0.get(collaborator)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CollaboratorUsage)> {
        self.0.iter()
    }

    pub fn total_calls(&self) -> u64 {
        self.0.values().map(|u| u.calls).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.0.values().map(|u| u.errors).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Usage snapshot flushed at a week boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub week: NaiveDate,
    pub records_processed: usize,
    pub run_elapsed_secs: f64,
    pub counters: UsageCounters,
}
