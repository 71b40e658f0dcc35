use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two xkcd surfaces that are synced independently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Comics,
    Whatif,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Comics => "comics",
            SourceKind::Whatif => "whatif",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical record produced by a source's normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub source: SourceKind,
    pub item_id: i64,
    pub title: String,
    pub alt_text: String,
    pub body_text: String,
    pub posted_date: NaiveDate,
    pub collected_at: DateTime<Utc>,
    pub media: Option<MediaRef>,
    pub raw_payload: String,
}

/// Remote media and the local path it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub path: String,
}

/// Summary of one sync pass, logged at the end of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub previous_watermark: i64,
    pub latest: i64,
    pub attempted: u64,
    pub succeeded: u64,
    /// Already stored with media on disk; accepted without a fetch.
    pub verified: u64,
    pub skipped: u64,
    pub failed: u64,
    pub outstanding: Vec<i64>,
    pub watermark: i64,
    pub interrupted: bool,
}

impl PassReport {
    pub fn nothing_new(&self) -> bool {
        self.latest <= self.previous_watermark
    }
}
