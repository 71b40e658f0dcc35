//! Row models returned by repositories.
//!
//! Keep these focused on what the queries return; sync decisions live in
//! `crate::sync`.

use chrono::{DateTime, NaiveDate, Utc};

/// An item row, as read back for verification and status output.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    pub item_id: i64,
    pub title: String,
    pub alt_text: String,
    pub body_text: String,
    pub posted_date: NaiveDate,
    pub collected_at: DateTime<Utc>,
    pub media_url: Option<String>,
    pub media_path: Option<String>,
    pub raw_payload: String,
}

/// Watermark row for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRow {
    pub source: String,
    pub last_id: i64,
    pub last_ran_at: Option<DateTime<Utc>>,
}
