use super::model::{ProgressRow, StoredItem};
use crate::error::StoreError;
use crate::model::{ItemRecord, SourceKind};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        // WAL plus full fsync: a committed upsert survives a crash right after it.
        .journal_mode(if in_memory {
            SqliteJournalMode::Memory
        } else {
            SqliteJournalMode::Wal
        })
        .synchronous(SqliteSynchronous::Full);

    // Every pooled connection to `:memory:` would be a separate database.
    let max_connections = if in_memory { 1 } else { 4 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open {normalized}"))?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs and create the parent
/// directory. In-memory and non-sqlite URLs pass through unchanged.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(?err, dir = %parent.display(), "could not create database directory");
            }
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{expanded}?{q}"),
        None => format!("sqlite://{expanded}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Progress store
// ---------------------------------------------------------------------------

/// Current watermark for `source`; the row is created at 0 on first use.
#[instrument(skip_all, fields(source = %source))]
pub async fn get_watermark(pool: &Pool, source: SourceKind) -> Result<i64, StoreError> {
    sqlx::query("INSERT OR IGNORE INTO sync_progress (source, last_id) VALUES (?, 0)")
        .bind(source.as_str())
        .execute(pool)
        .await?;
    let id: i64 = sqlx::query_scalar("SELECT last_id FROM sync_progress WHERE source = ?")
        .bind(source.as_str())
        .fetch_one(pool)
        .await?;
    Ok(id)
}

/// Advance the watermark. Writing the current value again is allowed (it
/// refreshes `last_ran_at`); moving it backwards is not.
#[instrument(skip_all, fields(source = %source, id = id))]
pub async fn set_watermark(pool: &Pool, source: SourceKind, id: i64) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT OR IGNORE INTO sync_progress (source, last_id) VALUES (?, 0)")
        .bind(source.as_str())
        .execute(&mut *tx)
        .await?;
    let current: i64 = sqlx::query_scalar("SELECT last_id FROM sync_progress WHERE source = ?")
        .bind(source.as_str())
        .fetch_one(&mut *tx)
        .await?;
    if id < current {
        return Err(StoreError::WatermarkRegression {
            source_name: source.as_str().to_string(),
            current,
            requested: id,
        });
    }
    sqlx::query("UPDATE sync_progress SET last_id = ?, last_ran_at = ? WHERE source = ?")
        .bind(id)
        .bind(Utc::now())
        .bind(source.as_str())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Operator restart: overwrite the watermark with `id`, even if it is lower
/// than the stored value.
#[instrument(skip_all, fields(source = %source, id = id))]
pub async fn restart_watermark(pool: &Pool, source: SourceKind, id: i64) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO sync_progress (source, last_id, last_ran_at) VALUES (?, ?, ?) \
         ON CONFLICT(source) DO UPDATE SET last_id = excluded.last_id, last_ran_at = excluded.last_ran_at",
    )
    .bind(source.as_str())
    .bind(id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_progress(pool: &Pool, source: SourceKind) -> Result<Option<ProgressRow>> {
    let row = sqlx::query("SELECT source, last_id, last_ran_at FROM sync_progress WHERE source = ?")
        .bind(source.as_str())
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| ProgressRow {
        source: row.get("source"),
        last_id: row.get("last_id"),
        last_ran_at: row.try_get("last_ran_at").ok().flatten(),
    }))
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

/// Insert the record, or overwrite every field of the existing
/// `(source, item_id)` row.
#[instrument(skip_all, fields(source = %record.source, item_id = record.item_id))]
pub async fn upsert_item(pool: &Pool, record: &ItemRecord) -> Result<(), StoreError> {
    let (media_url, media_path) = match &record.media {
        Some(m) => (Some(m.url.as_str()), Some(m.path.as_str())),
        None => (None, None),
    };
    sqlx::query(
        "INSERT INTO items \
            (source, item_id, title, alt_text, body_text, posted_date, collected_at, media_url, media_path, raw_payload) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(source, item_id) DO UPDATE SET \
            title = excluded.title, \
            alt_text = excluded.alt_text, \
            body_text = excluded.body_text, \
            posted_date = excluded.posted_date, \
            collected_at = excluded.collected_at, \
            media_url = excluded.media_url, \
            media_path = excluded.media_path, \
            raw_payload = excluded.raw_payload",
    )
    .bind(record.source.as_str())
    .bind(record.item_id)
    .bind(&record.title)
    .bind(&record.alt_text)
    .bind(&record.body_text)
    .bind(record.posted_date)
    .bind(record.collected_at)
    .bind(media_url)
    .bind(media_path)
    .bind(&record.raw_payload)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all, fields(source = %source, item_id = item_id))]
pub async fn find_item(
    pool: &Pool,
    source: SourceKind,
    item_id: i64,
) -> Result<Option<StoredItem>, StoreError> {
    let row = sqlx::query(
        "SELECT item_id, title, alt_text, body_text, posted_date, collected_at, media_url, media_path, raw_payload \
         FROM items WHERE source = ? AND item_id = ?",
    )
    .bind(source.as_str())
    .bind(item_id)
    .fetch_optional(pool)
    .await?;
    row.map(|row| stored_item_from_row(&row)).transpose()
}

fn stored_item_from_row(row: &SqliteRow) -> Result<StoredItem, StoreError> {
    Ok(StoredItem {
        item_id: row.try_get("item_id")?,
        title: row.try_get("title")?,
        alt_text: row.try_get("alt_text")?,
        body_text: row.try_get("body_text")?,
        posted_date: row.try_get("posted_date")?,
        collected_at: row.try_get("collected_at")?,
        media_url: row.try_get("media_url")?,
        media_path: row.try_get("media_path")?,
        raw_payload: row.try_get("raw_payload")?,
    })
}

pub async fn count_items(pool: &Pool, source: SourceKind) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE source = ?")
        .bind(source.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn list_item_ids(pool: &Pool, source: SourceKind) -> Result<Vec<i64>, StoreError> {
    let ids = sqlx::query_scalar("SELECT item_id FROM items WHERE source = ? ORDER BY item_id")
        .bind(source.as_str())
        .fetch_all(pool)
        .await?;
    Ok(ids)
}
