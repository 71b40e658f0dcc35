//! Sync driver: one pass of DISCOVER_LATEST -> COMPUTE_RANGE ->
//! PROCESS_ITEM* -> FINALIZE for a single source.
//!
//! The watermark is committed once, at the end of the pass, as the id just
//! below the lowest id still outstanding (or the remote maximum when nothing
//! is). An id that failed therefore holds the watermark even if later ids
//! were stored; those later ids are recognised from the record store on the
//! next pass and accepted without a fetch. A crash before FINALIZE leaves
//! the old watermark, and the next pass walks the same range again.
use reqwest::Url;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::error::{ItemError, StoreError, SyncError};
use crate::media;
use crate::model::PassReport;
use crate::source::Source;
use crate::transport::Session;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Root of this source's fan-out media directories.
    pub media_dir: PathBuf,
    pub courtesy_delay: Duration,
    /// Operator restart: walk from 0 and overwrite the watermark at the end.
    pub restart: bool,
}

/// What happened to one id that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Synced,
    /// Record and media already present; nothing fetched.
    Verified,
}

/// Ids still to sync: `(watermark, latest]`.
pub fn pending_range(watermark: i64, latest: i64) -> RangeInclusive<i64> {
    (watermark + 1)..=latest
}

/// End-of-batch commit: one below the lowest outstanding id, else `latest`.
/// Never below `current`, never above `latest`.
pub fn next_watermark(current: i64, latest: i64, outstanding: &BTreeSet<i64>) -> i64 {
    let candidate = match outstanding.first() {
        Some(lowest) => lowest - 1,
        None => latest,
    };
    candidate.min(latest).max(current)
}

pub struct Syncer<'a> {
    pool: &'a Pool,
    session: &'a Session,
    source: &'a dyn Source,
    options: SyncOptions,
}

impl<'a> Syncer<'a> {
    pub fn new(
        pool: &'a Pool,
        session: &'a Session,
        source: &'a dyn Source,
        options: SyncOptions,
    ) -> Self {
        Self {
            pool,
            session,
            source,
            options,
        }
    }

    /// Run one pass. Only discovery and progress-store failures are returned;
    /// per-item failures end up in `PassReport::outstanding`.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<PassReport, SyncError> {
        let span = info_span!("sync_pass", source = %self.source.kind(), run_id = %Uuid::new_v4());
        self.run_pass(shutdown).instrument(span).await
    }

    async fn run_pass(&self, mut shutdown: watch::Receiver<bool>) -> Result<PassReport, SyncError> {
        let kind = self.source.kind();
        let watermark = if self.options.restart {
            warn!("restart requested; walking from 0");
            0
        } else {
            db::get_watermark(self.pool, kind).await?
        };

        // DISCOVER_LATEST
        let latest = self
            .source
            .latest_id(self.session)
            .await
            .map_err(|source| SyncError::Discovery {
                source_name: kind.as_str(),
                source,
            })?;
        info!(watermark, latest, "discovered latest id");

        let mut report = PassReport {
            previous_watermark: watermark,
            latest,
            watermark,
            ..PassReport::default()
        };

        // COMPUTE_RANGE
        let pending = pending_range(watermark, latest);
        if pending.is_empty() {
            info!(watermark, "nothing new");
            self.commit_watermark(watermark).await?;
            return Ok(report);
        }
        let mut outstanding: BTreeSet<i64> = pending.clone().collect();
        info!(count = outstanding.len(), "items to sync");

        // PROCESS_ITEM, ascending
        for id in pending {
            if *shutdown.borrow() {
                warn!(next = id, "interrupted; finalizing with what is stored");
                report.interrupted = true;
                break;
            }

            let result = self.process_item(id).await;
            let touched_network = !matches!(
                result,
                Ok(ItemOutcome::Verified) | Err(ItemError::Sentinel(_))
            );
            match result {
                Ok(ItemOutcome::Synced) => {
                    outstanding.remove(&id);
                    report.attempted += 1;
                    report.succeeded += 1;
                    info!(id, "synced");
                }
                Ok(ItemOutcome::Verified) => {
                    outstanding.remove(&id);
                    report.verified += 1;
                    info!(id, "already stored");
                }
                Err(err) if err.is_permanent_skip() => {
                    outstanding.remove(&id);
                    report.skipped += 1;
                    info!(id, reason = err.kind(), "skipped");
                }
                Err(err) => {
                    report.attempted += 1;
                    report.failed += 1;
                    log_item_failure(id, &err);
                }
            }

            if touched_network && !self.options.courtesy_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.courtesy_delay) => {}
                    _ = interrupted(&mut shutdown) => {}
                }
            }
        }

        // FINALIZE
        let next = next_watermark(watermark, latest, &outstanding);
        self.commit_watermark(next).await?;
        report.watermark = next;
        report.outstanding = outstanding.into_iter().collect();
        Ok(report)
    }

    /// A restart only reaches the store here, after discovery succeeded.
    async fn commit_watermark(&self, id: i64) -> Result<(), StoreError> {
        let kind = self.source.kind();
        if self.options.restart {
            db::restart_watermark(self.pool, kind, id).await
        } else {
            db::set_watermark(self.pool, kind, id).await
        }
    }

    /// Fetcher -> Normalizer -> Acquirer -> Record Store for one id.
    #[instrument(skip(self), fields(source = %self.source.kind()))]
    pub async fn process_item(&self, id: i64) -> Result<ItemOutcome, ItemError> {
        if self.source.is_sentinel(id) {
            return Err(ItemError::Sentinel(id));
        }
        if self.already_stored(id).await? {
            return Ok(ItemOutcome::Verified);
        }

        let raw = self.source.fetch(self.session, id).await?;
        let record = self.source.normalize(id, raw, &self.options.media_dir)?;

        if let Some(media) = &record.media {
            let url = Url::parse(&media.url).map_err(|err| {
                ItemError::malformed(id, format!("bad media url: {err}"), record.raw_payload.clone())
            })?;
            let acquired = media::acquire(self.session, &url, std::path::Path::new(&media.path))
                .await
                .map_err(|source| ItemError::Download { id, source })?;
            debug!(path = %acquired.path().display(), "media in place");
        }

        db::upsert_item(self.pool, &record)
            .await
            .map_err(|source| ItemError::Storage { id, source })?;
        Ok(ItemOutcome::Synced)
    }

    /// Stored with its media on disk: counts as synced without a fetch.
    async fn already_stored(&self, id: i64) -> Result<bool, ItemError> {
        let stored = db::find_item(self.pool, self.source.kind(), id)
            .await
            .map_err(|source| ItemError::Storage { id, source })?;
        let Some(stored) = stored else {
            return Ok(false);
        };
        match stored.media_path {
            None => Ok(true),
            Some(path) => Ok(tokio::fs::try_exists(&path).await.unwrap_or(false)),
        }
    }
}

/// Resolves once shutdown is requested; never, if the sender is gone.
async fn interrupted(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn log_item_failure(id: i64, err: &ItemError) {
    match err {
        ItemError::Malformed { reason, raw, .. } => {
            warn!(id, %reason, raw = %raw, "malformed payload; id stays outstanding");
        }
        other => warn!(id, kind = other.kind(), error = %other, "item failed; id stays outstanding"),
    }
}
