use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use xkcd_sync::db::{self, Pool};
use xkcd_sync::error::{SyncError, TransportError};
use xkcd_sync::model::{ItemRecord, MediaRef, SourceKind};
use xkcd_sync::source::{media_path, Comics, Source, Whatif};
use xkcd_sync::sync::{SyncOptions, Syncer};
use xkcd_sync::transport::{PageFormat, Payload, Session, Transport};

const COMICS_BASE: &str = "https://xkcd.com/";
const WHATIF_BASE: &str = "https://what-if.xkcd.com/";

async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

#[derive(Clone)]
enum Reply {
    Json(Value),
    Html(String),
    Timeout,
}

/// Canned transport: url -> reply, plus a log of every url asked for.
#[derive(Clone, Default)]
struct RecordingTransport {
    replies: Arc<Mutex<HashMap<String, Reply>>>,
    failing_downloads: Arc<Mutex<HashSet<String>>>,
    fetches: Arc<Mutex<Vec<String>>>,
    downloads: Arc<Mutex<Vec<String>>>,
    stop_on: Arc<Mutex<Option<(String, watch::Sender<bool>)>>>,
}

impl RecordingTransport {
    fn reply(&self, url: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(url.to_string(), reply);
    }

    fn fail_download(&self, url: &str) {
        self.failing_downloads.lock().unwrap().insert(url.to_string());
    }

    fn heal_download(&self, url: &str) {
        self.failing_downloads.lock().unwrap().remove(url);
    }

    /// Request shutdown as soon as `url` is fetched.
    fn stop_after(&self, url: &str, stop: watch::Sender<bool>) {
        *self.stop_on.lock().unwrap() = Some((url.to_string(), stop));
    }

    fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }

    fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }

    fn clear_log(&self) {
        self.fetches.lock().unwrap().clear();
        self.downloads.lock().unwrap().clear();
    }

    /// Per-comic fetches only, discovery excluded.
    fn comic_fetches(&self) -> Vec<i64> {
        self.fetches()
            .iter()
            .filter_map(|url| {
                url.strip_prefix(COMICS_BASE)?
                    .strip_suffix("/info.0.json")?
                    .parse()
                    .ok()
            })
            .collect()
    }

    fn latest_comic(&self, latest: i64) {
        self.reply(&format!("{COMICS_BASE}info.0.json"), Reply::Json(comic(latest)));
    }

    fn comics(&self, ids: impl IntoIterator<Item = i64>) {
        for id in ids {
            self.reply(&format!("{COMICS_BASE}{id}/info.0.json"), Reply::Json(comic(id)));
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn fetch(&self, url: &Url, format: PageFormat) -> Result<Payload, TransportError> {
        self.fetches.lock().unwrap().push(url.to_string());
        if let Some((stop_url, stop)) = self.stop_on.lock().unwrap().as_ref() {
            if stop_url == url.as_str() {
                let _ = stop.send(true);
            }
        }
        let reply = self.replies.lock().unwrap().get(url.as_str()).cloned();
        match (reply, format) {
            (Some(Reply::Json(value)), PageFormat::Json) => Ok(Payload::Json(value)),
            (Some(Reply::Json(value)), PageFormat::Html) => Ok(Payload::Html(value.to_string())),
            (Some(Reply::Html(body)), _) => Ok(Payload::Html(body)),
            (Some(Reply::Timeout), _) => Err(TransportError::Timeout { url: url.to_string() }),
            (None, _) => Err(TransportError::NotFound { url: url.to_string() }),
        }
    }

    async fn download(&self, url: &Url, dest: &mut tokio::fs::File) -> Result<u64, TransportError> {
        self.downloads.lock().unwrap().push(url.to_string());
        if self.failing_downloads.lock().unwrap().contains(url.as_str()) {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: 503,
            });
        }
        let body = format!("image bytes for {url}");
        dest.write_all(body.as_bytes()).await.map_err(|source| TransportError::Io {
            url: url.to_string(),
            source,
        })?;
        Ok(body.len() as u64)
    }
}

fn comic(id: i64) -> Value {
    json!({
        "num": id,
        "title": format!("Comic {id}"),
        "safe_title": format!("Comic {id}"),
        "alt": format!("alt text {id}"),
        "transcript": "",
        "img": format!("https://imgs.xkcd.com/comics/c{id}.png"),
        "year": "2020", "month": "2", "day": "29",
        "link": "", "news": ""
    })
}

struct Harness {
    pool: Pool,
    transport: RecordingTransport,
    session: Session,
    media: tempfile::TempDir,
}

impl Harness {
    async fn new() -> Self {
        let transport = RecordingTransport::default();
        Self {
            pool: setup_pool().await,
            session: Session::new(transport.clone()),
            transport,
            media: tempfile::tempdir().unwrap(),
        }
    }

    fn media_dir(&self) -> PathBuf {
        self.media.path().join("comics")
    }

    fn options(&self, restart: bool) -> SyncOptions {
        SyncOptions {
            media_dir: self.media_dir(),
            courtesy_delay: Duration::ZERO,
            restart,
        }
    }

    async fn run_with(
        &self,
        source: &dyn Source,
        restart: bool,
    ) -> Result<xkcd_sync::model::PassReport, SyncError> {
        let (_tx, rx) = watch::channel(false);
        Syncer::new(&self.pool, &self.session, source, self.options(restart))
            .run(rx)
            .await
    }

    async fn run_comics(&self) -> Result<xkcd_sync::model::PassReport, SyncError> {
        let comics = Comics::new(Url::parse(COMICS_BASE).unwrap());
        self.run_with(&comics, false).await
    }

    async fn watermark(&self) -> i64 {
        db::get_watermark(&self.pool, SourceKind::Comics).await.unwrap()
    }

    async fn stored(&self) -> Vec<i64> {
        db::list_item_ids(&self.pool, SourceKind::Comics).await.unwrap()
    }

    fn comic_media(&self, id: i64) -> PathBuf {
        media_path(&self.media_dir(), id, "png")
    }
}

#[tokio::test]
async fn nothing_new_makes_no_item_requests() {
    let h = Harness::new().await;
    db::set_watermark(&h.pool, SourceKind::Comics, 8).await.unwrap();
    h.transport.latest_comic(8);

    let report = h.run_comics().await.unwrap();
    assert!(report.nothing_new());
    assert_eq!(report.attempted, 0);
    assert!(h.transport.comic_fetches().is_empty());
    assert_eq!(h.watermark().await, 8);

    // A remote maximum below the watermark is also "nothing new".
    h.transport.latest_comic(6);
    let report = h.run_comics().await.unwrap();
    assert!(report.nothing_new());
    assert_eq!(h.watermark().await, 8);
}

#[tokio::test]
async fn syncs_the_pending_range_in_order() {
    let h = Harness::new().await;
    db::set_watermark(&h.pool, SourceKind::Comics, 5).await.unwrap();
    h.transport.latest_comic(8);
    h.transport.comics(1..=8);

    let report = h.run_comics().await.unwrap();
    assert_eq!(h.transport.comic_fetches(), vec![6, 7, 8]);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.watermark, 8);
    assert_eq!(h.watermark().await, 8);
    assert_eq!(h.stored().await, vec![6, 7, 8]);
    assert!(h.comic_media(7).exists());
    assert_eq!(h.transport.downloads().len(), 3);

    let item = db::find_item(&h.pool, SourceKind::Comics, 7)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.title, "Comic 7");
    assert_eq!(item.alt_text, "alt text 7");
    assert_eq!(item.posted_date.to_string(), "2020-02-29");
    assert_eq!(
        item.media_path.as_deref(),
        Some(h.comic_media(7).to_string_lossy().as_ref())
    );
}

#[tokio::test]
async fn sentinel_is_skipped_without_a_request() {
    let h = Harness::new().await;
    db::set_watermark(&h.pool, SourceKind::Comics, 402).await.unwrap();
    h.transport.latest_comic(405);
    h.transport.comics([403, 405]);

    let report = h.run_comics().await.unwrap();
    assert_eq!(h.transport.comic_fetches(), vec![403, 405]);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.watermark, 405);
    assert_eq!(h.stored().await, vec![403, 405]);
}

#[tokio::test]
async fn transient_failure_holds_the_watermark_below_the_gap() {
    let h = Harness::new().await;
    h.transport.latest_comic(3);
    h.transport.comics([1, 3]);
    h.transport
        .reply(&format!("{COMICS_BASE}2/info.0.json"), Reply::Timeout);

    let report = h.run_comics().await.unwrap();
    assert_eq!(report.outstanding, vec![2]);
    assert_eq!(report.failed, 1);
    assert_eq!(report.watermark, 1);
    assert_eq!(h.watermark().await, 1);
    assert_eq!(h.stored().await, vec![1, 3]);

    // Next pass: only the gap is fetched, 3 is recognised from the store.
    h.transport.clear_log();
    h.transport.comics([2]);
    let report = h.run_comics().await.unwrap();
    assert_eq!(h.transport.comic_fetches(), vec![2]);
    assert_eq!(report.verified, 1);
    assert_eq!(report.watermark, 3);
    assert_eq!(h.stored().await, vec![1, 2, 3]);
}

#[tokio::test]
async fn malformed_payload_stays_outstanding() {
    let h = Harness::new().await;
    h.transport.latest_comic(4);
    h.transport.comics([1, 2, 4]);
    let mut broken = comic(3);
    broken.as_object_mut().unwrap().remove("alt");
    h.transport
        .reply(&format!("{COMICS_BASE}3/info.0.json"), Reply::Json(broken));

    let report = h.run_comics().await.unwrap();
    assert_eq!(report.outstanding, vec![3]);
    assert_eq!(h.watermark().await, 2);
    assert_eq!(h.stored().await, vec![1, 2, 4]);

    h.transport.clear_log();
    let report = h.run_comics().await.unwrap();
    assert_eq!(h.transport.comic_fetches(), vec![3]);
    assert_eq!(report.watermark, 2);

    h.transport.clear_log();
    h.transport.comics([3]);
    let report = h.run_comics().await.unwrap();
    assert_eq!(h.transport.comic_fetches(), vec![3]);
    assert_eq!(report.watermark, 4);
}

#[tokio::test]
async fn failed_media_download_keeps_the_item_unstored() {
    let h = Harness::new().await;
    h.transport.latest_comic(2);
    h.transport.comics([1, 2]);
    h.transport.fail_download("https://imgs.xkcd.com/comics/c2.png");

    let report = h.run_comics().await.unwrap();
    assert_eq!(report.outstanding, vec![2]);
    assert_eq!(h.watermark().await, 1);
    assert_eq!(h.stored().await, vec![1]);
    assert!(!h.comic_media(2).exists());

    h.transport.heal_download("https://imgs.xkcd.com/comics/c2.png");
    let report = h.run_comics().await.unwrap();
    assert_eq!(report.watermark, 2);
    assert!(h.comic_media(2).exists());
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let h = Harness::new().await;
    h.transport.latest_comic(3);
    h.transport.comics(1..=3);

    h.run_comics().await.unwrap();
    let downloads = h.transport.downloads().len();
    h.transport.clear_log();

    let report = h.run_comics().await.unwrap();
    assert!(report.nothing_new());
    assert!(h.transport.comic_fetches().is_empty());
    assert!(h.transport.downloads().is_empty());
    assert_eq!(downloads, 3);
    assert_eq!(h.stored().await.len(), 3);
}

#[tokio::test]
async fn crash_before_finalize_recovers_without_refetching() {
    let h = Harness::new().await;
    // Items and media landed but the watermark was never advanced.
    for id in 1..=3 {
        let path = h.comic_media(id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"img").unwrap();
        db::upsert_item(&h.pool, &stored_comic(id, &path)).await.unwrap();
    }
    h.transport.latest_comic(3);

    let report = h.run_comics().await.unwrap();
    assert!(h.transport.comic_fetches().is_empty());
    assert_eq!(report.verified, 3);
    assert_eq!(report.watermark, 3);
    assert_eq!(h.watermark().await, 3);
}

#[tokio::test]
async fn restart_reverifies_and_refetches_missing_media() {
    let h = Harness::new().await;
    h.transport.latest_comic(3);
    h.transport.comics(1..=3);
    h.run_comics().await.unwrap();

    std::fs::remove_file(h.comic_media(2)).unwrap();
    h.transport.clear_log();

    let comics = Comics::new(Url::parse(COMICS_BASE).unwrap());
    let report = h.run_with(&comics, true).await.unwrap();
    assert_eq!(report.previous_watermark, 0);
    assert_eq!(h.transport.comic_fetches(), vec![2]);
    assert_eq!(report.verified, 2);
    assert_eq!(report.watermark, 3);
    assert!(h.comic_media(2).exists());
    assert_eq!(h.stored().await, vec![1, 2, 3]);
}

#[tokio::test]
async fn discovery_failure_leaves_progress_untouched() {
    let h = Harness::new().await;
    db::set_watermark(&h.pool, SourceKind::Comics, 5).await.unwrap();
    h.transport
        .reply(&format!("{COMICS_BASE}info.0.json"), Reply::Timeout);

    let err = h.run_comics().await.unwrap_err();
    assert!(matches!(err, SyncError::Discovery { source_name: "comics", .. }));
    assert!(h.transport.comic_fetches().is_empty());
    assert_eq!(h.watermark().await, 5);

    h.transport
        .reply(&format!("{COMICS_BASE}info.0.json"), Reply::Json(json!({ "title": "no num" })));
    let err = h.run_comics().await.unwrap_err();
    assert!(matches!(err, SyncError::Discovery { .. }));
    assert_eq!(h.watermark().await, 5);
}

#[tokio::test]
async fn restart_with_failed_discovery_keeps_the_watermark() {
    let h = Harness::new().await;
    db::set_watermark(&h.pool, SourceKind::Comics, 5).await.unwrap();
    h.transport
        .reply(&format!("{COMICS_BASE}info.0.json"), Reply::Timeout);

    let comics = Comics::new(Url::parse(COMICS_BASE).unwrap());
    let err = h.run_with(&comics, true).await.unwrap_err();
    assert!(matches!(err, SyncError::Discovery { .. }));
    assert_eq!(h.watermark().await, 5);

    // Once discovery works, the restart is committed even below the old value.
    h.transport.latest_comic(3);
    h.transport.comics(1..=3);
    let report = h.run_with(&comics, true).await.unwrap();
    assert_eq!(report.previous_watermark, 0);
    assert_eq!(report.watermark, 3);
    assert_eq!(h.watermark().await, 3);
}

#[tokio::test]
async fn storage_failure_leaves_the_id_outstanding() {
    let h = Harness::new().await;
    h.transport.latest_comic(3);
    h.transport.comics(1..=3);
    sqlx::query(
        "CREATE TRIGGER reject_item_2 BEFORE INSERT ON items WHEN NEW.item_id = 2 \
         BEGIN SELECT RAISE(ABORT, 'disk full'); END",
    )
    .execute(&h.pool)
    .await
    .unwrap();

    let report = h.run_comics().await.unwrap();
    assert_eq!(h.transport.comic_fetches(), vec![1, 2, 3]);
    assert_eq!(report.failed, 1);
    assert_eq!(report.outstanding, vec![2]);
    assert_eq!(report.watermark, 1);
    assert_eq!(h.stored().await, vec![1, 3]);

    sqlx::query("DROP TRIGGER reject_item_2")
        .execute(&h.pool)
        .await
        .unwrap();
    h.transport.clear_log();
    let report = h.run_comics().await.unwrap();
    assert_eq!(h.transport.comic_fetches(), vec![2]);
    // The image landed on the first attempt.
    assert!(h.transport.downloads().is_empty());
    assert_eq!(report.watermark, 3);
    assert_eq!(h.stored().await, vec![1, 2, 3]);
}

#[tokio::test]
async fn stop_requested_before_start_fetches_nothing() {
    let h = Harness::new().await;
    h.transport.latest_comic(3);
    h.transport.comics(1..=3);

    let (_tx, rx) = watch::channel(true);
    let comics = Comics::new(Url::parse(COMICS_BASE).unwrap());
    let report = Syncer::new(&h.pool, &h.session, &comics, h.options(false))
        .run(rx)
        .await
        .unwrap();
    assert!(report.interrupted);
    assert!(h.transport.comic_fetches().is_empty());
    assert_eq!(report.watermark, 0);
    assert_eq!(h.watermark().await, 0);
}

#[tokio::test]
async fn interrupt_mid_pass_finalizes_after_the_current_item() {
    let h = Harness::new().await;
    h.transport.latest_comic(3);
    h.transport.comics(1..=3);
    let (tx, rx) = watch::channel(false);
    h.transport
        .stop_after(&format!("{COMICS_BASE}1/info.0.json"), tx);

    let comics = Comics::new(Url::parse(COMICS_BASE).unwrap());
    let report = Syncer::new(&h.pool, &h.session, &comics, h.options(false))
        .run(rx)
        .await
        .unwrap();
    assert!(report.interrupted);
    assert_eq!(h.transport.comic_fetches(), vec![1]);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.outstanding, vec![2, 3]);
    assert_eq!(report.watermark, 1);
    assert_eq!(h.watermark().await, 1);
    assert_eq!(h.stored().await, vec![1]);
}

#[tokio::test]
async fn whatif_pass_uses_archive_metadata() {
    let h = Harness::new().await;
    h.transport.reply(
        &format!("{WHATIF_BASE}archive/"),
        Reply::Html(WHATIF_ARCHIVE.to_string()),
    );
    h.transport
        .reply(&format!("{WHATIF_BASE}1/"), Reply::Html(article(1, true)));
    h.transport
        .reply(&format!("{WHATIF_BASE}2/"), Reply::Html(article(2, false)));

    let whatif = Whatif::new(Url::parse(WHATIF_BASE).unwrap());
    let report = h.run_with(&whatif, false).await.unwrap();
    assert_eq!(report.latest, 2);
    assert_eq!(report.watermark, 2);
    assert_eq!(
        db::get_watermark(&h.pool, SourceKind::Whatif).await.unwrap(),
        2
    );
    // Comics progress is independent.
    assert_eq!(h.watermark().await, 0);

    let first = db::find_item(&h.pool, SourceKind::Whatif, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.title, "Relativistic Baseball");
    assert_eq!(first.alt_text, "Question 1?");
    assert_eq!(first.posted_date.to_string(), "2012-07-03");
    assert_eq!(
        first.media_url.as_deref(),
        Some("https://what-if.xkcd.com/imgs/a/1/figure.png")
    );
    assert!(Path::new(first.media_path.as_deref().unwrap()).exists());

    let second = db::find_item(&h.pool, SourceKind::Whatif, 2)
        .await
        .unwrap()
        .unwrap();
    assert!(second.media_path.is_none());
    assert_eq!(h.transport.downloads().len(), 1);
}

fn stored_comic(id: i64, media: &Path) -> ItemRecord {
    ItemRecord {
        source: SourceKind::Comics,
        item_id: id,
        title: format!("Comic {id}"),
        alt_text: "alt".into(),
        body_text: String::new(),
        posted_date: chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        collected_at: chrono::Utc::now(),
        media: Some(MediaRef {
            url: format!("https://imgs.xkcd.com/comics/c{id}.png"),
            path: media.to_string_lossy().into_owned(),
        }),
        raw_payload: comic(id).to_string(),
    }
}

const WHATIF_ARCHIVE: &str = r#"
<html><body><div id="archive-wrapper">
  <div class="archive-entry">
    <a href="/1/"><img class="archive-image" src="/imgs/a/1/archive_crop.png"></a>
    <h1 class="archive-title"><a href="/1/">Relativistic Baseball</a></h1>
    <h2 class="archive-date">July 3, 2012</h2>
  </div>
  <div class="archive-entry">
    <a href="/2/"><img class="archive-image" src="/imgs/a/2/archive_crop.png"></a>
    <h1 class="archive-title"><a href="/2/">SAT Guessing</a></h1>
    <h2 class="archive-date">July 10, 2012</h2>
  </div>
</div></body></html>"#;

fn article(id: i64, with_illustration: bool) -> String {
    let img = if with_illustration {
        format!(r#"<img class="illustration" src="/imgs/a/{id}/figure.png">"#)
    } else {
        String::new()
    };
    format!(
        r#"<html><body><article class="entry">
  <p id="question">Question {id}?</p>
  <p id="attribute">&mdash;Reader {id}</p>
  <p>Answer paragraph for {id}.</p>
  {img}
</article></body></html>"#
    )
}
