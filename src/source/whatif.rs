//! "What if?" articles. The archive page is the only place listing ids, titles
//! and publication dates, so discovery loads it and keeps it for the pass.
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

use super::{media_extension, media_path, resolve_url, Source};
use crate::error::{DiscoveryError, ItemError, TransportError};
use crate::model::{ItemRecord, MediaRef, SourceKind};
use crate::transport::{Payload, Session};

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid CSS selector")
}

static ARCHIVE_ENTRY: Lazy<Selector> = Lazy::new(|| selector("div.archive-entry"));
static ARCHIVE_LINK: Lazy<Selector> = Lazy::new(|| selector("a[href]"));
static ARCHIVE_TITLE: Lazy<Selector> = Lazy::new(|| selector(".archive-title"));
static ARCHIVE_DATE: Lazy<Selector> = Lazy::new(|| selector(".archive-date"));
static ARTICLE: Lazy<Selector> = Lazy::new(|| selector("article.entry"));
static QUESTION: Lazy<Selector> = Lazy::new(|| selector("p#question"));
static PARAGRAPH: Lazy<Selector> = Lazy::new(|| selector("p"));
static ILLUSTRATION: Lazy<Selector> = Lazy::new(|| selector("img.illustration"));
static ID_IN_HREF: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)/?$").expect("valid id pattern"));

const DATE_FORMATS: &[&str] = &["%B %d, %Y", "%b %d, %Y", "%Y-%m-%d", "%d %B %Y"];

/// One row of the archive listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub id: i64,
    pub title: String,
    pub posted_at: String,
}

#[derive(Debug)]
pub struct Whatif {
    base_url: Url,
    archive: Mutex<BTreeMap<i64, ArchiveEntry>>,
}

impl Whatif {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            archive: Mutex::new(BTreeMap::new()),
        }
    }

    fn join(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|err| TransportError::Request {
                url: format!("{}{}", self.base_url, path),
                message: err.to_string(),
            })
    }

    pub fn archive_url(&self) -> Result<Url, TransportError> {
        self.join("archive/")
    }

    pub fn item_url(&self, id: i64) -> Result<Url, TransportError> {
        self.join(&format!("{id}/"))
    }

    fn archive_entry(&self, id: i64) -> Option<ArchiveEntry> {
        self.archive
            .lock()
            .ok()
            .and_then(|archive| archive.get(&id).cloned())
    }

    fn archive_is_empty(&self) -> bool {
        self.archive.lock().map(|a| a.is_empty()).unwrap_or(true)
    }

    /// Download and cache the archive listing; returns the highest id.
    async fn load_archive(&self, session: &Session) -> Result<i64, DiscoveryError> {
        let url = self.archive_url()?;
        let body = session.fetch_html(&url).await?;
        let entries = parse_archive(&body);
        let latest = entries
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| DiscoveryError::Malformed(format!("no archive entries at {url}")))?;
        debug!(entries = entries.len(), latest, "loaded what-if archive");
        if let Ok(mut archive) = self.archive.lock() {
            *archive = entries;
        }
        Ok(latest)
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse every `div.archive-entry`. Entries that cannot be read are logged
/// and left out.
pub fn parse_archive(html: &str) -> BTreeMap<i64, ArchiveEntry> {
    let document = Html::parse_document(html);
    let mut entries = BTreeMap::new();
    for entry in document.select(&ARCHIVE_ENTRY) {
        let id = entry
            .select(&ARCHIVE_LINK)
            .filter_map(|a| a.value().attr("href"))
            .find_map(|href| ID_IN_HREF.captures(href))
            .and_then(|caps| caps[1].parse::<i64>().ok());
        let title = entry.select(&ARCHIVE_TITLE).next().map(element_text);
        let posted_at = entry.select(&ARCHIVE_DATE).next().map(element_text);
        match (id, title, posted_at) {
            (Some(id), Some(title), Some(posted_at)) => {
                entries.insert(
                    id,
                    ArchiveEntry {
                        id,
                        title,
                        posted_at,
                    },
                );
            }
            _ => warn!(entry = %entry.html(), "cannot parse archive entry"),
        }
    }
    entries
}

fn parse_posted_at(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text.trim(), fmt).ok())
}

/// The parts of an article page kept in the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub question: String,
    pub body: String,
    pub illustration: Option<String>,
}

pub fn parse_article(html: &str) -> Option<Article> {
    let document = Html::parse_document(html);
    let article = document.select(&ARTICLE).next()?;
    let question = article.select(&QUESTION).next().map(element_text)?;
    let body = article
        .select(&PARAGRAPH)
        .filter(|p| !matches!(p.value().id(), Some("question") | Some("attribute")))
        .map(element_text)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    let illustration = article
        .select(&ILLUSTRATION)
        .find_map(|img| img.value().attr("src"))
        .map(str::to_string);
    Some(Article {
        question,
        body,
        illustration,
    })
}

#[async_trait]
impl Source for Whatif {
    fn kind(&self) -> SourceKind {
        SourceKind::Whatif
    }

    async fn latest_id(&self, session: &Session) -> Result<i64, DiscoveryError> {
        self.load_archive(session).await
    }

    async fn fetch(&self, session: &Session, id: i64) -> Result<Payload, ItemError> {
        if self.archive_is_empty() {
            if let Err(err) = self.load_archive(session).await {
                warn!(?err, "what-if archive unavailable");
            }
        }
        let url = self.item_url(id)?;
        let body = session.fetch_html(&url).await?;
        Ok(Payload::Html(body))
    }

    fn normalize(&self, id: i64, raw: Payload, media_dir: &Path) -> Result<ItemRecord, ItemError> {
        let html = match raw {
            Payload::Html(body) => body,
            Payload::Json(value) => {
                return Err(ItemError::malformed(id, "expected HTML", value.to_string()))
            }
        };
        let entry = self
            .archive_entry(id)
            .ok_or_else(|| ItemError::malformed(id, "not listed in the archive", html.clone()))?;
        let posted_date = parse_posted_at(&entry.posted_at).ok_or_else(|| {
            ItemError::malformed(
                id,
                format!("unreadable archive date {:?}", entry.posted_at),
                html.clone(),
            )
        })?;
        let article = parse_article(&html)
            .ok_or_else(|| ItemError::malformed(id, "no article.entry with a question", html.clone()))?;

        let media = article
            .illustration
            .as_deref()
            .and_then(|src| resolve_url(&self.base_url, src))
            .map(|url| MediaRef {
                path: media_path(media_dir, id, &media_extension(&url))
                    .to_string_lossy()
                    .into_owned(),
                url: url.to_string(),
            });

        let raw_payload = json!({ "archive": entry, "html": html }).to_string();
        Ok(ItemRecord {
            source: SourceKind::Whatif,
            item_id: id,
            title: entry.title,
            alt_text: article.question,
            body_text: article.body,
            posted_date,
            collected_at: Utc::now(),
            media,
            raw_payload,
        })
    }
}
