//! xkcd comics via the JSON interface (`/info.0.json`, `/{id}/info.0.json`).
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::Url;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

use super::{media_extension, media_path, resolve_url, Source};
use crate::error::{DiscoveryError, ItemError, TransportError};
use crate::model::{ItemRecord, MediaRef, SourceKind};
use crate::transport::{Payload, Session};

/// Comic 404 does not exist; the site answers with its 404 page.
pub const SENTINEL_ID: i64 = 404;

#[derive(Debug, Clone)]
pub struct Comics {
    base_url: Url,
}

impl Comics {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    fn join(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|err| TransportError::Request {
                url: format!("{}{}", self.base_url, path),
                message: err.to_string(),
            })
    }

    pub fn latest_url(&self) -> Result<Url, TransportError> {
        self.join("info.0.json")
    }

    pub fn item_url(&self, id: i64) -> Result<Url, TransportError> {
        self.join(&format!("{id}/info.0.json"))
    }
}

/// Fields the normalizer requires from an `info.0.json` body.
#[derive(Debug, Deserialize)]
struct ComicPayload {
    num: i64,
    title: String,
    alt: String,
    #[serde(default)]
    transcript: String,
    img: String,
    #[serde(deserialize_with = "number_or_string")]
    year: u32,
    #[serde(deserialize_with = "number_or_string")]
    month: u32,
    #[serde(deserialize_with = "number_or_string")]
    day: u32,
}

/// The API sends calendar fields as strings ("2006"), but accept numbers too.
fn number_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Field {
        Number(u32),
        Text(String),
    }
    match Field::deserialize(deserializer)? {
        Field::Number(n) => Ok(n),
        Field::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Zero-pad the three calendar fields into `YYYY-MM-DD` and parse.
fn posted_date(year: u32, month: u32, day: u32) -> Option<NaiveDate> {
    let text = format!("{year:04}-{month:02}-{day:02}");
    NaiveDate::parse_from_str(&text, "%Y-%m-%d").ok()
}

#[async_trait]
impl Source for Comics {
    fn kind(&self) -> SourceKind {
        SourceKind::Comics
    }

    fn sentinel(&self) -> Option<i64> {
        Some(SENTINEL_ID)
    }

    async fn latest_id(&self, session: &Session) -> Result<i64, DiscoveryError> {
        let url = self.latest_url()?;
        let body = session.fetch_json(&url).await?;
        let num = body
            .get("num")
            .and_then(Value::as_i64)
            .filter(|n| *n > 0)
            .ok_or_else(|| DiscoveryError::Malformed(format!("no usable `num` in {url}")))?;
        debug!(latest = num, "newest comic");
        Ok(num)
    }

    async fn fetch(&self, session: &Session, id: i64) -> Result<Payload, ItemError> {
        if self.is_sentinel(id) {
            return Err(ItemError::Sentinel(id));
        }
        let url = self.item_url(id)?;
        let body = session.fetch_json(&url).await?;
        Ok(Payload::Json(body))
    }

    fn normalize(&self, id: i64, raw: Payload, media_dir: &Path) -> Result<ItemRecord, ItemError> {
        let value = match raw {
            Payload::Json(value) => value,
            Payload::Html(body) => return Err(ItemError::malformed(id, "expected JSON", body)),
        };
        let raw_payload = value.to_string();
        let comic: ComicPayload = serde_json::from_value(value)
            .map_err(|err| ItemError::malformed(id, err.to_string(), raw_payload.clone()))?;

        if comic.num != id {
            return Err(ItemError::malformed(
                id,
                format!("payload is for comic {}", comic.num),
                raw_payload,
            ));
        }
        let date = posted_date(comic.year, comic.month, comic.day).ok_or_else(|| {
            ItemError::malformed(
                id,
                format!("invalid date {}-{}-{}", comic.year, comic.month, comic.day),
                raw_payload.clone(),
            )
        })?;
        let media_url = resolve_url(&self.base_url, &comic.img)
            .ok_or_else(|| ItemError::malformed(id, "missing img", raw_payload.clone()))?;
        let path = media_path(media_dir, id, &media_extension(&media_url));

        Ok(ItemRecord {
            source: SourceKind::Comics,
            item_id: id,
            title: comic.title,
            alt_text: comic.alt,
            body_text: comic.transcript,
            posted_date: date,
            collected_at: Utc::now(),
            media: Some(MediaRef {
                url: media_url.to_string(),
                path: path.to_string_lossy().into_owned(),
            }),
            raw_payload,
        })
    }
}
