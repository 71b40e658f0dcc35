//! Media acquirer: put a remote file at a fixed local path exactly once.
use reqwest::Url;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::DownloadError;
use crate::transport::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    /// The file was already on disk; no transfer happened.
    Existing(PathBuf),
    Downloaded { path: PathBuf, bytes: u64 },
}

impl Acquired {
    pub fn path(&self) -> &Path {
        match self {
            Acquired::Existing(path) => path,
            Acquired::Downloaded { path, .. } => path,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DownloadError + '_ {
    move |source| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Sibling temp name, hidden and unique per attempt.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".to_string());
    path.with_file_name(format!(".{}.{}.part", name, Uuid::new_v4()))
}

/// Ensure `url` is stored at `path`. A complete file only ever appears at
/// `path` through a rename, so an existing file is trusted as-is.
#[instrument(skip_all, fields(url = %url, path = %path.display()))]
pub async fn acquire(session: &Session, url: &Url, path: &Path) -> Result<Acquired, DownloadError> {
    if fs::try_exists(path).await.map_err(io_err(path))? {
        debug!("media already present");
        return Ok(Acquired::Existing(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    }

    let tmp = temp_path(path);
    match write_temp(session, url, &tmp).await {
        Ok(bytes) => {
            fs::rename(&tmp, path).await.map_err(io_err(path))?;
            debug!(bytes, "media downloaded");
            Ok(Acquired::Downloaded {
                path: path.to_path_buf(),
                bytes,
            })
        }
        Err(err) => {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(?cleanup, tmp = %tmp.display(), "could not remove partial download");
                }
            }
            Err(err)
        }
    }
}

async fn write_temp(session: &Session, url: &Url, tmp: &Path) -> Result<u64, DownloadError> {
    let mut file = fs::File::create(tmp).await.map_err(io_err(tmp))?;
    let bytes = session.download(url, &mut file).await?;
    file.sync_all().await.map_err(io_err(tmp))?;
    Ok(bytes)
}
