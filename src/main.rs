use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use reqwest::Url;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info, warn};

use xkcd_sync::config;
use xkcd_sync::db;
use xkcd_sync::error::SyncError;
use xkcd_sync::source::{Comics, Source, Whatif};
use xkcd_sync::sync::{SyncOptions, Syncer};
use xkcd_sync::transport::{HttpTransport, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Which {
    All,
    Comics,
    Whatif,
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Fetch new xkcd comics and what-if articles into SQLite, then exit"
)]
struct Args {
    /// Path to YAML config file (built-in defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for media and the default database; overrides app.save_dir
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Which source(s) to sync
    #[arg(long, value_enum, default_value = "all")]
    source: Which,

    /// Reset the watermark to 0; stored items are re-verified, not refetched
    #[arg(long)]
    restart: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(dir) = &args.save_dir {
        cfg.app.save_dir = dir.to_string_lossy().into_owned();
    }
    cfg.ensure_dirs()?;

    let save_dir = cfg.app.resolved_save_dir();
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let session = Session::new(HttpTransport::from_config(&cfg.http)?);

    let mut sources: Vec<Box<dyn Source>> = Vec::new();
    if matches!(args.source, Which::All | Which::Comics) && cfg.sources.comics.enabled {
        let base = Url::parse(&cfg.sources.comics.base_url).context("sources.comics.base_url")?;
        sources.push(Box::new(Comics::new(base)));
    }
    if matches!(args.source, Which::All | Which::Whatif) && cfg.sources.whatif.enabled {
        let base = Url::parse(&cfg.sources.whatif.base_url).context("sources.whatif.base_url")?;
        sources.push(Box::new(Whatif::new(base)));
    }
    if sources.is_empty() {
        warn!("no enabled source selected; nothing to do");
        return Ok(ExitCode::SUCCESS);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current item");
            let _ = stop_tx.send(true);
        }
    });

    info!(database_url = %database_url, save_dir = %save_dir.display(), "starting sync");
    let mut exit = ExitCode::SUCCESS;
    for source in &sources {
        let kind = source.kind();
        let options = SyncOptions {
            media_dir: save_dir.join(kind.as_str()),
            courtesy_delay: cfg.app.courtesy_delay(),
            restart: args.restart,
        };
        let syncer = Syncer::new(&pool, &session, source.as_ref(), options);
        match syncer.run(stop_rx.clone()).await {
            Ok(report) => {
                let stored = db::count_items(&pool, kind).await.unwrap_or(-1);
                info!(
                    source = %kind,
                    attempted = report.attempted,
                    succeeded = report.succeeded,
                    verified = report.verified,
                    skipped = report.skipped,
                    failed = report.failed,
                    outstanding = ?report.outstanding,
                    watermark = report.watermark,
                    latest = report.latest,
                    stored,
                    "pass finished"
                );
                if report.interrupted {
                    break;
                }
            }
            Err(err @ SyncError::Discovery { .. }) => {
                error!(source = %kind, error = %err, "discovery failed; watermark untouched");
                exit = ExitCode::FAILURE;
            }
            Err(err) => {
                error!(source = %kind, error = %err, "pass aborted");
                exit = ExitCode::FAILURE;
            }
        }
        if *stop_rx.borrow() {
            break;
        }
    }

    info!(
        requests = session.requests(),
        downloads = session.downloads(),
        bytes = session.bytes_downloaded(),
        "sync finished"
    );
    pool.close().await;
    Ok(exit)
}

