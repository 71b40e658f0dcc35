use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use xkcd_sync::config;
use xkcd_sync::db;
use xkcd_sync::model::SourceKind;

#[derive(Parser, Debug)]
#[command(about = "Print the watermark and stored item count per source")]
struct Args {
    /// Path to YAML config (built-in defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides app.save_dir when locating the default database
    #[arg(long)]
    save_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(dir) = &args.save_dir {
        cfg.app.save_dir = dir.to_string_lossy().into_owned();
    }
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    println!("Database: {}", database_url);
    for kind in [SourceKind::Comics, SourceKind::Whatif] {
        let stored = db::count_items(&pool, kind).await?;
        match db::fetch_progress(&pool, kind).await? {
            Some(row) => {
                let ran = row
                    .last_ran_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into());
                println!(
                    "  {} -> {{ watermark: {}, last_ran_at: {}, stored: {} }}",
                    kind, row.last_id, ran, stored
                );
            }
            None => println!("  {} -> {{ never synced, stored: {} }}", kind, stored),
        }
    }
    pool.close().await;
    Ok(())
}
