use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use healthsync::config;
use healthsync::db;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Remove duplicate rows, keeping the newest insert per natural key"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let mut total = 0;
    for (table, removed) in db::deduplicate_all(&pool).await? {
        let remaining = db::count(&pool, table).await?;
        println!("{:<17} removed={removed:<6} remaining={remaining}", table.name());
        total += removed;
    }
    info!(total, "deduplication finished");
    Ok(())
}
