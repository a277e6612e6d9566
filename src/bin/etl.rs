use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use healthsync::config;
use healthsync::db;
use healthsync::etl::{self, EtlContext, Job};
use healthsync::token::Credential;
use healthsync::whoop::WhoopClient;
use healthsync::withings::WithingsClient;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Fetch vendor data, load it into the database and remove duplicates"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Ignore stored rows and fetch the full history
    #[arg(long)]
    full: bool,

    /// Only run these jobs (recovery, sleep, workout, body, vitals)
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,

    /// Seed the wearable-tracker credential file with a refresh token
    #[arg(long)]
    whoop_refresh_token: Option<String>,

    /// Seed the health-monitor credential file with a refresh token
    #[arg(long)]
    withings_refresh_token: Option<String>,
}

fn seed_credential(refresh_token: &str) -> Credential {
    Credential {
        access_token: String::new(),
        refresh_token: Some(refresh_token.to_string()),
        user_id: None,
        expires_at: None,
    }
}

fn select_jobs(only: &[String]) -> Result<Vec<Job>> {
    if only.is_empty() {
        return Ok(Job::ALL.to_vec());
    }
    only.iter()
        .map(|name| match Job::parse(name) {
            Some(job) => Ok(job),
            None => bail!("unknown job '{name}'"),
        })
        .collect()
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
    cfg.ensure_dirs()?;
    let jobs = select_jobs(&args.only)?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let whoop = WhoopClient::from_config(&cfg)?;
    let withings = WithingsClient::from_config(&cfg)?;
    if let Some(token) = &args.whoop_refresh_token {
        whoop.tokens().file().save(&seed_credential(token))?;
        info!("seeded whoop credential file");
    }
    if let Some(token) = &args.withings_refresh_token {
        withings.tokens().file().save(&seed_credential(token))?;
        info!("seeded withings credential file");
    }

    let ctx = EtlContext {
        pool,
        whoop,
        withings,
        safety_days: cfg.app.incremental_safety_days,
        body_meastypes: cfg.withings.body_meastypes.clone(),
        vitals_meastypes: cfg.withings.vitals_meastypes.clone(),
    };

    info!(jobs = jobs.len(), full = args.full, "starting ETL run");
    let results = etl::run_all(&ctx, &jobs, args.full).await;

    let mut failed = 0;
    for (job, result) in &results {
        match result {
            Ok(summary) => println!(
                "{:<10} fetched={:<6} loaded={:<6} removed_duplicates={}",
                summary.source, summary.fetched, summary.loaded, summary.removed_duplicates
            ),
            Err(err) => {
                failed += 1;
                warn!(job = job.name(), %err, "job did not complete");
                println!("{:<10} FAILED: {err}", job.name());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} job(s) failed", results.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_jobs_defaults_to_all() {
        assert_eq!(select_jobs(&[]).unwrap().len(), 5);
        let jobs = select_jobs(&["sleep".into(), "vitals".into()]).unwrap();
        assert_eq!(jobs.iter().map(|j| j.name()).collect::<Vec<_>>(), ["sleep", "vitals"]);
        assert!(select_jobs(&["steps".into()]).is_err());
    }
}
