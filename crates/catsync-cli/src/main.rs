use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use catsync_sync::SyncConfig;
use clap::{Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "catsync")]
#[command(about = "Problem catalog sync and reconciliation")]
struct Cli {
    /// Skip writing run reports.
    #[arg(long, global = true)]
    no_reports: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Push the canonical dataset to the catalog service.
    Sync(SyncArgs),
    /// Rewrite inconsistent stored records to their canonical form.
    Reconcile(StoreArgs),
    /// Converge every copy of a known duplicate title onto its template.
    RepairDuplicates(StoreArgs),
    /// Show how a title and description classify.
    Classify {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Check that the catalog service is up.
    Health {
        #[arg(long)]
        api_url: Option<String>,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    dataset: Option<PathBuf>,
    #[arg(long)]
    api_url: Option<String>,
    /// Pause between create calls, in milliseconds.
    #[arg(long)]
    delay_ms: Option<u64>,
}

#[derive(Debug, Args)]
struct StoreArgs {
    #[arg(long)]
    store: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
}

/// Flag raised by Ctrl-C; drivers stop between records once it is set.
fn stop_on_ctrl_c() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current record");
            flag.store(true, Ordering::Relaxed);
        }
    });
    stop
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if cli.no_reports {
        config.write_reports = false;
    }

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            if let Some(dataset) = args.dataset {
                config.dataset_path = dataset;
            }
            if let Some(api_url) = args.api_url {
                config.api_url = api_url;
            }
            if let Some(ms) = args.delay_ms {
                config.create_delay = Duration::from_millis(ms);
            }
            let report = catsync_sync::run_sync(&config, Some(stop_on_ctrl_c())).await?;
            println!(
                "sync complete: run_id={} created={} skipped={} failed={} remote_count={}",
                report.run_id,
                report.created,
                report.skipped,
                report.failed,
                report
                    .final_remote_count
                    .map_or_else(|| "unknown".to_string(), |n| n.to_string())
            );
        }
        Commands::Reconcile(args) => {
            if let Some(store) = args.store {
                config.store_path = store;
            }
            let report = catsync_sync::run_reconcile(&config, args.dry_run).await?;
            println!(
                "reconcile complete: run_id={} fixed={} skipped={} failed={}{}",
                report.run_id,
                report.fixed,
                report.skipped,
                report.failed,
                if report.dry_run { " (dry run)" } else { "" }
            );
        }
        Commands::RepairDuplicates(args) => {
            if let Some(store) = args.store {
                config.store_path = store;
            }
            let report = catsync_sync::run_duplicate_repair(&config, args.dry_run).await?;
            for title in &report.titles {
                println!(
                    "{}: matched={} fixed={} unchanged={}",
                    title.title, title.matched, title.fixed, title.unchanged
                );
            }
            println!(
                "duplicate repair complete: run_id={} fixed={} failed={}",
                report.run_id, report.fixed, report.failed
            );
        }
        Commands::Classify { title, description } => {
            let (rules, _) = config.load_rules()?;
            let classification = rules.classify(&title, &description);
            println!("kind: {}", classification.kind.as_deref().unwrap_or("(none)"));
            println!("category: {}", classification.category);
            for constraint in &classification.constraints {
                println!("  - {constraint}");
            }
        }
        Commands::Health { api_url } => {
            if let Some(api_url) = api_url {
                config.api_url = api_url;
            }
            let status = catsync_sync::check_health(&config).await?;
            println!("{}: {}", config.api_url, status.status);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_defaults_to_sync() {
        let cli = Cli::try_parse_from(["catsync"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn reconcile_flags_parse() {
        let cli = Cli::try_parse_from(["catsync", "reconcile", "--store", "s.json", "--dry-run", "--no-reports"])
            .unwrap();
        assert!(cli.no_reports);
        match cli.command {
            Some(Commands::Reconcile(args)) => {
                assert_eq!(args.store, Some(PathBuf::from("s.json")));
                assert!(args.dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn classify_requires_a_title() {
        assert!(Cli::try_parse_from(["catsync", "classify"]).is_err());
        assert!(Cli::try_parse_from(["catsync", "classify", "--title", "Two Sum"]).is_ok());
    }
}
