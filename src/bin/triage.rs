#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use triage_harness::checksum::{self, ChecksumStatus};
use triage_harness::config::ExperimentConfig;
use triage_harness::experiment::{Experiment, ExperimentStore};
use triage_harness::ledger::Ledger;
use triage_harness::lock::ResumeLocks;
use triage_harness::reconcile::{reconcile_from_ledger, DecisionTally};
use triage_harness::source::{self, SourceStore};
use triage_harness::store::{format_epoch_ms, Store};

#[derive(Parser)]
#[command(name = "triage", version, about = "Triage experiment harness CLI")]
struct Cli {
    /// SQLite database (defaults to $TRIAGE_STORE_PATH or .triage_experiments.sqlite)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a JSONL dataset into the source store
    Load {
        #[arg(long)]
        dataset: PathBuf,
    },
    /// Show one experiment, or list all of them
    Status {
        #[arg(long)]
        experiment: Option<String>,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Check a dataset file against an experiment's stored checksum
    Verify {
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        dataset: PathBuf,
    },
    /// Export an experiment's ledger as JSONL
    Export {
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        out: PathBuf,
    },
    /// Reconcile per-category results into one decision per case
    Reconcile {
        #[arg(long)]
        experiment: String,
        /// Experiment config supplying weights and threshold
        #[arg(long)]
        config: PathBuf,
        /// Override the configured threshold
        #[arg(long)]
        threshold: Option<f64>,
        /// Write decisions as JSONL here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show the resume lock holder for an experiment
    Lock {
        #[arg(long)]
        experiment: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let store = Store::open(cli.db.unwrap_or_else(Store::default_path))?;

    match cli.command {
        Commands::Load { dataset } => {
            let report = SourceStore::new(store).load(&dataset).await?;
            println!(
                "dataset {} ({} records){}",
                report.checksum,
                report.count,
                if report.newly_loaded { "" } else { " already loaded" }
            );
        }
        Commands::Status { experiment, json } => {
            let experiments = ExperimentStore::new(store.clone());
            let ledger = Ledger::new(store.clone());
            let listed = match experiment {
                Some(id) => vec![experiments.get(&id).await?],
                None => experiments.list().await?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&listed)?);
                return Ok(());
            }
            if listed.is_empty() {
                println!("no experiments in {}", store.path().display());
            }
            let locks = ResumeLocks::new(store.clone());
            for exp in &listed {
                let errors = ledger.error_count(&exp.id).await?;
                let holder = locks.current(&exp.id).await?;
                print_status(exp, errors);
                if let Some(holder) = holder {
                    let liveness = if holder.is_holder_alive() { "live" } else { "stale" };
                    println!("  lock:       pid {} ({liveness})", holder.holder_pid);
                }
            }
        }
        Commands::Verify {
            experiment,
            dataset,
        } => {
            let exp = ExperimentStore::new(store).get(&experiment).await?;
            let records = source::read_dataset(&dataset)?;
            match checksum::verify(Some(&exp.dataset_checksum), &records) {
                ChecksumStatus::Match => println!("match: {}", exp.dataset_checksum),
                ChecksumStatus::Absent { current } => println!("no stored checksum; current {current}"),
                ChecksumStatus::Mismatch { stored, current } => {
                    return Err(format!("checksum mismatch: stored {stored}, current {current}").into());
                }
            }
        }
        Commands::Export { experiment, out } => {
            ExperimentStore::new(store.clone()).get(&experiment).await?;
            let n = Ledger::new(store).export_jsonl(&experiment, &out).await?;
            println!("exported {n} results to {}", out.display());
        }
        Commands::Reconcile {
            experiment,
            config,
            threshold,
            out,
        } => {
            ExperimentStore::new(store.clone()).get(&experiment).await?;
            let config = ExperimentConfig::from_path(&config)?;
            let mut reconcile_config = config.reconcile_config();
            if let Some(threshold) = threshold {
                if !(0.0..=1.0).contains(&threshold) {
                    return Err("--threshold must be within [0, 1]".into());
                }
                reconcile_config = reconcile_config.threshold(threshold);
            }
            let decisions =
                reconcile_from_ledger(&Ledger::new(store), &experiment, &reconcile_config).await?;
            let mut writer: Box<dyn Write> = match &out {
                Some(path) => Box::new(BufWriter::new(File::create(path)?)),
                None => Box::new(io::stdout().lock()),
            };
            for decision in &decisions {
                serde_json::to_writer(&mut writer, decision)?;
                writeln!(writer)?;
            }
            writer.flush()?;
            let tally = DecisionTally::from_decisions(&decisions);
            eprintln!(
                "{} cases: {} detected, {} not detected, {} unknown",
                tally.total(),
                tally.detected,
                tally.not_detected,
                tally.unknown
            );
        }
        Commands::Lock { experiment } => {
            match ResumeLocks::new(store).current(&experiment).await? {
                Some(holder) => {
                    let liveness = if holder.is_holder_alive() {
                        "alive"
                    } else {
                        "not running; will be reclaimed on next resume"
                    };
                    println!("{holder} (holder {liveness})");
                }
                None => println!("experiment {experiment} is not locked"),
            }
        }
    }

    Ok(())
}

fn print_status(exp: &Experiment, errors: usize) {
    let ts = |ms: Option<i64>| ms.map(format_epoch_ms).unwrap_or_else(|| "-".to_string());
    println!("{} [{}]", exp.id, exp.status);
    println!("  dataset:    {}", exp.dataset_checksum.short());
    println!(
        "  progress:   {}/{} ({} errors)",
        exp.completed_items, exp.total_items, errors
    );
    println!("  started:    {}", ts(exp.started_at));
    println!("  last step:  {}", ts(exp.last_progress_at));
    println!("  eta:        {}", ts(exp.estimated_completion_at));
    if let Some(stage) = &exp.failure_stage {
        println!(
            "  failed at:  {stage}: {}",
            exp.failure_reason.as_deref().unwrap_or("")
        );
    }
}
