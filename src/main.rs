//! CLI entry point for the path-loss calibration station
//!
//! ```bash
//! pathloss_station run OP1234 --path-cord-change 3 --path-cord-change 7
//! pathloss_station run OP1234 --simulate
//! pathloss_station check
//! pathloss_station ledger --last 5 --json
//! pathloss_station config
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use pathloss_station::calibration::{
    build_procedure, AutoConfirm, CalibrationStation, OperatorPrompt, RunContext,
};
use pathloss_station::config::{StationConfig, DEFAULT_CONFIG_PATH};
use pathloss_station::data::ledger::CalibrationLedger;
use pathloss_station::hardware::{check_equipment, InstrumentLease, LeaseSettings, SessionTiming};
use pathloss_station::instrument::{ConfiguredFactory, InstrumentFactory, MockBench, MockFactory};
use pathloss_station::logging::init_logging;
use pathloss_station::sequencer::{Indicator, StatusBoard, StepEvent};
use pathloss_station::{StationError, StationResult};

#[derive(Parser)]
#[command(name = "pathloss_station")]
#[command(about = "Optical path-loss calibration station", long_about = None)]
struct Cli {
    /// Station configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the calibration procedure over the available bays
    Run {
        /// Operator id recorded in the ledger and the lease audit log
        operator: String,

        /// Bay whose path cord was changed since the last calibration (repeatable)
        #[arg(long = "path-cord-change")]
        path_cord_change: Vec<u16>,

        /// Use simulated instruments instead of the configured ones
        #[arg(long)]
        simulate: bool,

        /// Confirm every operator prompt automatically
        #[arg(long)]
        yes: bool,
    },

    /// Identify every instrument under the lease
    Check {
        /// Use simulated instruments instead of the configured ones
        #[arg(long)]
        simulate: bool,
    },

    /// Show the most recent calibration ledger rows
    Ledger {
        #[arg(long, default_value = "10")]
        last: usize,

        /// Print the rows as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

/// Asks on the console and waits for the operator to answer.
struct ConsolePrompt;

#[async_trait]
impl OperatorPrompt for ConsolePrompt {
    async fn confirm(&self, message: &str) -> StationResult<bool> {
        let message = message.to_string();
        tokio::task::spawn_blocking(move || -> StationResult<bool> {
            let mut stdout = io::stdout();
            write!(stdout, "{} [Y/n] ", message)?;
            stdout.flush()?;
            let mut answer = String::new();
            io::stdin().lock().read_line(&mut answer)?;
            let answer = answer.trim().to_ascii_lowercase();
            Ok(answer.is_empty() || answer == "y" || answer == "yes")
        })
        .await
        .map_err(|e| StationError::Prompt(e.to_string()))?
    }
}

fn factory(config: &StationConfig, simulate: bool) -> Arc<dyn InstrumentFactory> {
    if simulate {
        info!("Using simulated instruments");
        Arc::new(MockFactory::new(MockBench::new()))
    } else {
        Arc::new(ConfiguredFactory::new(config.instruments.clone()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = StationConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            operator,
            path_cord_change,
            simulate,
            yes,
        } => {
            init_logging(&config.station.log_level, Some(&config.station.log_dir))?;
            if simulate {
                config.sequence.warmup_secs = 0;
            }
            let prompt: Arc<dyn OperatorPrompt> = if yes {
                Arc::new(AutoConfirm::new())
            } else {
                Arc::new(ConsolePrompt)
            };
            run(&config, operator, path_cord_change, factory(&config, simulate), prompt).await
        }
        Commands::Check { simulate } => {
            init_logging(&config.station.log_level, None)?;
            let lease = InstrumentLease::new(LeaseSettings::from_config(&config));
            let timing = SessionTiming::from_sequence(&config.sequence);
            let report = check_equipment(&lease, factory(&config, simulate).as_ref(), &timing).await?;
            for status in &report.instruments {
                let mark = if status.present { "OK " } else { "MISSING" };
                println!("{:<8} {:<4} {}", mark, status.role, status.idn);
            }
            if !report.all_present() {
                anyhow::bail!("not every instrument responded");
            }
            Ok(())
        }
        Commands::Ledger { last, json } => {
            let ledger = CalibrationLedger::new(&config.station.ledger_path, config.bays.ledger_bays);
            let records = ledger.read();
            let skip = records.len().saturating_sub(last);
            if json {
                println!("{}", serde_json::to_string_pretty(&records[skip..])?);
                return Ok(());
            }
            for record in &records[skip..] {
                let loss: Vec<String> = config
                    .bays
                    .available
                    .iter()
                    .map(|&bay| format!("{}:{:.3}", bay, record.bay(bay).tpl_db))
                    .collect();
                println!(
                    "{:>4} {} {:<10} {:<10} CRP {:.3} dBm  {}",
                    record.iteration,
                    record.datetime,
                    record.station_id,
                    record.operator_id,
                    record.crp_db,
                    loss.join(" ")
                );
            }
            Ok(())
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(
    config: &StationConfig,
    operator: String,
    path_cord_change: Vec<u16>,
    factory: Arc<dyn InstrumentFactory>,
    prompt: Arc<dyn OperatorPrompt>,
) -> Result<()> {
    let bays = config.bays.available.clone();
    let cord_changes: BTreeSet<u16> = path_cord_change.into_iter().collect();
    for bay in cord_changes.iter().filter(|b| !bays.contains(b)) {
        warn!(bay, "Path cord change given for a bay that is not available");
    }

    let ctx = RunContext::new(
        operator,
        config.station.station_id.clone(),
        Local::now(),
        config.limits.clone(),
        &bays,
        &cord_changes,
    );
    let station = Arc::new(CalibrationStation::new(config, factory, prompt));
    let mut sequencer = build_procedure(station, &bays)?;
    let mut board = StatusBoard::for_steps(sequencer.steps());
    let mut events = sequencer.subscribe();
    let ctrl_c = sequencer.handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            ctrl_c.abort();
        }
    });

    let worker = sequencer.spawn(ctx);

    let mut faults_open = true;
    loop {
        tokio::select! {
            event = events.progress.recv() => match event {
                Some(event) => {
                    if let StepEvent::Finished { name, outcome, .. } = &event {
                        info!(step = %name, outcome = %outcome, "Step finished");
                    }
                    board.apply(&event);
                }
                None => break,
            },
            fault = events.faults.recv(), if faults_open => match fault {
                Some(fault) => error!(step = %fault.name, message = %fault.message, "Step fault"),
                None => faults_open = false,
            },
        }
    }

    let report = events
        .result
        .await
        .context("sequencer finished without a result")?;
    board.finish(&report);
    let completed = worker.await??;

    for (bay, indicator) in board.bays() {
        let readings = completed.context.bay(*bay);
        let tpl = readings.map(|r| r.tpl_db).unwrap_or(0.0);
        println!("Bay {:>3}: {:?} TPL {:.3} dB", bay, indicator, tpl);
    }
    if let Some(record) = &completed.context.ledger_record {
        println!("Ledger iteration {}", record.iteration);
    }
    if let Some(path) = &completed.context.chart_path {
        println!("Control chart {}", path.display());
    }

    let failed_steps = board
        .steps()
        .iter()
        .filter(|s| s.indicator == Indicator::Failed)
        .count();
    info!(
        state = ?report.state,
        passed = report.passed_count(),
        failed = report.failed_count(),
        "Calibration finished"
    );
    if report.is_success() {
        Ok(())
    } else {
        anyhow::bail!(
            "calibration failed: {} steps failed, {} step indicators failed",
            report.failed_count(),
            failed_steps
        )
    }
}
