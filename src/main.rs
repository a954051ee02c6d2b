//! harel - statechart runner
//!
//! Validates, inspects and runs statechart documents.

mod commands;
mod config;
mod shell;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use harel_core::{Configuration, Engine, ExternalQueue};
use shell::Line;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "harel")]
#[command(about = "Hierarchical, parallel statechart interpreter")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "HAREL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and validate a chart
    Validate {
        /// Chart file (.json, .yaml or .yml)
        chart: PathBuf,
    },

    /// Print a chart's node tree and initial configuration
    Show {
        /// Chart file (.json, .yaml or .yml)
        chart: PathBuf,
    },

    /// Run a chart, reading events from stdin
    Run {
        /// Chart file (.json, .yaml or .yml)
        chart: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            return Err(e.into());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &cli.config {
        tracing::debug!("Loaded config from {}", path.display());
    }

    let result = match &cli.command {
        Commands::Validate { chart } => commands::validate(chart).map(|out| println!("{}", out)),
        Commands::Show { chart } => commands::show(chart).map(|out| println!("{}", out)),
        Commands::Run { chart } => run_chart(chart, &config).await,
    };

    if let Err(e) = &result {
        eprintln!("{}: {}", "Error".red(), e);
    }
    result
}

/// Runs the engine on a blocking task while stdin feeds its external queue.
async fn run_chart(chart: &Path, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let (document, model) = commands::load_chart(chart)?;
    let mut engine = Engine::new(model)?
        .with_config(config.engine_config())
        .with_context(config.initial_context());

    tracing::info!(
        chart = document.name().unwrap_or("-"),
        checksum = document.checksum(),
        "Starting chart"
    );
    engine.start()?;
    println!("{}", commands::format_configuration(&engine.get_configuration()));

    let queue = engine.external_queue();
    let (tx, rx) = tokio::sync::watch::channel(engine.get_configuration());

    let mut runner = tokio::task::spawn_blocking(move || {
        if engine.is_running() {
            engine.run_with(|c: &Arc<Configuration>| {
                println!("{}", commands::format_configuration(c));
                let _ = tx.send(c.clone());
            })?;
        }
        Ok::<_, harel_core::CoreError>(engine)
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut timers = JoinSet::new();
    let mut finished = None;
    let mut quit = false;

    while finished.is_none() && !quit {
        tokio::select! {
            result = &mut runner => finished = Some(result),
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match shell::parse_line(&line) {
                    Ok(Line::Empty) => {}
                    Ok(Line::Send(event)) => {
                        if let Err(e) = queue.push(event) {
                            eprintln!("{}: {}", "Error".red(), e);
                        }
                    }
                    Ok(Line::After(delay, event)) => {
                        let q = queue.clone();
                        timers.spawn(async move {
                            tokio::time::sleep(delay).await;
                            if let Err(e) = q.push(event) {
                                tracing::warn!("Dropped delayed event: {}", e);
                            }
                        });
                    }
                    Ok(Line::Config) => {
                        println!("{}", commands::format_configuration(&rx.borrow()));
                    }
                    Ok(Line::Help) => println!("{}", shell::HELP_TEXT),
                    Ok(Line::Quit) => quit = true,
                    Err(msg) => eprintln!("{}: {}", "Error".red(), msg),
                }
            }
        }
    }

    let result = match finished {
        Some(result) => result,
        None => {
            if quit {
                timers.abort_all();
            } else {
                // End of input: let scheduled events fire and drain first.
                while timers.join_next().await.is_some() {}
                drain(&queue, &mut runner).await;
            }
            queue.close();
            runner.await
        }
    };

    let engine = result??;
    let stats = engine.stats();
    println!(
        "{} after {} macrosteps, {} microsteps{}",
        "Stopped".yellow(),
        stats.macrosteps,
        stats.microsteps,
        if engine.is_halted() {
            " (final state reached)"
        } else {
            ""
        }
    );
    Ok(())
}

/// Waits until the engine has taken every queued event, or has finished.
async fn drain<T>(queue: &ExternalQueue, runner: &mut tokio::task::JoinHandle<T>) {
    while !queue.is_empty() && !runner.is_finished() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
