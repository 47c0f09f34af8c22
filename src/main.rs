// Allow dead code for functions that are part of the API surface but not used in all code paths
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

mod checkpoint;
mod cli;
mod config;
mod control;
mod error;
mod input;
mod orchestrator;
mod output;
mod parser;
mod progress;
mod retry;
mod session;
mod template;

use checkpoint::CheckpointStore;
use cli::{Cli, Commands};
use config::AppConfig;
use control::{Controller, StartRequest};
use progress::BatchStatus;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    init_logging(cli.verbose);

    // Handle --init before any config loading
    if cli.init {
        match AppConfig::create_default_config() {
            Ok(path) => {
                println!("Created default configuration file at: {}", path.display());
                println!("Edit this file to customize settings, then run autoquest again.");
                return Ok(());
            }
            Err(e) => {
                eprintln!("Failed to create configuration file: {e}");
                std::process::exit(1);
            }
        }
    }

    let app_config = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(config::ConfigError::FileNotFound(path)) => match AppConfig::prompt_create_config() {
            Ok(Some(created)) => {
                println!("Created default configuration file at: {}", created.display());
                println!("Edit this file to customize settings, then run autoquest again.");
                return Ok(());
            }
            Ok(None) => {
                eprintln!("Configuration file not found at: {}", path.display());
                eprintln!("Run with --init to create a default configuration file.");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("Failed to create configuration file: {e}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Commands::Run {
            entities,
            templates,
            output,
            batch_id,
            debug_port,
            fields_per_query,
        }) => {
            let mut config = app_config;
            if let Some(n) = fields_per_query {
                config.query.fields_per_query = n;
            }
            run_batch(config, entities, templates, output, batch_id, debug_port).await
        }
        Some(Commands::Status { batch_id }) => show_status(&app_config, &batch_id),
        None => {
            eprintln!("No command given. Try: autoquest run --entities <FILE> --templates <FILE>");
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("autoquest={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_batch(
    config: AppConfig,
    entities: String,
    templates: String,
    output: String,
    batch_id: Option<String>,
    debug_port: Option<u16>,
) -> Result<()> {
    let controller = std::sync::Arc::new(Controller::new(config));

    let batch_id = controller
        .start(StartRequest {
            entities_path: PathBuf::from(entities),
            templates_path: PathBuf::from(templates),
            output_path: PathBuf::from(&output),
            batch_id,
            debug_port,
        })
        .await?;
    println!("Batch {batch_id} started");

    // First Ctrl+C requests a graceful stop; a second one aborts hard.
    {
        let controller = std::sync::Arc::clone(&controller);
        let batch_id = batch_id.clone();
        let mut stop_requested = false;
        ctrlc::set_handler(move || {
            if stop_requested {
                eprintln!("\nAborting immediately");
                std::process::exit(130);
            }
            stop_requested = true;
            eprintln!("\nStop requested, finishing in-flight work (Ctrl+C again to abort)");
            let _ = controller.stop(&batch_id);
        })?;
    }

    let bar = progress_bar();
    let join_fut = controller.join(&batch_id);
    tokio::pin!(join_fut);
    let status = loop {
        tokio::select! {
            status = &mut join_fut => break status?,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if let Some(snap) = controller.status(&batch_id) {
                    bar.set_length(snap.total as u64);
                    bar.set_position(snap.finished() as u64);
                    match (&snap.current_entity, &snap.current_field) {
                        (Some(entity), Some(field)) => bar.set_message(format!("{entity}: {field}")),
                        _ => bar.set_message(""),
                    }
                }
            }
        }
    };
    bar.finish_and_clear();

    if let Some(snap) = controller.status(&batch_id) {
        println!(
            "Batch {}: {} done, {} failed, {} pending",
            match status {
                BatchStatus::Completed => "completed",
                BatchStatus::Stopped => "stopped",
                _ => "finished",
            },
            snap.done,
            snap.failed,
            snap.pending
        );
    }
    println!("Output workbook: {output}");
    Ok(())
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );
    bar
}

fn show_status(config: &AppConfig, batch_id: &str) -> Result<()> {
    let store = CheckpointStore::open(Path::new(&config.storage.db_path))?;
    let counts = store.counts(batch_id)?;
    if counts.total() == 0 {
        println!("No tasks recorded for batch {batch_id}");
        return Ok(());
    }
    println!("Batch {batch_id}:");
    println!("  pending:     {}", counts.pending);
    println!("  in progress: {}", counts.in_progress);
    println!("  done:        {}", counts.done);
    println!("  failed:      {}", counts.failed);
    println!("  total:       {}", counts.total());
    Ok(())
}
