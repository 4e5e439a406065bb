#![allow(dead_code)]

use clap::Parser;

mod algorithms;
mod codec;
mod config;
mod core;
mod discovery;
mod io;
mod logging;
mod messages;
mod tasks;

use crate::core::state::ProcessingState;
use crate::core::stream::StopGate;

/// radial - a runtime for radar signal-processing pipelines
#[derive(Parser)]
#[command(name = "radial")]
#[command(version = "0.1.0")]
#[command(about = "Assemble and run radar signal-processing streams from XML descriptions")]
struct Cli {
    /// Stream configuration file path
    #[arg(short, long, default_value = "./config/runner.xml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// List available algorithms
    #[arg(short = 'L', long)]
    list_algorithms: bool,

    /// Seconds between status log lines (0 disables)
    #[arg(long, default_value = "10")]
    status_interval: u64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level);

    if cli.list_algorithms {
        println!("Available algorithms:");
        for name in algorithms::factory::list_algorithms() {
            println!("  - {name}");
        }
        return;
    }

    let config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("failed to load config from '{}': {err:#}", cli.config);
            std::process::exit(1);
        }
    };
    if let Err(err) = config::validate_config(&config) {
        tracing::error!("configuration error: {err:#}");
        std::process::exit(1);
    }
    tracing::info!(
        runner = config.name.as_deref().unwrap_or("unnamed"),
        streams = config.streams.len(),
        "configuration loaded"
    );

    let gate = StopGate::new();
    let mut streams = Vec::new();
    for (index, stream_config) in config.streams.iter().enumerate() {
        match crate::core::builder::build_stream(stream_config, index, gate.clone()).await {
            Ok(stream) => streams.push(stream),
            Err(err) => {
                tracing::error!("failed to build stream {}: {err:#}", index + 1);
                std::process::exit(1);
            }
        }
    }

    // Everything is wired; drive the pipelines into their running state.
    for stream in &streams {
        stream.command_state(ProcessingState::Run);
    }

    if cli.status_interval > 0 {
        let status_streams = streams.clone();
        let interval = std::time::Duration::from_secs(cli.status_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                for stream in &status_streams {
                    let status = stream.status();
                    tracing::info!(
                        stream = %status.name,
                        state = %status.aggregate_state(),
                        tasks = status.tasks.len(),
                        "status"
                    );
                    for task in &status.tasks {
                        tracing::debug!(
                            task = %task.name,
                            state = %task.state,
                            pending = task.pending_queue,
                            messages = task.message_count,
                            rate = task.message_rate,
                            drops = task.drop_count,
                            "task status"
                        );
                    }
                }
            }
        });
    }

    tokio::select! {
        _ = gate.wait() => {
            tracing::info!("all input sources have been processed");
        }
        result = tokio::signal::ctrl_c() => {
            if result.is_ok() {
                tracing::info!("interrupted, shutting down");
            }
        }
    }

    futures::future::join_all(streams.iter().map(|stream| stream.close())).await;
    tracing::info!("runner stopped");
}
