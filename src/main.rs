mod batching;
mod config;
mod demands;
mod error;
mod face;
mod indexer;
mod jobs;
mod models;
mod notify;
mod pipeline;
mod search;
mod status;
mod store;
mod walker;
mod web_server;

#[cfg(test)]
mod testing;

use crate::config::AppConfig;
use crate::pipeline::Pipeline;
use crate::jobs::ResultArchive;
use crate::store::SqliteStore;
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "facefinder", about = "Finds the photos a person appears in")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the web server and the background workers
    Serve,
    /// Index one configured directory and exit
    Index {
        /// Directory name as configured
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::new()?;

    // Initialize env_logger based on config.log_level
    env_logger::Builder::new()
        .filter_level(config.log_level.parse().unwrap_or(log::LevelFilter::Info))
        .init();

    info!("Starting facefinder");

    let config = Arc::new(config);
    let engine = face::create_face_engine(&config);
    let sink = notify::create_sink(&config)?;
    let store = Arc::new(SqliteStore::open(&config.database_path).await?);
    let archive = store.clone() as Arc<dyn ResultArchive>;
    let pipeline = Pipeline::new(config.clone(), store.clone(), engine, sink, Some(archive));
    let command = cli.command.unwrap_or(Command::Serve);
    if matches!(command, Command::Serve) {
        pipeline.recover().await?;
    }
    let directories = pipeline.seed_directories(&config).await?;
    info!("{} directories configured", directories.len());
    pipeline.start();

    match command {
        Command::Serve => {
            batching::start_sweeper(
                pipeline.queue.clone(),
                Duration::from_secs(config.sweep_interval_secs),
            );

            // Run the web server in the foreground
            if let Err(e) = web_server::start_web_server(config.clone(), pipeline.clone()).await {
                log::error!("Web server error: {}", e);
            }
        }
        Command::Index { name } => {
            let directory = directories
                .into_iter()
                .find(|d| d.name == name)
                .ok_or_else(|| anyhow::anyhow!("Unknown directory: {}", name))?;
            pipeline.trigger_index(directory.id).await?;
            pipeline.queue.wait_idle().await;
            let progress = pipeline.index_progress(directory.id).await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
    }

    pipeline.queue.close();
    store.close().await;
    info!("Facefinder finished");

    Ok(())
}
