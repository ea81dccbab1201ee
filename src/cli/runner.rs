//! CLI runner - executes commands

use crate::cli::commands::{Cli, Commands, OutputFormat};
use crate::config::{ConfiguredCatalog, SourceConfig};
use crate::database::DatabaseEngine;
use crate::engine::{read_incremental, IncrementalDriver, Message, SyncStats};
use crate::error::{Error, Result, ResultExt};
use crate::state::{merge_checkpoints, CheckpointMessage, StateStore};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// CLI runner
pub struct Runner {
    cli: Cli,
}

impl Runner {
    /// Create a new runner
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Run the CLI command
    pub async fn run(&self) -> Result<()> {
        match &self.cli.command {
            Commands::Check => self.check().await,
            Commands::Read {
                catalog,
                state,
                state_out,
            } => {
                let state_out = state_out.as_ref().or(state.as_ref());
                self.read(catalog, state.as_deref(), state_out.map(PathBuf::as_path))
                    .await
            }
        }
    }

    /// Load the source configuration
    fn load_config(&self) -> Result<SourceConfig> {
        let path = self
            .cli
            .config
            .as_ref()
            .ok_or_else(|| Error::config("Config file not specified (use -C flag)"))?;
        SourceConfig::from_file(path)
    }

    /// Check connection
    async fn check(&self) -> Result<()> {
        let config = self.load_config()?;
        let status = match DatabaseEngine::new(&config.database) {
            Ok(engine) => {
                self.output(&Message::info(format!(
                    "Checking connection to {}",
                    engine.connection_info()
                )));
                engine.check_connection().await
            }
            Err(e) => Err(e),
        };

        let (status, message) = match status {
            Ok(()) => ("SUCCEEDED", "Connection successful".to_string()),
            Err(e) => ("FAILED", format!("Connection failed: {e}")),
        };
        self.output(&json!({
            "type": "CONNECTION_STATUS",
            "connectionStatus": {"status": status, "message": message}
        }));
        Ok(())
    }

    /// Read changed rows and persist checkpoints
    async fn read(
        &self,
        catalog_path: &Path,
        state_path: Option<&Path>,
        state_out: Option<&Path>,
    ) -> Result<()> {
        let config = self.load_config()?;
        let catalog = ConfiguredCatalog::from_file(catalog_path)
            .with_context(|| format!("Failed to load catalog {}", catalog_path.display()))?;
        let prior = match state_path {
            Some(path) => StateStore::new(path)
                .load()
                .with_context(|| format!("Failed to load state {}", path.display()))?,
            None => Vec::new(),
        };

        let database = Arc::new(DatabaseEngine::new(&config.database)?);
        let driver = IncrementalDriver::from_config(&config, database, None)?;
        tracing::info!(
            "Starting {} sync of {} stream(s)",
            driver.name(),
            catalog.incremental_streams().count()
        );

        let started = Instant::now();
        let mut messages = read_incremental(driver, catalog, prior.clone());
        let mut stats = SyncStats::new();
        let mut checkpoints: Vec<CheckpointMessage> = Vec::new();
        let mut failure = None;

        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => {
                    stats.observe(&message);
                    if let Message::State { state } = &message {
                        checkpoints.push(state.clone());
                    }
                    self.output(&message);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // Checkpoints emitted before a failure are still valid
        if let Some(path) = state_out {
            if !checkpoints.is_empty() {
                let merged = merge_checkpoints(prior, checkpoints);
                StateStore::new(path).save(&merged).await?;
                tracing::info!("Saved {} checkpoint(s) to {}", merged.len(), path.display());
            }
        }

        self.output(&Message::info(format!(
            "Synced {} records, {} checkpoints, {} complete, {} incomplete in {:.1}s",
            stats.records_synced,
            stats.checkpoints,
            stats.streams_completed,
            stats.streams_incomplete,
            started.elapsed().as_secs_f64()
        )));

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Output a message
    fn output(&self, msg: &impl Serialize) {
        let line = match self.cli.format {
            OutputFormat::Json => serde_json::to_string(msg),
            OutputFormat::Pretty => serde_json::to_string_pretty(msg),
        };
        println!("{}", line.unwrap_or_default());
    }
}
