//! Command-line interface for bundlecache.

pub mod args;
mod commands;

use clap::Parser;
use thiserror::Error;

use crate::cache;
use crate::config;

pub use args::GlobalArgs;
pub use commands::CacheCommand;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during CLI execution.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration error.
    #[error("{0}")]
    Config(#[from] config::ConfigError),

    /// Cache error.
    #[error("{0}")]
    Cache(#[from] cache::Error),

    /// Key not present anywhere in the chain.
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI operations.
pub type Result<T> = std::result::Result<T, CliError>;

// =============================================================================
// CLI Definition
// =============================================================================

/// bndl - move bundle artifacts through a tiered cache chain.
#[derive(Parser, Debug)]
#[command(name = "bndl", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: CacheCommand,
}

impl Cli {
    /// Parse command-line arguments and return the CLI instance.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let config = self.global.to_config_source().read()?;
        let cache = cache::new_cache(&self.global.cache, &config).await?;
        self.command.run(cache, &self.global).await
    }
}

/// Main entry point for the CLI.
pub async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli.run().await
}
