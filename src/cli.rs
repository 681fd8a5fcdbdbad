//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// volpop - volume populator for replicated snapshots
#[derive(Parser, Debug)]
#[command(name = "volpop")]
#[command(version)]
#[command(about = "Populate volume claims from the latest snapshot of a replication destination")]
#[command(
    long_about = "volpop watches volume claims whose data source is a ReplicationDestination, restores the destination's latest snapshot into a shadow claim and hands the provisioned volume over to the original claim."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the populator against the current cluster
    Run {
        /// Configuration file (TOML or JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Only watch claims and destinations in this namespace
        #[arg(short, long)]
        namespace: Option<String>,

        /// Maximum number of claims reconciled at the same time
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Log filter, overrides RUST_LOG (e.g. "debug", "volpop_reconciler=trace")
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Print the shadow claim name for a claim UID
    ShadowName {
        /// UID of the original claim
        #[arg(short, long)]
        uid: String,

        /// Shadow claim prefix
        #[arg(short, long, default_value = volpop_core::config::DEFAULT_SHADOW_PREFIX)]
        prefix: String,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file (TOML or JSON)
        #[arg(short, long)]
        config: PathBuf,
    },
}
