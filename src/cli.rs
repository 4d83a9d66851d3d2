//! Command-line surface.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "auditlogd", version, about = "Network audit-log server")]
pub struct Cli {
    /// Configuration file path.
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    pub config: PathBuf,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'n', long = "no-fork")]
    pub no_fork: bool,

    /// Drop a fraction of iobuf writes at random, for exercising client
    /// restart behavior. Expressed as a percentage (0-100).
    #[arg(short = 'R', long = "random-drop", value_name = "PERCENT")]
    pub random_drop: Option<f64>,
}

impl Cli {
    pub fn random_drop_probability(&self) -> Option<f64> {
        self.random_drop.map(|p| (p / 100.0).clamp(0.0, 1.0))
    }
}
