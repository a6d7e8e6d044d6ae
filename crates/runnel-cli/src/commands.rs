//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a pipeline definition
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "runnel.yaml")]
        path: String,
    },

    /// Run a pipeline locally in the shell sandbox
    Run {
        /// Path to pipeline file
        #[arg(default_value = "runnel.yaml")]
        path: String,

        /// Directory steps run in when a job sets no working directory
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Agent configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
