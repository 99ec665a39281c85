//! CLI command implementations.
//!
//! | Module   | Commands handled              |
//! |----------|-------------------------------|
//! | `run`    | `Run`, `Resume`, `Decide`     |
//! | `status` | `Status`, `List`              |
//! | `config` | `Config`                      |

pub mod config;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use run::{cmd_decide, cmd_resume, cmd_run};
pub use status::{cmd_list, cmd_status};

use anyhow::Result;
use cadence::config::Config;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

use super::Cli;

/// Load configuration and install logging. File logging is only wanted for
/// commands that drive or change a task.
pub fn load_config(cli: &Cli, project_dir: &Path, log_to_file: bool) -> Result<(Config, Option<WorkerGuard>)> {
    let config = Config::load(project_dir)?.with_cli_args(cli.verbose, cli.non_interactive);
    let log_dir = log_to_file.then(|| config.log_dir());
    let guard = cadence::logging::init(&config.toml.logging, log_dir.as_deref())?;
    Ok((config, guard))
}
