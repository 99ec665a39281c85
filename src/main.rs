use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version, about = "Resumable LLM agent orchestration through a fixed task lifecycle")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Leave escalations pending instead of prompting for a decision
    #[arg(long, global = true)]
    pub non_interactive: bool,

    /// Work in the project directory without git commits
    #[arg(long, global = true)]
    pub no_git: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new task
    Run {
        /// Task description
        #[arg(short, long, conflicts_with = "task_file", required_unless_present = "task_file")]
        task: Option<String>,

        /// Read the task description from a file
        #[arg(long)]
        task_file: Option<PathBuf>,

        /// Identifier for the task (generated when omitted)
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Resume a task from its checkpoint
    Resume { task_id: String },
    /// Answer a pending escalation
    Decide {
        task_id: String,

        #[command(subcommand)]
        decision: DecisionCommands,

        /// Record the decision without resuming the task
        #[arg(long, global = true)]
        no_run: bool,
    },
    /// Show a task's checkpointed state
    Status { task_id: Option<String> },
    /// List checkpointed tasks
    List,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum DecisionCommands {
    /// Accept and continue
    Approve,
    /// Try again with feedback
    Retry {
        #[arg(short, long)]
        feedback: String,
    },
    /// Abandon the task
    Abandon,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and list problems
    Validate,
    /// Write a default cadence.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone()),
        Commands::Status { task_id } => {
            let (config, _log_guard) = cmd::load_config(&cli, &project_dir, false)?;
            cmd::cmd_status(&config, task_id.as_deref())
        }
        Commands::List => {
            let (config, _log_guard) = cmd::load_config(&cli, &project_dir, false)?;
            cmd::cmd_list(&config)
        }
        Commands::Run {
            task,
            task_file,
            task_id,
        } => {
            let (config, _log_guard) = cmd::load_config(&cli, &project_dir, true)?;
            let task = match (task, task_file) {
                (Some(task), _) => task.clone(),
                (None, Some(path)) => std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read task file {}", path.display()))?,
                (None, None) => anyhow::bail!("Provide --task or --task-file"),
            };
            cmd::cmd_run(&cli, &config, &task, task_id.as_deref()).await
        }
        Commands::Resume { task_id } => {
            let (config, _log_guard) = cmd::load_config(&cli, &project_dir, true)?;
            cmd::cmd_resume(&cli, &config, task_id).await
        }
        Commands::Decide {
            task_id,
            decision,
            no_run,
        } => {
            let (config, _log_guard) = cmd::load_config(&cli, &project_dir, true)?;
            cmd::cmd_decide(&cli, &config, task_id, decision.clone(), *no_run).await
        }
    }
}
