//! Task execution commands: `cadence run`, `cadence resume`, `cadence decide`.

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use tracing::warn;

use cadence::agent::{AgentInvoker, ClaudeInvoker};
use cadence::checkpoint::CheckpointStore;
use cadence::config::Config;
use cadence::human::{DecisionSource, DeferredDecisions, HumanDecision, TerminalDecisions};
use cadence::notify::TracingSink;
use cadence::orchestrator::{Orchestrator, OrchestratorSettings, RunOutcome, RunReport};
use cadence::sandbox::{DirectorySandbox, InPlaceGitSandbox, Sandbox};

use super::super::{Cli, DecisionCommands};

fn build_orchestrator(cli: &Cli, config: &Config) -> Orchestrator {
    let invoker: Arc<dyn AgentInvoker> = Arc::new(ClaudeInvoker::new(
        &config.toml.agent,
        config.project_dir.clone(),
    ));

    let in_repo = git2::Repository::discover(&config.project_dir).is_ok();
    let sandbox: Arc<dyn Sandbox> = if cli.no_git {
        Arc::new(DirectorySandbox::new(&config.project_dir))
    } else if in_repo {
        Arc::new(InPlaceGitSandbox::new(&config.project_dir))
    } else {
        warn!(
            path = %config.project_dir.display(),
            "not a git repository, changes will not be committed (use --no-git to silence)"
        );
        Arc::new(DirectorySandbox::new(&config.project_dir))
    };

    let decisions: Arc<dyn DecisionSource> = if config.non_interactive {
        Arc::new(DeferredDecisions)
    } else {
        Arc::new(TerminalDecisions)
    };

    let orchestrator = Orchestrator::new(
        invoker,
        sandbox,
        CheckpointStore::new(config.checkpoint_dir()),
        OrchestratorSettings::from_toml(&config.toml),
    )
    .with_decisions(decisions)
    .with_sink(Arc::new(TracingSink));

    // Ctrl-C abandons the in-flight step; the last checkpoint stays authoritative.
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    orchestrator
}

pub async fn cmd_run(cli: &Cli, config: &Config, task: &str, task_id: Option<&str>) -> Result<()> {
    config.ensure_directories()?;
    let orchestrator = build_orchestrator(cli, config);
    let report = orchestrator
        .run(task, task_id)
        .await
        .context("Task run failed")?;
    print_report(&report);
    Ok(())
}

pub async fn cmd_resume(cli: &Cli, config: &Config, task_id: &str) -> Result<()> {
    let orchestrator = build_orchestrator(cli, config);
    let report = orchestrator
        .resume(task_id)
        .await
        .with_context(|| format!("Failed to resume task {}", task_id))?;
    print_report(&report);
    Ok(())
}

pub async fn cmd_decide(
    cli: &Cli,
    config: &Config,
    task_id: &str,
    decision: DecisionCommands,
    no_run: bool,
) -> Result<()> {
    let decision = match decision {
        DecisionCommands::Approve => HumanDecision::Approve,
        DecisionCommands::Retry { feedback } => HumanDecision::RetryWithFeedback(feedback),
        DecisionCommands::Abandon => HumanDecision::Abandon,
    };

    let orchestrator = build_orchestrator(cli, config);
    let label = decision.label();
    let phase = orchestrator
        .decide(task_id, decision)
        .with_context(|| format!("Failed to record decision for task {}", task_id))?;
    println!(
        "{} {} for task {} (now {})",
        style("Recorded").green().bold(),
        label,
        style(task_id).cyan(),
        phase
    );

    if no_run {
        return Ok(());
    }
    let report = orchestrator
        .resume(task_id)
        .await
        .with_context(|| format!("Failed to resume task {}", task_id))?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    match &report.outcome {
        RunOutcome::Completed => println!(
            "{} task {} completed",
            style("✓").green().bold(),
            style(&report.task_id).cyan()
        ),
        RunOutcome::Abandoned => println!(
            "{} task {} abandoned",
            style("✗").red().bold(),
            style(&report.task_id).cyan()
        ),
        RunOutcome::AwaitingDecision(pending) => {
            println!(
                "{} task {} is waiting at {}",
                style("⏸").yellow().bold(),
                style(&report.task_id).cyan(),
                style(pending.point).bold()
            );
            println!("  {}", pending.reason);
            println!();
            println!("Choices: {}", pending.point.choices().join(" | "));
            println!(
                "Decide with: cadence decide {} approve|retry --feedback \"...\"|abandon",
                report.task_id
            );
        }
    }
    let progress = &report.progress;
    println!(
        "  phase {} | checkpoint #{} | {} agent calls | {} chunks | ${:.4}",
        report.phase, report.sequence, progress.agent_calls, progress.chunks_completed, progress.cost_usd
    );
    println!();
}
