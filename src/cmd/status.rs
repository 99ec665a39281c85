//! Read-only inspection commands: `cadence status`, `cadence list`.

use anyhow::{Context, Result};
use console::style;

use cadence::agent::AgentRole;
use cadence::checkpoint::{CheckpointStore, restore};
use cadence::config::Config;
use cadence::notify::Notifier;

pub fn cmd_status(config: &Config, task_id: Option<&str>) -> Result<()> {
    let Some(task_id) = task_id else {
        return cmd_list(config);
    };

    let store = CheckpointStore::new(config.checkpoint_dir());
    let raw = store
        .load_raw(task_id)
        .with_context(|| format!("No checkpoint for task {}", task_id))?;
    let restored = restore(&raw, Some(task_id), Notifier::new(task_id))
        .with_context(|| format!("Checkpoint for task {} is not restorable", task_id))?;
    let machine = &restored.machine;
    let task = machine.context();

    println!();
    println!("{} {}", style("Task").bold(), style(task_id).cyan());
    println!("  phase:      {}", style(machine.phase()).bold());
    println!("  checkpoint: #{}", restored.sequence);
    println!("  cycle:      {}", task.cycle());
    println!("  task:       {}", first_line(task.effective_task()));

    if let Some(pending) = machine.pending() {
        println!();
        println!(
            "  {} awaiting decision at {} (since {})",
            style("⏸").yellow().bold(),
            pending.point,
            pending.requested_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        println!("    {}", pending.reason);
        for (label, meaning) in ["approve", "retry", "abandon"]
            .iter()
            .zip(pending.point.choices())
        {
            println!("    {:<8} {}", label, meaning);
        }
    }

    if let Some(execution) = machine.execution() {
        let ctx = execution.context();
        println!();
        println!("  execution:  {}", execution.state());
        if let Some(chunk) = ctx.chunk() {
            println!("  chunk:      {}", first_line(chunk));
        }
        println!(
            "  attempts:   implementation {} | review {}",
            ctx.attempts(AgentRole::Implementation),
            ctx.attempts(AgentRole::Review)
        );
        println!("  completed:  {} chunk(s)", ctx.completed_chunks().len());
    }

    let progress = &restored.progress;
    println!();
    println!(
        "  {} agent calls, {} classifications, {} in / {} out tokens, ${:.4}",
        progress.agent_calls,
        progress.classification_calls,
        progress.input_tokens,
        progress.output_tokens,
        progress.cost_usd
    );
    println!();
    Ok(())
}

pub fn cmd_list(config: &Config) -> Result<()> {
    let store = CheckpointStore::new(config.checkpoint_dir());
    let summaries = store.list()?;

    if summaries.is_empty() {
        println!("No checkpointed tasks in {}", store.dir().display());
        return Ok(());
    }

    println!();
    println!(
        "{:<40} {:<16} {:>6}  {:<20} {}",
        "TASK", "PHASE", "SEQ", "UPDATED", "WAITING"
    );
    for summary in summaries {
        println!(
            "{:<40} {:<16} {:>6}  {:<20} {}",
            summary.task_id,
            summary.phase.to_string(),
            summary.sequence,
            summary.timestamp.format("%Y-%m-%d %H:%M:%S"),
            if summary.awaiting_decision { "yes" } else { "" }
        );
    }
    println!();
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}
