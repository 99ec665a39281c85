//! Integration tests for the cadence CLI
//!
//! These tests drive the binary against temporary project directories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

use cadence::checkpoint::{Checkpoint, CheckpointStore, ProgressCounters};
use cadence::context::TaskContext;
use cadence::human::DecisionPoint;
use cadence::machine::TaskPhaseMachine;
use cadence::notify::Notifier;

/// Helper to create a cadence Command
fn cadence() -> Command {
    cargo_bin_cmd!("cadence")
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Write a checkpoint for a task waiting at plan critique.
fn seed_pending_task(dir: &TempDir, task_id: &str) {
    let mut machine = TaskPhaseMachine::new(
        TaskContext::new(task_id, "Add a config parser"),
        Notifier::default(),
    );
    machine.start(false).unwrap();
    machine.finish_planning("1. Add src/parser.rs".to_string()).unwrap();
    machine
        .escalate(DecisionPoint::PlanCritique, "plan critique requested a human decision")
        .unwrap();

    let progress = ProgressCounters {
        agent_calls: 2,
        ..ProgressCounters::default()
    };
    let checkpoint = Checkpoint::capture(&machine, &progress, 3).unwrap();
    CheckpointStore::new(dir.path().join(".cadence/checkpoints"))
        .save(&checkpoint)
        .unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_cadence_help() {
        cadence()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("resume"))
            .stdout(predicate::str::contains("decide"));
    }

    #[test]
    fn test_cadence_version() {
        cadence().arg("--version").assert().success();
    }

    #[test]
    fn test_run_requires_a_task() {
        let dir = create_temp_project();

        cadence().current_dir(dir.path()).arg("run").assert().failure();
    }

    #[test]
    fn test_run_rejects_blank_task() {
        let dir = create_temp_project();

        cadence()
            .current_dir(dir.path())
            .args(["--non-interactive", "--no-git", "run", "--task", "   "])
            .assert()
            .failure()
            .stderr(predicate::str::contains("empty"));
    }

    #[test]
    fn test_run_rejects_unsafe_task_id() {
        let dir = create_temp_project();

        cadence()
            .current_dir(dir.path())
            .args([
                "--non-interactive",
                "--no-git",
                "run",
                "--task",
                "Add a parser",
                "--task-id",
                "../escape",
            ])
            .assert()
            .failure();
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();

        cadence()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cadence.toml found"))
            .stdout(predicate::str::contains("[agent]"))
            .stdout(predicate::str::contains("max_review_attempts = 3"));
    }

    #[test]
    fn test_config_init_then_validate() {
        let dir = create_temp_project();

        cadence()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        assert!(dir.path().join(".cadence/cadence.toml").exists());

        cadence()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_init_keeps_existing_file() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".cadence")).unwrap();
        fs::write(
            dir.path().join(".cadence/cadence.toml"),
            "[limits]\nmax_review_attempts = 9\n",
        )
        .unwrap();

        cadence()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join(".cadence/cadence.toml")).unwrap();
        assert!(content.contains("max_review_attempts = 9"));
    }

    #[test]
    fn test_config_validate_reports_problems() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".cadence")).unwrap();
        fs::write(
            dir.path().join(".cadence/cadence.toml"),
            "[limits]\nmax_review_attempts = 0\n",
        )
        .unwrap();

        cadence()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("limits.max_review_attempts"));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".cadence")).unwrap();
        fs::write(dir.path().join(".cadence/cadence.toml"), "[limits\nbroken").unwrap();

        cadence()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure();

        // Commands that load configuration refuse to start as well.
        cadence()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .failure();
    }
}

// =============================================================================
// Checkpoint Inspection Tests
// =============================================================================

mod inspection {
    use super::*;

    #[test]
    fn test_list_empty() {
        let dir = create_temp_project();

        cadence()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No checkpointed tasks"));
    }

    #[test]
    fn test_status_unknown_task_fails() {
        let dir = create_temp_project();

        cadence()
            .current_dir(dir.path())
            .args(["status", "no-such-task"])
            .assert()
            .failure();
    }

    #[test]
    fn test_list_shows_seeded_task() {
        let dir = create_temp_project();
        seed_pending_task(&dir, "parser-task");

        cadence()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("parser-task"))
            .stdout(predicate::str::contains("plan_critique"))
            .stdout(predicate::str::contains("yes"));
    }

    #[test]
    fn test_status_shows_pending_decision() {
        let dir = create_temp_project();
        seed_pending_task(&dir, "parser-task");

        cadence()
            .current_dir(dir.path())
            .args(["status", "parser-task"])
            .assert()
            .success()
            .stdout(predicate::str::contains("awaiting decision at plan_critique"))
            .stdout(predicate::str::contains("Re-plan with my feedback"))
            .stdout(predicate::str::contains("checkpoint: #3"));
    }

    #[test]
    fn test_status_rejects_tampered_checkpoint() {
        let dir = create_temp_project();
        seed_pending_task(&dir, "parser-task");
        let path = dir.path().join(".cadence/checkpoints/parser-task.json");
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("Add a config parser", "Delete everything")).unwrap();

        cadence()
            .current_dir(dir.path())
            .args(["status", "parser-task"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Decision Tests
// =============================================================================

mod decisions {
    use super::*;

    #[test]
    fn test_decide_retry_without_running() {
        let dir = create_temp_project();
        seed_pending_task(&dir, "parser-task");

        cadence()
            .current_dir(dir.path())
            .args([
                "--no-git",
                "decide",
                "parser-task",
                "--no-run",
                "retry",
                "--feedback",
                "keep the parser streaming",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Recorded"))
            .stdout(predicate::str::contains("planning"));

        cadence()
            .current_dir(dir.path())
            .args(["status", "parser-task"])
            .assert()
            .success()
            .stdout(predicate::str::contains("phase:      planning"))
            .stdout(predicate::str::contains("checkpoint: #4"))
            .stdout(predicate::str::contains("awaiting decision").not());
    }

    #[test]
    fn test_decide_without_pending_decision_fails() {
        let dir = create_temp_project();
        seed_pending_task(&dir, "parser-task");

        cadence()
            .current_dir(dir.path())
            .args(["--no-git", "decide", "parser-task", "--no-run", "approve"])
            .assert()
            .success();

        // Nothing is pending any more.
        cadence()
            .current_dir(dir.path())
            .args(["--no-git", "decide", "parser-task", "--no-run", "approve"])
            .assert()
            .failure();
    }

    #[test]
    fn test_decide_retry_requires_feedback() {
        let dir = create_temp_project();
        seed_pending_task(&dir, "parser-task");

        cadence()
            .current_dir(dir.path())
            .args(["decide", "parser-task", "retry"])
            .assert()
            .failure();
    }
}
