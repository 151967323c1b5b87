//! Integration tests for the ontextract binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use ontextract::orchestration::db::OrchestrationDb;
use ontextract::orchestration::models::RunStage;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn ontextract() -> Command {
    let mut cmd = cargo_bin_cmd!("ontextract");
    cmd.env_remove("ONTEXTRACT_PORT")
        .env_remove("ONTEXTRACT_DB_PATH")
        .env_remove("ONTEXTRACT_REVIEW_POLICY")
        .env_remove("ONTEXTRACT_PROJECT_DIR");
    cmd
}

fn init_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    ontextract()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
    dir
}

// =============================================================================
// Basic CLI
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        ontextract()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"));
    }

    #[test]
    fn test_version() {
        ontextract().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = TempDir::new().unwrap();

        ontextract()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized OntExtract project"));

        assert!(dir.path().join(".ontextract/ontextract.toml").exists());
        assert!(dir.path().join(".ontextract/ontextract.db").exists());
    }

    #[test]
    fn test_init_idempotent() {
        let dir = init_project();

        ontextract()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_project_dir_flag() {
        let dir = TempDir::new().unwrap();

        ontextract()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("init")
            .assert()
            .success();

        assert!(dir.path().join(".ontextract").exists());
    }
}

// =============================================================================
// Config
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();

        ontextract()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("review_policy = \"auto_approve\""))
            .stdout(predicate::str::contains("port = 8720"));
    }

    #[test]
    fn test_config_show_env_override() {
        let dir = TempDir::new().unwrap();

        ontextract()
            .current_dir(dir.path())
            .env("ONTEXTRACT_PORT", "9100")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9100"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = init_project();
        fs::write(
            dir.path().join(".ontextract/ontextract.toml"),
            "[orchestration]\nmax_concurrent_documents = 0\n",
        )
        .unwrap();

        ontextract()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_concurrent_documents"));
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = init_project();

        ontextract()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_invalid_toml_fails() {
        let dir = init_project();
        fs::write(
            dir.path().join(".ontextract/ontextract.toml"),
            "[server\nport = ",
        )
        .unwrap();

        ontextract()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Run inspection
// =============================================================================

mod run_inspection {
    use super::*;

    fn seed_run(dir: &TempDir) -> i64 {
        let db = OrchestrationDb::new(&dir.path().join(".ontextract/ontextract.db")).unwrap();
        let exp = db
            .create_experiment("agency", "Trace 'agent'", Some("agent"))
            .unwrap();
        db.add_document(exp.id, "A", "The agent acts.", Some(1850))
            .unwrap();
        db.create_run("run-cli", exp.id, true).unwrap();
        db.advance_stage("run-cli", RunStage::Analyzing, RunStage::Recommending)
            .unwrap();
        exp.id
    }

    #[test]
    fn test_status_prints_view() {
        let dir = init_project();
        seed_run(&dir);

        ontextract()
            .current_dir(dir.path())
            .args(["status", "run-cli"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"current_stage\": \"recommending\""))
            .stdout(predicate::str::contains("\"progress_percentage\": 20"));
    }

    #[test]
    fn test_status_unknown_run_fails() {
        let dir = init_project();

        ontextract()
            .current_dir(dir.path())
            .args(["status", "missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Run missing not found"));
    }

    #[test]
    fn test_status_without_database_fails() {
        let dir = TempDir::new().unwrap();

        ontextract()
            .current_dir(dir.path())
            .args(["status", "anything"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("ontextract init"));
    }

    #[test]
    fn test_runs_lists_experiment_runs() {
        let dir = init_project();
        let exp_id = seed_run(&dir);

        ontextract()
            .current_dir(dir.path())
            .args(["runs", &exp_id.to_string()])
            .assert()
            .success()
            .stdout(predicate::str::contains("run-cli"))
            .stdout(predicate::str::contains("recommending"));
    }

    #[test]
    fn test_runs_unknown_experiment_fails() {
        let dir = init_project();

        ontextract()
            .current_dir(dir.path())
            .args(["runs", "77"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Experiment 77 not found"));
    }
}
