//! CLI integration tests for riskflow.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const ENV_OVERRIDES: [&str; 9] = [
    "RISKFLOW_PORT",
    "RISKFLOW_DB_PATH",
    "RISKFLOW_STAGE_SERVICE_URL",
    "RISKFLOW_WEBHOOK_URL",
    "RISKFLOW_ADMIN_CONTACT",
    "RISKFLOW_LOG_FORMAT",
    "RETRY_CHECK_INTERVAL",
    "RETRY_MAX_ATTEMPTS",
    "SMALL_RISK_THRESHOLD_EUR",
];

/// A riskflow command running in `dir` with a clean override environment.
fn riskflow(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("riskflow");
    cmd.current_dir(dir.path());
    for key in ENV_OVERRIDES {
        cmd.env_remove(key);
    }
    cmd
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        riskflow(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init-db"))
            .stdout(predicate::str::contains("sweep"))
            .stdout(predicate::str::contains("status"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        riskflow(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("riskflow"));
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = TempDir::new().unwrap();
        riskflow(&dir).arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_shows_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        riskflow(&dir)
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("No config file"))
            .stdout(predicate::str::contains("[workflow]"))
            .stdout(predicate::str::contains("max_retries = 3"))
            .stdout(predicate::str::contains("event_heartbeat_secs = 25"));
    }

    #[test]
    fn test_config_reads_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("riskflow.toml"),
            "[server]\nport = 4321\n\n[workflow]\nsmall_value_threshold = 2500.0\n",
        )
        .unwrap();

        riskflow(&dir)
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 4321"))
            .stdout(predicate::str::contains("small_value_threshold = 2500.0"));
    }

    #[test]
    fn test_config_flag_points_at_other_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("custom.toml"), "[workflow]\nmax_retries = 9\n").unwrap();

        riskflow(&dir)
            .args(["--config", "custom.toml", "config"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_retries = 9"));
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("riskflow.toml"), "[workflow]\nmax_retries = 2\n").unwrap();

        riskflow(&dir)
            .env("RETRY_MAX_ATTEMPTS", "6")
            .env("RETRY_CHECK_INTERVAL", "45")
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("max_retries = 6"))
            .stdout(predicate::str::contains("sweep_interval_secs = 45"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("riskflow.toml"),
            "[workflow]\nstale_lease_secs = 60\nlease_renewal_secs = 120\n",
        )
        .unwrap();

        riskflow(&dir)
            .args(["config", "--validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("lease_renewal_secs"));
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let dir = TempDir::new().unwrap();
        riskflow(&dir)
            .args(["config", "--validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }
}

// =============================================================================
// Database commands
// =============================================================================

mod database {
    use super::*;

    #[test]
    fn test_init_db_creates_database() {
        let dir = TempDir::new().unwrap();
        riskflow(&dir)
            .args(["init-db", "--db-path", "data/riskflow.db"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Database initialized"));

        assert!(dir.path().join("data/riskflow.db").exists());
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let dir = TempDir::new().unwrap();
        for _ in 0..2 {
            riskflow(&dir)
                .args(["init-db", "--db-path", "riskflow.db"])
                .assert()
                .success();
        }
    }

    #[test]
    fn test_status_of_unknown_run() {
        let dir = TempDir::new().unwrap();
        riskflow(&dir)
            .args(["init-db", "--db-path", "riskflow.db"])
            .assert()
            .success();

        riskflow(&dir)
            .args(["status", "no-such-run", "--db-path", "riskflow.db"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Execution not found"));
    }

    #[test]
    fn test_status_without_database() {
        let dir = TempDir::new().unwrap();
        riskflow(&dir)
            .args(["status", "run-1", "--db-path", "missing.db"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No database"));
    }
}

// =============================================================================
// Sweep
// =============================================================================

mod sweep {
    use super::*;

    #[test]
    fn test_sweep_requires_stage_service() {
        let dir = TempDir::new().unwrap();
        riskflow(&dir)
            .args(["sweep", "--db-path", "riskflow.db"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("service_url"));
    }

    #[test]
    fn test_sweep_on_empty_database_reports_nothing() {
        let dir = TempDir::new().unwrap();
        riskflow(&dir)
            .env("RISKFLOW_STAGE_SERVICE_URL", "http://127.0.0.1:9")
            .args(["sweep", "--db-path", "riskflow.db"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"escalated\": []"))
            .stdout(predicate::str::contains("\"retried\": []"));
    }
}
