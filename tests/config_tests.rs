//! Configuration system tests
//!
//! Exercises configuration loading, validation, and overrides through
//! the binary's `config` subcommands.

mod common;

use assert_cmd::Command;
use predicates::prelude::*;

use common::ConfigFixture;

fn node_cmd() -> Command {
    Command::cargo_bin("taskmesh").unwrap()
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_minimal_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[node]

[worker]

[coordinator]

[logging]
"#,
    );

    node_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(fixture.path())
        .assert()
        .success();
}

#[test]
fn test_full_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[node]
id = "test-node-001"
name = "Test Node"
listen_addr = "0.0.0.0:9410"
root_addr = "10.1.2.3:9400"
secret = "mesh-secret"
workers = 4

[coordinator]
tick_ms = 250
idle_tick_factor = 10
isolation_threshold = 100
max_tasks = 8
jobs_per_task = 2.0
max_servers = 16
learn_peers = false

[worker]
max_jobs = 12
min_jobs = 3
max_peers = 6
max_failed_jobs = 32
relay_p = 0.5
connect_p = 0.2
min_job_p = 0.1
peer_relay_c = 0.25
parental_relay_p = 0.4
activity_c = 1.5
activity_sleep_c = 1.2
activity_sleep_offset = 0.3
peer_activity_sleep_c = 0.6
max_sleep_c = 10.0
min_sleep_ms = 200
exec_idle_ms = 4000

[transport]
connect_timeout_ms = 8000
reply_timeout_ms = 10000
idle_timeout_ms = 30000
max_reconnect_attempts = 3
inbox_capacity = 100
ping_every_messages = 40
ping_payload_len = 64

[logging]
level = "debug"
file = "/tmp/taskmesh/node.log"
max_file_size_mb = 50
max_files = 3
json_format = false

[resources]
model = "file:///srv/models/base.bin"
"#,
    );

    node_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(fixture.path())
        .assert()
        .success();
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_rejects_malformed_toml() {
    let fixture = ConfigFixture::new();
    fixture.write_config("this is not [valid toml");

    node_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(fixture.path())
        .assert()
        .failure();
}

#[test]
fn test_rejects_bad_listen_addr() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[node]
listen_addr = "no-port-here"
"#,
    );

    node_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(fixture.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("listen_addr"));
}

#[test]
fn test_rejects_bad_root_addr() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[node]
root_addr = "hostname-without-port"
"#,
    );

    node_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(fixture.path())
        .assert()
        .failure();
}

#[test]
fn test_rejects_probability_out_of_range() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[worker]
relay_p = 2.5
"#,
    );

    node_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(fixture.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("relay_p"));
}

#[test]
fn test_rejects_min_jobs_over_max_jobs() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[worker]
max_jobs = 2
min_jobs = 8
"#,
    );

    node_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(fixture.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("min_jobs"));
}

#[test]
fn test_rejects_unknown_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
level = "shouting"
"#,
    );

    node_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(fixture.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("level"));
}

// ─────────────────────────────────────────────────────────────────
// Environment Override Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_override_shows_in_config() {
    node_cmd()
        .env("TASKMESH_LISTEN_ADDR", "127.0.0.1:9555")
        .arg("config")
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("127.0.0.1:9555"));
}

#[test]
fn test_env_override_is_validated() {
    node_cmd()
        .env("TASKMESH_LISTEN_ADDR", "still-not-an-address")
        .arg("config")
        .arg("validate")
        .assert()
        .failure();
}

#[test]
fn test_env_workers_override() {
    node_cmd()
        .env("TASKMESH_WORKERS", "7")
        .arg("config")
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("workers = 7"));
}
