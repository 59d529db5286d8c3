use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

const SERVICE_VARS: &[&str] = &[
    "DEVSTACK_ROOT",
    "MYSQL_APP_FOLDER",
    "MYSQL_DATA_FOLDER",
    "PHP_APP_FOLDER",
    "NGINX_APP_FOLDER",
    "NGINX_DOMAIN_TAIL",
    "MAILPIT_APP_FOLDER",
];

fn devstack(root: &std::path::Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("devstack");
    cmd.current_dir(root).arg("--root").arg(root);
    for var in SERVICE_VARS {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn help_lists_commands() {
    cargo_bin_cmd!("devstack")
        .arg("help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start").and(predicate::str::contains("status")));
}

#[test]
fn unknown_command_is_rejected() {
    cargo_bin_cmd!("devstack")
        .arg("deploy")
        .assert()
        .failure()
        .stderr(predicate::str::contains("deploy"));
}

#[test]
fn status_on_unconfigured_root_reports_every_service() {
    let temp = tempdir().unwrap();

    devstack(temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Service Status:")
                .and(predicate::str::contains("MySQL     : Error: MYSQL_APP_FOLDER"))
                .and(predicate::str::contains("SSL       : Error: NGINX_DOMAIN_TAIL")),
        );
}

#[test]
fn stop_on_unconfigured_root_exits_zero() {
    let temp = tempdir().unwrap();

    devstack(temp.path())
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("Warning: failed to stop MySQL"));
}

#[test]
fn start_with_missing_settings_exits_non_zero() {
    let temp = tempdir().unwrap();

    devstack(temp.path())
        .arg("start")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("service(s) failed to start"));
}

#[test]
fn malformed_env_file_aborts_before_running_services() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join(".env"), "MYSQL_PORT=3306\nthis is not an assignment\n").unwrap();

    devstack(temp.path())
        .arg("status")
        .assert()
        .failure()
        .stdout(predicate::str::contains("Service Status").not());
}

#[test]
fn malformed_tunables_are_rejected() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("devstack.yaml"), "verify:\n  interval: soon\n").unwrap();

    devstack(temp.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("soon"));
}
