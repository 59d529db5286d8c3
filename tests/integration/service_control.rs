#[path = "common/mod.rs"]
mod common;

use common::{Harness, env_without, full_env, read, scaffold_root};
use devstack::{
    command::CommandOutput,
    config::{Environment, Layout, Tunables},
    orchestrator::{Action, Orchestrator, Outcome},
    services,
    test_utils::{FakeSupervisor, RecordingRunner},
};
use std::{fs, path::Path};
use tempfile::tempdir;

fn orchestrator(env: &Environment, harness: &Harness, root: &Path) -> Orchestrator {
    let layout = Layout::new(root);
    Orchestrator::new(services::stack(
        env,
        &layout,
        &Tunables::default(),
        &harness.context(),
    ))
}

#[test]
fn full_stack_starts_reports_and_stops() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    scaffold_root(root, &["blog", "shop"]);
    let harness = Harness::new(root);
    let stack = orchestrator(&full_env(), &harness, root);

    assert_eq!(
        stack.service_names(),
        ["MySQL", "SSL", "PHP", "Nginx", "Mailpit"]
    );

    let started = stack.run(Action::Start);
    assert!(started.is_success(), "start failed:\n{started}");
    let order: Vec<_> = started.outcomes.iter().map(|o| o.service.as_str()).collect();
    assert_eq!(order, ["Mailpit", "MySQL", "Nginx", "PHP", "SSL"]);

    let root_folder = format!("{}/", root.display());
    let my_ini = read(root.join("apps/mysql/mysql-8.4/my.ini"));
    assert!(my_ini.contains(&format!("{root_folder}data/mysql")));
    assert!(!my_ini.contains('{'));

    let php_ini = read(root.join("apps/php/php-8.3/php.ini"));
    assert!(php_ini.contains(&format!("{}/tmp/sessions", root.display())));
    assert!(root.join("tmp/sessions").is_dir());

    let blog = read(root.join("etc/nginx/sites-enabled/blog.test.conf"));
    assert!(blog.contains("server_name blog.test"));
    assert!(root.join("etc/nginx/sites-enabled/shop.test.conf").exists());
    assert!(root.join("logs/nginx/access-shop.test.log").exists());

    let openssl_conf = read(root.join("etc/ssl/openssl.conf"));
    assert!(openssl_conf.contains("DNS.2 = blog.test"));
    assert!(openssl_conf.contains("*.shop.test"));
    assert!(root.join("etc/ssl/certificate.yaml").exists());

    let scratch = read(root.join("hosts.tmp"));
    assert!(scratch.contains("# keep me"));
    assert!(scratch.contains("127.0.0.1\tblog.test"));

    let lines = harness.runner.lines();
    assert!(lines.iter().any(|line| line.contains("mysqld") && line.contains("--initialize")));
    assert!(lines.iter().any(|line| line.ends_with(" -t")));
    assert!(lines.iter().any(|line| line.contains("update-ca-certificates")));
    assert_eq!(harness.supervisor.launched().len(), 4);

    let status = stack.run(Action::Status).to_string();
    assert!(status.starts_with("Service Status:\n"));
    assert!(status.contains("MySQL     : Running (PID: "));
    assert!(status.contains("Port: 127.0.0.1:3306"));
    assert!(status.contains("UI: http://127.0.0.1:8025"));
    assert!(status.contains("SSL       : Active (expires "));

    let stopped = stack.run(Action::Stop);
    assert!(stopped.is_success());
    assert!(
        harness
            .runner
            .lines()
            .iter()
            .any(|line| line.contains("mysqladmin") && line.ends_with("shutdown"))
    );
    let mut terminated = harness.supervisor.terminated();
    terminated.sort();
    assert_eq!(terminated, ["mailpit", "nginx", "php-cgi"]);
}

#[test]
fn second_start_reuses_certificate_and_data_dir() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    scaffold_root(root, &["blog"]);
    let harness = Harness::new(root);
    let stack = orchestrator(&full_env(), &harness, root);

    assert!(stack.run(Action::Start).is_success());
    fs::create_dir_all(root.join("data/mysql/mysql")).unwrap();
    let first_runs = harness.runner.lines().len();

    assert!(stack.run(Action::Restart).is_success());
    let rerun: Vec<_> = harness.runner.lines().split_off(first_runs);
    assert!(!rerun.iter().any(|line| line.contains("--initialize")));
    assert!(!rerun.iter().any(|line| line.contains("genrsa")));
}

#[test]
fn missing_settings_fail_only_the_affected_service() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    scaffold_root(root, &[]);
    let harness = Harness::new(root);

    let vars = env_without("MYSQL_APP_FOLDER");
    let stack = orchestrator(&vars, &harness, root);

    let result = stack.run(Action::Start);
    assert!(!result.is_success());
    assert_eq!(result.exit_code(), 1);
    assert!(matches!(
        result.outcome("MySQL"),
        Some(Outcome::Failure { reason }) if reason.contains("MYSQL_APP_FOLDER")
    ));
    assert_eq!(result.failures().count(), 1);

    let status = stack.run(Action::Status).to_string();
    assert!(status.contains("MySQL     : Error: MYSQL_APP_FOLDER environment variable is not set"));
}

#[test]
fn failed_nginx_check_leaves_siblings_running() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    scaffold_root(root, &["blog"]);
    let runner = RecordingRunner::new().respond(
        "nginx -p",
        CommandOutput::failed(1, "nginx: [emerg] unexpected \"}\""),
    );
    let harness = Harness::with(root, FakeSupervisor::new(), runner);
    let stack = orchestrator(&full_env(), &harness, root);

    let result = stack.run(Action::Start);
    assert!(matches!(
        result.outcome("Nginx"),
        Some(Outcome::Failure { reason }) if reason.contains("emerg")
    ));
    for name in ["Mailpit", "MySQL", "PHP", "SSL"] {
        assert_eq!(result.outcome(name), Some(&Outcome::Success { detail: None }));
    }
    assert!(result.to_string().contains("Failed to start Nginx"));
}

#[test]
fn start_fails_when_process_never_appears() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    scaffold_root(root, &[]);
    let harness = Harness::with(
        root,
        FakeSupervisor::new().stay_down("mailpit"),
        RecordingRunner::new(),
    );
    let stack = orchestrator(&full_env(), &harness, root);

    let result = stack.run(Action::Start);
    assert!(result.outcome("Mailpit").unwrap().is_failure());
    assert_eq!(result.failures().count(), 1);
}
