#[path = "common/mod.rs"]
mod common;

use std::{
    sync::{Arc, Barrier},
    thread,
    time::{Duration, Instant},
};

use common::{Harness, full_env, scaffold_root};
use devstack::{
    config::{Layout, Tunables},
    error::ServiceError,
    orchestrator::{Action, Orchestrator, Outcome},
    services::{self, ServiceController, ServiceState, ServiceStatus},
    test_utils::{FakePlatform, FakeSupervisor, RecordingRunner},
};
use tempfile::tempdir;

/// Controller that blocks on a shared barrier, proving every worker runs at
/// the same time.
struct Rendezvous {
    name: &'static str,
    barrier: Arc<Barrier>,
}

impl ServiceController for Rendezvous {
    fn name(&self) -> &str {
        self.name
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.barrier.wait();
        Ok(())
    }

    fn stop(&self) -> Result<(), ServiceError> {
        thread::sleep(Duration::from_millis(200));
        Ok(())
    }

    fn status(&self) -> ServiceStatus {
        ServiceStatus::NotConfigured
    }

    fn settle_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn state(&self) -> ServiceState {
        ServiceState::Unconfigured
    }
}

fn rendezvous_stack(names: &[&'static str]) -> Orchestrator {
    let barrier = Arc::new(Barrier::new(names.len()));
    Orchestrator::new(
        names
            .iter()
            .map(|&name| {
                Arc::new(Rendezvous {
                    name,
                    barrier: barrier.clone(),
                }) as Arc<dyn ServiceController>
            })
            .collect(),
    )
}

#[test]
fn services_run_concurrently() {
    let stack = rendezvous_stack(&["A", "B", "C", "D", "E"]);

    // Sequential execution would deadlock on the barrier.
    let result = stack.run(Action::Start);
    assert!(result.is_success());

    let started = Instant::now();
    assert!(stack.run(Action::Stop).is_success());
    assert!(started.elapsed() < Duration::from_millis(900));
}

#[test]
fn stop_tolerates_services_that_are_not_running() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    scaffold_root(root, &[]);
    let harness = Harness::with(
        root,
        FakeSupervisor::new()
            .with_running("mysqld", 41)
            .with_running("mailpit", 43),
        RecordingRunner::new(),
    );
    let stack = Orchestrator::new(services::stack(
        &full_env(),
        &Layout::new(root),
        &Tunables::default(),
        &harness.context(),
    ));

    let result = stack.run(Action::Stop);
    assert!(result.is_success());
    assert_eq!(result.exit_code(), 0);
    for name in ["Mailpit", "MySQL", "Nginx", "PHP", "SSL"] {
        assert_eq!(
            result.outcome(name),
            Some(&Outcome::Success { detail: None }),
            "{name} should stop cleanly"
        );
    }
    assert_eq!(harness.supervisor.terminated(), ["mailpit"]);
    assert!(result.to_string().ends_with("All services stopped"));
}

#[test]
fn stop_failures_are_warnings() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    scaffold_root(root, &[]);
    let mut harness = Harness::new(root);
    // No trust store on this host.
    harness.platform = Arc::new(FakePlatform::new(root.join("hosts")));
    let stack = Orchestrator::new(services::stack(
        &full_env(),
        &Layout::new(root),
        &Tunables::default(),
        &harness.context(),
    ));

    let result = stack.run(Action::Stop);
    assert!(result.outcome("SSL").unwrap().is_failure());
    assert!(result.is_success());
    let report = result.to_string();
    assert!(report.contains("Warning: failed to stop SSL"));
    assert!(report.ends_with("All services stopped (1 with warnings)"));
}
