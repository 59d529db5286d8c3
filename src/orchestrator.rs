//! Fans one action out to every service concurrently and aggregates the
//! outcomes.
use std::{
    any::Any,
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use strum_macros::AsRefStr;
use tracing::{debug, error, info, warn};

use crate::{error, services::ServiceController};

/// A lifecycle action applied to every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    /// Configure and launch.
    Start,
    /// Shut down; best effort.
    Stop,
    /// Stop, settle, start.
    Restart,
    /// Read-only report.
    Status,
}

impl Action {
    fn past_tense(self) -> &'static str {
        match self {
            Action::Start => "started",
            Action::Stop => "stopped",
            Action::Restart => "restarted",
            Action::Status => "checked",
        }
    }

    fn progressive(self) -> &'static str {
        match self {
            Action::Start => "Starting",
            Action::Stop => "Stopping",
            Action::Restart => "Restarting",
            Action::Status => "Checking",
        }
    }

    /// Whether a single service failure fails the whole run.
    pub fn failures_are_fatal(self) -> bool {
        matches!(self, Action::Start | Action::Restart)
    }
}

/// Result of one action on one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The action completed.
    Success {
        /// Extra text, such as a status line.
        detail: Option<String>,
    },
    /// The action failed.
    Failure {
        /// Error message including its cause chain.
        reason: String,
    },
}

impl Outcome {
    /// True for [`Outcome::Failure`].
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure { .. })
    }
}

/// One service's entry in an [`AggregatedResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOutcome {
    /// Service name.
    pub service: String,
    /// What happened.
    pub outcome: Outcome,
    /// Wall time spent on the action.
    pub elapsed: Duration,
}

/// Every service's outcome for one run, ordered by service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedResult {
    /// The action that was run.
    pub action: Action,
    /// Per-service outcomes.
    pub outcomes: Vec<ServiceOutcome>,
}

impl AggregatedResult {
    /// Outcome for `service`, if it took part.
    pub fn outcome(&self, service: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|entry| entry.service == service)
            .map(|entry| &entry.outcome)
    }

    /// Services that failed.
    pub fn failures(&self) -> impl Iterator<Item = &ServiceOutcome> {
        self.outcomes.iter().filter(|entry| entry.outcome.is_failure())
    }

    /// Overall result. Only start and restart can fail as a whole.
    pub fn is_success(&self) -> bool {
        !self.action.failures_are_fatal() || self.failures().next().is_none()
    }

    /// Process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}

impl fmt::Display for AggregatedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.action == Action::Status {
            writeln!(f, "Service Status:")?;
            writeln!(f, "==============")?;
            for entry in &self.outcomes {
                let line = match &entry.outcome {
                    Outcome::Success { detail } => detail.as_deref().unwrap_or("Unknown"),
                    Outcome::Failure { reason } => reason.as_str(),
                };
                writeln!(f, "{:<10}: {line}", entry.service)?;
            }
            return Ok(());
        }

        let verb = self.action.as_ref();
        for entry in &self.outcomes {
            match &entry.outcome {
                Outcome::Success { .. } => writeln!(
                    f,
                    "{} {} in {:.2} seconds",
                    entry.service,
                    self.action.past_tense(),
                    entry.elapsed.as_secs_f64()
                )?,
                Outcome::Failure { reason } if self.action.failures_are_fatal() => {
                    writeln!(f, "Failed to {verb} {}: {reason}", entry.service)?
                }
                Outcome::Failure { reason } => {
                    writeln!(f, "Warning: failed to {verb} {}: {reason}", entry.service)?
                }
            }
        }

        let failed = self.failures().count();
        if self.is_success() && failed == 0 {
            write!(f, "All services {}", self.action.past_tense())
        } else if self.is_success() {
            write!(
                f,
                "All services {} ({failed} with warnings)",
                self.action.past_tense()
            )
        } else {
            write!(f, "{failed} service(s) failed to {verb}")
        }
    }
}

/// Runs actions across a fixed set of services.
pub struct Orchestrator {
    services: Vec<Arc<dyn ServiceController>>,
}

impl Orchestrator {
    /// Orchestrator over `services`.
    pub fn new(services: Vec<Arc<dyn ServiceController>>) -> Self {
        Self { services }
    }

    /// Names of the managed services, in registration order.
    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|service| service.name()).collect()
    }

    /// Runs `action` on every service in parallel and waits for all of them.
    ///
    /// One thread per service; a failure or panic in one never affects the
    /// others.
    pub fn run(&self, action: Action) -> AggregatedResult {
        info!("{} all services", action.progressive());

        let mut outcomes: Vec<ServiceOutcome> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .services
                .iter()
                .map(|service| {
                    let name = service.name().to_string();
                    let handle = thread::Builder::new()
                        .name(format!("devstack-{}", name.to_lowercase()))
                        .spawn_scoped(scope, move || run_one(service.as_ref(), action));
                    (name, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(service, handle)| {
                    let joined = match handle {
                        Ok(handle) => handle.join().map_err(panic_reason),
                        Err(err) => Err(format!("failed to spawn worker thread: {err}")),
                    };
                    joined.unwrap_or_else(|reason| {
                        error!("{service} worker aborted: {reason}");
                        ServiceOutcome {
                            service,
                            outcome: Outcome::Failure { reason },
                            elapsed: Duration::ZERO,
                        }
                    })
                })
                .collect()
        });

        outcomes.sort_by(|a, b| a.service.cmp(&b.service));
        AggregatedResult { action, outcomes }
    }
}

fn run_one(service: &dyn ServiceController, action: Action) -> ServiceOutcome {
    let started = Instant::now();
    let name = service.name().to_string();
    debug!("{} {name}", action.progressive());

    let result = match action {
        Action::Start => service.start(),
        Action::Stop => service.stop(),
        Action::Restart => service.restart(),
        Action::Status => {
            let status = service.status();
            return ServiceOutcome {
                service: name,
                outcome: Outcome::Success {
                    detail: Some(status.to_string()),
                },
                elapsed: started.elapsed(),
            };
        }
    };

    let elapsed = started.elapsed();
    let outcome = match result {
        Ok(()) => {
            info!(
                "{name} {} in {:.2} seconds",
                action.past_tense(),
                elapsed.as_secs_f64()
            );
            Outcome::Success { detail: None }
        }
        Err(err) => {
            let reason = error::chain(&err);
            if action.failures_are_fatal() {
                error!("Failed to {} {name}: {reason}", action.as_ref());
            } else {
                warn!("Failed to {} {name}: {reason}", action.as_ref());
            }
            Outcome::Failure { reason }
        }
    };

    ServiceOutcome {
        service: name,
        outcome,
        elapsed,
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
