//! Detached process supervision by image name.
use std::{
    ffi::OsStr,
    process::Stdio,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use sysinfo::{ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

use crate::{
    command::{CommandRunner, CommandSpec, run_checked},
    error::ProcessError,
    platform::Platform,
};

/// Starts, probes and stops service processes.
///
/// Identity is name based: nothing is remembered between calls and every
/// query re-reads the OS process table. Two consequences follow and callers
/// must tolerate both:
///
/// * false positives: an unrelated process with the same image name counts
///   as the service;
/// * false negatives: a child spawned a moment ago may not be visible yet,
///   which is why starts are confirmed with [`wait_until_running`].
///
/// An implementation that records spawned PIDs can replace this one where
/// name collisions are a real risk.
pub trait ProcessSupervisor: Send + Sync {
    /// Spawns `spec` detached from this process and returns its PID as soon
    /// as the OS confirms the spawn. Readiness is not awaited.
    fn start_detached(&self, spec: &CommandSpec) -> Result<u32, ProcessError>;

    /// Returns the lowest PID whose image name equals `image`, if any.
    fn is_running(&self, image: &str) -> Option<u32>;

    /// Kills every process whose image name equals `image`. Finding none is
    /// a success.
    fn terminate(&self, image: &str) -> Result<(), ProcessError>;
}

/// Bounded polling used to confirm a freshly spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between polls.
    pub interval: Duration,
    /// Maximum number of polls.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            attempts: 10,
        }
    }
}

/// Polls `supervisor` until `image` shows up or the policy is exhausted.
pub fn wait_until_running(
    supervisor: &dyn ProcessSupervisor,
    image: &str,
    policy: &RetryPolicy,
) -> Result<u32, ProcessError> {
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        if let Some(pid) = supervisor.is_running(image) {
            info!("'{image}' is running with PID {pid}");
            return Ok(pid);
        }

        debug!("Waiting for '{image}' to start (attempt {attempt}/{attempts})");
        if attempt < attempts {
            thread::sleep(policy.interval);
        }
    }

    Err(ProcessError::FailedToStart {
        image: image.to_string(),
        attempts,
    })
}

/// One way of stopping a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopStrategy {
    /// Ask the service to shut itself down with a foreground command.
    Command(CommandSpec),
    /// Kill every process with the service's image name.
    Terminate,
}

/// Tries each strategy in order until one succeeds.
///
/// Returns immediately when nothing with `image` is running. If every
/// strategy fails the last error is returned.
pub fn stop_with(
    supervisor: &dyn ProcessSupervisor,
    runner: &dyn CommandRunner,
    image: &str,
    strategies: &[StopStrategy],
) -> Result<(), ProcessError> {
    if supervisor.is_running(image).is_none() {
        info!("'{image}' is not running");
        return Ok(());
    }

    let mut last_error = None;
    for strategy in strategies {
        let outcome = match strategy {
            StopStrategy::Command(spec) => {
                debug!("Stopping '{image}' with `{spec}`");
                run_checked(runner, spec).map(|_| ())
            }
            StopStrategy::Terminate => supervisor.terminate(image),
        };

        match outcome {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!("Stop strategy for '{image}' failed: {err}");
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// [`ProcessSupervisor`] backed by the host process table.
pub struct SystemSupervisor {
    platform: Arc<dyn Platform>,
    grace: Duration,
    poll: Duration,
}

impl SystemSupervisor {
    /// Creates a supervisor that waits `grace` for a polite exit before
    /// force-killing.
    pub fn new(platform: Arc<dyn Platform>, grace: Duration) -> Self {
        Self {
            platform,
            grace,
            poll: Duration::from_millis(100),
        }
    }

    fn matching_pids(image: &str) -> Vec<u32> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        matching_pids_in(&system, image)
    }

    fn signal_all(image: &str, graceful: bool) {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        for process in system.processes_by_exact_name(OsStr::new(image)) {
            if process.thread_kind().is_some() {
                continue;
            }
            let pid = process.pid().as_u32();
            let delivered = if graceful {
                // Platforms without SIGTERM fall back to a hard kill.
                process.kill_with(Signal::Term).unwrap_or_else(|| process.kill())
            } else {
                process.kill()
            };
            if !delivered {
                debug!("Signal to '{image}' (PID {pid}) was not delivered");
            }
        }
    }

    fn wait_for_exit(&self, image: &str, timeout: Duration) -> Vec<u32> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = Self::matching_pids(image);
            if remaining.is_empty() || Instant::now() >= deadline {
                return remaining;
            }
            thread::sleep(self.poll);
        }
    }
}

fn matching_pids_in(system: &System, image: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = system
        .processes_by_exact_name(OsStr::new(image))
        .filter(|process| process.thread_kind().is_none())
        .filter(|process| !matches!(process.status(), ProcessStatus::Zombie))
        .map(|process| process.pid().as_u32())
        .collect();
    pids.sort_unstable();
    pids
}

impl ProcessSupervisor for SystemSupervisor {
    fn start_detached(&self, spec: &CommandSpec) -> Result<u32, ProcessError> {
        debug!("Launching detached command: `{spec}`");

        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        self.platform.detach(&mut cmd);

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id();
                debug!("Spawned `{spec}` with PID {pid}");
                Ok(pid)
            }
            Err(source) => Err(ProcessError::SpawnFailed {
                command: spec.to_string(),
                source,
            }),
        }
    }

    fn is_running(&self, image: &str) -> Option<u32> {
        Self::matching_pids(image).first().copied()
    }

    fn terminate(&self, image: &str) -> Result<(), ProcessError> {
        let pids = Self::matching_pids(image);
        if pids.is_empty() {
            debug!("No process named '{image}' to terminate");
            return Ok(());
        }

        info!("Terminating '{image}' (PIDs {pids:?})");
        Self::signal_all(image, true);
        let survivors = self.wait_for_exit(image, self.grace);
        if survivors.is_empty() {
            return Ok(());
        }

        warn!("'{image}' ignored graceful shutdown; killing PIDs {survivors:?}");
        Self::signal_all(image, false);
        let survivors = self.wait_for_exit(image, self.grace);
        if survivors.is_empty() {
            Ok(())
        } else {
            Err(ProcessError::TerminateFailed {
                image: image.to_string(),
                pids: survivors,
            })
        }
    }
}
