//! Per-service lifecycle controllers and the pieces they share.
//!
//! Every managed service follows the same sequence:
//!
//! ```text
//! Unconfigured -> Configuring -> (Initializing) -> Starting -> Running
//! Running -> Stopping -> Stopped
//! any step -> Failed(reason)
//! ```
//!
//! `Failed` only ends the current invocation; the next `start` retries the
//! whole sequence from the beginning.
use std::{
    fmt, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use tracing::{info, warn};

use crate::{
    command::{CommandRunner, CommandSpec},
    config::{Environment, Layout, Tunables, Timing},
    error::{self, ServiceError, SettingsError},
    materialize::{SubstitutionMap, TemplateBinding},
    platform::Platform,
    process::{self, ProcessSupervisor, StopStrategy},
};

pub mod mailpit;
pub mod mysql;
pub mod nginx;
pub mod php;
pub mod tls;

pub use mailpit::{MailpitController, MailpitSettings};
pub use mysql::{MysqlController, MysqlSettings};
pub use nginx::{NginxController, NginxSettings};
pub use php::{PhpController, PhpSettings};
pub use tls::{TlsController, TlsSettings};

/// Whether a service needs a one-time setup step before its first start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializationPolicy {
    /// Never.
    None,
    /// When `data_dir` does not exist or has no entries.
    InitIfDataDirMissingOrEmpty {
        /// Directory whose contents signal a completed initialization.
        data_dir: PathBuf,
    },
}

impl InitializationPolicy {
    /// Evaluates the policy against the filesystem.
    pub fn is_required(&self) -> Result<bool, ServiceError> {
        match self {
            InitializationPolicy::None => Ok(false),
            InitializationPolicy::InitIfDataDirMissingOrEmpty { data_dir } => {
                needs_initialization(data_dir).map_err(|err| {
                    ServiceError::io(
                        format!("failed to inspect data directory {}", data_dir.display()),
                        err,
                    )
                })
            }
        }
    }
}

/// True when `data_dir` is absent or empty.
pub fn needs_initialization(data_dir: &Path) -> std::io::Result<bool> {
    match fs::read_dir(data_dir) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
        Err(err) => Err(err),
    }
}

/// An address a service listens on. Informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Short label shown in status output.
    pub label: String,
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// URL scheme to print in front of the address, if any.
    pub scheme: Option<&'static str>,
}

impl Endpoint {
    /// A plain `host:port` endpoint.
    pub fn new(label: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            label: label.into(),
            host: host.into(),
            port,
            scheme: None,
        }
    }

    /// An endpoint printed as an `http://` URL.
    pub fn http(label: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Some("http"),
            ..Self::new(label, host, port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Some(scheme) => write!(f, "{}: {scheme}://{}:{}", self.label, self.host, self.port),
            None => write!(f, "{}: {}:{}", self.label, self.host, self.port),
        }
    }
}

/// Static description of a supervised service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Display name, unique across the stack.
    pub name: String,
    /// Process image name used for lookup and termination.
    pub image_name: String,
    /// Templates rendered before every start, in order.
    pub templates: Vec<TemplateBinding>,
    /// One-time setup requirement.
    pub initialization: InitializationPolicy,
    /// Listen addresses for status output.
    pub endpoints: Vec<Endpoint>,
}

/// Lifecycle position of a controller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ServiceState {
    /// Nothing attempted yet.
    #[default]
    Unconfigured,
    /// Rendering configuration.
    Configuring,
    /// Running one-time setup.
    Initializing,
    /// Process launched, waiting for it to appear.
    Starting,
    /// Process confirmed.
    Running,
    /// Stop strategies in progress.
    Stopping,
    /// No process left.
    Stopped,
    /// The last invocation failed.
    Failed(String),
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Unconfigured => write!(f, "unconfigured"),
            ServiceState::Configuring => write!(f, "configuring"),
            ServiceState::Initializing => write!(f, "initializing"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Records the last [`ServiceState`] of a controller.
#[derive(Debug, Default)]
pub struct StateTracker {
    state: Mutex<ServiceState>,
}

impl StateTracker {
    /// Moves to `state`.
    pub fn set(&self, state: ServiceState) {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = state;
    }

    /// The current state.
    pub fn get(&self) -> ServiceState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Sets `Failed` when `result` is an error, then hands it back.
    pub fn record<T>(&self, result: Result<T, ServiceError>) -> Result<T, ServiceError> {
        if let Err(err) = &result {
            self.set(ServiceState::Failed(error::chain(err)));
        }
        result
    }
}

/// What `status` reports for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// A matching process exists.
    Running {
        /// Lowest matching PID.
        pid: u32,
        /// Configured listen addresses.
        endpoints: Vec<Endpoint>,
    },
    /// No matching process.
    Stopped,
    /// Certificate material is present.
    Active {
        /// Expiry, when known.
        expires: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// Certificate material has never been generated.
    NotConfigured,
    /// Settings are unusable; the message explains why.
    Error(String),
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Running { pid, endpoints } => {
                write!(f, "Running (PID: {pid}")?;
                for endpoint in endpoints {
                    write!(f, ", {endpoint}")?;
                }
                write!(f, ")")
            }
            ServiceStatus::Stopped => write!(f, "Stopped"),
            ServiceStatus::Active { expires: Some(at) } => {
                write!(f, "Active (expires {})", at.format("%Y-%m-%d"))
            }
            ServiceStatus::Active { expires: None } => write!(f, "Active"),
            ServiceStatus::NotConfigured => write!(f, "Not configured"),
            ServiceStatus::Error(message) => write!(f, "Error: {message}"),
        }
    }
}

/// Lifecycle contract every managed service implements.
pub trait ServiceController: Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// Configures, optionally initializes, launches and verifies the service.
    fn start(&self) -> Result<(), ServiceError>;

    /// Stops the service. Finding nothing to stop is a success.
    fn stop(&self) -> Result<(), ServiceError>;

    /// Reports the current condition. Never fails.
    fn status(&self) -> ServiceStatus;

    /// Pause between stop and start during a restart.
    fn settle_delay(&self) -> Duration;

    /// Last recorded lifecycle state.
    fn state(&self) -> ServiceState;

    /// Stops (failures are only logged), waits [`settle_delay`](Self::settle_delay),
    /// then starts.
    fn restart(&self) -> Result<(), ServiceError> {
        if let Err(err) = self.stop() {
            warn!(
                "Error stopping {} before restart: {}",
                self.name(),
                error::chain(&err)
            );
        }
        thread::sleep(self.settle_delay());
        self.start()
    }
}

/// Collaborators shared by every controller.
#[derive(Clone)]
pub struct ServiceContext {
    /// Process launcher and probe.
    pub supervisor: Arc<dyn ProcessSupervisor>,
    /// Foreground command runner.
    pub runner: Arc<dyn CommandRunner>,
    /// Host OS adapter.
    pub platform: Arc<dyn Platform>,
    /// Retry and settle timings.
    pub timing: Timing,
}

impl ServiceContext {
    /// Renders every template of `descriptor` with `values`.
    pub fn materialize(
        &self,
        descriptor: &ServiceDescriptor,
        values: &SubstitutionMap,
    ) -> Result<(), ServiceError> {
        for binding in &descriptor.templates {
            binding.render(values)?;
        }
        Ok(())
    }

    /// Spawns `spec` and waits for `descriptor`'s image to appear.
    ///
    /// The spawn always happens, even if a process with the same image is
    /// already visible, so a stale process can never mask a failed start.
    pub fn launch(
        &self,
        descriptor: &ServiceDescriptor,
        spec: &CommandSpec,
    ) -> Result<u32, ServiceError> {
        info!("Starting {} server", descriptor.name);
        self.supervisor.start_detached(spec)?;
        let pid = process::wait_until_running(
            self.supervisor.as_ref(),
            &descriptor.image_name,
            &self.timing.verify,
        )?;
        Ok(pid)
    }

    /// Runs `strategies` against `descriptor`'s image.
    pub fn shutdown(
        &self,
        descriptor: &ServiceDescriptor,
        strategies: &[StopStrategy],
    ) -> Result<(), ServiceError> {
        process::stop_with(
            self.supervisor.as_ref(),
            self.runner.as_ref(),
            &descriptor.image_name,
            strategies,
        )?;
        Ok(())
    }

    /// Running/stopped status for `descriptor`.
    pub fn probe(&self, descriptor: &ServiceDescriptor) -> ServiceStatus {
        match self.supervisor.is_running(&descriptor.image_name) {
            Some(pid) => ServiceStatus::Running {
                pid,
                endpoints: descriptor.endpoints.clone(),
            },
            None => ServiceStatus::Stopped,
        }
    }
}

/// Status for a controller whose settings could not be built.
pub(crate) fn settings_status(err: &SettingsError) -> ServiceStatus {
    ServiceStatus::Error(err.to_string())
}

/// Builds the full stack in display order: MySQL, SSL, PHP, Nginx, Mailpit.
///
/// Settings problems do not abort construction; the affected controller
/// reports them from every call instead.
pub fn stack(
    env: &Environment,
    layout: &Layout,
    tunables: &Tunables,
    ctx: &ServiceContext,
) -> Vec<Arc<dyn ServiceController>> {
    let platform = ctx.platform.as_ref();
    vec![
        Arc::new(MysqlController::new(
            MysqlSettings::from_env(env, layout, platform),
            ctx.clone(),
        )),
        Arc::new(TlsController::new(
            TlsSettings::from_env(env, layout),
            tunables.certificates,
            ctx.clone(),
        )),
        Arc::new(PhpController::new(
            PhpSettings::from_env(env, layout, platform),
            ctx.clone(),
        )),
        Arc::new(NginxController::new(
            NginxSettings::from_env(env, layout, platform, &tunables.hosts_marker),
            ctx.clone(),
        )),
        Arc::new(MailpitController::new(
            MailpitSettings::from_env(env, layout, platform),
            ctx.clone(),
        )),
    ]
}
