//! PHP FastCGI runtime (`php-cgi -b host:port`).
use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use tracing::{info, warn};

use crate::{
    command::CommandSpec,
    config::{Environment, Layout},
    error::{ServiceError, SettingsError},
    materialize::{self, SubstitutionMap, TemplateBinding},
    platform::Platform,
    process::StopStrategy,
};

use super::{
    Endpoint, InitializationPolicy, ServiceContext, ServiceController, ServiceDescriptor,
    ServiceState, ServiceStatus, StateTracker, settings_status,
};

const NAME: &str = "PHP";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9003;

/// Path overrides that are substituted into `php.ini` under the same name in
/// braces.
pub const PATH_OVERRIDES: [&str; 6] = [
    "PHP_ERROR_LOG",
    "PHP_INCLUDE_PATH",
    "PHP_EXTENSION_DIR",
    "PHP_SESSION_SAVE_PATH",
    "PHP_CURL_CAINFO",
    "PHP_SENDMAIL_PATH",
];

/// Resolved PHP settings.
#[derive(Debug, Clone)]
pub struct PhpSettings {
    /// Supervision details.
    pub descriptor: ServiceDescriptor,
    /// `PHP_APP_FOLDER`.
    pub app_folder: String,
    /// `apps/php/<PHP_APP_FOLDER>`, also the working directory.
    pub app_dir: PathBuf,
    /// FastCGI bind host.
    pub host: String,
    /// FastCGI bind port.
    pub port: u16,
    /// Resolved path overrides by variable name; unset ones are empty.
    pub overrides: BTreeMap<String, String>,
}

impl PhpSettings {
    /// Reads `PHP_APP_FOLDER`, `PHP_HOST`, `PHP_PORT` and the path overrides.
    pub fn from_env(
        env: &Environment,
        layout: &Layout,
        platform: &dyn Platform,
    ) -> Result<Self, SettingsError> {
        let app_folder = env.require("PHP_APP_FOLDER")?;
        let host = env.get("PHP_HOST").unwrap_or(DEFAULT_HOST).to_string();
        let port = env.port_or("PHP_PORT", DEFAULT_PORT)?;
        let app_dir = layout.app_dir("php", app_folder);
        let root_dir = layout.root().display().to_string();

        let mut overrides = BTreeMap::new();
        for key in PATH_OVERRIDES {
            let value = match env.get(key) {
                Some(raw) => raw
                    .replace("{ROOT_DIR}", &root_dir)
                    .replace("{PHP_APP_FOLDER}", app_folder),
                None => {
                    warn!("{key} environment variable is not set");
                    String::new()
                }
            };
            overrides.insert(key.to_string(), value);
        }

        Ok(Self {
            descriptor: ServiceDescriptor {
                name: NAME.to_string(),
                image_name: platform.image_name("php-cgi"),
                templates: vec![TemplateBinding::new(
                    layout.template("php", "php.ini.tpl"),
                    app_dir.join("php.ini"),
                )],
                initialization: InitializationPolicy::None,
                endpoints: vec![Endpoint::new("Port", host.clone(), port)],
            },
            app_folder: app_folder.to_string(),
            app_dir,
            host,
            port,
            overrides,
        })
    }

    fn override_path(&self, key: &str) -> Option<PathBuf> {
        self.overrides
            .get(key)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    }

    /// Placeholder values for `php.ini`.
    pub fn substitutions(&self) -> SubstitutionMap {
        let mut values = SubstitutionMap::new();
        values.insert("{PHP_APP_FOLDER}".to_string(), self.app_folder.clone());
        for (key, value) in &self.overrides {
            values.insert(format!("{{{key}}}"), value.clone());
        }
        values
    }

    /// Directories that must exist before launch: the error log's parent and
    /// the session save path.
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(log) = self.override_path("PHP_ERROR_LOG")
            && let Some(parent) = log.parent()
            && !parent.as_os_str().is_empty()
        {
            dirs.push(parent.to_path_buf());
        }
        if let Some(sessions) = self.override_path("PHP_SESSION_SAVE_PATH") {
            dirs.push(sessions);
        }
        dirs
    }

    /// `<app>/php-cgi -b host:port`, run from the app directory.
    pub fn server_command(&self) -> CommandSpec {
        CommandSpec::new(self.app_dir.join(&self.descriptor.image_name))
            .arg("-b")
            .arg(format!("{}:{}", self.host, self.port))
            .current_dir(&self.app_dir)
    }
}

/// Controller for the PHP FastCGI process.
pub struct PhpController {
    settings: Result<PhpSettings, SettingsError>,
    ctx: ServiceContext,
    state: StateTracker,
}

impl PhpController {
    /// Creates the controller.
    pub fn new(settings: Result<PhpSettings, SettingsError>, ctx: ServiceContext) -> Self {
        Self {
            settings,
            ctx,
            state: StateTracker::default(),
        }
    }

    fn settings(&self) -> Result<&PhpSettings, SettingsError> {
        self.settings.as_ref().map_err(Clone::clone)
    }

    fn run_start(&self) -> Result<(), ServiceError> {
        let settings = self.settings()?;

        self.state.set(ServiceState::Configuring);
        for dir in settings.required_dirs() {
            if !dir.exists() {
                info!("Creating directory: {}", dir.display());
            }
            materialize::ensure_dir(&dir)?;
        }
        self.ctx
            .materialize(&settings.descriptor, &settings.substitutions())?;

        self.state.set(ServiceState::Starting);
        self.ctx
            .launch(&settings.descriptor, &settings.server_command())?;
        self.state.set(ServiceState::Running);
        Ok(())
    }

    fn run_stop(&self) -> Result<(), ServiceError> {
        let settings = self.settings()?;
        self.state.set(ServiceState::Stopping);
        self.ctx
            .shutdown(&settings.descriptor, &[StopStrategy::Terminate])?;
        self.state.set(ServiceState::Stopped);
        Ok(())
    }
}

impl ServiceController for PhpController {
    fn name(&self) -> &str {
        NAME
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.state.record(self.run_start())
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.state.record(self.run_stop())
    }

    fn status(&self) -> ServiceStatus {
        match self.settings() {
            Ok(settings) => self.ctx.probe(&settings.descriptor),
            Err(err) => settings_status(&err),
        }
    }

    fn settle_delay(&self) -> Duration {
        self.ctx.timing.restart_settle
    }

    fn state(&self) -> ServiceState {
        self.state.get()
    }
}
