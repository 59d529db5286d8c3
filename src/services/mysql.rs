//! MySQL database server.
use std::{path::PathBuf, time::Duration};

use regex::Regex;
use tracing::{info, warn};

use crate::{
    command::{CommandSpec, run_checked},
    config::{Environment, Layout},
    error::{ServiceError, SettingsError},
    materialize::{self, TemplateBinding, substitutions},
    platform::Platform,
    process::StopStrategy,
};

use super::{
    Endpoint, InitializationPolicy, ServiceContext, ServiceController, ServiceDescriptor,
    ServiceState, ServiceStatus, StateTracker, settings_status,
};

const NAME: &str = "MySQL";
const DEFAULT_PORT: u16 = 3306;

/// Resolved MySQL settings.
#[derive(Debug, Clone)]
pub struct MysqlSettings {
    /// Supervision details.
    pub descriptor: ServiceDescriptor,
    /// `apps/mysql/<MYSQL_APP_FOLDER>`.
    pub app_dir: PathBuf,
    /// `data/<MYSQL_DATA_FOLDER>`.
    pub data_dir: PathBuf,
    /// `MYSQL_DATA_FOLDER`.
    pub data_folder: String,
    /// Rendered `my.ini`.
    pub config_file: PathBuf,
    /// Listen port.
    pub port: u16,
    /// `<root>/` with forward slashes.
    pub root_folder: String,
    /// Image suffix of the host platform.
    pub suffix: &'static str,
}

impl MysqlSettings {
    /// Reads `MYSQL_APP_FOLDER`, `MYSQL_DATA_FOLDER` and `MYSQL_PORT`.
    pub fn from_env(
        env: &Environment,
        layout: &Layout,
        platform: &dyn Platform,
    ) -> Result<Self, SettingsError> {
        let app_folder = env.require("MYSQL_APP_FOLDER")?;
        let data_folder = env.require("MYSQL_DATA_FOLDER")?;
        let port = env.port_or("MYSQL_PORT", DEFAULT_PORT)?;

        let app_dir = layout.app_dir("mysql", app_folder);
        let data_dir = layout.data_dir(data_folder);
        let config_file = app_dir.join("my.ini");

        Ok(Self {
            descriptor: ServiceDescriptor {
                name: NAME.to_string(),
                image_name: platform.image_name("mysqld"),
                templates: vec![TemplateBinding::new(
                    layout.template("mysql", "my.ini.tpl"),
                    &config_file,
                )],
                initialization: InitializationPolicy::InitIfDataDirMissingOrEmpty {
                    data_dir: data_dir.clone(),
                },
                endpoints: vec![Endpoint::new("Port", "127.0.0.1", port)],
            },
            app_dir,
            data_dir,
            data_folder: data_folder.to_string(),
            config_file,
            port,
            root_folder: layout.root_folder(),
            suffix: platform.image_suffix(),
        })
    }

    fn binary(&self, name: &str) -> PathBuf {
        self.app_dir.join("bin").join(format!("{name}{}", self.suffix))
    }

    fn defaults_file_arg(&self) -> String {
        format!("--defaults-file={}", self.config_file.display())
    }

    /// `mysqld --defaults-file=<my.ini>`.
    pub fn server_command(&self) -> CommandSpec {
        CommandSpec::new(self.binary("mysqld")).arg(self.defaults_file_arg())
    }

    /// `mysqld --defaults-file=<my.ini> --initialize`.
    pub fn initialize_command(&self) -> CommandSpec {
        self.server_command().arg("--initialize")
    }

    /// `mysqladmin --defaults-file=<my.ini> -u root shutdown`.
    pub fn shutdown_command(&self) -> CommandSpec {
        CommandSpec::new(self.binary("mysqladmin"))
            .arg(self.defaults_file_arg())
            .args(["-u", "root", "shutdown"])
    }
}

/// Pulls the generated root password out of `mysqld --initialize` output.
pub fn temporary_password(output: &str) -> Option<String> {
    let re = Regex::new(r"temporary password.*root@localhost:\s*(\S+)").ok()?;
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|found| found.as_str().to_string())
}

/// Controller for the MySQL server.
pub struct MysqlController {
    settings: Result<MysqlSettings, SettingsError>,
    ctx: ServiceContext,
    state: StateTracker,
}

impl MysqlController {
    /// Creates the controller.
    pub fn new(settings: Result<MysqlSettings, SettingsError>, ctx: ServiceContext) -> Self {
        Self {
            settings,
            ctx,
            state: StateTracker::default(),
        }
    }

    fn settings(&self) -> Result<&MysqlSettings, SettingsError> {
        self.settings.as_ref().map_err(Clone::clone)
    }

    fn initialize(&self, settings: &MysqlSettings) -> Result<(), ServiceError> {
        info!("MySQL data directory is missing or empty, initializing");
        materialize::ensure_dir(&settings.data_dir)?;

        let output = run_checked(self.ctx.runner.as_ref(), &settings.initialize_command())
            .map_err(ServiceError::Initialization)?;
        match temporary_password(&output.combined()) {
            Some(password) => info!("Temporary root password: {password}"),
            None => warn!("mysqld --initialize did not report a temporary root password"),
        }
        info!("MySQL initialization completed");
        Ok(())
    }

    fn run_start(&self) -> Result<(), ServiceError> {
        let settings = self.settings()?;

        self.state.set(ServiceState::Configuring);
        let values = substitutions([
            ("{mysql_data_folder}", settings.data_folder.as_str()),
            ("{root_folder}", settings.root_folder.as_str()),
            ("{mysql_port}", settings.port.to_string().as_str()),
        ]);
        self.ctx.materialize(&settings.descriptor, &values)?;

        if settings.descriptor.initialization.is_required()? {
            self.state.set(ServiceState::Initializing);
            self.initialize(settings)?;
        } else {
            info!("MySQL data directory exists, skipping initialization");
        }

        self.state.set(ServiceState::Starting);
        self.ctx
            .launch(&settings.descriptor, &settings.server_command())?;
        self.state.set(ServiceState::Running);
        Ok(())
    }

    fn run_stop(&self) -> Result<(), ServiceError> {
        let settings = self.settings()?;
        self.state.set(ServiceState::Stopping);
        self.ctx.shutdown(
            &settings.descriptor,
            &[
                StopStrategy::Command(settings.shutdown_command()),
                StopStrategy::Terminate,
            ],
        )?;
        self.state.set(ServiceState::Stopped);
        Ok(())
    }
}

impl ServiceController for MysqlController {
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
