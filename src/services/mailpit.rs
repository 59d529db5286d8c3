//! Mailpit SMTP capture daemon and its web UI.
use std::{path::PathBuf, time::Duration};

use crate::{
    command::CommandSpec,
    config::{Environment, Layout},
    error::{ServiceError, SettingsError},
    platform::Platform,
    process::StopStrategy,
};

use super::{
    Endpoint, InitializationPolicy, ServiceContext, ServiceController, ServiceDescriptor,
    ServiceState, ServiceStatus, StateTracker, settings_status,
};

const NAME: &str = "Mailpit";

/// Resolved Mailpit settings.
#[derive(Debug, Clone)]
pub struct MailpitSettings {
    /// Supervision details.
    pub descriptor: ServiceDescriptor,
    /// `apps/mailpit/<MAILPIT_APP_FOLDER>`.
    pub app_dir: PathBuf,
    /// SMTP listener.
    pub smtp: (String, u16),
    /// Web UI listener.
    pub ui: (String, u16),
}

impl MailpitSettings {
    /// Reads `MAILPIT_APP_FOLDER` and the SMTP/UI host and port variables,
    /// logging each default that applies.
    pub fn from_env(
        env: &Environment,
        layout: &Layout,
        platform: &dyn Platform,
    ) -> Result<Self, SettingsError> {
        let app_folder = env.require("MAILPIT_APP_FOLDER")?;
        let smtp_host = env.get_or("MAILPIT_SMTP_HOST", "127.0.0.1");
        let smtp_port = port(env, "MAILPIT_SMTP_PORT", "1025")?;
        let ui_host = env.get_or("MAILPIT_UI_HOST", "127.0.0.1");
        let ui_port = port(env, "MAILPIT_UI_PORT", "8025")?;

        Ok(Self {
            descriptor: ServiceDescriptor {
                name: NAME.to_string(),
                image_name: platform.image_name("mailpit"),
                templates: Vec::new(),
                initialization: InitializationPolicy::None,
                endpoints: vec![
                    Endpoint::new("SMTP", smtp_host.clone(), smtp_port),
                    Endpoint::http("UI", ui_host.clone(), ui_port),
                ],
            },
            app_dir: layout.app_dir("mailpit", app_folder),
            smtp: (smtp_host, smtp_port),
            ui: (ui_host, ui_port),
        })
    }

    /// `mailpit --smtp=host:port --listen=host:port`.
    pub fn server_command(&self) -> CommandSpec {
        CommandSpec::new(self.app_dir.join(&self.descriptor.image_name))
            .arg(format!("--smtp={}:{}", self.smtp.0, self.smtp.1))
            .arg(format!("--listen={}:{}", self.ui.0, self.ui.1))
            .current_dir(&self.app_dir)
    }
}

fn port(env: &Environment, key: &str, default: &str) -> Result<u16, SettingsError> {
    let raw = env.get_or(key, default);
    raw.parse().map_err(|err: std::num::ParseIntError| SettingsError::Invalid {
        key: key.to_string(),
        value: raw.clone(),
        reason: err.to_string(),
    })
}

/// Controller for Mailpit.
pub struct MailpitController {
    settings: Result<MailpitSettings, SettingsError>,
    ctx: ServiceContext,
    state: StateTracker,
}

impl MailpitController {
    /// Creates the controller.
    pub fn new(settings: Result<MailpitSettings, SettingsError>, ctx: ServiceContext) -> Self {
        Self {
            settings,
            ctx,
            state: StateTracker::default(),
        }
    }

    fn settings(&self) -> Result<&MailpitSettings, SettingsError> {
        self.settings.as_ref().map_err(Clone::clone)
    }

    fn run_start(&self) -> Result<(), ServiceError> {
        let settings = self.settings()?;
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

impl ServiceController for MailpitController {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Timing,
        test_utils::{FakePlatform, FakeSupervisor, RecordingRunner},
    };
    use std::sync::Arc;

    fn controller(env: &Environment, supervisor: Arc<FakeSupervisor>) -> MailpitController {
        let platform = Arc::new(FakePlatform::new("/etc/hosts"));
        let settings = MailpitSettings::from_env(env, &Layout::new("/srv/dev"), platform.as_ref());
        MailpitController::new(
            settings,
            ServiceContext {
                supervisor,
                runner: Arc::new(RecordingRunner::new()),
                platform,
                timing: Timing::default(),
            },
        )
    }

    #[test]
    fn defaults_apply_to_unset_endpoints() {
        let env = Environment::from_vars([("MAILPIT_APP_FOLDER", "mailpit"), ("MAILPIT_UI_PORT", "8100")]);
        let supervisor = Arc::new(FakeSupervisor::new());
        let mailpit = controller(&env, supervisor.clone());

        mailpit.start().unwrap();
        assert_eq!(
            supervisor.launched()[0].to_string(),
            "/srv/dev/apps/mailpit/mailpit/mailpit --smtp=127.0.0.1:1025 --listen=127.0.0.1:8100"
        );
        assert_eq!(
            mailpit.status().to_string(),
            "Running (PID: 1000, SMTP: 127.0.0.1:1025, UI: http://127.0.0.1:8100)"
        );
    }

    #[test]
    fn stop_without_process_succeeds() {
        let env = Environment::from_vars([("MAILPIT_APP_FOLDER", "mailpit")]);
        let supervisor = Arc::new(FakeSupervisor::new());
        let mailpit = controller(&env, supervisor.clone());

        mailpit.stop().unwrap();
        assert!(supervisor.terminated().is_empty());
        assert_eq!(mailpit.state(), ServiceState::Stopped);
        assert_eq!(mailpit.status(), ServiceStatus::Stopped);
    }

    #[test]
    fn invalid_port_is_a_settings_error() {
        let env = Environment::from_vars([("MAILPIT_APP_FOLDER", "mailpit"), ("MAILPIT_SMTP_PORT", "smtp")]);
        let mailpit = controller(&env, Arc::new(FakeSupervisor::new()));
        assert!(matches!(
            mailpit.start(),
            Err(ServiceError::Settings(SettingsError::Invalid { .. }))
        ));
    }
}
