//! Nginx web server with one virtual host per `www/<site>` directory.
use std::{path::PathBuf, time::Duration};

use tracing::{debug, info};

use crate::{
    command::{CommandSpec, run_checked},
    config::{Environment, Layout, Site},
    error::{ServiceError, SettingsError},
    hosts::HostsFileSync,
    materialize::{self, TemplateBinding, substitutions},
    platform::Platform,
    process::StopStrategy,
};

use super::{
    Endpoint, InitializationPolicy, ServiceContext, ServiceController, ServiceDescriptor,
    ServiceState, ServiceStatus, StateTracker, settings_status,
};

const NAME: &str = "Nginx";

/// Resolved Nginx settings.
#[derive(Debug, Clone)]
pub struct NginxSettings {
    /// Supervision details; `templates` holds `nginx.conf`.
    pub descriptor: ServiceDescriptor,
    /// `apps/nginx/<NGINX_APP_FOLDER>`, also the nginx prefix.
    pub app_dir: PathBuf,
    /// `NGINX_DOMAIN_TAIL`.
    pub domain_tail: String,
    /// Environment root layout.
    pub layout: Layout,
    /// `etc/nginx/sites-enabled`.
    pub sites_enabled: PathBuf,
    /// `logs/nginx`.
    pub logs_dir: PathBuf,
    /// Default virtual host template.
    pub default_site_template: PathBuf,
    /// Per-site virtual host template.
    pub site_template: PathBuf,
    /// Managed hosts file marker.
    pub hosts_marker: String,
}

impl NginxSettings {
    /// Reads `NGINX_APP_FOLDER` and `NGINX_DOMAIN_TAIL`.
    pub fn from_env(
        env: &Environment,
        layout: &Layout,
        platform: &dyn Platform,
        hosts_marker: &str,
    ) -> Result<Self, SettingsError> {
        let app_folder = env.require("NGINX_APP_FOLDER")?;
        let domain_tail = env.require("NGINX_DOMAIN_TAIL")?;
        let app_dir = layout.app_dir("nginx", app_folder);

        Ok(Self {
            descriptor: ServiceDescriptor {
                name: NAME.to_string(),
                image_name: platform.image_name("nginx"),
                templates: vec![TemplateBinding::new(
                    layout.template("nginx", "nginx.conf.tpl"),
                    app_dir.join("conf").join("nginx.conf"),
                )],
                initialization: InitializationPolicy::None,
                endpoints: vec![
                    Endpoint::http("HTTP", "127.0.0.1", 80),
                    Endpoint::new("HTTPS", "127.0.0.1", 443),
                ],
            },
            app_dir,
            domain_tail: domain_tail.to_string(),
            layout: layout.clone(),
            sites_enabled: layout.etc_dir("nginx").join("sites-enabled"),
            logs_dir: layout.logs_dir("nginx"),
            default_site_template: layout.template("nginx", "00-default.conf.tpl"),
            site_template: layout.template("nginx", "general-site.conf.tpl"),
            hosts_marker: hosts_marker.to_string(),
        })
    }

    fn binary(&self) -> PathBuf {
        self.app_dir.join(&self.descriptor.image_name)
    }

    /// `nginx -p <app>`.
    pub fn server_command(&self) -> CommandSpec {
        CommandSpec::new(self.binary())
            .arg("-p")
            .arg(self.app_dir.as_os_str())
            .current_dir(&self.app_dir)
    }

    /// `nginx -p <app> -t`.
    pub fn test_command(&self) -> CommandSpec {
        self.server_command().arg("-t")
    }
}

/// Controller for the Nginx server.
pub struct NginxController {
    settings: Result<NginxSettings, SettingsError>,
    ctx: ServiceContext,
    state: StateTracker,
}

impl NginxController {
    /// Creates the controller.
    pub fn new(settings: Result<NginxSettings, SettingsError>, ctx: ServiceContext) -> Self {
        Self {
            settings,
            ctx,
            state: StateTracker::default(),
        }
    }

    fn settings(&self) -> Result<&NginxSettings, SettingsError> {
        self.settings.as_ref().map_err(Clone::clone)
    }

    fn sync_hosts(&self, settings: &NginxSettings, sites: &[Site]) -> Result<(), ServiceError> {
        let sync = HostsFileSync::new(
            self.ctx.platform.hosts_file_path(),
            settings.layout.scratch_hosts(),
            &settings.hosts_marker,
        );
        let domains: Vec<&str> = sites.iter().map(|site| site.domain.as_str()).collect();
        sync.sync(&domains, self.ctx.platform.as_ref(), self.ctx.runner.as_ref())?;
        Ok(())
    }

    fn write_sites(&self, settings: &NginxSettings, sites: &[Site]) -> Result<(), ServiceError> {
        let root_folder = settings.layout.root_folder();

        materialize::recreate_dir(&settings.sites_enabled)?;

        materialize::render(
            &settings.default_site_template,
            &settings.sites_enabled.join("00-default.conf"),
            &substitutions([("{root_folder}", root_folder.as_str())]),
        )?;

        for site in sites {
            debug!("Writing virtual host for {}", site.domain);
            materialize::render(
                &settings.site_template,
                &settings.sites_enabled.join(format!("{}.conf", site.domain)),
                &substitutions([
                    ("{root_folder}", root_folder.as_str()),
                    ("{folder_name}", site.folder.as_str()),
                    ("{domain_name}", site.domain.as_str()),
                ]),
            )?;
        }
        Ok(())
    }

    /// Starts every log from scratch; logs of sites that no longer exist go away.
    fn reset_logs(&self, settings: &NginxSettings, sites: &[Site]) -> Result<(), ServiceError> {
        materialize::recreate_dir(&settings.logs_dir)?;
        materialize::recreate_empty(&settings.logs_dir.join("error.log"))?;
        for site in sites {
            materialize::recreate_empty(
                &settings.logs_dir.join(format!("error-{}.log", site.domain)),
            )?;
            materialize::recreate_empty(
                &settings.logs_dir.join(format!("access-{}.log", site.domain)),
            )?;
        }
        Ok(())
    }

    fn run_start(&self) -> Result<(), ServiceError> {
        let settings = self.settings()?;

        self.state.set(ServiceState::Configuring);
        let sites = settings
            .layout
            .sites(&settings.domain_tail)
            .map_err(|err| ServiceError::io("failed to list website directories", err))?;
        info!("Found {} site(s) under {}", sites.len(), settings.layout.www_dir().display());

        self.sync_hosts(settings, &sites)?;
        let root_folder = settings.layout.root_folder();
        self.ctx.materialize(
            &settings.descriptor,
            &substitutions([("{root_folder}", root_folder.as_str())]),
        )?;
        self.write_sites(settings, &sites)?;
        self.reset_logs(settings, &sites)?;

        info!("Checking Nginx configuration");
        run_checked(self.ctx.runner.as_ref(), &settings.test_command())?;

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

impl ServiceController for NginxController {
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
