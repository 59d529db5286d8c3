//! Development certificate covering every site, installed into the OS trust
//! store. There is no process to supervise.
use std::{net::Ipv4Addr, time::Duration};

use tracing::info;

use crate::{
    certs::{self, CertificateManager, CertificatePaths, SubjectAltNames},
    config::{CertificateTunables, Environment, Layout},
    error::{ServiceError, SettingsError},
};

use super::{
    ServiceContext, ServiceController, ServiceState, ServiceStatus, StateTracker,
    settings_status,
};

const NAME: &str = "SSL";

/// Resolved TLS settings.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// `NGINX_DOMAIN_TAIL`.
    pub domain_tail: String,
    /// Environment root layout.
    pub layout: Layout,
    /// Non-loopback IPv4 addresses to include in the certificate.
    pub local_ips: Vec<Ipv4Addr>,
}

impl TlsSettings {
    /// Reads `NGINX_DOMAIN_TAIL` and enumerates local addresses.
    pub fn from_env(env: &Environment, layout: &Layout) -> Result<Self, SettingsError> {
        let domain_tail = env.require("NGINX_DOMAIN_TAIL")?;
        Ok(Self {
            domain_tail: domain_tail.to_string(),
            layout: layout.clone(),
            local_ips: certs::local_ipv4_addresses(),
        })
    }
}

struct Setup {
    settings: TlsSettings,
    manager: CertificateManager,
}

/// Controller for the development certificate.
pub struct TlsController {
    setup: Result<Setup, SettingsError>,
    settle: Duration,
    state: StateTracker,
}

impl TlsController {
    /// Creates the controller.
    pub fn new(
        settings: Result<TlsSettings, SettingsError>,
        tunables: CertificateTunables,
        ctx: ServiceContext,
    ) -> Self {
        let setup = settings.map(|settings| Setup {
            manager: CertificateManager::new(
                CertificatePaths::new(&settings.layout),
                tunables,
                ctx.runner.clone(),
                ctx.platform.clone(),
            ),
            settings,
        });
        Self {
            setup,
            settle: ctx.timing.restart_settle,
            state: StateTracker::default(),
        }
    }

    fn setup(&self) -> Result<&Setup, SettingsError> {
        self.setup.as_ref().map_err(Clone::clone)
    }

    fn run_start(&self) -> Result<(), ServiceError> {
        let Setup { settings, manager } = self.setup()?;

        self.state.set(ServiceState::Configuring);
        let sites = settings
            .layout
            .sites(&settings.domain_tail)
            .map_err(|err| ServiceError::io("failed to list website directories", err))?;
        let domains: Vec<&str> = sites.iter().map(|site| site.domain.as_str()).collect();
        let sans = SubjectAltNames::for_sites(&settings.local_ips, &domains, &settings.domain_tail);

        if manager.should_regenerate(&sans) {
            info!("Generating new SSL certificate");
            manager.generate(&sans)?;
        } else {
            info!("Using existing SSL certificate");
            manager.write_config(&sans)?;
        }

        self.state.set(ServiceState::Starting);
        manager.install()?;
        self.state.set(ServiceState::Running);
        Ok(())
    }

    fn run_stop(&self) -> Result<(), ServiceError> {
        let Setup { manager, .. } = self.setup()?;
        self.state.set(ServiceState::Stopping);
        manager.uninstall()?;
        self.state.set(ServiceState::Stopped);
        Ok(())
    }
}

impl ServiceController for TlsController {
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
        match self.setup() {
            Ok(Setup { manager, .. }) if manager.is_provisioned() => ServiceStatus::Active {
                expires: manager.manifest().map(|manifest| manifest.expires_at()),
            },
            Ok(_) => ServiceStatus::NotConfigured,
            Err(err) => settings_status(&err),
        }
    }

    fn settle_delay(&self) -> Duration {
        self.settle
    }

    fn state(&self) -> ServiceState {
        self.state.get()
    }
}
