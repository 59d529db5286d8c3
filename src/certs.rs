//! Self-signed certificate provisioning and trust store integration.
use std::{
    fs,
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum_macros::{AsRefStr, EnumString};
use tracing::{debug, info, warn};

use crate::{
    command::{CommandRunner, CommandSpec, run_checked},
    config::{CertificateTunables, Layout},
    error::{CertificateError, ConfigError, ProcessError},
    materialize::{self, SubstitutionMap},
    platform::{LinuxFamily, Platform, TrustStoreKind, powershell_as_admin},
};

/// Common name used in the OpenSSL template and to find the certificate in
/// trust stores on removal.
pub const CERTIFICATE_NAME: &str = "local_server";

const DEBIAN_ANCHOR: &str = "/usr/local/share/ca-certificates/local_server.crt";
const REDHAT_ANCHOR: &str = "/etc/pki/ca-trust/source/anchors/local_server.crt";
const MAC_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

/// When an existing certificate is replaced.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RegenerationPolicy {
    /// Only when the certificate file is absent.
    Missing,
    /// Also when the domain set changed or expiry is near.
    #[default]
    Stale,
}

/// Files making up the certificate material under `etc/ssl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    /// OpenSSL config template.
    pub config_template: PathBuf,
    /// Rendered OpenSSL config.
    pub config: PathBuf,
    /// RSA private key.
    pub private_key: PathBuf,
    /// Certificate signing request.
    pub csr: PathBuf,
    /// Self-signed certificate.
    pub certificate: PathBuf,
    /// Record of what the certificate was issued for.
    pub manifest: PathBuf,
}

impl CertificatePaths {
    /// Standard locations for `layout`.
    pub fn new(layout: &Layout) -> Self {
        let ssl = layout.etc_dir("ssl");
        Self {
            config_template: layout.template("ssl", "openssl.conf.tpl"),
            config: ssl.join("openssl.conf"),
            private_key: ssl.join("private.key"),
            csr: ssl.join("csr.csr"),
            certificate: ssl.join("certificate.crt"),
            manifest: ssl.join("certificate.yaml"),
        }
    }
}

/// The `IP.n` / `DNS.n` entries of the `[alt_names]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectAltNames {
    ips: Vec<String>,
    dns: Vec<String>,
}

impl SubjectAltNames {
    /// Loopback plus `local_ips`, `localhost`, each site domain in bare and
    /// wildcard form, then `*.localhost` and `*.<domain_tail>`.
    pub fn for_sites<S: AsRef<str>>(local_ips: &[Ipv4Addr], domains: &[S], domain_tail: &str) -> Self {
        let mut ips = vec![Ipv4Addr::LOCALHOST.to_string()];
        for ip in local_ips {
            let ip = ip.to_string();
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }

        let mut dns = vec!["localhost".to_string()];
        for domain in domains {
            let domain = domain.as_ref();
            dns.push(domain.to_string());
            dns.push(format!("*.{domain}"));
        }
        dns.push("*.localhost".to_string());
        dns.push(format!("*.{domain_tail}"));

        Self { ips, dns }
    }

    /// Config lines, numbered independently per kind.
    pub fn lines(&self) -> Vec<String> {
        let ips = self
            .ips
            .iter()
            .enumerate()
            .map(|(idx, ip)| format!("IP.{} = {ip}", idx + 1));
        let dns = self
            .dns
            .iter()
            .enumerate()
            .map(|(idx, name)| format!("DNS.{} = {name}", idx + 1));
        ips.chain(dns).collect()
    }

    /// SHA-256 over the rendered lines.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for line in self.lines() {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Non-loopback IPv4 addresses of this machine. Lookup failures yield none.
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let interfaces = match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(err) => {
            warn!("Could not enumerate network interfaces: {err}");
            return Vec::new();
        }
    };

    let mut ips: Vec<Ipv4Addr> = interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();
    ips.sort();
    ips.dedup();
    ips
}

/// What a certificate was issued for, stored next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateManifest {
    /// [`SubjectAltNames::fingerprint`] at issue time.
    pub fingerprint: String,
    /// When the certificate was signed.
    pub issued_at: DateTime<Utc>,
    /// Requested validity.
    pub validity_days: u32,
}

impl CertificateManifest {
    /// End of the validity period.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + ChronoDuration::days(i64::from(self.validity_days))
    }
}

/// Generates, installs and removes the development certificate.
pub struct CertificateManager {
    paths: CertificatePaths,
    tunables: CertificateTunables,
    runner: Arc<dyn CommandRunner>,
    platform: Arc<dyn Platform>,
}

impl CertificateManager {
    /// Creates a manager over `paths`.
    pub fn new(
        paths: CertificatePaths,
        tunables: CertificateTunables,
        runner: Arc<dyn CommandRunner>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            paths,
            tunables,
            runner,
            platform,
        }
    }

    /// Certificate file locations.
    pub fn paths(&self) -> &CertificatePaths {
        &self.paths
    }

    /// Whether the certificate must be generated again for `sans`.
    pub fn should_regenerate(&self, sans: &SubjectAltNames) -> bool {
        if !self.paths.certificate.exists() {
            debug!("No certificate at {}", self.paths.certificate.display());
            return true;
        }
        if self.tunables.regenerate == RegenerationPolicy::Missing {
            return false;
        }

        let Some(manifest) = self.manifest() else {
            info!("Certificate has no readable manifest; regenerating");
            return true;
        };
        if manifest.fingerprint != sans.fingerprint() {
            info!("Certificate domain set changed; regenerating");
            return true;
        }

        let renew_at = manifest.expires_at()
            - ChronoDuration::days(i64::from(self.tunables.renew_before_days));
        if Utc::now() >= renew_at {
            info!(
                "Certificate expires {}; regenerating",
                manifest.expires_at().format("%Y-%m-%d")
            );
            return true;
        }
        false
    }

    /// Reads the manifest written by the last successful [`generate`](Self::generate).
    pub fn manifest(&self) -> Option<CertificateManifest> {
        let content = match fs::read_to_string(&self.paths.manifest) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("Failed to read {}: {err}", self.paths.manifest.display());
                return None;
            }
        };
        match serde_yaml::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                warn!("Ignoring malformed {}: {err}", self.paths.manifest.display());
                None
            }
        }
    }

    /// Whether a certificate file exists.
    pub fn is_provisioned(&self) -> bool {
        self.paths.certificate.exists()
    }

    /// Renders the OpenSSL config with `sans` appended.
    pub fn write_config(&self, sans: &SubjectAltNames) -> Result<(), CertificateError> {
        materialize::render(
            &self.paths.config_template,
            &self.paths.config,
            &SubstitutionMap::new(),
        )?;
        materialize::append_lines(&self.paths.config, &sans.lines())?;
        Ok(())
    }

    /// Writes the config, then key, CSR and certificate in sequence.
    ///
    /// The first failing step aborts; files written by earlier steps stay.
    pub fn generate(&self, sans: &SubjectAltNames) -> Result<(), CertificateError> {
        self.write_config(sans)?;
        let paths = &self.paths;

        info!("Generating private key");
        self.openssl(
            "generate private key",
            CommandSpec::new("openssl")
                .args(["genrsa", "-out"])
                .arg(paths.private_key.as_os_str())
                .arg("2048"),
        )?;

        info!("Generating certificate signing request");
        self.openssl(
            "generate CSR",
            CommandSpec::new("openssl")
                .args(["req", "-new", "-key"])
                .arg(paths.private_key.as_os_str())
                .arg("-out")
                .arg(paths.csr.as_os_str())
                .arg("-config")
                .arg(paths.config.as_os_str()),
        )?;

        info!("Signing certificate");
        self.openssl(
            "self-sign certificate",
            CommandSpec::new("openssl")
                .args(["x509", "-req", "-days"])
                .arg(self.tunables.validity_days.to_string())
                .arg("-in")
                .arg(paths.csr.as_os_str())
                .arg("-signkey")
                .arg(paths.private_key.as_os_str())
                .arg("-out")
                .arg(paths.certificate.as_os_str())
                .args(["-extensions", "v3_req", "-extfile"])
                .arg(paths.config.as_os_str()),
        )?;

        let manifest = CertificateManifest {
            fingerprint: sans.fingerprint(),
            issued_at: Utc::now(),
            validity_days: self.tunables.validity_days,
        };
        let yaml = serde_yaml::to_string(&manifest)?;
        fs::write(&paths.manifest, yaml)
            .map_err(|err| ConfigError::io(&paths.manifest, err))?;
        Ok(())
    }

    fn openssl(&self, step: &'static str, spec: CommandSpec) -> Result<(), CertificateError> {
        run_checked(self.runner.as_ref(), &spec)
            .map(|_| ())
            .map_err(|source| CertificateError::GenerationFailed { step, source })
    }

    fn trust_store(&self) -> Result<TrustStoreKind, CertificateError> {
        self.platform
            .trust_store()
            .ok_or_else(|| CertificateError::UnsupportedPlatform(self.platform.os_name().to_string()))
    }

    /// Adds the certificate to the host trust store.
    pub fn install(&self) -> Result<(), CertificateError> {
        let store = self.trust_store()?;
        info!("Installing certificate into the {store} trust store");
        let certificate = self.paths.certificate.as_path();

        let steps = match store {
            TrustStoreKind::Windows => vec![powershell_as_admin(&format!(
                "Import-Certificate -FilePath '{}' -CertStoreLocation Cert:\\LocalMachine\\Root",
                certificate.display()
            ))],
            TrustStoreKind::MacKeychain => vec![
                CommandSpec::new("sudo")
                    .args(["security", "add-trusted-cert", "-d", "-r", "trustRoot", "-k"])
                    .arg(MAC_KEYCHAIN)
                    .arg(certificate.as_os_str()),
            ],
            TrustStoreKind::LinuxCaTrust(family) => {
                let anchor = Path::new(linux_anchor(family));
                vec![
                    self.platform.elevated_copy(certificate, anchor),
                    linux_refresh(family, false),
                ]
            }
        };

        self.run_steps(&steps).map_err(|source| CertificateError::Install {
            store: store.to_string(),
            source,
        })
    }

    /// Removes the certificate from the host trust store. Files on disk stay.
    pub fn uninstall(&self) -> Result<(), CertificateError> {
        let store = self.trust_store()?;
        info!("Removing certificate from the {store} trust store");

        let steps = match store {
            TrustStoreKind::Windows => vec![powershell_as_admin(&format!(
                "Get-ChildItem Cert:\\LocalMachine\\Root | Where-Object Subject -Like '*{CERTIFICATE_NAME}*' | Remove-Item"
            ))],
            TrustStoreKind::MacKeychain => vec![CommandSpec::new("sudo").args([
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "security find-certificate -a -c {CERTIFICATE_NAME} -Z | awk '/SHA-1/ {{print $NF}}' | xargs -I {{}} security delete-certificate -Z {{}}"
                ),
            ])],
            TrustStoreKind::LinuxCaTrust(family) => vec![
                CommandSpec::new("sudo").args(["rm", "-f", linux_anchor(family)]),
                linux_refresh(family, true),
            ],
        };

        self.run_steps(&steps).map_err(|source| CertificateError::Uninstall {
            store: store.to_string(),
            source,
        })
    }

    fn run_steps(&self, steps: &[CommandSpec]) -> Result<(), ProcessError> {
        for step in steps {
            debug!("Trust store step: `{step}`");
            run_checked(self.runner.as_ref(), step)?;
        }
        Ok(())
    }
}

fn linux_anchor(family: LinuxFamily) -> &'static str {
    match family {
        LinuxFamily::Debian => DEBIAN_ANCHOR,
        LinuxFamily::RedHat => REDHAT_ANCHOR,
    }
}

fn linux_refresh(family: LinuxFamily, fresh: bool) -> CommandSpec {
    match family {
        LinuxFamily::Debian if fresh => {
            CommandSpec::new("sudo").args(["update-ca-certificates", "--fresh"])
        }
        LinuxFamily::Debian => CommandSpec::new("sudo").arg("update-ca-certificates"),
        LinuxFamily::RedHat => CommandSpec::new("sudo").args(["update-ca-trust", "extract"]),
    }
}
