//! Configuration management for devstack.
//!
//! Everything a controller needs is assembled here once, at startup, and
//! handed down explicitly: the merged environment (process variables over a
//! `.env` file), the on-disk [`Layout`] of the environment root, and the
//! optional [`Tunables`] file. Components never read process-wide state.
use std::{
    collections::HashMap,
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    certs::RegenerationPolicy,
    error::{ConfigError, SettingsError},
    hosts::DEFAULT_MARKER,
    process::RetryPolicy,
};

/// Variable consulted for the environment root when `--root` is absent.
pub const ROOT_ENV_VAR: &str = "DEVSTACK_ROOT";

/// Default name of the tunables file inside the root.
pub const DEFAULT_TUNABLES_FILE: &str = "devstack.yaml";

/// Key/value view over the process environment and the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Builds an environment from explicit pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// Loads `env_file` (if it exists) and overlays the process environment,
    /// which wins on conflicts.
    pub fn load(env_file: &Path) -> Result<Self, ConfigError> {
        let mut vars = match parse_env_file(env_file) {
            Ok(vars) => {
                debug!("Loaded {} entries from {}", vars.len(), env_file.display());
                vars
            }
            Err(ConfigError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                debug!("No env file at {}", env_file.display());
                HashMap::new()
            }
            Err(err) => return Err(err),
        };

        vars.extend(env::vars());
        Ok(Self { vars })
    }

    /// Returns a non-empty value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Returns the value for `key` or a [`SettingsError::Missing`].
    pub fn require(&self, key: &str) -> Result<&str, SettingsError> {
        self.get(key).ok_or_else(|| SettingsError::Missing {
            key: key.to_string(),
        })
    }

    /// Returns the value for `key`, falling back to `default` with a log line.
    pub fn get_or(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(value) => value.to_string(),
            None => {
                info!("{key} not set, using default: {default}");
                default.to_string()
            }
        }
    }

    /// Parses a TCP port from `key`, falling back to `default`.
    pub fn port_or(&self, key: &str, default: u16) -> Result<u16, SettingsError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse::<u16>().map_err(|err| SettingsError::Invalid {
                key: key.to_string(),
                value: raw.to_string(),
                reason: err.to_string(),
            }),
        }
    }
}

/// Parses a `.env` file: `KEY=VALUE` per line, `#` comments, optional
/// `export ` prefix, surrounding quotes stripped.
pub fn parse_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|err| ConfigError::io(path, err))?;
    let mut vars = HashMap::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::EnvFile {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: "expected KEY=VALUE".into(),
            });
        };

        let key = key.trim();
        if key.is_empty() || !key.chars().all(|ch| ch == '_' || ch.is_ascii_alphanumeric()) {
            return Err(ConfigError::EnvFile {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: format!("invalid variable name '{key}'"),
            });
        }

        vars.insert(key.to_string(), strip_quotes(value.trim()).to_string());
    }

    Ok(vars)
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Resolves the environment root from an explicit path, `DEVSTACK_ROOT`, or
/// the current directory, in that order.
pub fn resolve_root(explicit: Option<&Path>) -> std::io::Result<PathBuf> {
    let candidate = match explicit {
        Some(path) => path.to_path_buf(),
        None => match env::var_os(ROOT_ENV_VAR) {
            Some(value) if !value.is_empty() => PathBuf::from(value),
            _ => env::current_dir()?,
        },
    };

    if candidate.is_absolute() {
        return Ok(candidate);
    }
    let resolved = env::current_dir()?.join(&candidate);
    Ok(resolved.canonicalize().unwrap_or(resolved))
}

/// A website directory under `www/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    /// Directory name.
    pub folder: String,
    /// `<folder>.<domain tail>`.
    pub domain: String,
}

/// Directory conventions of an environment root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The environment root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Install directory of a bundled application, `apps/<service>/<folder>`.
    pub fn app_dir(&self, service: &str, folder: &str) -> PathBuf {
        self.root.join("apps").join(service).join(folder)
    }

    /// Data directory, `data/<folder>`.
    pub fn data_dir(&self, folder: &str) -> PathBuf {
        self.root.join("data").join(folder)
    }

    /// Template file, `tpl/<service>/<file>`.
    pub fn template(&self, service: &str, file: &str) -> PathBuf {
        self.root.join("tpl").join(service).join(file)
    }

    /// Generated configuration for a service, `etc/<service>`.
    pub fn etc_dir(&self, service: &str) -> PathBuf {
        self.root.join("etc").join(service)
    }

    /// Log directory for a service, `logs/<service>`.
    pub fn logs_dir(&self, service: &str) -> PathBuf {
        self.root.join("logs").join(service)
    }

    /// Website sources, `www/`.
    pub fn www_dir(&self) -> PathBuf {
        self.root.join("www")
    }

    /// Unprivileged staging copy of the hosts file.
    pub fn scratch_hosts(&self) -> PathBuf {
        self.root.join("hosts.tmp")
    }

    /// The root with forward slashes and a trailing slash, as config files
    /// expect it on every platform.
    pub fn root_folder(&self) -> String {
        let mut formatted = self.root.to_string_lossy().replace('\\', "/");
        if !formatted.ends_with('/') {
            formatted.push('/');
        }
        formatted
    }

    /// Lists site directories under `www/`, sorted by name. A missing `www/`
    /// means no sites.
    pub fn sites(&self, domain_tail: &str) -> std::io::Result<Vec<Site>> {
        let entries = match fs::read_dir(self.www_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut sites = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let folder = entry.file_name().to_string_lossy().into_owned();
            let domain = format!("{folder}.{domain_tail}");
            sites.push(Site { folder, domain });
        }
        sites.sort_by(|a, b| a.folder.cmp(&b.folder));
        Ok(sites)
    }
}

/// Timing knobs shared by every controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Startup verification polling.
    pub verify: RetryPolicy,
    /// Pause between stop and start on restart.
    pub restart_settle: Duration,
    /// How long a terminated process gets before it is force-killed.
    pub stop_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            verify: RetryPolicy::default(),
            restart_settle: Duration::from_secs(1),
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// Certificate provisioning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateTunables {
    /// Lifetime of generated certificates.
    pub validity_days: u32,
    /// Regenerate this many days before expiry.
    pub renew_before_days: u32,
    /// When a certificate is regenerated.
    pub regenerate: RegenerationPolicy,
}

impl Default for CertificateTunables {
    fn default() -> Self {
        Self {
            validity_days: 365,
            renew_before_days: 30,
            regenerate: RegenerationPolicy::Stale,
        }
    }
}

/// Resolved contents of the optional tunables file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunables {
    /// Process timing.
    pub timing: Timing,
    /// Certificate policy.
    pub certificates: CertificateTunables,
    /// Marker identifying managed hosts lines.
    pub hosts_marker: String,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            certificates: CertificateTunables::default(),
            hosts_marker: DEFAULT_MARKER.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTunables {
    verify: Option<RawVerify>,
    restart_settle: Option<String>,
    stop_grace: Option<String>,
    certificates: Option<RawCertificates>,
    hosts_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVerify {
    interval: Option<String>,
    attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCertificates {
    validity_days: Option<u32>,
    renew_before_days: Option<u32>,
    regenerate: Option<RegenerationPolicy>,
}

impl Tunables {
    /// Loads tunables from `path`; a missing file yields the defaults.
    /// `${VAR}` references are expanded from `env` before parsing.
    pub fn load(path: &Path, env: &Environment) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("No tunables file at {}; using defaults", path.display());
                return Ok(Self::default());
            }
            Err(err) => return Err(ConfigError::io(path, err)),
        };

        let expanded = expand_env_vars(&content, env)?;
        Self::from_yaml(&expanded)
    }

    /// Parses tunables from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawTunables = if content.trim().is_empty() {
            RawTunables::default()
        } else {
            serde_yaml::from_str(content)?
        };

        let mut tunables = Self::default();
        if let Some(verify) = raw.verify {
            if let Some(interval) = verify.interval {
                tunables.timing.verify.interval = parse_duration("verify.interval", &interval)?;
            }
            if let Some(attempts) = verify.attempts {
                tunables.timing.verify.attempts = attempts;
            }
        }
        if let Some(settle) = raw.restart_settle {
            tunables.timing.restart_settle = parse_duration("restart_settle", &settle)?;
        }
        if let Some(grace) = raw.stop_grace {
            tunables.timing.stop_grace = parse_duration("stop_grace", &grace)?;
        }
        if let Some(certs) = raw.certificates {
            if let Some(days) = certs.validity_days {
                tunables.certificates.validity_days = days;
            }
            if let Some(days) = certs.renew_before_days {
                tunables.certificates.renew_before_days = days;
            }
            if let Some(policy) = certs.regenerate {
                tunables.certificates.regenerate = policy;
            }
        }
        if let Some(marker) = raw.hosts_marker {
            if marker.trim().is_empty() {
                warn!("Ignoring empty hosts_marker; using {DEFAULT_MARKER}");
            } else {
                tunables.hosts_marker = marker;
            }
        }

        if tunables.certificates.renew_before_days >= tunables.certificates.validity_days {
            warn!(
                "certificates.renew_before_days ({}) is not below validity_days ({}); certificates will be regenerated on every start",
                tunables.certificates.renew_before_days, tunables.certificates.validity_days
            );
        }

        Ok(tunables)
    }
}

/// Expands `${VAR}` and `$VAR` references from `env`.
fn expand_env_vars(input: &str, env: &Environment) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| ConfigError::Expansion(err.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures<'_>| {
        let var_name = &caps[1];
        match env.get(var_name) {
            Some(value) => value.to_string(),
            None => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigError::Expansion(name)),
        None => Ok(result.into_owned()),
    }
}

/// Parses `<number>[ms|s|m|h]`; a bare number is seconds.
pub fn parse_duration(field: &str, raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    let invalid = || ConfigError::InvalidValue {
        field: field.to_string(),
        value: raw.to_string(),
    };
    if value.is_empty() {
        return Err(invalid());
    }

    let (amount, unit_ms) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60_000)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3_600_000)
    } else {
        (value, 1_000)
    };

    let amount: u64 = amount.parse().map_err(|_| invalid())?;
    Ok(Duration::from_millis(amount.saturating_mul(unit_ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn env_file_supports_comments_exports_and_quotes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "# stack").unwrap();
        writeln!(file, "MYSQL_APP_FOLDER=mysql-8.4").unwrap();
        writeln!(file, "export NGINX_DOMAIN_TAIL = \"test\"").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "PHP_ERROR_LOG='{{ROOT_DIR}}/logs/php/error.log'").unwrap();

        let vars = parse_env_file(&path).unwrap();
        assert_eq!(vars["MYSQL_APP_FOLDER"], "mysql-8.4");
        assert_eq!(vars["NGINX_DOMAIN_TAIL"], "test");
        assert_eq!(vars["PHP_ERROR_LOG"], "{ROOT_DIR}/logs/php/error.log");
    }

    #[test]
    fn env_file_rejects_lines_without_assignment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "GOOD=1\nnot an assignment\n").unwrap();
        assert!(matches!(
            parse_env_file(&path),
            Err(ConfigError::EnvFile { line: 2, .. })
        ));
    }

    #[test]
    fn missing_env_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        assert!(Environment::load(&dir.path().join(".env")).is_ok());
    }

    #[test]
    fn empty_values_count_as_missing() {
        let env = Environment::from_vars([("MYSQL_APP_FOLDER", "  ")]);
        assert_eq!(
            env.require("MYSQL_APP_FOLDER"),
            Err(SettingsError::Missing {
                key: "MYSQL_APP_FOLDER".into()
            })
        );
        assert_eq!(env.get_or("MAILPIT_UI_PORT", "8025"), "8025");
    }

    #[test]
    fn invalid_port_is_reported() {
        let env = Environment::from_vars([("MYSQL_PORT", "33o6")]);
        assert!(matches!(
            env.port_or("MYSQL_PORT", 3306),
            Err(SettingsError::Invalid { .. })
        ));
        assert_eq!(Environment::default().port_or("MYSQL_PORT", 3306), Ok(3306));
    }

    #[test]
    fn sites_are_sorted_directories_only() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        fs::create_dir_all(layout.www_dir().join("shop")).unwrap();
        fs::create_dir_all(layout.www_dir().join("blog")).unwrap();
        fs::write(layout.www_dir().join("README.md"), "not a site").unwrap();

        let sites = layout.sites("test").unwrap();
        assert_eq!(
            sites,
            vec![
                Site {
                    folder: "blog".into(),
                    domain: "blog.test".into()
                },
                Site {
                    folder: "shop".into(),
                    domain: "shop.test".into()
                },
            ]
        );
    }

    #[test]
    fn missing_www_means_no_sites() {
        let dir = tempdir().unwrap();
        assert!(Layout::new(dir.path()).sites("test").unwrap().is_empty());
    }

    #[test]
    fn root_folder_uses_forward_slashes_and_trailing_slash() {
        assert_eq!(Layout::new("/srv/dev").root_folder(), "/srv/dev/");
        assert_eq!(Layout::new("/srv/dev/").root_folder(), "/srv/dev/");
    }

    #[test]
    fn tunables_default_when_file_absent() {
        let dir = tempdir().unwrap();
        let tunables =
            Tunables::load(&dir.path().join("devstack.yaml"), &Environment::default()).unwrap();
        assert_eq!(tunables, Tunables::default());
    }

    #[test]
    fn tunables_parse_durations_and_expand_variables() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devstack.yaml");
        fs::write(
            &path,
            r#"
verify:
  interval: 250ms
  attempts: ${VERIFY_ATTEMPTS}
restart_settle: 2s
stop_grace: 1m
certificates:
  validity_days: 90
  renew_before_days: 7
  regenerate: missing
"#,
        )
        .unwrap();

        let env = Environment::from_vars([("VERIFY_ATTEMPTS", "20")]);
        let tunables = Tunables::load(&path, &env).unwrap();
        assert_eq!(tunables.timing.verify.interval, Duration::from_millis(250));
        assert_eq!(tunables.timing.verify.attempts, 20);
        assert_eq!(tunables.timing.restart_settle, Duration::from_secs(2));
        assert_eq!(tunables.timing.stop_grace, Duration::from_secs(60));
        assert_eq!(tunables.certificates.validity_days, 90);
        assert_eq!(tunables.certificates.regenerate, RegenerationPolicy::Missing);
    }

    #[test]
    fn tunables_report_missing_variables() {
        let err = expand_env_vars("attempts: ${NOPE}", &Environment::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Expansion(name) if name == "NOPE"));
    }

    #[test]
    fn durations_accept_units() {
        assert_eq!(parse_duration("x", "5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("x", "750ms").unwrap(), Duration::from_millis(750));
        assert!(parse_duration("x", "soon").is_err());
    }
}
