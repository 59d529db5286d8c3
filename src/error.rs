//! Error handling for devstack.
use std::{error::Error as StdError, path::PathBuf};

use thiserror::Error;

/// Problems with the values a service needs before it can do anything.
///
/// These are produced once when settings are assembled and replayed on every
/// call into the affected controller, so the type is `Clone`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// A required environment value is absent or empty.
    #[error("{key} environment variable is not set")]
    Missing {
        /// Name of the environment variable.
        key: String,
    },

    /// An environment value is present but unusable.
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        /// Name of the environment variable.
        key: String,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors raised while reading configuration or materializing templates.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The template to render does not exist.
    #[error("configuration template not found: {}", path.display())]
    TemplateNotFound {
        /// Expected template location.
        path: PathBuf,
    },

    /// A create, read, copy or write step failed.
    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        /// File or directory being touched.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The `.env` file exists but could not be parsed.
    #[error("invalid entry in env file {} at line {line}: {reason}", path.display())]
    EnvFile {
        /// Location of the env file.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// Description of the problem.
        reason: String,
    },

    /// The tunables file is not valid YAML for the expected shape.
    #[error("Invalid YAML format: {0}")]
    Tunables(#[from] serde_yaml::Error),

    /// A tunable has a value of the right type but an unusable format.
    #[error("invalid value '{value}' for {field}")]
    InvalidValue {
        /// Dotted field name.
        field: String,
        /// The rejected value.
        value: String,
    },

    /// A `${VAR}` reference in the tunables file has no value.
    #[error("Missing environment variable: {0}")]
    Expansion(String),
}

impl ConfigError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while spawning, probing or stopping processes.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The OS refused to spawn the command.
    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailed {
        /// The command line that was attempted.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The process never showed up in the process table.
    #[error("'{image}' failed to start within {attempts} verification attempts")]
    FailedToStart {
        /// Image name that was polled.
        image: String,
        /// Number of polls performed.
        attempts: u32,
    },

    /// Matching processes survived every termination attempt.
    #[error("failed to terminate '{image}' (PIDs still alive: {pids:?})")]
    TerminateFailed {
        /// Image name that was targeted.
        image: String,
        /// PIDs that are still present.
        pids: Vec<u32>,
    },

    /// A foreground command ran but exited unsuccessfully.
    #[error("`{command}` exited with status {code:?}: {output}")]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Captured output, trimmed.
        output: String,
    },

    /// A foreground command could not be executed at all.
    #[error("failed to run `{command}`: {source}")]
    CommandIo {
        /// The command line that was attempted.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the hosts file synchronizer.
#[derive(Debug, Error)]
pub enum HostsError {
    /// The current hosts file could not be read.
    #[error("failed to read hosts file {}: {source}", path.display())]
    Read {
        /// System hosts file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The scratch copy could not be written.
    #[error("failed to write scratch hosts file {}: {source}", path.display())]
    Write {
        /// Scratch file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The elevated copy over the system hosts file failed.
    #[error("failed to install hosts file with elevated privileges")]
    Elevation(#[source] ProcessError),
}

/// Errors raised by the certificate lifecycle manager.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// One of the key/CSR/certificate steps failed.
    #[error("certificate generation failed while trying to {step}")]
    GenerationFailed {
        /// The step that failed.
        step: &'static str,
        /// The underlying error that occurred.
        #[source]
        source: ProcessError,
    },

    /// No trust store adapter exists for this host.
    #[error("unsupported platform for certificate trust store: {0}")]
    UnsupportedPlatform(String),

    /// Installing into the trust store failed.
    #[error("failed to install certificate into the {store} trust store")]
    Install {
        /// Trust store description.
        store: String,
        /// The underlying error that occurred.
        #[source]
        source: ProcessError,
    },

    /// Removing from the trust store failed.
    #[error("failed to remove certificate from the {store} trust store")]
    Uninstall {
        /// Trust store description.
        store: String,
        /// The underlying error that occurred.
        #[source]
        source: ProcessError,
    },

    /// Rendering the OpenSSL config or writing certificate files failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The certificate manifest could not be written.
    #[error("failed to write certificate manifest: {0}")]
    Manifest(#[from] serde_yaml::Error),
}

/// Everything a service controller can fail with.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Required settings are missing or invalid.
    #[error("invalid configuration: {0}")]
    Settings(#[from] SettingsError),

    /// Template rendering or file preparation failed.
    #[error("failed to prepare configuration: {0}")]
    Config(#[from] ConfigError),

    /// Spawning, verifying or stopping the process failed.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The hosts file could not be updated.
    #[error("failed to update hosts file: {0}")]
    Hosts(#[from] HostsError),

    /// Certificate provisioning failed.
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// A filesystem step outside of template rendering failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A service's one-time initialization failed.
    #[error("initialization failed: {0}")]
    Initialization(#[source] ProcessError),
}

impl ServiceError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ServiceError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Formats an error followed by every `source()` below it, separated by `: `.
///
/// Variants that already print their source inline are not repeated.
pub fn chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        current = cause.source();
    }
    message
}
