//! Host operating system adapters.
//!
//! Everything that differs per OS (image suffixes, the hosts file location,
//! trust store tooling, process detachment and privilege elevation) lives
//! behind [`Platform`]. One implementation is chosen by [`detect`] at startup
//! and shared by every component.
use std::{
    fmt,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use crate::command::CommandSpec;

/// Linux distribution families with a known CA trust layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinuxFamily {
    /// Debian, Ubuntu and derivatives (`update-ca-certificates`).
    Debian,
    /// RHEL, CentOS, Fedora (`update-ca-trust`).
    RedHat,
}

/// Which trust store a certificate is installed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStoreKind {
    /// `Cert:\LocalMachine\Root` via PowerShell.
    Windows,
    /// System keychain via `security`.
    MacKeychain,
    /// Distribution CA bundle.
    LinuxCaTrust(LinuxFamily),
}

impl fmt::Display for TrustStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustStoreKind::Windows => write!(f, "Windows"),
            TrustStoreKind::MacKeychain => write!(f, "macOS keychain"),
            TrustStoreKind::LinuxCaTrust(LinuxFamily::Debian) => {
                write!(f, "Debian CA certificates")
            }
            TrustStoreKind::LinuxCaTrust(LinuxFamily::RedHat) => {
                write!(f, "Red Hat CA trust")
            }
        }
    }
}

/// OS-specific behaviour consumed by the rest of the crate.
pub trait Platform: Send + Sync {
    /// Short OS identifier used in messages.
    fn os_name(&self) -> &'static str;

    /// Suffix appended to executable/image names (`.exe` on Windows).
    fn image_suffix(&self) -> &'static str;

    /// Location of the system hosts file.
    fn hosts_file_path(&self) -> PathBuf;

    /// The trust store available on this host, if any.
    fn trust_store(&self) -> Option<TrustStoreKind>;

    /// Configures `cmd` so the spawned child outlives this process.
    fn detach(&self, cmd: &mut Command);

    /// Command that copies `source` over `destination` with elevated privileges.
    fn elevated_copy(&self, source: &Path, destination: &Path) -> CommandSpec;

    /// Image name for `base` with the platform suffix applied.
    fn image_name(&self, base: &str) -> String {
        format!("{base}{}", self.image_suffix())
    }
}

/// Selects the adapter for the running OS.
pub fn detect() -> Arc<dyn Platform> {
    if cfg!(target_os = "windows") {
        Arc::new(WindowsPlatform)
    } else if cfg!(target_os = "macos") {
        Arc::new(MacPlatform)
    } else {
        Arc::new(LinuxPlatform::detect())
    }
}

/// Linux (and other Unix-likes that use `/etc/hosts` and `sudo`).
#[derive(Debug, Clone, Copy)]
pub struct LinuxPlatform {
    family: Option<LinuxFamily>,
}

impl LinuxPlatform {
    /// Adapter with an explicit distribution family.
    pub fn new(family: Option<LinuxFamily>) -> Self {
        Self { family }
    }

    /// Probes the release files to find the distribution family.
    pub fn detect() -> Self {
        Self::new(detect_linux_family(Path::new("/etc")))
    }
}

/// Determines the distribution family from release marker files under `etc`.
pub fn detect_linux_family(etc: &Path) -> Option<LinuxFamily> {
    if etc.join("debian_version").exists() {
        Some(LinuxFamily::Debian)
    } else if etc.join("redhat-release").exists() {
        Some(LinuxFamily::RedHat)
    } else {
        None
    }
}

impl Platform for LinuxPlatform {
    fn os_name(&self) -> &'static str {
        "linux"
    }

    fn image_suffix(&self) -> &'static str {
        ""
    }

    fn hosts_file_path(&self) -> PathBuf {
        PathBuf::from("/etc/hosts")
    }

    fn trust_store(&self) -> Option<TrustStoreKind> {
        self.family.map(TrustStoreKind::LinuxCaTrust)
    }

    fn detach(&self, cmd: &mut Command) {
        detach_process_group(cmd);
    }

    fn elevated_copy(&self, source: &Path, destination: &Path) -> CommandSpec {
        sudo_copy(source, destination)
    }
}

/// macOS.
#[derive(Debug, Clone, Copy, Default)]
pub struct MacPlatform;

impl Platform for MacPlatform {
    fn os_name(&self) -> &'static str {
        "macos"
    }

    fn image_suffix(&self) -> &'static str {
        ""
    }

    fn hosts_file_path(&self) -> PathBuf {
        PathBuf::from("/private/etc/hosts")
    }

    fn trust_store(&self) -> Option<TrustStoreKind> {
        Some(TrustStoreKind::MacKeychain)
    }

    fn detach(&self, cmd: &mut Command) {
        detach_process_group(cmd);
    }

    fn elevated_copy(&self, source: &Path, destination: &Path) -> CommandSpec {
        sudo_copy(source, destination)
    }
}

/// Windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsPlatform;

impl Platform for WindowsPlatform {
    fn os_name(&self) -> &'static str {
        "windows"
    }

    fn image_suffix(&self) -> &'static str {
        ".exe"
    }

    fn hosts_file_path(&self) -> PathBuf {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    }

    fn trust_store(&self) -> Option<TrustStoreKind> {
        Some(TrustStoreKind::Windows)
    }

    fn detach(&self, cmd: &mut Command) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }
        #[cfg(not(windows))]
        let _ = cmd;
    }

    fn elevated_copy(&self, source: &Path, destination: &Path) -> CommandSpec {
        powershell_as_admin(&format!(
            "Copy-Item -Path \"{}\" -Destination \"{}\" -Force",
            source.display(),
            destination.display()
        ))
    }
}

/// Wraps a PowerShell snippet in an elevated `Start-Process ... -Verb RunAs`.
///
/// The outer shell exits with the elevated child's exit code, so a failed
/// elevated step is reported as a failed command.
pub fn powershell_as_admin(script: &str) -> CommandSpec {
    CommandSpec::new("powershell").args([
        "-Command".to_string(),
        format!(
            "$p = Start-Process powershell -Verb RunAs -Wait -PassThru -ArgumentList '-NoProfile -ExecutionPolicy Bypass -Command \"{script}\"'; exit $p.ExitCode"
        ),
    ])
}

fn sudo_copy(source: &Path, destination: &Path) -> CommandSpec {
    CommandSpec::new("sudo")
        .arg("cp")
        .arg(source.as_os_str())
        .arg(destination.as_os_str())
}

fn detach_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                // Own process group so the service survives our exit and
                // terminal signals aimed at us.
                if libc::setpgid(0, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(not(unix))]
    let _ = cmd;
}
