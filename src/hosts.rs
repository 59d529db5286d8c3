//! Keeps locally managed entries in the system hosts file in sync.
use std::{
    collections::HashSet,
    fmt, fs,
    path::{Path, PathBuf},
};

use memchr::memmem;
use tracing::{debug, info};

use crate::{
    command::{CommandRunner, run_checked},
    error::HostsError,
    platform::Platform,
};

/// Address every managed hostname resolves to.
pub const LOOPBACK: &str = "127.0.0.1";

/// Trailing comment that marks a hosts line as owned by devstack.
pub const DEFAULT_MARKER: &str = "#devstack managed";

/// One hosts line written by the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostsEntry {
    /// Address the hostname maps to.
    pub ip: String,
    /// The hostname.
    pub hostname: String,
    /// Ownership marker.
    pub marker: String,
}

impl HostsEntry {
    /// A loopback entry for `hostname`.
    pub fn loopback(hostname: &str, marker: &str) -> Self {
        Self {
            ip: LOOPBACK.to_string(),
            hostname: hostname.to_string(),
            marker: marker.to_string(),
        }
    }
}

impl fmt::Display for HostsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}\t{}", self.ip, self.hostname, self.marker)
    }
}

/// Drops every line containing `marker` from `base` and appends one managed
/// entry per hostname. Unmarked lines survive byte for byte and in order,
/// terminators included; duplicate hostnames collapse to a single entry.
///
/// New entries end with `\r\n` when the first line of `base` does, `\n`
/// otherwise.
pub fn merge<S: AsRef<str>>(base: &[u8], marker: &str, hostnames: &[S]) -> Vec<u8> {
    let newline: &[u8] = match base.iter().position(|&b| b == b'\n') {
        Some(end) if end > 0 && base[end - 1] == b'\r' => b"\r\n",
        _ => b"\n",
    };
    let finder = memmem::Finder::new(marker.as_bytes());

    let mut merged = Vec::with_capacity(base.len());
    for line in base.split_inclusive(|&b| b == b'\n') {
        if finder.find(line).is_none() {
            merged.extend_from_slice(line);
        }
    }
    if merged.last().is_some_and(|&b| b != b'\n') {
        merged.extend_from_slice(newline);
    }

    let mut seen = HashSet::new();
    for hostname in hostnames {
        let hostname = hostname.as_ref();
        if hostname.is_empty() || !seen.insert(hostname) {
            continue;
        }
        merged.extend_from_slice(HostsEntry::loopback(hostname, marker).to_string().as_bytes());
        merged.extend_from_slice(newline);
    }

    merged
}

/// Rewrites the managed block of the system hosts file.
pub struct HostsFileSync {
    hosts_path: PathBuf,
    scratch_path: PathBuf,
    marker: String,
}

impl HostsFileSync {
    /// Synchronizer for `hosts_path` that stages content in `scratch_path`.
    pub fn new(
        hosts_path: impl Into<PathBuf>,
        scratch_path: impl Into<PathBuf>,
        marker: impl Into<String>,
    ) -> Self {
        Self {
            hosts_path: hosts_path.into(),
            scratch_path: scratch_path.into(),
            marker: marker.into(),
        }
    }

    /// The system hosts file being managed.
    pub fn hosts_path(&self) -> &Path {
        &self.hosts_path
    }

    /// Replaces all managed entries with one per hostname in `hostnames`.
    ///
    /// Content is assembled in the scratch file without privileges and only
    /// the final copy over the system file is elevated. If that copy fails
    /// the system file keeps its previous content.
    pub fn sync<S: AsRef<str>>(
        &self,
        hostnames: &[S],
        platform: &dyn Platform,
        runner: &dyn CommandRunner,
    ) -> Result<(), HostsError> {
        info!("Updating hosts file {}", self.hosts_path.display());

        let current = fs::read(&self.hosts_path).map_err(|source| HostsError::Read {
            path: self.hosts_path.clone(),
            source,
        })?;

        let merged = merge(&current, &self.marker, hostnames);
        if let Some(parent) = self.scratch_path.parent() {
            fs::create_dir_all(parent).map_err(|source| HostsError::Write {
                path: self.scratch_path.clone(),
                source,
            })?;
        }
        fs::write(&self.scratch_path, merged).map_err(|source| HostsError::Write {
            path: self.scratch_path.clone(),
            source,
        })?;

        let copy = platform.elevated_copy(&self.scratch_path, &self.hosts_path);
        debug!("Installing hosts file with `{copy}`");
        run_checked(runner, &copy).map_err(HostsError::Elevation)?;
        Ok(())
    }
}
