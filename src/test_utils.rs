//! In-memory stand-ins for the OS-facing traits, shared by unit and
//! integration tests.
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU32, Ordering},
    },
};

use crate::{
    command::{CommandOutput, CommandRunner, CommandSpec},
    error::ProcessError,
    platform::{Platform, TrustStoreKind},
    process::ProcessSupervisor,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process table held in memory. A launched command's program file name
/// becomes a running image unless it was marked with [`stay_down`](Self::stay_down).
#[derive(Default)]
pub struct FakeSupervisor {
    running: Mutex<BTreeMap<String, u32>>,
    launched: Mutex<Vec<CommandSpec>>,
    terminated: Mutex<Vec<String>>,
    stay_down: Mutex<HashSet<String>>,
    next_pid: AtomicU32,
}

impl FakeSupervisor {
    /// Empty process table.
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Self::default()
        }
    }

    /// Marks `image` as already running with `pid`.
    pub fn with_running(self, image: &str, pid: u32) -> Self {
        lock(&self.running).insert(image.to_string(), pid);
        self
    }

    /// Launches of `image` succeed but the process never shows up.
    pub fn stay_down(self, image: &str) -> Self {
        lock(&self.stay_down).insert(image.to_string());
        self
    }

    /// Every command passed to `start_detached`.
    pub fn launched(&self) -> Vec<CommandSpec> {
        lock(&self.launched).clone()
    }

    /// Every image passed to `terminate`.
    pub fn terminated(&self) -> Vec<String> {
        lock(&self.terminated).clone()
    }
}

impl ProcessSupervisor for FakeSupervisor {
    fn start_detached(&self, spec: &CommandSpec) -> Result<u32, ProcessError> {
        lock(&self.launched).push(spec.clone());
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if let Some(image) = spec.program_name()
            && !lock(&self.stay_down).contains(image)
        {
            lock(&self.running).insert(image.to_string(), pid);
        }
        Ok(pid)
    }

    fn is_running(&self, image: &str) -> Option<u32> {
        lock(&self.running).get(image).copied()
    }

    fn terminate(&self, image: &str) -> Result<(), ProcessError> {
        lock(&self.terminated).push(image.to_string());
        lock(&self.running).remove(image);
        Ok(())
    }
}

/// Records commands and answers them from canned rules.
///
/// Unless a rule matches, every command succeeds with empty output. Any
/// `-out <path>` argument gets a placeholder file so tools that produce
/// files look like they worked.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<CommandSpec>>,
    rules: Vec<(String, CommandOutput)>,
}

impl RecordingRunner {
    /// Runner where everything succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands whose rendered text contains `needle` answer with `output`.
    pub fn respond(mut self, needle: &str, output: CommandOutput) -> Self {
        self.rules.push((needle.to_string(), output));
        self
    }

    /// Every command run so far.
    pub fn calls(&self) -> Vec<CommandSpec> {
        lock(&self.calls).clone()
    }

    /// Rendered command lines run so far.
    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        lock(&self.calls).push(spec.clone());
        let line = spec.to_string();
        if let Some((_, output)) = self.rules.iter().find(|(needle, _)| line.contains(needle)) {
            return Ok(output.clone());
        }
        if let Some(out) = spec.arg_after("-out")
            && out.parent().is_some_and(Path::exists)
        {
            fs::write(out, "generated")?;
        }
        Ok(CommandOutput::ok(""))
    }
}

/// Platform with a caller-chosen hosts file and trust store; elevation is a
/// plain `cp`.
pub struct FakePlatform {
    /// Hosts file to manage.
    pub hosts_file: PathBuf,
    /// Trust store to report.
    pub trust_store: Option<TrustStoreKind>,
}

impl FakePlatform {
    /// Fake platform managing `hosts_file`.
    pub fn new(hosts_file: impl Into<PathBuf>) -> Self {
        Self {
            hosts_file: hosts_file.into(),
            trust_store: None,
        }
    }
}

impl Platform for FakePlatform {
    fn os_name(&self) -> &'static str {
        "test"
    }

    fn image_suffix(&self) -> &'static str {
        ""
    }

    fn hosts_file_path(&self) -> PathBuf {
        self.hosts_file.clone()
    }

    fn trust_store(&self) -> Option<TrustStoreKind> {
        self.trust_store
    }

    fn detach(&self, _cmd: &mut Command) {}

    fn elevated_copy(&self, source: &Path, destination: &Path) -> CommandSpec {
        CommandSpec::new("cp")
            .arg(source.as_os_str())
            .arg(destination.as_os_str())
    }
}
