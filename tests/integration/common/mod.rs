#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use devstack::{
    config::{Environment, Layout, Timing},
    platform::{LinuxFamily, TrustStoreKind},
    process::RetryPolicy,
    services::ServiceContext,
    test_utils::{FakePlatform, FakeSupervisor, RecordingRunner},
};

pub const HOSTS_BASE: &str = "127.0.0.1\tlocalhost\n# keep me\n10.1.2.3\tbuildbox\n";

/// Environment root populated with the bundled templates, a hosts file and
/// the given site folders under `www/`.
pub fn scaffold_root(dir: &Path, sites: &[&str]) -> Layout {
    let bundled = Path::new(env!("CARGO_MANIFEST_DIR")).join("tpl");
    copy_tree(&bundled, &dir.join("tpl"));

    for site in sites {
        fs::create_dir_all(dir.join("www").join(site)).expect("failed to create site dir");
    }
    fs::write(dir.join("hosts"), HOSTS_BASE).expect("failed to write hosts file");
    Layout::new(dir)
}

fn copy_tree(from: &Path, to: &Path) {
    fs::create_dir_all(to).expect("failed to create template dir");
    for entry in fs::read_dir(from).expect("failed to read template dir") {
        let entry = entry.expect("failed to read dir entry");
        let target = to.join(entry.file_name());
        if entry.file_type().expect("failed to stat entry").is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).expect("failed to copy template");
        }
    }
}

/// A complete set of service variables.
pub const FULL_VARS: &[(&str, &str)] = &[
    ("MYSQL_APP_FOLDER", "mysql-8.4"),
    ("MYSQL_DATA_FOLDER", "mysql"),
    ("PHP_APP_FOLDER", "php-8.3"),
    ("PHP_ERROR_LOG", "{ROOT_DIR}/logs/php/error.log"),
    ("PHP_INCLUDE_PATH", "."),
    ("PHP_EXTENSION_DIR", "{ROOT_DIR}/apps/php/{PHP_APP_FOLDER}/ext"),
    ("PHP_SESSION_SAVE_PATH", "{ROOT_DIR}/tmp/sessions"),
    ("PHP_CURL_CAINFO", "{ROOT_DIR}/etc/ssl/certificate.crt"),
    ("PHP_SENDMAIL_PATH", "mailpit sendmail"),
    ("NGINX_APP_FOLDER", "nginx-1.27"),
    ("NGINX_DOMAIN_TAIL", "test"),
    ("MAILPIT_APP_FOLDER", "mailpit"),
];

pub fn full_env() -> Environment {
    Environment::from_vars(FULL_VARS.iter().copied())
}

/// [`FULL_VARS`] minus `missing`.
pub fn env_without(missing: &str) -> Environment {
    Environment::from_vars(FULL_VARS.iter().copied().filter(|(key, _)| *key != missing))
}

/// Fakes wired into a [`ServiceContext`], kept around for assertions.
pub struct Harness {
    pub supervisor: Arc<FakeSupervisor>,
    pub runner: Arc<RecordingRunner>,
    pub platform: Arc<FakePlatform>,
}

impl Harness {
    pub fn new(root: &Path) -> Self {
        Self::with(root, FakeSupervisor::new(), RecordingRunner::new())
    }

    pub fn with(root: &Path, supervisor: FakeSupervisor, runner: RecordingRunner) -> Self {
        let mut platform = FakePlatform::new(root.join("hosts"));
        platform.trust_store = Some(TrustStoreKind::LinuxCaTrust(LinuxFamily::Debian));
        Self {
            supervisor: Arc::new(supervisor),
            runner: Arc::new(runner),
            platform: Arc::new(platform),
        }
    }

    pub fn context(&self) -> ServiceContext {
        ServiceContext {
            supervisor: self.supervisor.clone(),
            runner: self.runner.clone(),
            platform: self.platform.clone(),
            timing: quick_timing(),
        }
    }
}

pub fn quick_timing() -> Timing {
    Timing {
        verify: RetryPolicy {
            attempts: 3,
            interval: Duration::from_millis(10),
        },
        restart_settle: Duration::from_millis(10),
        stop_grace: Duration::from_millis(500),
    }
}

pub fn read(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    fs::read_to_string(path).unwrap_or_else(|err| panic!("failed to read {path:?}: {err}"))
}

pub fn wait_for<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {what}");
        }

        thread::sleep(Duration::from_millis(100));
    }
}

pub fn wait_for_path(path: &Path) -> PathBuf {
    wait_for(&format!("{path:?} to exist"), || path.exists());
    path.to_path_buf()
}
