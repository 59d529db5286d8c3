#[path = "common/mod.rs"]
mod common;

use common::{HOSTS_BASE, read};
use devstack::{
    command::{CommandOutput, SystemRunner},
    error::HostsError,
    hosts::{DEFAULT_MARKER, HostsFileSync},
    test_utils::{FakePlatform, RecordingRunner},
};
use std::fs;
use tempfile::tempdir;

fn managed(content: &str) -> Vec<&str> {
    content
        .lines()
        .filter(|line| line.contains(DEFAULT_MARKER))
        .collect()
}

#[cfg(unix)]
#[test]
fn sync_installs_entries_and_keeps_foreign_lines() {
    let temp = tempdir().unwrap();
    let hosts = temp.path().join("hosts");
    fs::write(&hosts, HOSTS_BASE).unwrap();
    let platform = FakePlatform::new(&hosts);
    let sync = HostsFileSync::new(&hosts, temp.path().join("hosts.tmp"), DEFAULT_MARKER);

    sync.sync(&["blog.test", "shop.test"], &platform, &SystemRunner)
        .unwrap();

    let content = read(&hosts);
    assert!(content.starts_with(HOSTS_BASE));
    assert_eq!(managed(&content).len(), 2);
    assert!(content.contains(&format!("127.0.0.1\tshop.test\t{DEFAULT_MARKER}")));
}

#[cfg(unix)]
#[test]
fn resync_replaces_previous_block() {
    let temp = tempdir().unwrap();
    let hosts = temp.path().join("hosts");
    fs::write(&hosts, HOSTS_BASE).unwrap();
    let platform = FakePlatform::new(&hosts);
    let sync = HostsFileSync::new(&hosts, temp.path().join("hosts.tmp"), DEFAULT_MARKER);

    sync.sync(&["blog.test", "shop.test"], &platform, &SystemRunner)
        .unwrap();
    let first = read(&hosts);
    sync.sync(&["blog.test", "shop.test"], &platform, &SystemRunner)
        .unwrap();
    assert_eq!(read(&hosts), first);

    sync.sync(&["blog.test"], &platform, &SystemRunner).unwrap();
    let content = read(&hosts);
    assert_eq!(managed(&content).len(), 1);
    assert!(!content.contains("shop.test"));
    assert!(content.contains("10.1.2.3\tbuildbox"));
}

#[cfg(unix)]
#[test]
fn sync_keeps_non_utf8_lines() {
    let temp = tempdir().unwrap();
    let hosts = temp.path().join("hosts");
    let base: &[u8] = b"127.0.0.1\tlocalhost\r\n# r\xe9seau interne\r\n";
    fs::write(&hosts, base).unwrap();
    let platform = FakePlatform::new(&hosts);
    let sync = HostsFileSync::new(&hosts, temp.path().join("hosts.tmp"), DEFAULT_MARKER);

    sync.sync(&["blog.test"], &platform, &SystemRunner).unwrap();

    let content = fs::read(&hosts).unwrap();
    assert!(content.starts_with(base));
    assert!(content.ends_with(format!("127.0.0.1\tblog.test\t{DEFAULT_MARKER}\r\n").as_bytes()));
}

#[test]
fn failed_elevation_leaves_hosts_file_untouched() {
    let temp = tempdir().unwrap();
    let hosts = temp.path().join("hosts");
    fs::write(&hosts, HOSTS_BASE).unwrap();
    let platform = FakePlatform::new(&hosts);
    let runner = RecordingRunner::new().respond("cp", CommandOutput::failed(1, "sudo: a password is required"));
    let sync = HostsFileSync::new(&hosts, temp.path().join("hosts.tmp"), DEFAULT_MARKER);

    let err = sync.sync(&["blog.test"], &platform, &runner).unwrap_err();
    assert!(matches!(err, HostsError::Elevation(_)));
    assert_eq!(read(&hosts), HOSTS_BASE);
    assert!(read(temp.path().join("hosts.tmp")).contains("blog.test"));
}

#[test]
fn unreadable_hosts_file_is_reported() {
    let temp = tempdir().unwrap();
    let hosts = temp.path().join("missing-hosts");
    let platform = FakePlatform::new(&hosts);
    let sync = HostsFileSync::new(&hosts, temp.path().join("hosts.tmp"), DEFAULT_MARKER);

    let err = sync
        .sync(&["blog.test"], &platform, &RecordingRunner::new())
        .unwrap_err();
    assert!(matches!(err, HostsError::Read { .. }));
}
