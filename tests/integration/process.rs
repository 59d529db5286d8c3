#[path = "common/mod.rs"]
mod common;

#[cfg(target_os = "linux")]
mod linux {
    use super::common::wait_for;
    use devstack::{
        command::{CommandSpec, SystemRunner},
        error::ProcessError,
        platform,
        process::{
            ProcessSupervisor, RetryPolicy, StopStrategy, SystemSupervisor, stop_with,
            wait_until_running,
        },
    };
    use std::{
        fs,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        time::Duration,
    };
    use tempfile::tempdir;

    // Kernel process names are capped at 15 bytes.
    fn image(prefix: &str) -> String {
        format!("{prefix}{}", std::process::id())
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn supervisor() -> SystemSupervisor {
        SystemSupervisor::new(platform::detect(), Duration::from_secs(2))
    }

    fn patient() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(100),
            attempts: 50,
        }
    }

    #[test]
    fn detached_process_is_found_and_terminated() {
        let temp = tempdir().unwrap();
        let name = image("dsp");
        let script = write_script(temp.path(), &name, "while true; do sleep 1; done");
        let supervisor = supervisor();

        let spawned = supervisor
            .start_detached(&CommandSpec::new(&script).current_dir(temp.path()))
            .unwrap();
        let pid = wait_until_running(&supervisor, &name, &patient()).unwrap();
        assert_eq!(pid, spawned);

        supervisor.terminate(&name).unwrap();
        wait_for("script to exit", || supervisor.is_running(&name).is_none());
    }

    #[test]
    fn failing_stop_command_falls_back_to_terminate() {
        let temp = tempdir().unwrap();
        let name = image("dsf");
        let script = write_script(temp.path(), &name, "while true; do sleep 1; done");
        let supervisor = supervisor();

        supervisor
            .start_detached(&CommandSpec::new(&script))
            .unwrap();
        wait_until_running(&supervisor, &name, &patient()).unwrap();

        stop_with(
            &supervisor,
            &SystemRunner,
            &name,
            &[
                StopStrategy::Command(CommandSpec::new("false")),
                StopStrategy::Terminate,
            ],
        )
        .unwrap();
        wait_for("script to exit", || supervisor.is_running(&name).is_none());
    }

    #[test]
    fn process_that_exits_immediately_fails_verification() {
        let temp = tempdir().unwrap();
        let name = image("dsq");
        let script = write_script(temp.path(), &name, "exit 0");
        let supervisor = supervisor();

        supervisor
            .start_detached(&CommandSpec::new(&script))
            .unwrap();
        let quick = RetryPolicy {
            interval: Duration::from_millis(200),
            attempts: 3,
        };
        // Give the script time to exit before the first poll.
        std::thread::sleep(Duration::from_millis(300));
        let err = wait_until_running(&supervisor, &name, &quick).unwrap_err();
        assert!(matches!(err, ProcessError::FailedToStart { attempts: 3, .. }));
    }

    #[test]
    fn terminating_unknown_image_is_a_no_op() {
        supervisor().terminate(&image("dsn")).unwrap();
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = supervisor()
            .start_detached(&CommandSpec::new("/nonexistent/devstack-helper"))
            .unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
    }
}
