//! CLI tests: spawn the `swarm` binary in scratch projects.

use std::process::Command;

use swarm::exit_codes;

#[test]
fn commands_refuse_directories_without_beads() {
    let temp = tempfile::tempdir().expect("tempdir");
    for args in [&["status"][..], &["start", "--once"], &["cleanup", "-f"], &["stop"]] {
        let output = Command::new(env!("CARGO_BIN_EXE_swarm"))
            .current_dir(temp.path())
            .args(args)
            .output()
            .expect("run swarm");
        assert_eq!(output.status.code(), Some(exit_codes::INVALID), "{args:?}");
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
        stderr.contains("not a swarm project (no .beads found)"),
        "{stderr}"
    );
    }
}

#[test]
fn invalid_config_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(temp.path().join(".beads")).expect("beads");
    std::fs::create_dir_all(temp.path().join(".swarm")).expect("swarm dir");
    std::fs::write(temp.path().join(".swarm/config.toml"), "idle_limit = 0\n").expect("config");

    let output = Command::new(env!("CARGO_BIN_EXE_swarm"))
        .current_dir(temp.path())
        .arg("status")
        .output()
        .expect("run swarm");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("idle_limit must be >= 1"));
}

#[cfg(unix)]
mod with_fake_tracker {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// A project whose `bd` answers every query with an empty list.
    fn empty_project() -> (tempfile::TempDir, String) {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join(".beads")).expect("beads");
        let bin = temp.path().join("bin");
        std::fs::create_dir_all(&bin).expect("bin");
        let bd = bin.join("bd");
        std::fs::write(&bd, "#!/bin/sh\necho '[]'\n").expect("write bd");
        std::fs::set_permissions(&bd, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        let path = format!(
            "{}:{}",
            bin.display(),
            std::env::var("PATH").unwrap_or_default()
        );
        (temp, path)
    }

    fn swarm(dir: &Path, path: &str, args: &[&str]) -> std::process::Output {
        Command::new(env!("CARGO_BIN_EXE_swarm"))
            .current_dir(dir)
            .env("PATH", path)
            .args(args)
            .output()
            .expect("run swarm")
    }

    #[test]
    fn start_with_empty_queue_exits_cleanly_without_workers() {
        let (temp, path) = empty_project();
        let output = swarm(temp.path(), &path, &["start", "-w", "3"]);
        assert_eq!(output.status.code(), Some(exit_codes::OK));
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("Ready items: 0"), "{stdout}");
        assert!(stdout.contains("No ready work"), "{stdout}");
        assert!(!temp.path().join("logs").exists());
    }

    #[test]
    fn status_reports_no_ready_work() {
        let (temp, path) = empty_project();
        let output = swarm(temp.path(), &path, &["status", "--tree"]);
        assert_eq!(output.status.code(), Some(exit_codes::OK));
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("Issues: 0"), "{stdout}");
        assert!(
        stdout.trim_end().ends_with("State: no ready work"),
        "{stdout}"
    );
    }

    #[test]
    fn cleanup_without_orphans_is_a_no_op() {
        let (temp, path) = empty_project();
        let output = swarm(temp.path(), &path, &["cleanup"]);
        assert_eq!(output.status.code(), Some(exit_codes::OK));
        assert!(String::from_utf8_lossy(&output.stdout).contains("No orphaned work."));
    }

    #[test]
    fn stop_without_sessions_is_a_no_op() {
        let (temp, path) = empty_project();
        let output = swarm(temp.path(), &path, &["stop"]);
        assert_eq!(output.status.code(), Some(exit_codes::OK));
        assert!(String::from_utf8_lossy(&output.stdout).contains("No swarm sessions found."));
    }
}
