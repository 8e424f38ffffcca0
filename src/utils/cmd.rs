//! Small subprocess helpers shared by hooks and state handlers.
//!
//! These are for short-lived system commands (`systemctl`, `dpkg`,
//! `crontab`). Long-running engine invocations with streamed output live in
//! the archive adapter instead.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{BackupError, Result};

/// Locate a binary on PATH, like `which`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

pub fn have_cmd(name: &str) -> bool {
    find_in_path(name).is_some()
}

/// Run a command and return its stdout. Non-zero exit is an error carrying
/// the command line and stderr verbatim.
pub async fn run_capture(program: &str, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;
    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(command_error(program, args, &output.status, &output.stderr))
    }
}

/// Run a command, feeding `input` on stdin.
pub async fn run_with_stdin(program: &str, args: &[&str], input: &[u8]) -> Result<()> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await?;
        stdin.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(command_error(program, args, &output.status, &output.stderr))
    }
}

/// Run a command, writing its stdout to a file. Used for database dumps.
pub async fn run_to_file(program: &str, args: &[&str], dest: &Path) -> Result<()> {
    let file = std::fs::File::create(dest)?;
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(file))
        .stderr(Stdio::piped())
        .output()
        .await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(command_error(program, args, &output.status, &output.stderr))
    }
}

/// Run a command and report only whether it succeeded. For status probes
/// like `systemctl is-active --quiet`.
pub async fn run_status(program: &str, args: &[&str]) -> Result<bool> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    Ok(status.success())
}

fn command_error(
    program: &str,
    args: &[&str],
    status: &std::process::ExitStatus,
    stderr: &[u8],
) -> BackupError {
    let stderr = String::from_utf8_lossy(stderr);
    BackupError::Io(std::io::Error::other(format!(
        "`{} {}` exited with {}: {}",
        program,
        args.join(" "),
        status,
        stderr.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_common_binaries_on_path() {
        // `sh` exists on any Unix test host.
        assert!(have_cmd("sh"));
        assert!(!have_cmd("definitely-not-a-real-binary-xyz"));
    }

    #[tokio::test]
    async fn run_capture_returns_stdout() {
        let out = run_capture("sh", &["-c", "printf hello"]).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn run_capture_surfaces_stderr_verbatim() {
        let err = run_capture("sh", &["-c", "echo boom >&2; exit 7"])
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("boom"), "stderr missing from {msg}");
        assert!(msg.contains("7"), "exit status missing from {msg}");
    }

    #[tokio::test]
    async fn run_with_stdin_feeds_input() {
        // `grep -q` exits 0 only if the pattern is found on stdin.
        run_with_stdin("grep", &["-q", "needle"], b"hay\nneedle\n")
            .await
            .unwrap();
        assert!(run_with_stdin("grep", &["-q", "needle"], b"hay\n")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn run_to_file_writes_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        run_to_file("sh", &["-c", "printf dumped"], &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"dumped");
    }
}
