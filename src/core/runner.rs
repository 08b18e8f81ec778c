use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tracing::debug;

/// Runs an external tool to completion and returns its stdout.
/// A non-zero exit status is an error carrying stderr.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        cwd: &Path,
        envs: &[(&str, &str)],
    ) -> Result<String>;
}

#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        cwd: &Path,
        envs: &[(&str, &str)],
    ) -> Result<String> {
        let command_line = format!("{} {}", program, args.join(" "));
        debug!("Running `{}` in {}", command_line, cwd.display());

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in envs {
            command.env(key, value);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to start `{}`", command_line))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "`{}` failed ({}): {}",
                command_line,
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plan.json"), "{\"ok\":true}").unwrap();

        let out = ProcessRunner::new()
            .run("cat", &["plan.json"], dir.path(), &[])
            .await
            .unwrap();
        assert_eq!(out, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn passes_environment_variables() {
        let dir = tempfile::tempdir().unwrap();
        let out = ProcessRunner::new()
            .run("sh", &["-c", "printf %s \"$PASSPHRASE\""], dir.path(), &[("PASSPHRASE", "secret")])
            .await
            .unwrap();
        assert_eq!(out, "secret");
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessRunner::new()
            .run("sh", &["-c", "echo boom >&2; exit 3"], dir.path(), &[])
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("boom"));
        assert!(message.contains("sh -c"));
    }
}
