//! Execution of container engine commands.

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

/// Captured result of one engine invocation.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    /// Exit code, `None` if the engine was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl EngineOutput {
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Runs engine CLI commands. Swapped for a scripted runner in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Program name, used in diagnostics.
    fn program(&self) -> &str;

    /// Run to completion, optionally feeding `input` on stdin.
    async fn run(&self, args: &[String], input: Option<&str>) -> io::Result<EngineOutput>;

    /// Start a long-running command with piped stdout and stderr. The child
    /// is killed when dropped.
    fn spawn(&self, args: &[String]) -> io::Result<Child>;
}

/// Real engine CLI (`docker`, `podman`, ...).
#[derive(Debug, Clone)]
pub struct EngineCli {
    program: String,
}

impl EngineCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for EngineCli {
    fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, args: &[String], input: Option<&str>) -> io::Result<EngineOutput> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok(EngineOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&self, args: &[String]) -> io::Result<Child> {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_output() {
        let cli = EngineCli::new("sh");
        let output = cli
            .run(&["-c".into(), "echo out; echo err >&2; exit 3".into()], None)
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_feeds_input() {
        let cli = EngineCli::new("cat");
        let output = cli.run(&[], Some("say hello\n")).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "say hello\n");
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let cli = EngineCli::new("hycore-no-such-engine");
        assert!(cli.run(&[], None).await.is_err());
    }
}
