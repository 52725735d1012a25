//! External command execution and the runner abstraction used by the mount
//! connector and the node-side mounter.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::process::Command;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("signal"), |code| code.to_string())
    }

    /// Standard error followed by standard output, trimmed, for diagnostics.
    #[must_use]
    pub fn combined(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        match (stderr.is_empty(), stdout.is_empty()) {
            (true, _) => stdout.to_owned(),
            (false, true) => stderr.to_owned(),
            (false, false) => format!("{stderr}\n{stdout}"),
        }
    }
}

/// Raised when a command cannot be started.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to spawn {program}: {message}")]
pub struct SpawnError {
    /// Program that failed to start.
    pub program: String,
    /// Operating system error string.
    pub message: String,
}

/// Future returned by [`CommandRunner::run`].
pub type ExecFuture<'a> = Pin<Box<dyn Future<Output = Result<CommandOutput, SpawnError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> ExecFuture<'a>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> ExecFuture<'a> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| SpawnError {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Renders a command line with shell quoting, for log lines.
#[must_use]
pub fn render(program: &str, args: &[OsString]) -> String {
    let mut rendered = String::from(program);
    for arg in args {
        rendered.push(' ');
        let lossy = arg.to_string_lossy();
        rendered.push_str(escape(lossy).as_ref());
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn output(code: Option<i32>, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            code,
            stdout: stdout.to_owned(),
            stderr: stderr.to_owned(),
        }
    }

    #[rstest]
    #[case(output(Some(0), "", ""), true)]
    #[case(output(Some(2), "", ""), false)]
    #[case(output(None, "", ""), false)]
    fn success_requires_zero_exit(#[case] out: CommandOutput, #[case] expected: bool) {
        assert_eq!(out.is_success(), expected);
    }

    #[test]
    fn combined_prefers_stderr_first() {
        assert_eq!(output(Some(1), "out\n", "err\n").combined(), "err\nout");
        assert_eq!(output(Some(1), "out", "").combined(), "out");
        assert_eq!(output(None, "", "boom").status_text(), "signal");
    }

    #[test]
    fn render_quotes_arguments() {
        let args = [OsString::from("a b"), OsString::from("plain")];
        assert_eq!(render("mount", &args), "mount 'a b' plain");
    }

    #[tokio::test]
    async fn process_runner_reports_spawn_failure() {
        let err = ProcessCommandRunner
            .run("/nonexistent/stowage-test-binary", &[])
            .await
            .expect_err("missing binary should fail to spawn");
        assert_eq!(err.program, "/nonexistent/stowage-test-binary");
    }
}
