//! External process execution.
//!
//! Every provider operation, ping and SSH probe goes through a
//! [`CommandRunner`]. The runner never interprets a non-zero exit code as a
//! failure; it hands the exit code, stdout and stderr back to the caller, who
//! decides whether to retry or abort. Each invocation is appended to the
//! [`CommandLog`].

use std::fmt;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use crate::error::VmError;

/// A program plus its argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Start a command line for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `flag value`.
    #[must_use]
    pub fn opt(self, flag: &str, value: impl Into<String>) -> Self {
        self.arg(flag).arg(value)
    }

    /// Program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument vector.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Shell-quoted rendering, used for the command log and diagnostics.
    #[must_use]
    pub fn rendered(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| shlex::try_quote(part).map_or_else(|_| part.to_string(), |q| q.into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered())
    }
}

/// Raw result of running a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (`-1` when terminated by a signal).
    pub code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Result of [`CommandRunner::run_checked`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedOutput {
    /// Exit code.
    pub code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Human-readable failure reason, set only on non-zero exit.
    pub error_message: Option<String>,
}

impl CheckedOutput {
    /// Convert into stdout, or [`VmError::ProviderRejected`] on non-zero exit.
    ///
    /// # Errors
    /// Returns the extracted message when the command failed.
    pub fn into_stdout(self) -> Result<String, VmError> {
        match self.error_message {
            None => Ok(self.stdout),
            Some(message) => Err(VmError::ProviderRejected(message)),
        }
    }
}

/// Executes external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion, capturing output. No error interpretation.
    async fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, VmError>;

    /// Run a command attached to the caller's terminal, returning its exit code.
    async fn run_interactive(&self, cmd: &CommandLine) -> Result<i32, VmError>;

    /// Run a command and extract a readable error message on failure.
    async fn run_checked(&self, cmd: &CommandLine) -> Result<CheckedOutput, VmError> {
        let output = self.run(cmd).await?;
        let error_message = if output.success() {
            None
        } else {
            let message = extract_error_message(&output.stdout, &output.stderr);
            debug!(command = %cmd, code = output.code, error = %message, "Command failed");
            Some(message)
        };

        Ok(CheckedOutput {
            code: output.code,
            stdout: output.stdout,
            error_message,
        })
    }
}

/// Run a command and return stdout, turning a non-zero exit into
/// [`VmError::ProviderRejected`].
///
/// # Errors
/// Returns an error if the command cannot be spawned or exits non-zero.
pub async fn exec(runner: &dyn CommandRunner, cmd: &CommandLine) -> Result<String, VmError> {
    runner.run_checked(cmd).await?.into_stdout()
}

/// Run a command and decode its JSON stdout.
///
/// # Errors
/// Returns an error if the command fails or the reply is not the expected JSON.
pub async fn exec_json<T: DeserializeOwned>(
    runner: &dyn CommandRunner,
    cmd: &CommandLine,
) -> Result<T, VmError> {
    let body = exec(runner, cmd).await?;
    decode(&body)
}

/// Decode a JSON reply, keeping the raw body on failure.
///
/// # Errors
/// Returns [`VmError::MalformedResponse`] if the body does not match `T`.
pub fn decode<T: DeserializeOwned>(body: &str) -> Result<T, VmError> {
    serde_json::from_str(body).map_err(|e| {
        warn!(error = %e, body = %body, "Failed to parse provider response");
        VmError::malformed(&e, body)
    })
}

/// Pull a human-readable message out of a failed command's output.
///
/// Provider CLIs often print plain text with a JSON object appended, e.g.
/// `Some prefix text {"Message": "bad thing", "Code": "X"}`. The first
/// top-level object in stdout (then stderr) is parsed and its `Message`,
/// `message` or `error.message` field returned. Falls back to the raw stderr,
/// then stdout.
#[must_use]
pub fn extract_error_message(stdout: &str, stderr: &str) -> String {
    json_message(stdout)
        .or_else(|| json_message(stderr))
        .unwrap_or_else(|| {
            let stderr = stderr.trim();
            if stderr.is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.to_string()
            }
        })
}

fn json_message(text: &str) -> Option<String> {
    let object = first_json_object(text)?;
    let value: serde_json::Value = serde_json::from_str(object).ok()?;
    message_field(&value)
}

fn message_field(value: &serde_json::Value) -> Option<String> {
    ["Message", "message"]
        .iter()
        .find_map(|key| value.get(*key).and_then(serde_json::Value::as_str))
        .map(str::to_string)
        .or_else(|| value.get("error").and_then(message_field))
}

/// Slice of `text` spanning the first balanced top-level `{ ... }`.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Append-only, timestamped record of every external command.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    path: Option<PathBuf>,
}

impl CommandLog {
    /// Open (create) the log at `path` and write a session header.
    ///
    /// # Errors
    /// Returns an error if the log directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, VmError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = Self { path: Some(path) };
        let header = chrono::Local::now().format("%c");
        log.append(&format!("\n#\n# {header}\n#\n"));
        Ok(log)
    }

    /// A log that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Log file location, if enabled.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record one command invocation.
    pub fn record(&self, cmd: &CommandLine) {
        let stamp = chrono::Local::now().format("%Y%m%d.%H%M%S");
        self.append(&format!("{stamp}: {cmd}\n"));
    }

    fn append(&self, text: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(text.as_bytes()));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to append to command log");
        }
    }
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    log: CommandLog,
}

impl ShellRunner {
    /// Create a runner that records into `log`.
    #[must_use]
    pub fn new(log: CommandLog) -> Self {
        Self { log }
    }

    fn command(cmd: &CommandLine) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(cmd.program());
        command.args(cmd.arguments()).kill_on_drop(true);
        command
    }

    fn spawn_error(cmd: &CommandLine, err: std::io::Error) -> VmError {
        if err.kind() == ErrorKind::NotFound {
            VmError::ToolingMissing(cmd.program().to_string())
        } else {
            VmError::Io(err)
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, VmError> {
        debug!(command = %cmd, "Running command");
        self.log.record(cmd);

        let output = Self::command(cmd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Self::spawn_error(cmd, e))?;

        let result = CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(code = result.code, stdout = %result.stdout, "Command finished");
        Ok(result)
    }

    async fn run_interactive(&self, cmd: &CommandLine) -> Result<i32, VmError> {
        debug!(command = %cmd, "Running interactive command");
        self.log.record(cmd);

        let status = Self::command(cmd)
            .status()
            .await
            .map_err(|e| Self::spawn_error(cmd, e))?;
        Ok(status.code().unwrap_or(-1))
    }
}
