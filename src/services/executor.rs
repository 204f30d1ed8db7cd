//! External command execution.
//!
//! Render and preview commands are shell strings built from templates; the
//! runner only cares about the exit status and whatever the tool wrote to
//! standard error.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

pub const INPUT_PLACEHOLDER: &str = "{input}";
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Longest stderr excerpt kept in an error message.
const STDERR_LIMIT: usize = 2000;

/// Result of a command that exited successfully.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stderr: String,
}

/// Runs a fully substituted command string.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<CommandOutput, ExecutionError>;
}

/// Runs commands through `<shell> -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput, ExecutionError> {
        tracing::debug!(shell = %self.shell, command = %command, "Running external command");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(ExecutionError::Launch)?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(ExecutionError::Exit {
                code: output.status.code(),
                stderr: truncate(&stderr, STDERR_LIMIT),
            });
        }

        Ok(CommandOutput { stderr })
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Quote a path for a POSIX shell.
pub fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Replace every `{input}` and `{output}` in `template` with quoted paths.
pub fn substitute_placeholders(template: &str, input: &Path, output: &Path) -> String {
    template
        .replace(INPUT_PLACEHOLDER, &shell_quote(input))
        .replace(OUTPUT_PLACEHOLDER, &shell_quote(output))
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("input not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("failed to create output directory {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to launch command: {0}")]
    Launch(#[source] std::io::Error),

    #[error("command exited with {}: {stderr}", exit_label(.code))]
    Exit { code: Option<i32>, stderr: String },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}
