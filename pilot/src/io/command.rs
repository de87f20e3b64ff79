//! Command Runner: executes one shell or script block in a working directory.
//!
//! The [`CommandRunner`] trait decouples the session from process spawning.
//! Tests use scripted runners that return predetermined results without
//! spawning anything.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::path::join_confined;
use crate::core::placeholders::PlaceholderSet;
use crate::core::types::ExecutionResult;
use crate::io::config::SessionConfig;
use crate::io::process::{ProcessLimits, run_streaming};

/// Parameters for one command execution.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Command text as authored by the model (placeholders unresolved).
    pub content: String,
    pub workdir: PathBuf,
    /// Fence tag or protocol hint selecting the interpreter.
    pub language: Option<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over command execution backends.
pub trait CommandRunner {
    /// Run one command, handing output chunks to `on_chunk` as they arrive.
    ///
    /// Spawn failures, nonzero exits, timeouts and output overflow are all
    /// reported as a failed [`ExecutionResult`]. `Err` is reserved for
    /// failures outside the command itself (e.g. the working directory cannot
    /// be created).
    fn execute(
        &self,
        request: &CommandRequest,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<ExecutionResult>;
}

/// Interpreter a block is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreter {
    Sh,
    Bash,
    PowerShell,
    Cmd,
    Python,
}

impl Interpreter {
    /// Shell used when a block carries no (or an unknown) hint.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Interpreter::PowerShell
        } else {
            Interpreter::Sh
        }
    }

    pub fn for_hint(hint: Option<&str>) -> Self {
        let Some(hint) = hint else {
            return Self::platform_default();
        };
        match hint.trim().to_ascii_lowercase().as_str() {
            "sh" | "shell" | "console" | "zsh" => Interpreter::Sh,
            "bash" => Interpreter::Bash,
            "powershell" | "ps1" | "pwsh" => Interpreter::PowerShell,
            "cmd" | "batch" | "bat" => Interpreter::Cmd,
            "python" | "py" => Interpreter::Python,
            _ => Self::platform_default(),
        }
    }

    /// Display name used in prompts and logs.
    pub fn name(self) -> &'static str {
        match self {
            Interpreter::Sh => "sh",
            Interpreter::Bash => "bash",
            Interpreter::PowerShell => "PowerShell",
            Interpreter::Cmd => "cmd",
            Interpreter::Python => "python",
        }
    }

    /// Build the process invocation for one whole block. The block runs as a
    /// single script, so shell state (variables, current directory) carries
    /// across lines and multi-line constructs stay intact.
    pub fn invocation(self, script: &str) -> io::Result<Invocation> {
        let invocation = match self {
            Interpreter::Sh => Invocation::inline("sh", &["-c"], script),
            Interpreter::Bash => Invocation::inline("bash", &["-c"], script),
            Interpreter::PowerShell => {
                let program = if cfg!(windows) { "powershell" } else { "pwsh" };
                Invocation::inline(
                    program,
                    &["-NoProfile", "-NonInteractive", "-Command"],
                    script,
                )
            }
            Interpreter::Cmd => {
                let file = ScriptFile::create("bat", &batch_script(script))?;
                let mut command = Command::new("cmd");
                command.arg("/C").arg(file.path());
                Invocation {
                    command,
                    stdin: None,
                    script_file: Some(file),
                }
            }
            Interpreter::Python => {
                let program = if cfg!(windows) { "python" } else { "python3" };
                let mut command = Command::new(program);
                command.arg("-");
                Invocation {
                    command,
                    stdin: Some(script.as_bytes().to_vec()),
                    script_file: None,
                }
            }
        };
        Ok(invocation)
    }
}

/// A ready-to-spawn interpreter process.
#[derive(Debug)]
pub struct Invocation {
    pub command: Command,
    /// Data written to the child's stdin.
    pub stdin: Option<Vec<u8>>,
    /// Script the command runs from; removed when dropped.
    pub script_file: Option<ScriptFile>,
}

impl Invocation {
    fn inline(program: &str, args: &[&str], script: &str) -> Self {
        let mut command = Command::new(program);
        command.args(args).arg(script);
        Self {
            command,
            stdin: None,
            script_file: None,
        }
    }
}

/// cmd reads batch files line by line, so parenthesized blocks need real
/// line breaks rather than `&` chaining.
fn batch_script(script: &str) -> String {
    let mut out = String::from("@echo off\r\n");
    for line in script.lines() {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

/// Temporary script file under the system temp directory.
#[derive(Debug)]
pub struct ScriptFile {
    path: PathBuf,
}

impl ScriptFile {
    fn create(extension: &str, contents: &str) -> io::Result<Self> {
        let path = std::env::temp_dir().join(format!("pilot-{}.{extension}", Uuid::new_v4()));
        fs::write(&path, contents)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            debug!(err = %err, path = %self.path.display(), "script file not removed");
        }
    }
}

/// Runner that spawns real interpreters.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    placeholders: PlaceholderSet,
}

impl ShellRunner {
    pub fn new(placeholders: PlaceholderSet) -> Self {
        Self { placeholders }
    }

    /// Runner resolving the built-in placeholders plus the configured extras.
    pub fn for_session(config: &SessionConfig) -> Self {
        Self::new(PlaceholderSet::with_extra(&config.extra_placeholders))
    }
}

impl CommandRunner for ShellRunner {
    #[instrument(skip_all, fields(workdir = %request.workdir.display(), language = ?request.language))]
    fn execute(
        &self,
        request: &CommandRequest,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<ExecutionResult> {
        fs::create_dir_all(&request.workdir)
            .with_context(|| format!("create working directory {}", request.workdir.display()))?;

        let interpreter = Interpreter::for_hint(request.language.as_deref());
        let resolved = self
            .placeholders
            .substitute(&request.content, &request.workdir);
        let invocation = match interpreter.invocation(&resolved) {
            Ok(invocation) => invocation,
            Err(err) => {
                warn!(err = %err, interpreter = interpreter.name(), "script file not written");
                return Ok(ExecutionResult::failure(
                    "",
                    format!("failed to prepare {} script: {err}", interpreter.name()),
                ));
            }
        };
        let Invocation {
            command: mut cmd,
            stdin,
            script_file: _script_file,
        } = invocation;
        cmd.current_dir(&request.workdir);

        info!(interpreter = interpreter.name(), "running command");
        debug!(script = %resolved, "command text");

        let limits = ProcessLimits {
            timeout: request.timeout,
            output_limit_bytes: request.output_limit_bytes,
        };
        let output = match run_streaming(cmd, stdin.as_deref(), limits, on_chunk) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, interpreter = interpreter.name(), "command did not start");
                return Ok(ExecutionResult::failure(
                    "",
                    format!("failed to start {}: {err:#}", interpreter.name()),
                ));
            }
        };
        on_chunk(&format!("\n{}\n", output.status_line()));

        let text = output.text();
        let result = if output.timed_out {
            ExecutionResult::failure(
                text,
                format!("timed out after {}s", request.timeout.as_secs()),
            )
        } else if output.overflowed {
            ExecutionResult::failure(
                text,
                format!("output exceeded {} bytes", request.output_limit_bytes),
            )
        } else if output.succeeded() {
            ExecutionResult::success(text)
        } else {
            let reason = match output.exit_code() {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by signal".to_string(),
            };
            ExecutionResult::failure(text, reason)
        };
        debug!(succeeded = result.succeeded, "command result");
        Ok(result)
    }
}

/// Write `content` to `path` joined under `workdir`, creating parent
/// directories and replacing any existing file.
///
/// The path is confined lexically so `..` segments cannot climb out of
/// `workdir`. Contents go to a sibling temp file first and are renamed into
/// place, so readers never see a partial file.
#[instrument(skip_all, fields(path = %path))]
pub fn write_file(path: &str, content: &str, workdir: &Path) -> io::Result<PathBuf> {
    let target = join_confined(workdir, path);
    if target == workdir {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("write target {path:?} names the working directory itself"),
        ));
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".pilot.tmp");
    let tmp_path = target.with_file_name(tmp_name);
    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, &target) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    debug!(target = %target.display(), bytes = content.len(), "wrote file");
    Ok(target)
}
