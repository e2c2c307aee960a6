//! Subprocess execution for dump, restore and log replay tools.
//!
//! Engines never spawn processes themselves; they describe the invocation as a
//! [`CommandSpec`] and hand it to a [`CommandRunner`]. The system runner spawns
//! real processes, the recording runner captures invocations instead.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use thiserror::Error;
use tokio::fs::File;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

mod recording;

pub use recording::RecordingCommandRunner;

/// Errors raised while spawning or waiting on a process
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum CommandError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to redirect {stream} for {program}: {source}")]
    Redirect {
        program: String,
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A fully formed process invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable, resolved through `PATH`
    pub program: String,
    /// Arguments, passed without a shell
    pub args: Vec<String>,
    /// Extra environment, used for credentials so they stay out of argv
    pub env: Vec<(String, String)>,
    /// File fed to stdin
    pub stdin_file: Option<PathBuf>,
    /// File receiving stdout
    pub stdout_file: Option<PathBuf>,
    /// Downstream process receiving this process's stdout
    pub pipe_to: Option<Box<CommandSpec>>,
}

impl CommandSpec {
    /// Invocation of `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for this process only
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed `path` to stdin
    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    /// Write stdout to `path`, truncating it
    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    /// Pipe stdout into `downstream`
    pub fn pipe_to(mut self, downstream: CommandSpec) -> Self {
        self.pipe_to = Some(Box::new(downstream));
        self
    }

    /// Value of a `--name=value` argument, if present
    pub fn flag_value(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}=", name);
        self.args.iter().find_map(|arg| arg.strip_prefix(prefix.as_str()))
    }

    /// Every process in the pipeline, upstream first
    pub fn stages(&self) -> Vec<&CommandSpec> {
        let mut stages = vec![self];
        let mut current = self;
        while let Some(next) = current.pipe_to.as_deref() {
            stages.push(next);
            current = next;
        }
        stages
    }
}

impl fmt::Display for CommandSpec {
    /// Shell-like rendering for logs; environment values are never shown
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        if let Some(ref path) = self.stdin_file {
            write!(f, " < {}", path.display())?;
        }
        if let Some(ref path) = self.stdout_file {
            write!(f, " > {}", path.display())?;
        }
        if let Some(ref next) = self.pipe_to {
            write!(f, " | {}", next)?;
        }
        Ok(())
    }
}

/// Captured result of a finished invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code of the first failing upstream stage, else of the last stage;
    /// `None` when killed by a signal
    pub status_code: Option<i32>,
    /// Stdout of the last stage, unless redirected to a file
    pub stdout: String,
    /// Stderr of every stage, upstream first
    pub stderr: String,
}

impl CommandOutput {
    /// Exit code zero, no output
    pub fn success() -> Self {
        Self {
            status_code: Some(0),
            ..Default::default()
        }
    }

    /// Exit code `code` with `stderr`
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Exit code zero
    pub fn is_success(&self) -> bool {
        self.status_code == Some(0)
    }

    /// Best error text for the operator: stderr, else stdout, else the exit status
    pub fn error_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.status_code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Narrow process-execution capability
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command (and its pipeline) to completion
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// Runs commands as real child processes
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    /// Runner spawning real processes
    pub fn new() -> Self {
        Self
    }

    async fn spawn(spec: &CommandSpec, stdin: Option<Stdio>) -> Result<Child, CommandError> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args).kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let stdin = match (stdin, spec.stdin_file.as_ref()) {
            (Some(upstream), _) => upstream,
            (None, Some(path)) => open_redirect(spec, "stdin", File::open(path).await)?,
            (None, None) => Stdio::null(),
        };
        command.stdin(stdin);

        let stdout = match spec.stdout_file.as_ref() {
            Some(path) => open_redirect(spec, "stdout", File::create(path).await)?,
            None => Stdio::piped(),
        };
        command.stdout(stdout).stderr(Stdio::piped());

        command.spawn().map_err(|source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        })
    }
}

fn open_redirect(
    spec: &CommandSpec,
    stream: &'static str,
    file: io::Result<File>,
) -> Result<Stdio, CommandError> {
    let file = file.map_err(|source| CommandError::Redirect {
        program: spec.program.clone(),
        stream,
        source,
    })?;
    Ok(Stdio::from(file.try_into_std().map_err(|_| CommandError::Redirect {
        program: spec.program.clone(),
        stream,
        source: io::Error::other("file handle still in use"),
    })?))
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!(command = %command, "running command");

        let stages = command.stages();
        let Some((last, upstream)) = stages.split_last() else {
            return Ok(CommandOutput::success());
        };

        // Upstream stages are awaited in their own tasks so their stderr is
        // drained while the downstream stage is still reading stdout
        let mut upstream_stdin: Option<Stdio> = None;
        let mut upstream_waits: Vec<(String, JoinHandle<io::Result<Output>>)> = Vec::new();

        for stage in upstream {
            let mut child = Self::spawn(stage, upstream_stdin.take()).await?;
            let stdout = child.stdout.take().ok_or_else(|| CommandError::Redirect {
                program: stage.program.clone(),
                stream: "stdout",
                source: io::Error::other("stdout was not captured"),
            })?;
            let stdio: Stdio = stdout.try_into().map_err(|source| CommandError::Redirect {
                program: stage.program.clone(),
                stream: "stdout",
                source,
            })?;
            upstream_stdin = Some(stdio);
            upstream_waits.push((stage.program.clone(), tokio::spawn(child.wait_with_output())));
        }

        let child = Self::spawn(last, upstream_stdin.take()).await?;
        let output = child.wait_with_output().await.map_err(|source| CommandError::Wait {
            program: last.program.clone(),
            source,
        })?;

        // An upstream failure (e.g. mysqlbinlog) fails the whole pipeline
        let mut stderr = String::new();
        let mut upstream_failure = None;
        for (program, wait) in upstream_waits {
            let result = wait
                .await
                .map_err(io::Error::other)
                .and_then(|result| result)
                .map_err(|source| CommandError::Wait { program, source })?;
            stderr.push_str(&String::from_utf8_lossy(&result.stderr));
            if !result.status.success() && upstream_failure.is_none() {
                upstream_failure = Some(result.status.code());
            }
        }
        stderr.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            status_code: upstream_failure.unwrap_or(output.status.code()),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }
}
