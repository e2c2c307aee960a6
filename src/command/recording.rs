use super::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

type Handler = dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync;

/// Command runner that records invocations instead of spawning processes.
///
/// Every invocation is answered by the handler, which defaults to reporting
/// success. Handlers may touch the filesystem to simulate a tool's side
/// effects, e.g. writing the file named by `--result-file`.
#[derive(Clone)]
pub struct RecordingCommandRunner {
    invocations: Arc<Mutex<Vec<CommandSpec>>>,
    handler: Arc<Handler>,
}

impl RecordingCommandRunner {
    /// Runner answering every command with success
    pub fn new() -> Self {
        Self::with_handler(|_| CommandOutput::success())
    }

    /// Runner answering every command with `handler`
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            invocations: Arc::new(Mutex::new(Vec::new())),
            handler: Arc::new(handler),
        }
    }

    /// Snapshot of every command run so far, in order
    pub fn invocations(&self) -> Vec<CommandSpec> {
        self.invocations.lock().clone()
    }

    /// Programs invoked, one entry per pipeline stage
    pub fn programs(&self) -> Vec<String> {
        self.invocations
            .lock()
            .iter()
            .flat_map(|spec| spec.stages().into_iter().map(|stage| stage.program.clone()))
            .collect()
    }
}

impl Default for RecordingCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RecordingCommandRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingCommandRunner")
            .field("invocations", &self.invocations.lock().len())
            .finish()
    }
}

#[async_trait]
impl CommandRunner for RecordingCommandRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.invocations.lock().push(command.clone());
        Ok((self.handler)(command))
    }
}
