//! Shell command hooks bound to connection lifecycle events.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::Result;
use crate::error::RegistryError;
use crate::model::{ConnectionConfiguration, ConnectionEventType, ShellCommand};

/// One hook invocation.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Data source the hook belongs to
    pub data_source_id: String,
    /// Lifecycle event being fired
    pub event: ConnectionEventType,
    /// Command with variables already substituted
    pub command: ShellCommand,
}

/// A hook process that is still running after `execute` returned.
#[async_trait]
pub trait RunningCommand: Send + Sync {
    /// OS process id, when known.
    fn process_id(&self) -> Option<u32>;

    /// Kills the process.
    ///
    /// # Errors
    /// Returns error if the process cannot be signalled
    async fn terminate(&mut self) -> Result<()>;
}

/// Runs hook commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Starts the command. Returns the process handle if it is still
    /// running when this call returns, `None` once it has finished.
    ///
    /// # Errors
    /// Returns error if the command cannot be started
    async fn execute(&self, request: &CommandRequest) -> Result<Option<Box<dyn RunningCommand>>>;
}

/// Executes hooks through the system shell.
#[derive(Debug, Clone, Default)]
pub struct ProcessCommandExecutor;

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl RunningCommand for ChildProcess {
    fn process_id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self) -> Result<()> {
        if self
            .child
            .try_wait()
            .map_err(|e| RegistryError::io("Checking hook process", e))?
            .is_some()
        {
            return Ok(());
        }
        self.child
            .kill()
            .await
            .map_err(|e| RegistryError::io("Terminating hook process", e))
    }
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

#[async_trait]
impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(&self, request: &CommandRequest) -> Result<Option<Box<dyn RunningCommand>>> {
        let shell = &request.command;
        let mut command = shell_command(&shell.command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = shell.working_directory.as_deref().filter(|d| !d.is_empty()) {
            command.current_dir(PathBuf::from(dir));
        }

        let mut child = command.spawn().map_err(|e| {
            RegistryError::io(format!("Starting {} hook", request.event), e)
        })?;
        debug!(
            data_source = request.data_source_id.as_str(),
            event = %request.event,
            pid = child.id(),
            "Started hook process"
        );

        if shell.wait_process_finish {
            let wait = child.wait();
            let status = if shell.wait_process_timeout_ms == 0 {
                Some(wait.await)
            } else {
                tokio::time::timeout(Duration::from_millis(shell.wait_process_timeout_ms), wait)
                    .await
                    .ok()
            };
            match status {
                Some(Ok(status)) => {
                    if !status.success() {
                        warn!(
                            data_source = request.data_source_id.as_str(),
                            event = %request.event,
                            code = status.code(),
                            "Hook process exited with failure"
                        );
                    }
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(RegistryError::io(format!("Waiting for {} hook", request.event), e));
                }
                None => warn!(
                    data_source = request.data_source_id.as_str(),
                    event = %request.event,
                    timeout_ms = shell.wait_process_timeout_ms,
                    "Hook process still running after timeout"
                ),
            }
        }

        Ok(Some(Box::new(ChildProcess { child })))
    }
}

/// Fires the hook for `event`, if the configuration has an enabled one.
///
/// Failures are logged and swallowed. Returns the process handle when it
/// keeps running and must be terminated at disconnect.
pub async fn fire_event(
    executor: &dyn CommandExecutor,
    data_source_id: &str,
    event: ConnectionEventType,
    config: &ConnectionConfiguration,
) -> Option<Box<dyn RunningCommand>> {
    let command = config.events.get(&event).filter(|c| c.enabled && !c.command.trim().is_empty())?;
    let request = CommandRequest {
        data_source_id: data_source_id.to_string(),
        event,
        command: command.clone(),
    };

    let running = match executor.execute(&request).await {
        Ok(running) => running,
        Err(e) => {
            warn!(
                data_source = data_source_id,
                event = %event,
                error = %e,
                "Connection event hook failed"
            );
            return None;
        }
    };

    if command.pause_after_execute_ms > 0 {
        tokio::time::sleep(Duration::from_millis(command.pause_after_execute_ms)).await;
    }
    running.filter(|_| command.terminate_at_disconnect)
}
