//! Launcher for the user application whose traffic is being intercepted.

use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Why the application run ended. The orchestrators translate these into
/// session verdicts: a command failure aborts, a normal exit ends the
/// session successfully, an unexpected exit ends it but keeps what was
/// captured.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppError {
    /// The command could not be started at all.
    Command(String),
    /// The application exited on its own with a failure status.
    AppStopped(String),
    /// The application exited on its own with status zero.
    TerminatedNormally,
    /// The surrounding session was cancelled; the app was stopped by us.
    CtxCanceled,
    /// Launcher-internal failure.
    Internal(String),
}

impl AppError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AppError::CtxCanceled)
    }
}

/// One registered user application.
pub struct App {
    id: u64,
    command: String,
}

impl App {
    pub fn new(id: u64, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the command to completion or until shutdown. Blocking in the
    /// async sense; the caller decides what its exit means.
    ///
    /// An empty command (mock-only sessions, externally managed apps) just
    /// waits for shutdown.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> AppError {
        if self.command.is_empty() {
            debug!(
                event.name = "app.no_command",
                app.id = self.id,
                "no user command configured, waiting for shutdown"
            );
            let _ = shutdown_rx.recv().await;
            return AppError::CtxCanceled;
        }

        info!(
            event.name = "app.starting",
            app.id = self.id,
            command = %self.command,
            "starting user application"
        );

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return AppError::Command(format!("failed to start `{}`: {e}", self.command));
            }
        };

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => {
                    info!(
                        event.name = "app.exited",
                        app.id = self.id,
                        "user application exited normally"
                    );
                    AppError::TerminatedNormally
                }
                Ok(status) => {
                    warn!(
                        event.name = "app.stopped",
                        app.id = self.id,
                        status = %status,
                        "user application stopped unexpectedly"
                    );
                    AppError::AppStopped(format!("exit status {status}"))
                }
                Err(e) => AppError::Internal(format!("failed to wait on the application: {e}")),
            },
            _ = shutdown_rx.recv() => {
                debug!(
                    event.name = "app.cancelled",
                    app.id = self.id,
                    "stopping user application on shutdown"
                );
                let _ = child.kill().await;
                AppError::CtxCanceled
            }
        }
    }
}
