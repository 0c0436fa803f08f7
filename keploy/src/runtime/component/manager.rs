use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, warn};

use super::{Handle, JoinError, ShutdownResult};
use crate::runtime::shutdown::ShutdownConfig;

/// Owner of the session's component handles and the shutdown broadcast.
///
/// Registration order is startup order; shutdown walks the list in reverse so
/// producers stop before the consumers that drain their channels.
pub struct ComponentManager {
    handles: Vec<Handle>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ComponentManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            handles: Vec::new(),
            shutdown_tx,
        }
    }

    /// Subscribe to the shutdown signal. Components `select!` on this to
    /// begin their graceful teardown.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Register a component handle.
    pub fn register(&mut self, handle: Handle) {
        debug!(
            event.name = "component.registered",
            component.name = %handle.name(),
            "registered component"
        );
        self.handles.push(handle);
    }

    /// Number of registered components.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Broadcast the shutdown signal without joining; used by timers that
    /// trigger teardown from inside a registered component.
    pub fn trigger(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Shut down all registered components in reverse registration order.
    ///
    /// Each component first gets the remaining share of the graceful budget;
    /// one that overstays is aborted and then granted `write_grace` so writes
    /// in flight can land.
    pub async fn shutdown(self, config: ShutdownConfig) -> ShutdownResult {
        let shutdown_start = Instant::now();
        let _ = self.shutdown_tx.send(());

        let mut components_completed = 0usize;
        let mut aborted_names = Vec::new();

        for handle in self.handles.into_iter().rev() {
            let remaining = config.timeout.saturating_sub(shutdown_start.elapsed());
            let (name, mut join) = handle.into_join();

            let graceful = if remaining.is_zero() {
                Err(JoinError::Timeout(remaining))
            } else {
                match tokio::time::timeout(remaining, &mut join).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) if e.is_cancelled() => Err(JoinError::Cancelled),
                    Ok(Err(e)) => Err(JoinError::Panic(format!("{e}"))),
                    Err(_) => Err(JoinError::Timeout(remaining)),
                }
            };

            match graceful {
                Ok(()) | Err(JoinError::Cancelled) => {
                    components_completed += 1;
                    debug!(
                        event.name = "component.stopped",
                        component.name = %name,
                        "component stopped"
                    );
                }
                Err(e) => {
                    warn!(
                        event.name = "component.shutdown_forced",
                        component.name = %name,
                        error.message = %e,
                        "component failed to stop gracefully, aborting"
                    );
                    join.abort();
                    let _ = tokio::time::timeout(config.write_grace, &mut join).await;
                    aborted_names.push(name);
                }
            }
        }

        let duration = shutdown_start.elapsed();
        if aborted_names.is_empty() {
            ShutdownResult::Graceful {
                duration,
                components_completed,
            }
        } else {
            ShutdownResult::ForcedTermination {
                duration,
                components_completed,
                components_aborted: aborted_names.len(),
                aborted_names,
            }
        }
    }
}

impl Default for ComponentManager {
    fn default() -> Self {
        Self::new()
    }
}
