//! Recording orchestrator: boots the interceptor, runs the user command,
//! and fans the captured streams into persistence.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::app::AppError;
use crate::core::Core;
use crate::error::{KeployError, Result};
use crate::models::{Mode, TEST_SET_PATTERN};
use crate::platform::yaml::next_indexed_id;
use crate::platform::{MockDb, TestDb};
use crate::runtime::component::{ComponentManager, Handle};
use crate::runtime::shutdown::ShutdownConfig;
use crate::telemetry::Telemetry;

pub struct Recorder {
    core: Arc<Core>,
    test_db: Arc<dyn TestDb>,
    mock_db: Arc<dyn MockDb>,
    telemetry: Arc<dyn Telemetry>,
    command: String,
    record_timer: Duration,
}

impl Recorder {
    pub fn new(
        core: Arc<Core>,
        test_db: Arc<dyn TestDb>,
        mock_db: Arc<dyn MockDb>,
        telemetry: Arc<dyn Telemetry>,
        command: String,
        record_timer: Duration,
    ) -> Self {
        Self {
            core,
            test_db,
            mock_db,
            telemetry,
            command,
            record_timer,
        }
    }

    /// Run one full recording session.
    ///
    /// Startup order: persistence consumers, then hooks/proxy, then the user
    /// application; the component manager tears them down in reverse so the
    /// app stops first and the persistence consumers drain last. On every
    /// exit path the hooks are unloaded and telemetry flushed.
    pub async fn start(&self) -> Result<()> {
        let existing = self.test_db.get_all_test_set_ids().await?;
        let test_set = next_indexed_id(&existing, TEST_SET_PATTERN);
        info!(
            event.name = "record.started",
            test_set = %test_set,
            "recording into new test set"
        );

        let app_id = self.core.setup(&self.command);
        let mut manager = ComponentManager::new();

        let test_count = Arc::new(AtomicUsize::new(0));
        let mock_count = Arc::new(AtomicUsize::new(0));
        let (insert_err_tx, mut insert_err_rx) = mpsc::channel::<KeployError>(10);

        // persistence consumers are registered first so they are joined last
        // and can drain whatever the interceptor captured
        let mut incoming = self.core.get_incoming()?;
        let test_db = self.test_db.clone();
        let set = test_set.clone();
        let errs = insert_err_tx.clone();
        let count = test_count.clone();
        let mut shutdown = manager.subscribe();
        manager.register(Handle::new(
            "test-consumer",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        case = incoming.recv() => match case {
                            Some(case) => {
                                match test_db.insert_test_case(&case, &set).await {
                                    Ok(()) => {
                                        count.fetch_add(1, Ordering::SeqCst);
                                    }
                                    Err(e) => {
                                        let _ = errs.send(e).await;
                                    }
                                }
                            }
                            None => return,
                        },
                        _ = shutdown.recv() => {
                            while let Ok(case) = incoming.try_recv() {
                                if let Err(e) = test_db.insert_test_case(&case, &set).await {
                                    let _ = errs.send(e).await;
                                } else {
                                    count.fetch_add(1, Ordering::SeqCst);
                                }
                            }
                            return;
                        }
                    }
                }
            }),
        ));

        let mut outgoing = self.core.get_outgoing()?;
        let mock_db = self.mock_db.clone();
        let set = test_set.clone();
        let errs = insert_err_tx.clone();
        let count = mock_count.clone();
        let mut shutdown = manager.subscribe();
        manager.register(Handle::new(
            "mock-consumer",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        mock = outgoing.recv() => match mock {
                            Some(mock) => {
                                match mock_db.insert_mock(&mock, &set).await {
                                    Ok(()) => {
                                        count.fetch_add(1, Ordering::SeqCst);
                                    }
                                    Err(e) => {
                                        let _ = errs.send(e).await;
                                    }
                                }
                            }
                            None => return,
                        },
                        _ = shutdown.recv() => {
                            while let Ok(mock) = outgoing.try_recv() {
                                if let Err(e) = mock_db.insert_mock(&mock, &set).await {
                                    let _ = errs.send(e).await;
                                } else {
                                    count.fetch_add(1, Ordering::SeqCst);
                                }
                            }
                            return;
                        }
                    }
                }
            }),
        ));

        if let Err(e) = self.core.hook(app_id, Mode::Record, &mut manager).await {
            manager.shutdown(ShutdownConfig::default()).await;
            return Err(e);
        }

        // the user application, last in and first out
        let (app_err_tx, mut app_err_rx) = mpsc::channel::<AppError>(1);
        let core = self.core.clone();
        let shutdown = manager.subscribe();
        manager.register(Handle::new(
            "app",
            tokio::spawn(async move {
                let err = core.run(app_id, shutdown).await;
                let _ = app_err_tx.send(err).await;
            }),
        ));

        if !self.record_timer.is_zero() {
            info!(
                event.name = "record.timer_set",
                seconds = self.record_timer.as_secs(),
                "recording will stop when the timer expires"
            );
        }

        let outcome = self.wait_for_stop(&mut app_err_rx, &mut insert_err_rx).await;

        manager.shutdown(ShutdownConfig::default()).await;
        if let Err(e) = self.core.unload().await {
            warn!(
                event.name = "record.unload_failed",
                error.message = %e,
                "failed to unload hooks"
            );
        }
        self.telemetry.recorded_test_suite(
            &test_set,
            test_count.load(Ordering::SeqCst),
            mock_count.load(Ordering::SeqCst),
        );
        self.telemetry.flush();

        info!(
            event.name = "record.finished",
            test_set = %test_set,
            tests = test_count.load(Ordering::SeqCst),
            mocks = mock_count.load(Ordering::SeqCst),
            "recording session finished"
        );
        outcome
    }

    async fn wait_for_stop(
        &self,
        app_err_rx: &mut mpsc::Receiver<AppError>,
        insert_err_rx: &mut mpsc::Receiver<KeployError>,
    ) -> Result<()> {
        let timer = async {
            if self.record_timer.is_zero() {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep(self.record_timer).await;
            }
        };

        tokio::select! {
            app_err = app_err_rx.recv() => match app_err {
                Some(AppError::TerminatedNormally) => {
                    info!(event.name = "record.app_done", "user application exited normally");
                    Ok(())
                }
                Some(AppError::AppStopped(reason)) => {
                    warn!(
                        event.name = "record.app_stopped",
                        reason = %reason,
                        "user application stopped unexpectedly; keeping what was captured"
                    );
                    Ok(())
                }
                Some(AppError::CtxCanceled) | None => Ok(()),
                Some(AppError::Command(reason)) => {
                    error!(
                        event.name = "record.command_failed",
                        reason = %reason,
                        "user command failed to start"
                    );
                    Err(KeployError::Command(reason))
                }
                Some(AppError::Internal(reason)) => Err(KeployError::internal(reason)),
            },
            insert_err = insert_err_rx.recv() => {
                let e = insert_err
                    .map(|e| KeployError::StoreWrite(e.to_string()))
                    .unwrap_or_else(|| KeployError::internal("insert error channel closed"));
                error!(
                    event.name = "record.store_write_failed",
                    error.message = %e,
                    "stopping to avoid silent data loss"
                );
                Err(e)
            }
            _ = timer => {
                warn!(event.name = "record.time_up", "time up, stopping the recording");
                Ok(())
            }
            _ = tokio::signal::ctrl_c() => {
                info!(event.name = "record.interrupted", "interrupt received, stopping");
                Ok(())
            }
        }
    }

    /// `mock record`: persist only the outgoing mocks, without allocating a
    /// test set.
    pub async fn start_mock(&self) -> Result<()> {
        let app_id = self.core.setup(&self.command);
        let mut manager = ComponentManager::new();

        let (insert_err_tx, mut insert_err_rx) = mpsc::channel::<KeployError>(10);
        let mut outgoing = self.core.get_outgoing()?;
        let mock_db = self.mock_db.clone();
        let mut shutdown = manager.subscribe();
        manager.register(Handle::new(
            "mock-consumer",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        mock = outgoing.recv() => match mock {
                            Some(mock) => {
                                if let Err(e) = mock_db.insert_mock(&mock, "").await {
                                    let _ = insert_err_tx.send(e).await;
                                }
                            }
                            None => return,
                        },
                        _ = shutdown.recv() => {
                            while let Ok(mock) = outgoing.try_recv() {
                                let _ = mock_db.insert_mock(&mock, "").await;
                            }
                            return;
                        }
                    }
                }
            }),
        ));

        if let Err(e) = self.core.hook(app_id, Mode::Record, &mut manager).await {
            manager.shutdown(ShutdownConfig::default()).await;
            return Err(e);
        }

        let (app_err_tx, mut app_err_rx) = mpsc::channel::<AppError>(1);
        let core = self.core.clone();
        let shutdown = manager.subscribe();
        manager.register(Handle::new(
            "app",
            tokio::spawn(async move {
                let err = core.run(app_id, shutdown).await;
                let _ = app_err_tx.send(err).await;
            }),
        ));

        let outcome = self.wait_for_stop(&mut app_err_rx, &mut insert_err_rx).await;

        manager.shutdown(ShutdownConfig::default()).await;
        let _ = self.core.unload().await;
        self.telemetry.flush();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::Result;
    use crate::hooks::MockHooks;
    use crate::hooks::connection::ConnectionLedger;
    use crate::models::{Mock, TestCase};
    use crate::runtime::conf::Config;
    use crate::telemetry::NoopTelemetry;

    #[derive(Default)]
    struct MemoryTestDb {
        sets: Mutex<Vec<String>>,
        cases: Mutex<Vec<(String, TestCase)>>,
    }

    #[async_trait]
    impl TestDb for MemoryTestDb {
        async fn get_all_test_set_ids(&self) -> Result<Vec<String>> {
            Ok(self.sets.lock().unwrap().clone())
        }

        async fn insert_test_case(&self, tc: &TestCase, test_set: &str) -> Result<()> {
            self.cases
                .lock()
                .unwrap()
                .push((test_set.to_string(), tc.clone()));
            Ok(())
        }

        async fn get_test_cases(&self, _test_set: &str) -> Result<Vec<TestCase>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct MemoryMockDb {
        mocks: Mutex<Vec<(String, Mock)>>,
    }

    #[async_trait]
    impl MockDb for MemoryMockDb {
        async fn insert_mock(&self, mock: &Mock, test_set: &str) -> Result<()> {
            self.mocks
                .lock()
                .unwrap()
                .push((test_set.to_string(), mock.clone()));
            Ok(())
        }

        async fn get_filtered_mocks(
            &self,
            _: &str,
            _: chrono::DateTime<chrono::Utc>,
            _: chrono::DateTime<chrono::Utc>,
        ) -> Result<Vec<Mock>> {
            Ok(Vec::new())
        }

        async fn get_unfiltered_mocks(
            &self,
            _: &str,
            _: chrono::DateTime<chrono::Utc>,
            _: chrono::DateTime<chrono::Utc>,
        ) -> Result<Vec<Mock>> {
            Ok(Vec::new())
        }

        async fn delete_mocks(&self, _: &str, _: &[String]) -> Result<()> {
            Ok(())
        }
    }

    fn test_core(hooks: Arc<MockHooks>) -> Arc<Core> {
        let mut config = Config::default();
        config.proxy_port = 0;
        config.dns_port = 0;
        let (incoming_tx, incoming_rx) = mpsc::channel(64);
        let ledger = Arc::new(ConnectionLedger::new(
            incoming_tx,
            config.keep_alive_idle_limit(),
        ));
        Core::with_hooks(config, hooks.clone(), hooks, ledger, incoming_rx)
    }

    #[tokio::test]
    async fn session_ends_when_the_app_exits_and_hooks_unload() {
        let hooks = Arc::new(MockHooks::new());
        let core = test_core(hooks.clone());
        let test_db = Arc::new(MemoryTestDb::default());
        let mock_db = Arc::new(MemoryMockDb::default());

        let recorder = Recorder::new(
            core,
            test_db.clone(),
            mock_db,
            Arc::new(NoopTelemetry),
            "true".to_string(),
            Duration::ZERO,
        );

        recorder.start().await.expect("record session");
        assert!(!hooks.is_loaded());
        let calls = hooks.calls();
        assert_eq!(calls.last().unwrap(), "unload");
    }

    #[tokio::test]
    async fn failed_command_aborts_the_session() {
        let hooks = Arc::new(MockHooks::new());
        let core = test_core(hooks.clone());

        let recorder = Recorder::new(
            core,
            Arc::new(MemoryTestDb::default()),
            Arc::new(MemoryMockDb::default()),
            Arc::new(NoopTelemetry),
            // sh reports a nonexistent binary as a failed exit
            "exec /nonexistent-keploy-binary".to_string(),
            Duration::ZERO,
        );

        // an AppStopped exit keeps the session successful per the error
        // policy; only a spawn failure is fatal
        let outcome = recorder.start().await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn record_timer_stops_a_long_running_app() {
        let hooks = Arc::new(MockHooks::new());
        let core = test_core(hooks.clone());

        let recorder = Recorder::new(
            core,
            Arc::new(MemoryTestDb::default()),
            Arc::new(MemoryMockDb::default()),
            Arc::new(NoopTelemetry),
            "sleep 30".to_string(),
            Duration::from_millis(100),
        );

        let started = std::time::Instant::now();
        recorder.start().await.expect("timer-driven stop");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!hooks.is_loaded());
    }
}
