//! Test orchestrator: owns execution lifecycles, wires workloads to the
//! safety monitor and the collector, and guarantees cleanup on every exit
//! path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::collector::MetricsCollector;
use super::config::GlobalLimits;
use super::events::{EngineEvent, EventBus};
use super::models::{
    ExecutionRecord, ExecutionStatus, MetricPoint, SafetyLimits, TestConfiguration, TestParams,
};
use super::registry::PluginRegistry;
use super::safety::SafetyMonitor;
use crate::error::{EngineError, Result};
use crate::workloads::StressPlugin;

struct ExecutionState {
    status: ExecutionStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

/// One supervised execution. Owns the cancellation handle, the state cell,
/// and the metrics buffer; all of them die with the handle at reap time.
struct ExecutionHandle {
    id: Uuid,
    config: TestConfiguration,
    cancel: CancellationToken,
    /// Hard deadline; cancellation at or after it means normal completion.
    deadline: Instant,
    state: RwLock<ExecutionState>,
    metrics: Arc<Mutex<Vec<MetricPoint>>>,
}

impl ExecutionHandle {
    fn new(id: Uuid, config: TestConfiguration, deadline: Instant) -> Self {
        Self {
            id,
            config,
            cancel: CancellationToken::new(),
            deadline,
            state: RwLock::new(ExecutionState {
                status: ExecutionStatus::Pending,
                start_time: Utc::now(),
                end_time: None,
                error_message: None,
            }),
            metrics: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn set_running(&self) {
        let mut state = self.state.write().unwrap();
        state.status = ExecutionStatus::Running;
        state.start_time = Utc::now();
    }

    /// Perform the terminal transition. At most one call succeeds; later
    /// attempts report `AlreadyFinished`.
    fn finish(&self, status: ExecutionStatus, error: Option<String>) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.status.is_terminal() {
            return Err(EngineError::AlreadyFinished(self.id.to_string()));
        }
        state.status = status;
        state.end_time = Some(Utc::now());
        state.error_message = error;
        Ok(())
    }

    fn snapshot(&self) -> ExecutionRecord {
        let state = self.state.read().unwrap();
        let duration = match state.end_time {
            Some(end) => (end - state.start_time).to_std().unwrap_or_default(),
            None => (Utc::now() - state.start_time).to_std().unwrap_or_default(),
        };
        ExecutionRecord {
            id: self.id,
            config_id: self.config.id,
            config_name: self.config.name.clone(),
            plugin: self.config.plugin.clone(),
            status: state.status,
            start_time: state.start_time,
            end_time: state.end_time,
            duration,
            error_message: state.error_message.clone(),
        }
    }
}

struct OrchestratorInner {
    registry: Arc<PluginRegistry>,
    monitor: Arc<SafetyMonitor>,
    collector: Arc<MetricsCollector>,
    bus: EventBus,
    global_limits: GlobalLimits,
    executions: RwLock<HashMap<Uuid, Arc<ExecutionHandle>>>,
}

/// Top of the engine core. Cheap to clone; all public operations are safe to
/// call concurrently and status reads see consistent snapshots.
#[derive(Clone)]
pub struct TestOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl TestOrchestrator {
    pub fn new(
        registry: Arc<PluginRegistry>,
        monitor: Arc<SafetyMonitor>,
        collector: Arc<MetricsCollector>,
        bus: EventBus,
        global_limits: GlobalLimits,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                registry,
                monitor,
                collector,
                bus,
                global_limits,
                executions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Start a new test execution and return its id.
    ///
    /// Fails synchronously with `UnknownPlugin` or `InvalidConfig`; in that
    /// case no execution is created. Must be called from within a tokio
    /// runtime.
    pub fn start_test(&self, config: TestConfiguration, params: TestParams) -> Result<Uuid> {
        params.validate()?;
        let plugin = self
            .inner
            .registry
            .instantiate(&config.plugin)
            .ok_or_else(|| EngineError::unknown_plugin(&config.plugin))?;

        if self.inner.monitor.is_in_cooldown() {
            // Advisory only; starts are never blocked by cooldown.
            log::warn!(
                "starting execution while monitor is in cooldown plugin={}",
                config.plugin
            );
        }

        let id = Uuid::new_v4();
        let deadline = Instant::now() + params.duration;
        let handle = Arc::new(ExecutionHandle::new(id, config, deadline));
        self.inner
            .executions
            .write()
            .unwrap()
            .insert(id, Arc::clone(&handle));

        // The deadline is modelled as an automatic cancellation.
        let watchdog_cancel = handle.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watchdog_cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => watchdog_cancel.cancel(),
            }
        });

        log::info!(
            "test execution started execution_id={id} plugin={} duration={:?}",
            handle.config.plugin,
            params.duration
        );

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_execution(handle, plugin, params).await;
        });

        Ok(id)
    }

    /// Cancel a running execution; it transitions to Stopped once the
    /// workload observes the cancellation.
    pub fn stop_test(&self, execution_id: Uuid) -> Result<()> {
        let handle = self.get(execution_id)?;
        {
            let state = handle.state.read().unwrap();
            if state.status != ExecutionStatus::Running {
                return Err(EngineError::NotRunning(state.status.to_string()));
            }
        }
        handle.cancel.cancel();
        log::info!("test execution stop requested execution_id={execution_id}");
        Ok(())
    }

    /// Cut an execution immediately: cancel it and mark it Failed with
    /// `reason`, without waiting for cancellation to propagate. Succeeds for
    /// any known execution.
    pub fn emergency_stop(&self, execution_id: Uuid, reason: impl Into<String>) -> Result<()> {
        let handle = self.get(execution_id)?;
        let reason = reason.into();
        handle.cancel.cancel();
        if handle
            .finish(ExecutionStatus::Failed, Some(reason.clone()))
            .is_err()
        {
            log::debug!("emergency stop on already-finished execution {execution_id}");
        }
        log::error!("emergency stop executed execution_id={execution_id} reason={reason}");
        Ok(())
    }

    /// Consistent snapshot of one execution.
    pub fn get_status(&self, execution_id: Uuid) -> Result<ExecutionRecord> {
        Ok(self.get(execution_id)?.snapshot())
    }

    /// Snapshots of all non-reaped executions.
    pub fn list_executions(&self) -> Vec<ExecutionRecord> {
        self.inner
            .executions
            .read()
            .unwrap()
            .values()
            .map(|handle| handle.snapshot())
            .collect()
    }

    /// Copy of the execution's accumulated metric points.
    pub fn get_metrics(&self, execution_id: Uuid) -> Result<Vec<MetricPoint>> {
        let handle = self.get(execution_id)?;
        let metrics = handle.metrics.lock().unwrap();
        Ok(metrics.clone())
    }

    /// Remove terminal executions whose end time is older than `max_age`.
    /// Running and pending executions are never touched.
    pub fn reap_completed(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut executions = self.inner.executions.write().unwrap();
        let before = executions.len();
        executions.retain(|_, handle| {
            let state = handle.state.read().unwrap();
            let expired =
                state.status.is_terminal() && state.end_time.is_some_and(|end| end < cutoff);
            !expired
        });
        let reaped = before - executions.len();
        if reaped > 0 {
            log::info!("reaped {reaped} completed executions");
        }
        reaped
    }

    fn get(&self, execution_id: Uuid) -> Result<Arc<ExecutionHandle>> {
        self.inner
            .executions
            .read()
            .unwrap()
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(execution_id.to_string()))
    }

    async fn run_execution(
        self,
        handle: Arc<ExecutionHandle>,
        plugin: Arc<dyn StressPlugin>,
        params: TestParams,
    ) {
        handle.set_running();
        self.inner.bus.publish(EngineEvent::ExecutionStarted {
            execution_id: handle.id,
            config_name: handle.config.name.clone(),
        });

        // Support tasks (watcher, collection) stop when the execution is
        // cancelled or, via an explicit cancel below, when it completes.
        let support = handle.cancel.child_token();

        let mut limits = plugin.safety_limits();
        if let Some(override_limits) = &handle.config.safety {
            limits = limits.tightened(override_limits);
        }
        let limits = self.inner.global_limits.apply_to(limits);

        let watcher = tokio::spawn(self.clone().safety_watcher(
            Arc::clone(&handle),
            limits,
            support.clone(),
        ));
        {
            let execution_id = handle.id;
            tokio::spawn(async move {
                if let Err(err) = watcher.await {
                    if err.is_panic() {
                        log::error!(
                            "safety watcher faulted; execution {execution_id} is now unsupervised: {err}"
                        );
                    }
                }
            });
        }

        self.inner.collector.start_collection(
            handle.id,
            Arc::clone(&plugin),
            Arc::clone(&handle.metrics),
            &support,
        );

        if let Err(err) = plugin.initialize(&handle.config.config) {
            // No Execute, and per the plugin contract no Cleanup either.
            support.cancel();
            self.inner.collector.stop_collection(handle.id);
            let _ = handle.finish(
                ExecutionStatus::Failed,
                Some(format!("initialize failed: {err}")),
            );
            self.publish_finished(&handle);
            return;
        }

        let joined = {
            let plugin = Arc::clone(&plugin);
            let cancel = handle.cancel.clone();
            tokio::spawn(async move { plugin.execute(cancel, params).await }).await
        };

        let (status, error) = match joined {
            Err(join_err) => (
                ExecutionStatus::Failed,
                Some(format!("workload faulted: {}", fault_message(join_err))),
            ),
            Ok(Ok(())) => (ExecutionStatus::Completed, None),
            Ok(Err(err)) if err.is_cancelled() => {
                if Instant::now() >= handle.deadline {
                    (ExecutionStatus::Completed, None)
                } else {
                    (
                        ExecutionStatus::Stopped,
                        Some("test stopped before deadline".into()),
                    )
                }
            }
            Ok(Err(err)) => (ExecutionStatus::Failed, Some(err.to_string())),
        };

        if let Err(err) = plugin.cleanup() {
            log::warn!("plugin cleanup failed execution_id={}: {err}", handle.id);
        }

        support.cancel();
        self.inner.collector.stop_collection(handle.id);

        // An emergency stop may already have performed the terminal
        // transition; in that case its verdict stands.
        if handle.finish(status, error).is_err() {
            log::debug!("execution {} already finished", handle.id);
        }
        self.publish_finished(&handle);
    }

    async fn safety_watcher(
        self,
        handle: Arc<ExecutionHandle>,
        limits: SafetyLimits,
        token: CancellationToken,
    ) {
        let mut ticker = interval(self.inner.monitor.config().check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut emergency_rx = self.inner.monitor.subscribe_emergency();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(violation) = self.inner.monitor.check_limits(&limits) {
                        log::warn!(
                            "safety limit violation execution_id={} kind={} value={:.1} limit={:.1}",
                            handle.id,
                            violation.kind,
                            violation.current_value,
                            violation.limit
                        );
                        if violation.critical {
                            let _ = self.emergency_stop(
                                handle.id,
                                format!("critical safety violation: {}", violation.message),
                            );
                            break;
                        }
                    }
                    self.inner.monitor.periodic_check();
                }
                received = emergency_rx.recv() => {
                    match received {
                        Ok(reason) => {
                            let _ = self.emergency_stop(handle.id, reason);
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    fn publish_finished(&self, handle: &ExecutionHandle) {
        let record = handle.snapshot();
        log::info!(
            "test execution finished execution_id={} status={} duration={:?}",
            record.id,
            record.status,
            record.duration
        );
        self.inner.bus.publish(EngineEvent::ExecutionFinished {
            execution_id: record.id,
            status: record.status,
            duration: record.duration,
            error: record.error_message,
        });
    }
}

fn fault_message(err: tokio::task::JoinError) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic".into()
        }
    } else {
        "workload task aborted".into()
    }
}
