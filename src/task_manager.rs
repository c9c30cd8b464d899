//! Registry of running strategy tasks.
//!
//! Every running strategy owns one entry in a sharded map keyed by
//! [`StrategyKey`]. A key moves `ABSENT -> RUNNING` only through
//! [`TaskLifecycleManager::start`] and back to `ABSENT` either through
//! [`TaskLifecycleManager::stop`] or when the task terminates. Termination
//! cleanup lives in a guard owned by the spawned future, so it runs exactly
//! once on every exit path: normal return, error, panic, or abort.
//!
//! With a non-zero `abort_grace`, a stopped entry stays registered as
//! `STOPPING` until its body has exited, so a new start for the key waits
//! for the old body instead of running beside it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::instance::{StopSignal, StrategyInstance};
use crate::strategy_type::{StrategyKey, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A task for the key was already registered (running or still winding
    /// down); nothing changed.
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Cancellation was requested. The body may still be winding down.
    Stopped,
    /// Nothing registered for the key, or a stop is already in progress.
    NotRunning,
}

/// How the most recent task for a key ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    Completed,
    Failed(String),
    Cancelled,
    Panicked,
}

struct RunningTask {
    run_id: u64,
    instance: Arc<StrategyInstance>,
    handle: JoinHandle<()>,
    /// Stop requested, body still inside its abort grace.
    stopping: bool,
}

#[derive(Default)]
struct Shared {
    tasks: DashMap<StrategyKey, RunningTask>,
    exits: DashMap<StrategyKey, TaskExit>,
    per_tenant: DashMap<TenantId, usize>,
    total: AtomicUsize,
}

impl Shared {
    /// Claim an admission slot. Called with the key's shard locked, so it
    /// must not touch `tasks`.
    fn reserve(&self, tenant: TenantId, config: &SchedulerConfig) -> Result<(), SchedulerError> {
        let total = self.total.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(limit) = config.max_tasks_total {
            if total > limit {
                self.total.fetch_sub(1, Ordering::AcqRel);
                return Err(SchedulerError::TaskLimitReached {
                    tenant,
                    running: total - 1,
                    limit,
                });
            }
        }

        let mut count = self.per_tenant.entry(tenant).or_insert(0);
        if let Some(limit) = config.max_tasks_per_tenant {
            if *count >= limit {
                let running = *count;
                drop(count);
                self.total.fetch_sub(1, Ordering::AcqRel);
                return Err(SchedulerError::TaskLimitReached {
                    tenant,
                    running,
                    limit,
                });
            }
        }
        *count += 1;
        Ok(())
    }

    /// Give back the slot of an entry that has just been removed from `tasks`.
    fn release(&self, tenant: TenantId) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.per_tenant.remove_if_mut(&tenant, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

/// Owns the currently executing strategies and enforces at most one task per
/// [`StrategyKey`].
///
/// `start` and `stop` never wait on a strategy body; they only take the map's
/// shard lock for the key. `start` needs a tokio runtime and fails with
/// [`SchedulerError::NoRuntime`] without one.
pub struct TaskLifecycleManager {
    config: SchedulerConfig,
    shared: Arc<Shared>,
    next_run_id: AtomicU64,
}

impl Default for TaskLifecycleManager {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl TaskLifecycleManager {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            next_run_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register `instance` and spawn its run body, unless a task for the same
    /// key is already registered.
    ///
    /// The spawned future only receives its registration guard once the shard
    /// lock is released. A future dropped early (runtime shutting down, or
    /// an immediate abort) therefore never touches the map under our own
    /// lock; the registration comes back here and is dropped unlocked.
    pub fn start(&self, instance: StrategyInstance) -> Result<StartOutcome, SchedulerError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let key = instance.key().clone();

        let (gate, registration) = match self.shared.tasks.entry(key.clone()) {
            Entry::Occupied(existing) => {
                let task = existing.get();
                if task.stopping {
                    log::info!(
                        "strategy {} is still winding down (run #{}); start ignored",
                        key,
                        task.run_id
                    );
                } else {
                    log::info!(
                        "strategy {} already running (run #{}); start ignored",
                        key,
                        task.run_id
                    );
                }
                return Ok(StartOutcome::AlreadyRunning);
            }
            Entry::Vacant(slot) => {
                self.shared.reserve(key.tenant_id, &self.config)?;

                let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
                let instance = Arc::new(instance);
                let registration = Registration {
                    shared: self.shared.clone(),
                    key: key.clone(),
                    run_id,
                    stop: instance.stop_signal(),
                    exit: None,
                };

                let (gate, opened) = oneshot::channel::<Registration>();
                let runner = instance.clone();
                let handle = runtime.spawn(async move {
                    let Ok(mut registration) = opened.await else {
                        return;
                    };
                    let exit = match runner.run().await {
                        Ok(()) if runner.stop_signal().is_stopped() => TaskExit::Cancelled,
                        Ok(()) => TaskExit::Completed,
                        Err(err) => {
                            log::error!("strategy {} failed: {}", runner.key(), err);
                            TaskExit::Failed(err.to_string())
                        }
                    };
                    registration.exit = Some(exit);
                });

                slot.insert(RunningTask {
                    run_id,
                    instance,
                    handle,
                    stopping: false,
                });
                (gate, registration)
            }
        };

        let run_id = registration.run_id;
        if let Err(mut registration) = gate.send(registration) {
            // The future is gone before it ever ran. Dropping the
            // registration here deregisters the run and frees its slot.
            let stopped = registration.stop.is_stopped();
            registration.exit = Some(TaskExit::Cancelled);
            drop(registration);
            if !stopped {
                log::warn!("strategy {} could not be spawned: runtime is shutting down", key);
                return Err(SchedulerError::NoRuntime);
            }
        }
        log::info!("strategy {} started (run #{})", key, run_id);
        Ok(StartOutcome::Started)
    }

    pub fn stop(&self, instance: &StrategyInstance) -> StopOutcome {
        self.stop_key(instance.key())
    }

    /// Raise the stop flag of the registered instance, then abort its task
    /// (after `abort_grace`, if configured). Returns without waiting for the
    /// body to exit.
    ///
    /// Without a grace the entry is removed at once. With one, the entry is
    /// kept as stopping and removed by the task itself when the body exits,
    /// cooperatively or through the abort.
    pub fn stop_key(&self, key: &StrategyKey) -> StopOutcome {
        if self.config.abort_grace.is_zero() {
            return self.stop_now(key);
        }

        let Some(mut task) = self.shared.tasks.get_mut(key) else {
            log::debug!("strategy {} is not running; stop ignored", key);
            return StopOutcome::NotRunning;
        };
        if task.stopping {
            log::debug!("strategy {} is already stopping (run #{})", key, task.run_id);
            return StopOutcome::NotRunning;
        }
        task.stopping = true;
        let run_id = task.run_id;
        let instance = task.instance.clone();
        let abort = task.handle.abort_handle();
        drop(task);

        instance.stop();
        self.abort_after_grace(abort);
        log::info!("strategy {} stop requested (run #{})", key, run_id);
        StopOutcome::Stopped
    }

    fn stop_now(&self, key: &StrategyKey) -> StopOutcome {
        let Some((key, task)) = self.shared.tasks.remove(key) else {
            log::debug!("strategy {} is not running; stop ignored", key);
            return StopOutcome::NotRunning;
        };
        self.shared.release(key.tenant_id);

        task.instance.stop();
        task.handle.abort();
        log::info!("strategy {} stop requested (run #{})", key, task.run_id);
        StopOutcome::Stopped
    }

    fn abort_after_grace(&self, abort: AbortHandle) {
        let grace = self.config.abort_grace;
        if abort.is_finished() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if !abort.is_finished() {
                        log::warn!("strategy task ignored its stop flag for {:?}; aborting", grace);
                        abort.abort();
                    }
                });
            }
            Err(_) => abort.abort(),
        }
    }

    /// True while a task is registered for the key, including one that is
    /// still winding down after a stop.
    pub fn is_running(&self, instance: &StrategyInstance) -> bool {
        self.is_running_key(instance.key())
    }

    pub fn is_running_key(&self, key: &StrategyKey) -> bool {
        self.shared.tasks.contains_key(key)
    }

    pub fn running_count(&self) -> usize {
        self.shared.tasks.len()
    }

    pub fn running_keys(&self) -> Vec<StrategyKey> {
        let mut keys: Vec<_> = self
            .shared
            .tasks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn running_for_tenant(&self, tenant: TenantId) -> Vec<StrategyKey> {
        let mut keys: Vec<_> = self
            .shared
            .tasks
            .iter()
            .filter(|entry| entry.key().tenant_id == tenant)
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn last_exit(&self, key: &StrategyKey) -> Option<TaskExit> {
        self.shared.exits.get(key).map(|exit| exit.clone())
    }

    /// Stop every strategy of `tenant`. Returns how many were stopped.
    pub fn stop_tenant(&self, tenant: TenantId) -> usize {
        self.running_for_tenant(tenant)
            .iter()
            .filter(|key| self.stop_key(key) == StopOutcome::Stopped)
            .count()
    }

    /// Stop everything. Returns how many were stopped.
    pub fn shutdown(&self) -> usize {
        let stopped = self
            .running_keys()
            .iter()
            .filter(|key| self.stop_key(key) == StopOutcome::Stopped)
            .count();
        log::info!("task manager shut down, {} strategies stopped", stopped);
        stopped
    }
}

/// Owned by a spawned task; dropping it deregisters that task's run.
struct Registration {
    shared: Arc<Shared>,
    key: StrategyKey,
    run_id: u64,
    stop: StopSignal,
    exit: Option<TaskExit>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        // No recorded exit means the future was dropped mid-run. Aborts are
        // always preceded by a stop request; otherwise the runtime is
        // dropping the future after catching a panic out of it.
        let exit = self.exit.take().unwrap_or_else(|| {
            if self.stop.is_stopped() && !std::thread::panicking() {
                TaskExit::Cancelled
            } else {
                TaskExit::Panicked
            }
        });
        if exit == TaskExit::Panicked {
            log::error!("strategy {} panicked", self.key);
        }

        self.shared.exits.insert(self.key.clone(), exit.clone());

        // A stop() may already have removed this run, and a newer run may
        // own the key by now; only remove our own entry.
        let removed = self
            .shared
            .tasks
            .remove_if(&self.key, |_, task| task.run_id == self.run_id);
        if removed.is_some() {
            self.shared.release(self.key.tenant_id);
            log::info!(
                "strategy {} terminated (run #{}): {:?}",
                self.key,
                self.run_id,
                exit
            );
        } else {
            log::debug!(
                "strategy {} run #{} exited after being stopped: {:?}",
                self.key,
                self.run_id,
                exit
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrategyError;
    use crate::instance::{StopSignal, Strategy};
    use crate::strategy_type::StrategyType;
    use async_trait::async_trait;
    use std::time::Duration;

    fn logging_init() {
        let _ = env_logger::builder()
            .format_timestamp_millis()
            .is_test(true)
            .try_init();
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        UntilStopped,
        /// Never looks at its stop flag.
        Stubborn,
        FailAfter(Duration),
        PanicAfter(Duration),
        CompleteAfter(Duration),
        /// Sees its stop flag only every 60ms.
        SlowWindDown,
    }

    struct Scripted {
        strategy_type: StrategyType,
        behaviour: Behaviour,
        runs: Arc<AtomicUsize>,
        /// Bodies currently inside `run`, and the most ever seen at once.
        live: AtomicUsize,
        max_live: AtomicUsize,
    }

    impl Scripted {
        fn new(strategy_type: StrategyType, behaviour: Behaviour) -> Self {
            Self {
                strategy_type,
                behaviour,
                runs: Arc::new(AtomicUsize::new(0)),
                live: AtomicUsize::new(0),
                max_live: AtomicUsize::new(0),
            }
        }
    }

    struct Live<'a>(&'a AtomicUsize);

    impl Drop for Live<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Strategy for Scripted {
        fn strategy_type(&self) -> StrategyType {
            self.strategy_type
        }

        async fn run(&self, _tenant: TenantId, stop: StopSignal) -> Result<(), StrategyError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now_live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(now_live, Ordering::SeqCst);
            let _live = Live(&self.live);
            match self.behaviour {
                Behaviour::UntilStopped => {
                    while stop.sleep(Duration::from_millis(5)).await {}
                    Ok(())
                }
                Behaviour::Stubborn => loop {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                },
                Behaviour::FailAfter(d) => {
                    tokio::time::sleep(d).await;
                    Err(StrategyError::Settings("boom".to_owned()))
                }
                Behaviour::PanicAfter(d) => {
                    tokio::time::sleep(d).await;
                    panic!("strategy body panicked");
                }
                Behaviour::CompleteAfter(d) => {
                    tokio::time::sleep(d).await;
                    Ok(())
                }
                Behaviour::SlowWindDown => {
                    while !stop.is_stopped() {
                        tokio::time::sleep(Duration::from_millis(60)).await;
                    }
                    Ok(())
                }
            }
        }
    }

    fn instance(tenant: TenantId, strategy: &Arc<Scripted>) -> StrategyInstance {
        StrategyInstance::new(tenant, strategy.clone())
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn duplicate_start_keeps_one_task() {
        logging_init();
        let manager = TaskLifecycleManager::default();
        let strategy = Arc::new(Scripted::new(StrategyType::Scalping, Behaviour::UntilStopped));

        assert_eq!(manager.start(instance(1, &strategy)), Ok(StartOutcome::Started));
        assert_eq!(
            manager.start(instance(1, &strategy)),
            Ok(StartOutcome::AlreadyRunning)
        );
        wait_until(|| strategy.runs.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(strategy.runs.load(Ordering::SeqCst), 1);
        assert_eq!(manager.running_count(), 1);
        assert_eq!(manager.stop(&instance(1, &strategy)), StopOutcome::Stopped);
    }

    #[tokio::test]
    async fn stop_without_task_is_noop() {
        logging_init();
        let manager = TaskLifecycleManager::default();
        let strategy = Arc::new(Scripted::new(StrategyType::RsiEma, Behaviour::UntilStopped));
        assert_eq!(manager.stop(&instance(9, &strategy)), StopOutcome::NotRunning);
        assert_eq!(manager.stop(&instance(9, &strategy)), StopOutcome::NotRunning);
        assert!(!manager.is_running(&instance(9, &strategy)));
    }

    #[tokio::test]
    async fn stop_with_grace_keeps_key_until_body_exits() {
        logging_init();
        let manager = TaskLifecycleManager::new(
            SchedulerConfig::builder()
                .abort_grace(Duration::from_secs(5))
                .build()
                .unwrap(),
        );
        let strategy = Arc::new(Scripted::new(StrategyType::Scalping, Behaviour::UntilStopped));
        let key = StrategyKey::new(1, "SCALPING");

        manager.start(instance(1, &strategy)).unwrap();
        wait_until(|| strategy.runs.load(Ordering::SeqCst) == 1).await;
        assert!(manager.is_running_key(&key));

        assert_eq!(manager.stop_key(&key), StopOutcome::Stopped);
        // a second stop while winding down changes nothing
        assert_eq!(manager.stop_key(&key), StopOutcome::NotRunning);

        // the body polls every 5ms; grace is far longer, so this exit is
        // cooperative
        wait_until(|| !manager.is_running_key(&key)).await;
        assert_eq!(manager.last_exit(&key), Some(TaskExit::Cancelled));
        assert_eq!(manager.shared.total.load(Ordering::SeqCst), 0);
        assert!(manager.shared.per_tenant.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_during_grace_waits_for_old_body() {
        logging_init();
        let manager = TaskLifecycleManager::new(
            SchedulerConfig::builder()
                .abort_grace(Duration::from_millis(500))
                .build()
                .unwrap(),
        );
        // takes ~60ms to notice its stop flag, well inside the grace
        let strategy = Arc::new(Scripted::new(StrategyType::Scalping, Behaviour::SlowWindDown));
        let key = StrategyKey::new(1, "SCALPING");

        manager.start(instance(1, &strategy)).unwrap();
        wait_until(|| strategy.live.load(Ordering::SeqCst) == 1).await;

        assert_eq!(manager.stop_key(&key), StopOutcome::Stopped);
        assert_eq!(
            manager.start(instance(1, &strategy)),
            Ok(StartOutcome::AlreadyRunning)
        );
        assert!(manager.is_running_key(&key));
        assert_eq!(strategy.runs.load(Ordering::SeqCst), 1);

        wait_until(|| !manager.is_running_key(&key)).await;
        assert_eq!(strategy.live.load(Ordering::SeqCst), 0);
        assert_eq!(manager.last_exit(&key), Some(TaskExit::Cancelled));

        assert_eq!(manager.start(instance(1, &strategy)), Ok(StartOutcome::Started));
        wait_until(|| strategy.runs.load(Ordering::SeqCst) == 2).await;
        assert_eq!(strategy.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(manager.shared.total.load(Ordering::SeqCst), 1);
        manager.shutdown();
    }

    #[test]
    fn start_without_runtime_is_refused() {
        logging_init();
        let manager = Arc::new(TaskLifecycleManager::default());
        let strategy = Arc::new(Scripted::new(StrategyType::Scalping, Behaviour::UntilStopped));

        let (done, outcome) = std::sync::mpsc::channel();
        {
            let manager = manager.clone();
            let strategy = strategy.clone();
            std::thread::spawn(move || {
                let _ = done.send(manager.start(instance(1, &strategy)));
            });
        }
        let result = outcome
            .recv_timeout(Duration::from_secs(3))
            .expect("start blocked outside a runtime");
        assert_eq!(result, Err(SchedulerError::NoRuntime));
        assert_eq!(manager.running_count(), 0);
        assert_eq!(manager.shared.total.load(Ordering::SeqCst), 0);
        assert!(manager.shared.per_tenant.is_empty());

        // the key stays usable once a runtime is around
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            assert_eq!(manager.start(instance(1, &strategy)), Ok(StartOutcome::Started));
            assert!(manager.is_running_key(&StrategyKey::new(1, "SCALPING")));
            manager.shutdown();
        });
    }

    #[test]
    fn start_on_shut_down_runtime_leaves_no_entry() {
        logging_init();
        let manager = TaskLifecycleManager::default();
        let strategy = Arc::new(Scripted::new(StrategyType::RsiEma, Behaviour::UntilStopped));

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = rt.handle().clone();
        drop(rt);

        let _entered = handle.enter();
        assert_eq!(
            manager.start(instance(4, &strategy)),
            Err(SchedulerError::NoRuntime)
        );
        assert_eq!(manager.running_count(), 0);
        assert_eq!(manager.shared.total.load(Ordering::SeqCst), 0);
        assert!(manager.shared.per_tenant.is_empty());
        // the shard is not left locked
        assert!(!manager.is_running_key(&StrategyKey::new(4, "RSI_EMA")));
        assert_eq!(strategy.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn abort_backstop_stops_stubborn_body() {
        logging_init();
        let manager = TaskLifecycleManager::new(
            SchedulerConfig::builder()
                .abort_grace(Duration::from_millis(30))
                .build()
                .unwrap(),
        );
        let strategy = Arc::new(Scripted::new(StrategyType::MaCrossover, Behaviour::Stubborn));
        let key = StrategyKey::new(3, "MA_CROSSOVER");

        manager.start(instance(3, &strategy)).unwrap();
        wait_until(|| strategy.runs.load(Ordering::SeqCst) == 1).await;
        manager.stop_key(&key);
        // still registered while the grace runs
        assert!(manager.is_running_key(&key));

        wait_until(|| !manager.is_running_key(&key)).await;
        assert_eq!(manager.last_exit(&key), Some(TaskExit::Cancelled));
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn natural_completion_removes_key() {
        logging_init();
        let manager = TaskLifecycleManager::default();
        let strategy = Arc::new(Scripted::new(
            StrategyType::BollingerBands,
            Behaviour::CompleteAfter(Duration::from_millis(10)),
        ));
        let key = StrategyKey::new(5, "BOLLINGER_BANDS");

        manager.start(instance(5, &strategy)).unwrap();
        wait_until(|| !manager.is_running_key(&key)).await;
        assert_eq!(manager.last_exit(&key), Some(TaskExit::Completed));

        // stop after natural termination observes absence
        assert_eq!(manager.stop_key(&key), StopOutcome::NotRunning);
        // and the key can be started again
        assert_eq!(manager.start(instance(5, &strategy)), Ok(StartOutcome::Started));
        manager.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failing_tenant_does_not_affect_others() {
        logging_init();
        let manager = TaskLifecycleManager::default();
        let healthy = Arc::new(Scripted::new(StrategyType::Scalping, Behaviour::UntilStopped));
        let failing = Arc::new(Scripted::new(
            StrategyType::Scalping,
            Behaviour::FailAfter(Duration::from_millis(10)),
        ));
        let panicking = Arc::new(Scripted::new(
            StrategyType::FibonacciGrid,
            Behaviour::PanicAfter(Duration::from_millis(10)),
        ));

        manager.start(instance(1, &healthy)).unwrap();
        manager.start(instance(2, &failing)).unwrap();
        manager.start(instance(2, &panicking)).unwrap();

        let failed_key = StrategyKey::new(2, "SCALPING");
        let panicked_key = StrategyKey::new(2, "FIBONACCI_GRID");
        wait_until(|| {
            !manager.is_running_key(&failed_key) && !manager.is_running_key(&panicked_key)
        })
        .await;

        assert_eq!(
            manager.last_exit(&failed_key),
            Some(TaskExit::Failed("settings error: boom".to_owned()))
        );
        assert_eq!(manager.last_exit(&panicked_key), Some(TaskExit::Panicked));
        assert!(manager.is_running_key(&StrategyKey::new(1, "SCALPING")));
        assert!(manager.running_for_tenant(2).is_empty());
        manager.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_start_stop_keeps_registry_consistent() {
        logging_init();
        let manager = Arc::new(TaskLifecycleManager::default());
        let strategy = Arc::new(Scripted::new(StrategyType::RsiEma, Behaviour::UntilStopped));

        let mut workers = tokio::task::JoinSet::new();
        for worker in 0..8i64 {
            let manager = manager.clone();
            let strategy = strategy.clone();
            workers.spawn(async move {
                for round in 0..200i64 {
                    let tenant = (worker + round) % 4;
                    if (worker + round) % 3 == 0 {
                        manager.stop(&StrategyInstance::new(tenant, strategy.clone()));
                    } else {
                        let _ = manager.start(StrategyInstance::new(tenant, strategy.clone()));
                    }
                    if round % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            });
        }
        while let Some(res) = workers.join_next().await {
            res.unwrap();
        }

        // after quiescence every registered key has a live body behind it
        let keys = manager.running_keys();
        assert!(keys.len() <= 4);
        for key in &keys {
            let entry = manager.shared.tasks.get(key).unwrap();
            assert!(!entry.handle.is_finished());
            assert!(!entry.instance.stop_signal().is_stopped());
        }
        assert_eq!(manager.shared.total.load(Ordering::SeqCst), keys.len());

        assert_eq!(manager.shutdown(), keys.len());
        assert_eq!(manager.running_count(), 0);
        assert_eq!(manager.shared.total.load(Ordering::SeqCst), 0);
        assert!(manager.shared.per_tenant.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn churn_with_short_lived_bodies_keeps_registry_consistent() {
        logging_init();
        let manager = Arc::new(TaskLifecycleManager::default());
        // even slots run until stopped, odd slots finish on their own within
        // 0..2ms, so stops race natural termination
        let strategies: Vec<Arc<Scripted>> = StrategyType::ALL[..4]
            .iter()
            .enumerate()
            .map(|(i, strategy_type)| {
                let behaviour = if i % 2 == 0 {
                    Behaviour::UntilStopped
                } else {
                    Behaviour::CompleteAfter(Duration::from_micros(1_000 * (i as u64 - 1)))
                };
                Arc::new(Scripted::new(*strategy_type, behaviour))
            })
            .collect();

        let mut workers = tokio::task::JoinSet::new();
        for worker in 0..8i64 {
            let manager = manager.clone();
            let strategies = strategies.clone();
            workers.spawn(async move {
                for round in 0..300i64 {
                    let tenant = (worker + round) % 4;
                    let strategy = &strategies[((worker * 3 + round) % 4) as usize];
                    if (worker * 7 + round) % 5 < 2 {
                        manager.stop(&StrategyInstance::new(tenant, strategy.clone()));
                    } else {
                        let _ = manager.start(StrategyInstance::new(tenant, strategy.clone()));
                    }
                    if round % 8 == 0 {
                        tokio::task::yield_now().await;
                    }
                    if round % 50 == 0 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
            });
        }
        while let Some(res) = workers.join_next().await {
            res.unwrap();
        }

        // let every short-lived body finish
        tokio::time::sleep(Duration::from_millis(50)).await;

        let long_lived = [strategies[0].strategy_type, strategies[2].strategy_type];
        let keys = manager.running_keys();
        for key in &keys {
            let entry = manager.shared.tasks.get(key).unwrap();
            assert!(!entry.handle.is_finished(), "{} registered without a live body", key);
            assert!(
                long_lived.contains(&entry.instance.strategy_type()),
                "{} should have terminated",
                key
            );
        }
        assert_eq!(manager.shared.total.load(Ordering::SeqCst), keys.len());
        for tenant in 0..4 {
            let counted = manager.shared.per_tenant.get(&tenant).map_or(0, |c| *c);
            assert_eq!(counted, manager.running_for_tenant(tenant).len());
        }

        manager.shutdown();
        assert_eq!(manager.running_count(), 0);
        assert_eq!(manager.shared.total.load(Ordering::SeqCst), 0);
        assert!(manager.shared.per_tenant.is_empty());
    }

    #[tokio::test]
    async fn per_tenant_limit_is_enforced() {
        logging_init();
        let manager = TaskLifecycleManager::new(
            SchedulerConfig::builder()
                .max_tasks_per_tenant(1)
                .build()
                .unwrap(),
        );
        let scalping = Arc::new(Scripted::new(StrategyType::Scalping, Behaviour::UntilStopped));
        let grid = Arc::new(Scripted::new(StrategyType::FibonacciGrid, Behaviour::UntilStopped));

        manager.start(instance(1, &scalping)).unwrap();
        assert_eq!(
            manager.start(instance(1, &grid)),
            Err(SchedulerError::TaskLimitReached {
                tenant: 1,
                running: 1,
                limit: 1
            })
        );
        // other tenants are unaffected, and a duplicate is still a no-op
        assert_eq!(manager.start(instance(2, &grid)), Ok(StartOutcome::Started));
        assert_eq!(
            manager.start(instance(1, &scalping)),
            Ok(StartOutcome::AlreadyRunning)
        );

        manager.stop(&instance(1, &scalping));
        assert_eq!(manager.start(instance(1, &grid)), Ok(StartOutcome::Started));
        assert_eq!(manager.stop_tenant(1), 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn global_limit_is_enforced() {
        logging_init();
        let manager = TaskLifecycleManager::new(
            SchedulerConfig::builder().max_tasks_total(2).build().unwrap(),
        );
        let strategy = Arc::new(Scripted::new(StrategyType::Scalping, Behaviour::UntilStopped));

        manager.start(instance(1, &strategy)).unwrap();
        manager.start(instance(2, &strategy)).unwrap();
        assert!(matches!(
            manager.start(instance(3, &strategy)),
            Err(SchedulerError::TaskLimitReached { limit: 2, .. })
        ));
        assert_eq!(manager.running_count(), 2);
        manager.shutdown();
    }
}
