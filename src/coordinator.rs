//! Coordinator - fan-out and join
//!
//! `Coordinator` starts a batch of workers through a [`Spawner`] and hands
//! back a [`Batch`]. The batch owns the worker table and the receiving end of
//! the completion channel; every join goes through it.
//!
//! Workers finish in any order. Each completion event names the OS identity
//! of the worker that ended and the table maps it back to a [`WorkerId`].
//! Nothing here relies on spawn order or array position.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::io;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{Consumer, ResultValue};
use crate::core::config::{FanOutConfig, FanOutMode};
use crate::core::errors::{FanOutError, Result};
use crate::counter::SharedCounter;
use crate::spawn::{EventReceiver, ProcessSpawner, Spawner, Termination, ThreadSpawner};
use crate::table::{Resolution, ResultStatus, SpawnStatus, WorkerId, WorkerTable};
use crate::task::{TaskInput, TaskRegistry};

/// Entry point for fan-out
#[derive(Debug, Clone)]
pub struct Coordinator {
    config: FanOutConfig,
    registry: TaskRegistry,
}

impl Coordinator {
    /// Coordinator with the built-in tasks
    pub fn new(config: FanOutConfig) -> Result<Self> {
        Self::with_registry(config, TaskRegistry::with_builtins())
    }

    pub fn with_registry(config: FanOutConfig, registry: TaskRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &FanOutConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Spawner for `task` in the configured mode.
    ///
    /// Process workers resolve the task name in their own registry, so the
    /// name is not checked here.
    pub fn spawner(&self, task: &str) -> Result<Box<dyn Spawner>> {
        match self.config.mode {
            FanOutMode::Thread => {
                let body = self.registry.get(task)?;
                Ok(Box::new(ThreadSpawner::from_config(body, &self.config)?))
            }
            FanOutMode::Process => Ok(Box::new(ProcessSpawner::from_config(task, &self.config)?)),
        }
    }

    /// Fan `task` out over `inputs`, one worker per input.
    pub fn spawn_batch(&self, task: &str, inputs: Vec<TaskInput>) -> Result<Batch> {
        let spawner = self.spawner(task)?;
        self.spawn_batch_with(spawner.as_ref(), inputs)
    }

    /// `n` workers, each given its own id as input.
    pub fn spawn_ids(&self, task: &str, n: usize) -> Result<Batch> {
        let inputs = (1..=n as i64).map(TaskInput::from).collect();
        self.spawn_batch(task, inputs)
    }

    /// Fan out through a caller-supplied spawner.
    ///
    /// The first failed spawn stops the fan-out: nothing is attempted past
    /// that index and no batch is returned. Workers already running are
    /// detached.
    pub fn spawn_batch_with(&self, spawner: &dyn Spawner, inputs: Vec<TaskInput>) -> Result<Batch> {
        let id = Uuid::new_v4();
        let mode = spawner.mode();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = WorkerTable::new();

        info!(batch = %id, workers = inputs.len(), mode = %mode, "fanning out");

        for (index, input) in inputs.into_iter().enumerate() {
            let worker = table.allocate_id();
            table.register(worker, input.clone())?;

            let attempt = if index >= self.config.max_workers {
                Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    format!("worker slot limit of {} reached", self.config.max_workers),
                ))
            } else {
                spawner.spawn(worker, &input, &tx)
            };

            let attempt = attempt.and_then(|spawned| {
                let origin = spawned.origin;
                match table.mark_spawned(worker, spawned) {
                    Ok(()) => Ok(origin),
                    Err(e @ FanOutError::AttributionAmbiguity { .. }) => {
                        Err(io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))
                    }
                    Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
                }
            });

            match attempt {
                Ok(origin) => {
                    debug!(batch = %id, index, worker = %worker, origin = %origin, "worker spawned");
                }
                Err(source) => {
                    table.mark_spawn_failed(worker, &source)?;
                    error!(batch = %id, index, worker = %worker, error = %source, "spawn failed, aborting fan-out");
                    let running = table.unresolved().len();
                    if running > 0 {
                        warn!(batch = %id, running, "detaching workers already started");
                    }
                    return Err(FanOutError::SpawnFailure {
                        index,
                        worker,
                        source,
                    });
                }
            }
        }

        Ok(Batch {
            id,
            mode,
            table,
            events: rx,
            ready: VecDeque::new(),
            counter: spawner.counter(),
            started_at: Utc::now(),
        })
    }
}

/// One fan-out in flight
#[derive(Debug)]
pub struct Batch {
    id: Uuid,
    mode: FanOutMode,
    table: WorkerTable,
    events: EventReceiver,
    // Resolved but not yet delivered, in completion order
    ready: VecDeque<WorkerId>,
    counter: Option<SharedCounter>,
    started_at: DateTime<Utc>,
}

impl Batch {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> FanOutMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Registered ids in registration order
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.table.ids().to_vec()
    }

    pub fn table(&self) -> &WorkerTable {
        &self.table
    }

    /// Counter shared by thread workers. Process workers have none to share.
    pub fn counter(&self) -> Option<&SharedCounter> {
        self.counter.as_ref()
    }

    /// Workers not yet handed to the caller
    pub fn pending(&self) -> usize {
        self.table.undelivered()
    }

    /// Next result in completion order, `None` once every worker was
    /// delivered.
    pub async fn join_any(&mut self) -> Result<Option<(WorkerId, Resolution)>> {
        loop {
            if let Some(worker) = self.ready.pop_front() {
                let resolution = self.table.mark_delivered(worker)?;
                return Ok(Some((worker, resolution)));
            }
            if self.table.unresolved().is_empty() {
                return Ok(None);
            }
            self.next_completion().await?;
        }
    }

    /// Wait for one specific worker. Others that finish meanwhile stay queued
    /// for later joins.
    pub async fn join_worker(&mut self, worker: WorkerId) -> Result<Resolution> {
        let record = self.table.get(worker).ok_or(FanOutError::UnknownWorker(worker))?;
        if record.delivered {
            return Err(FanOutError::AlreadyDelivered(worker));
        }

        while !self.is_resolved(worker) {
            self.next_completion().await?;
        }
        self.ready.retain(|w| *w != worker);
        self.table.mark_delivered(worker)
    }

    /// Every remaining result, in completion order.
    pub async fn join_all(&mut self) -> Result<Vec<(WorkerId, Resolution)>> {
        let mut results = Vec::with_capacity(self.pending());
        while let Some(result) = self.join_any().await? {
            results.push(result);
        }
        info!(batch = %self.id, results = results.len(), "batch joined");
        Ok(results)
    }

    fn is_resolved(&self, worker: WorkerId) -> bool {
        self.table
            .get(worker)
            .map(|record| record.is_resolved())
            .unwrap_or(true)
    }

    /// Wait for the next termination event and record it. Returns the worker
    /// it was attributed to.
    pub async fn next_completion(&mut self) -> Result<WorkerId> {
        let event = match self.events.recv().await {
            Some(event) => event,
            None => {
                return Err(FanOutError::ChannelClosed {
                    pending: self.table.unresolved().len(),
                })
            }
        };

        let worker = self
            .table
            .attribute(&event.origin)
            .ok_or_else(|| FanOutError::AttributionAmbiguity {
                origin: event.origin.to_string(),
            })?;
        debug!(batch = %self.id, worker = %worker, origin = %event.origin, "attributed completion");

        self.record(worker, event.termination).await?;
        Ok(worker)
    }

    async fn record(&mut self, worker: WorkerId, termination: Termination) -> Result<()> {
        // The thread sent its event as its last act; reap it off the runtime.
        if let Some(handle) = self.table.take_thread(worker) {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    warn!(batch = %self.id, worker = %worker, "worker thread panicked after reporting")
                }
                Err(e) => {
                    warn!(batch = %self.id, worker = %worker, error = %e, "failed to reap worker thread")
                }
            }
        }

        let outcome = match termination {
            Termination::Collected(value) => Ok(Some(value)),
            Termination::Returned => match self.table.take_slot(worker) {
                Some(mut slot) => slot.collect(()).await,
                None => Ok(None),
            },
            Termination::Violated(violation) => Err(violation),
            Termination::Lost(reason) => {
                warn!(batch = %self.id, worker = %worker, reason = %reason, "worker lost");
                self.table.mark_lost(worker, reason)?;
                self.ready.push_back(worker);
                return Ok(());
            }
        };

        match outcome {
            Ok(Some(value)) => {
                info!(batch = %self.id, worker = %worker, value = %value, "worker resolved");
                self.table.mark_resolved(worker, value)?;
                self.ready.push_back(worker);
                Ok(())
            }
            Ok(None) => {
                self.table.mark_lost(worker, "no result published")?;
                self.ready.push_back(worker);
                Ok(())
            }
            Err(violation) => {
                error!(batch = %self.id, worker = %worker, error = %violation, "channel contract violated");
                self.table
                    .mark_lost(worker, format!("channel contract violated: {}", violation))?;
                self.ready.push_back(worker);
                Err(FanOutError::ChannelContractViolation {
                    worker,
                    source: violation,
                })
            }
        }
    }

    /// Serializable snapshot of the batch
    pub fn report(&self) -> BatchReport {
        let workers: Vec<WorkerSummary> = self
            .table
            .records()
            .map(|record| WorkerSummary {
                id: record.id,
                input: record.input.clone(),
                origin: record.origin.map(|origin| origin.to_string()),
                spawn: record.spawn.clone(),
                result: record.result.clone(),
                spawned_at: record.spawned_at,
                resolved_at: record.resolved_at,
                delivered: record.delivered,
            })
            .collect();

        let resolved = workers
            .iter()
            .filter(|w| matches!(w.result, ResultStatus::Resolved(_)))
            .count();
        let lost = workers
            .iter()
            .filter(|w| matches!(w.result, ResultStatus::Lost(_)))
            .count();

        BatchReport {
            batch: self.id,
            mode: self.mode,
            started_at: self.started_at,
            resolved,
            lost,
            counter: self.counter.as_ref().map(SharedCounter::get),
            workers,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch: Uuid,
    pub mode: FanOutMode,
    pub started_at: DateTime<Utc>,
    pub resolved: usize,
    pub lost: usize,
    /// Final value of the shared counter (thread batches)
    pub counter: Option<i64>,
    pub workers: Vec<WorkerSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub input: TaskInput,
    pub origin: Option<String>,
    pub spawn: SpawnStatus,
    pub result: ResultStatus,
    pub spawned_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub delivered: bool,
}

impl WorkerSummary {
    pub fn value(&self) -> Option<&ResultValue> {
        match &self.result {
            ResultStatus::Resolved(value) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CounterDiscipline;
    use crate::spawn::{EventSender, OsIdentity, SpawnedWorker, WorkerEvent};
    use crate::task::{task_fn, TaskOutput};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn coordinator() -> Coordinator {
        Coordinator::new(FanOutConfig::development()).unwrap()
    }

    /// Fails every spawn from `fail_at` on and counts attempts.
    struct Failing {
        inner: ThreadSpawner,
        fail_at: usize,
        attempts: Arc<AtomicUsize>,
    }

    impl Spawner for Failing {
        fn mode(&self) -> FanOutMode {
            FanOutMode::Thread
        }

        fn spawn(
            &self,
            worker: WorkerId,
            input: &TaskInput,
            events: &EventSender,
        ) -> io::Result<SpawnedWorker> {
            let index = self.attempts.fetch_add(1, Ordering::SeqCst);
            if index >= self.fail_at {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "Resource temporarily unavailable"));
            }
            self.inner.spawn(worker, input, events)
        }
    }

    /// Reports a pid nobody registered.
    struct Stranger;

    impl Spawner for Stranger {
        fn mode(&self) -> FanOutMode {
            FanOutMode::Process
        }

        fn spawn(
            &self,
            _worker: WorkerId,
            _input: &TaskInput,
            events: &EventSender,
        ) -> io::Result<SpawnedWorker> {
            let _ = events.send(WorkerEvent {
                origin: OsIdentity::Pid(1),
                termination: Termination::Lost("stray".to_string()),
            });
            Ok(SpawnedWorker::process(2))
        }
    }

    /// Reports the same pid for every worker, each already collected.
    struct SamePid;

    impl Spawner for SamePid {
        fn mode(&self) -> FanOutMode {
            FanOutMode::Process
        }

        fn spawn(
            &self,
            worker: WorkerId,
            _input: &TaskInput,
            events: &EventSender,
        ) -> io::Result<SpawnedWorker> {
            let _ = events.send(WorkerEvent {
                origin: OsIdentity::Pid(77),
                termination: Termination::Collected(ResultValue::NarrowCode(worker.get() as u8)),
            });
            Ok(SpawnedWorker::process(77))
        }
    }

    #[tokio::test]
    async fn test_reused_pid_fails_the_spawn() {
        let inputs = vec![TaskInput::default(), TaskInput::default()];
        let err = coordinator().spawn_batch_with(&SamePid, inputs).unwrap_err();

        assert_eq!(err.exit_code(), -1);
        match err {
            FanOutError::SpawnFailure { index, worker, source } => {
                assert_eq!(index, 1);
                assert_eq!(worker, WorkerId::new(2));
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists);
                assert!(source.to_string().contains("pid 77"), "{}", source);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_all_returns_every_worker_once() {
        let mut batch = coordinator().spawn_ids("count", 4).unwrap();
        assert_eq!(batch.len(), 4);

        let results = batch.join_all().await.unwrap();
        let mut ids: Vec<WorkerId> = results.iter().map(|(id, _)| *id).collect();
        ids.sort();
        assert_eq!(ids, batch.worker_ids());
        for (id, resolution) in &results {
            assert_eq!(
                resolution.value(),
                Some(&ResultValue::Returned(json!(id.get())))
            );
        }
        assert_eq!(batch.counter().unwrap().get(), 4 * 50);
        assert!(batch.join_any().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_thread_handles_reaped_on_join() {
        let mut batch = coordinator().spawn_ids("echo", 3).unwrap();
        let ticker = tokio::spawn(async {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        });

        assert_eq!(batch.join_all().await.unwrap().len(), 3);
        ticker.await.unwrap();
        for id in batch.worker_ids() {
            assert!(batch.table.take_thread(id).is_none(), "worker {} not reaped", id);
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_stops_fan_out() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let task = task_fn("noop", |_| Ok(TaskOutput::Int(0)));
        let spawner = Failing {
            inner: ThreadSpawner::new(task, SharedCounter::new(0, CounterDiscipline::Atomic)),
            fail_at: 2,
            attempts: Arc::clone(&attempts),
        };

        let inputs = (0..6i64).map(TaskInput::from).collect();
        let err = coordinator().spawn_batch_with(&spawner, inputs).unwrap_err();

        match err {
            FanOutError::SpawnFailure { index, worker, .. } => {
                assert_eq!(index, 2);
                assert_eq!(worker, WorkerId::new(3));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slot_limit_fails_offending_index() {
        let config = FanOutConfig::builder().max_workers(2).build().unwrap();
        let err = Coordinator::new(config).unwrap().spawn_ids("count", 3).unwrap_err();
        match err {
            FanOutError::SpawnFailure { index, source, .. } => {
                assert_eq!(index, 2);
                assert_eq!(source.kind(), io::ErrorKind::WouldBlock);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unregistered_origin_is_ambiguous() {
        let mut batch = coordinator()
            .spawn_batch_with(&Stranger, vec![TaskInput::default()])
            .unwrap();
        let err = batch.join_any().await.unwrap_err();
        assert!(matches!(err, FanOutError::AttributionAmbiguity { .. }));
    }

    #[tokio::test]
    async fn test_closed_channel_reports_pending() {
        let mut batch = coordinator()
            .spawn_batch_with(&Stranger, vec![TaskInput::default()])
            .unwrap();
        // Drain the stray event, after which no sender is left.
        let _ = batch.next_completion().await;
        let err = batch.next_completion().await.unwrap_err();
        assert!(matches!(err, FanOutError::ChannelClosed { pending: 1 }));
    }

    #[tokio::test]
    async fn test_failed_task_is_lost() {
        let mut registry = TaskRegistry::new();
        registry
            .register(task_fn("fails", |ctx| {
                if ctx.worker.get() == 2 {
                    anyhow::bail!("worker two refuses");
                }
                Ok(TaskOutput::Int(1))
            }))
            .unwrap();
        let coordinator =
            Coordinator::with_registry(FanOutConfig::development(), registry).unwrap();

        let mut batch = coordinator.spawn_ids("fails", 3).unwrap();
        let resolution = batch.join_worker(WorkerId::new(2)).await.unwrap();
        assert!(resolution.is_lost());
        assert_eq!(batch.join_all().await.unwrap().len(), 2);

        let report = batch.report();
        assert_eq!(report.resolved, 2);
        assert_eq!(report.lost, 1);
    }

    #[tokio::test]
    async fn test_join_errors() {
        let mut batch = coordinator().spawn_ids("count", 1).unwrap();
        assert!(matches!(
            batch.join_worker(WorkerId::new(9)).await,
            Err(FanOutError::UnknownWorker(_))
        ));
        batch.join_worker(WorkerId::new(1)).await.unwrap();
        assert!(matches!(
            batch.join_worker(WorkerId::new(1)).await,
            Err(FanOutError::AlreadyDelivered(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let err = coordinator().spawn_ids("nope", 1).unwrap_err();
        assert!(matches!(err, FanOutError::TaskNotFound { .. }));
    }
}
