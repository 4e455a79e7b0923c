//! Thread fan-out
//!
//! Workers share the coordinator's address space and one [`SharedCounter`].
//! Each thread fills its return slot, then reports its own thread id.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

use super::{EventSender, OsIdentity, SpawnedWorker, Spawner, Termination, WorkerEvent};
use crate::channel::{ChannelKind, Producer, ReturnSlot};
use crate::core::config::{FanOutConfig, FanOutMode};
use crate::core::errors::{FanOutError, Result};
use crate::counter::SharedCounter;
use crate::table::WorkerId;
use crate::task::{TaskBody, TaskInput, WorkerContext};

pub const DEFAULT_NAME_PREFIX: &str = "fanjoin-worker";

pub struct ThreadSpawner {
    task: Arc<dyn TaskBody>,
    counter: SharedCounter,
    name_prefix: String,
    stack_size: Option<usize>,
}

impl ThreadSpawner {
    pub fn new(task: Arc<dyn TaskBody>, counter: SharedCounter) -> Self {
        Self {
            task,
            counter,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            stack_size: None,
        }
    }

    pub fn from_config(task: Arc<dyn TaskBody>, config: &FanOutConfig) -> Result<Self> {
        if config.mode != FanOutMode::Thread || config.channel != ChannelKind::Return {
            return Err(FanOutError::configuration_field(
                format!(
                    "thread fan-out needs the return channel, got {} in {} mode",
                    config.channel, config.mode
                ),
                "channel",
            ));
        }

        let counter = SharedCounter::new(config.counter_seed, config.counter);
        Ok(Self {
            task,
            counter,
            name_prefix: config.thread_name_prefix.clone(),
            stack_size: config.thread_stack_size,
        })
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl Spawner for ThreadSpawner {
    fn mode(&self) -> FanOutMode {
        FanOutMode::Thread
    }

    fn spawn(
        &self,
        worker: WorkerId,
        input: &TaskInput,
        events: &EventSender,
    ) -> io::Result<SpawnedWorker> {
        let slot = ReturnSlot::new();
        let mut producer = slot.producer();
        let task = Arc::clone(&self.task);
        let events = events.clone();
        let ctx = WorkerContext {
            worker,
            input: input.clone(),
            counter: self.counter.clone(),
        };

        let mut builder = thread::Builder::new().name(format!("{}-{}", self.name_prefix, worker));
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }

        let handle = builder.spawn(move || {
            let termination = match panic::catch_unwind(AssertUnwindSafe(|| task.run(&ctx))) {
                Ok(Ok(output)) => match producer.publish(output) {
                    Ok(()) => Termination::Returned,
                    Err(violation) => Termination::Violated(violation),
                },
                Ok(Err(e)) => {
                    warn!(worker = %worker, error = %format!("{:#}", e), "task failed");
                    Termination::Lost(format!("task failed: {:#}", e))
                }
                Err(payload) => Termination::Lost(format!(
                    "task panicked: {}",
                    panic_message(payload.as_ref())
                )),
            };

            let origin = OsIdentity::Thread(thread::current().id());
            if events.send(WorkerEvent { origin, termination }).is_err() {
                debug!(worker = %worker, "batch dropped before worker finished");
            }
        })?;

        Ok(SpawnedWorker::thread(handle, slot))
    }

    fn counter(&self) -> Option<SharedCounter> {
        Some(self.counter.clone())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CounterDiscipline;
    use crate::task::{task_fn, TaskOutput};
    use tokio::sync::mpsc;

    #[test]
    fn test_worker_reports_its_own_thread() {
        let task = task_fn("id", |ctx| Ok(TaskOutput::Int(i64::from(ctx.worker.get()))));
        let spawner = ThreadSpawner::new(task, SharedCounter::new(0, CounterDiscipline::Atomic))
            .with_name_prefix("t");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let spawned = spawner.spawn(WorkerId::new(6), &TaskInput::default(), &tx).unwrap();
        let origin = spawned.origin;
        let handle = spawned.thread.unwrap();
        assert_eq!(handle.thread().name(), Some("t-6"));
        handle.join().unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin, origin);
        assert_eq!(event.termination, Termination::Returned);
        assert!(spawned.slot.unwrap().is_published());
    }

    #[test]
    fn test_panic_is_reported_as_lost() {
        let task = task_fn("boom", |_| panic!("boom"));
        let spawner = ThreadSpawner::new(task, SharedCounter::new(0, CounterDiscipline::Atomic));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let spawned = spawner.spawn(WorkerId::new(1), &TaskInput::default(), &tx).unwrap();
        spawned.thread.unwrap().join().unwrap();

        match rx.try_recv().unwrap().termination {
            Termination::Lost(reason) => assert!(reason.contains("boom"), "{}", reason),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_from_config_rejects_process_channels() {
        let task = task_fn("noop", |_| Ok(TaskOutput::Int(0)));
        let mut config = FanOutConfig::default();
        config.channel = ChannelKind::ExitCode;
        assert!(ThreadSpawner::from_config(task, &config).is_err());
    }
}
