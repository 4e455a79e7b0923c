//! Spawners start one worker each and report its termination.
//!
//! Every worker, thread or process, ends by sending a [`WorkerEvent`] that
//! names its OS identity. The batch maps that identity back to a
//! [`WorkerId`] through the table, which is what makes completion-order
//! joins attributable.

pub mod process;
pub mod thread;

pub use process::ProcessSpawner;
pub use thread::ThreadSpawner;

use std::fmt;
use std::io;
use std::thread::{JoinHandle, ThreadId};
use tokio::sync::mpsc;

use crate::channel::{ChannelViolation, ResultValue, ReturnSlot};
use crate::core::config::FanOutMode;
use crate::counter::SharedCounter;
use crate::table::WorkerId;
use crate::task::TaskInput;

/// Identity the OS reports for a terminated worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsIdentity {
    Pid(u32),
    Thread(ThreadId),
}

impl fmt::Display for OsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pid(pid) => write!(f, "pid {}", pid),
            Self::Thread(id) => write!(f, "thread {:?}", id),
        }
    }
}

/// How a worker ended, as seen by whoever watched it
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// The consumer already recovered a value (process workers)
    Collected(ResultValue),
    /// The value sits in the worker's return slot (thread workers)
    Returned,
    /// The fixed-width channel contract was broken
    Violated(ChannelViolation),
    /// No usable result
    Lost(String),
}

#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub origin: OsIdentity,
    pub termination: Termination,
}

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<WorkerEvent>;

/// What a successful spawn hands the table
#[derive(Debug)]
pub struct SpawnedWorker {
    pub origin: OsIdentity,
    pub slot: Option<ReturnSlot>,
    pub thread: Option<JoinHandle<()>>,
}

impl SpawnedWorker {
    pub fn process(pid: u32) -> Self {
        Self {
            origin: OsIdentity::Pid(pid),
            slot: None,
            thread: None,
        }
    }

    pub fn thread(handle: JoinHandle<()>, slot: ReturnSlot) -> Self {
        Self {
            origin: OsIdentity::Thread(handle.thread().id()),
            slot: Some(slot),
            thread: Some(handle),
        }
    }
}

/// Starts workers for one batch
pub trait Spawner: Send + Sync {
    fn mode(&self) -> FanOutMode;

    /// Start one worker. The worker must send exactly one event on `events`
    /// once it terminates. An error means nothing was started.
    fn spawn(
        &self,
        worker: WorkerId,
        input: &TaskInput,
        events: &EventSender,
    ) -> io::Result<SpawnedWorker>;

    /// Counter shared by this spawner's workers, when they share one
    fn counter(&self) -> Option<SharedCounter> {
        None
    }
}
