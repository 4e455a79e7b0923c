//! Worker fan-out/join coordinator
//!
//! Spawn a fixed number of workers (threads or child processes), run the same
//! task in each, and join them while attributing every result to the worker
//! that produced it. Results come back through one of three channels: an
//! 8-bit exit code, a fixed-width pipe payload, or a thread's return slot.
//!
//! ```no_run
//! # async fn demo() -> fanjoin::Result<()> {
//! use fanjoin::{Coordinator, FanOutConfig};
//!
//! let coordinator = Coordinator::new(FanOutConfig::default())?;
//! let mut batch = coordinator.spawn_ids("count", 5)?;
//! for (worker, resolution) in batch.join_all().await? {
//!     println!("worker {}: {}", worker, resolution);
//! }
//! # Ok(())
//! # }
//! ```

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod logging;
}

pub mod aggregate;
pub mod channel;
pub mod coordinator;
pub mod counter;
pub mod spawn;
pub mod table;
pub mod task;
pub mod worker;

// Re-exports for convenience
pub use channel::{ChannelKind, Payload, PayloadKind, ResultValue};
pub use coordinator::{Batch, BatchReport, Coordinator};
pub use crate::core::config::{FanOutConfig, FanOutConfigBuilder, FanOutMode};
pub use crate::core::errors::{FanOutError, Result};
pub use counter::{CounterDiscipline, SharedCounter};
pub use spawn::{ProcessSpawner, Spawner, ThreadSpawner};
pub use table::{Resolution, WorkerId};
pub use task::{task_fn, TaskBody, TaskInput, TaskOutput, TaskRegistry, WorkerContext};
