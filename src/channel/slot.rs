//! Return slot for thread workers
//!
//! The worker fills the slot before it signals completion and the
//! coordinator takes the value afterwards. Both sides hold a reference, so
//! the storage outlives whichever side finishes first.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ChannelViolation, Consumer, Producer, ResultValue};
use crate::task::TaskOutput;

#[derive(Debug, Default)]
struct SlotState {
    value: Option<ResultValue>,
    published: bool,
}

/// Coordinator's handle on a worker's return storage
#[derive(Debug, Clone, Default)]
pub struct ReturnSlot {
    state: Arc<Mutex<SlotState>>,
}

impl ReturnSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer handle for the worker thread
    pub fn producer(&self) -> SlotProducer {
        SlotProducer { slot: self.clone() }
    }

    pub fn is_published(&self) -> bool {
        self.lock().published
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // A panicking worker cannot leave the state half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Consumer for ReturnSlot {
    type Source = ();

    async fn collect(&mut self, _source: ()) -> Result<Option<ResultValue>, ChannelViolation> {
        Ok(self.lock().value.take())
    }
}

/// Worker side of a [`ReturnSlot`]
#[derive(Debug, Clone)]
pub struct SlotProducer {
    slot: ReturnSlot,
}

impl Producer for SlotProducer {
    fn publish(&mut self, output: TaskOutput) -> Result<(), ChannelViolation> {
        let mut state = self.slot.lock();
        if state.published {
            return Err(ChannelViolation::AlreadyPublished);
        }

        let value = match output {
            TaskOutput::Int(v) => Value::from(v),
            TaskOutput::Float(v) => Value::from(v),
            TaskOutput::Json(v) => v,
        };
        state.value = Some(ResultValue::Returned(value));
        state.published = true;
        Ok(())
    }
}
