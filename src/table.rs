//! Worker handle table
//!
//! One record per registered worker, kept in registration order. The table
//! is owned and mutated by the batch alone. Results move from `Unresolved`
//! to `Resolved` or `Lost` exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::thread::JoinHandle;

use crate::channel::{ResultValue, ReturnSlot};
use crate::core::errors::{FanOutError, Result};
use crate::spawn::{OsIdentity, SpawnedWorker};
use crate::task::TaskInput;

/// Identifier of a worker within one batch. Starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SpawnStatus {
    Pending,
    Spawned,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ResultStatus {
    Unresolved,
    Resolved(ResultValue),
    Lost(String),
}

/// Final outcome of one worker as handed to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum Resolution {
    Value(ResultValue),
    Lost(String),
}

impl Resolution {
    pub fn value(&self) -> Option<&ResultValue> {
        match self {
            Self::Value(value) => Some(value),
            Self::Lost(_) => None,
        }
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost(_))
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => write!(f, "{}", value),
            Self::Lost(reason) => write!(f, "lost ({})", reason),
        }
    }
}

#[derive(Debug)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub input: TaskInput,
    pub spawn: SpawnStatus,
    pub result: ResultStatus,
    pub origin: Option<OsIdentity>,
    pub registered_at: DateTime<Utc>,
    pub spawned_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub delivered: bool,
    slot: Option<ReturnSlot>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerRecord {
    fn new(id: WorkerId, input: TaskInput) -> Self {
        Self {
            id,
            input,
            spawn: SpawnStatus::Pending,
            result: ResultStatus::Unresolved,
            origin: None,
            registered_at: Utc::now(),
            spawned_at: None,
            resolved_at: None,
            delivered: false,
            slot: None,
            thread: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self.result, ResultStatus::Unresolved)
    }

    /// Outcome once resolved
    pub fn resolution(&self) -> Option<Resolution> {
        match &self.result {
            ResultStatus::Unresolved => None,
            ResultStatus::Resolved(value) => Some(Resolution::Value(value.clone())),
            ResultStatus::Lost(reason) => Some(Resolution::Lost(reason.clone())),
        }
    }
}

#[derive(Debug)]
pub struct WorkerTable {
    next_id: u32,
    records: HashMap<WorkerId, WorkerRecord>,
    order: Vec<WorkerId>,
    origins: HashMap<OsIdentity, WorkerId>,
}

impl Default for WorkerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            records: HashMap::new(),
            order: Vec::new(),
            origins: HashMap::new(),
        }
    }

    /// Next unused id. Ids are never handed out twice.
    pub fn allocate_id(&mut self) -> WorkerId {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn register(&mut self, id: WorkerId, input: TaskInput) -> Result<&WorkerRecord> {
        if self.records.contains_key(&id) {
            return Err(FanOutError::DuplicateWorker(id));
        }
        self.next_id = self.next_id.max(id.0.saturating_add(1));
        self.order.push(id);
        Ok(&*self.records.entry(id).or_insert(WorkerRecord::new(id, input)))
    }

    /// Record a started worker and map its OS identity back to it.
    ///
    /// A reaped child frees its pid before its completion is attributed, so
    /// the same pid can come back for a later spawn. While the earlier owner
    /// is unresolved its event may still be in flight, and the mapping is
    /// refused.
    pub fn mark_spawned(&mut self, id: WorkerId, spawned: SpawnedWorker) -> Result<()> {
        let origin = spawned.origin;
        if let Some(&owner) = self.origins.get(&origin) {
            let owner_resolved = self.records.get(&owner).map_or(true, WorkerRecord::is_resolved);
            if owner != id && !owner_resolved {
                return Err(FanOutError::AttributionAmbiguity {
                    origin: origin.to_string(),
                });
            }
        }
        let record = self.get_mut(id)?;
        record.spawn = SpawnStatus::Spawned;
        record.spawned_at = Some(Utc::now());
        record.origin = Some(origin);
        record.slot = spawned.slot;
        record.thread = spawned.thread;
        self.origins.insert(origin, id);
        Ok(())
    }

    /// A worker that never started can never resolve; it is recorded as lost.
    pub fn mark_spawn_failed(&mut self, id: WorkerId, error: impl fmt::Display) -> Result<()> {
        let record = self.get_mut(id)?;
        let message = error.to_string();
        record.spawn = SpawnStatus::Failed(message.clone());
        if !record.is_resolved() {
            record.result = ResultStatus::Lost(format!("spawn failed: {}", message));
            record.resolved_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn mark_resolved(&mut self, id: WorkerId, value: ResultValue) -> Result<()> {
        self.resolve(id, ResultStatus::Resolved(value))
    }

    pub fn mark_lost(&mut self, id: WorkerId, reason: impl Into<String>) -> Result<()> {
        self.resolve(id, ResultStatus::Lost(reason.into()))
    }

    fn resolve(&mut self, id: WorkerId, status: ResultStatus) -> Result<()> {
        let record = self.get_mut(id)?;
        if record.is_resolved() {
            return Err(FanOutError::AlreadyResolved { worker: id });
        }
        record.result = status;
        record.resolved_at = Some(Utc::now());
        Ok(())
    }

    /// Hand a resolved result to the caller. Each worker is delivered once.
    pub fn mark_delivered(&mut self, id: WorkerId) -> Result<Resolution> {
        let record = self.get_mut(id)?;
        if record.delivered {
            return Err(FanOutError::AlreadyDelivered(id));
        }
        let resolution = record.resolution().ok_or(FanOutError::NotResolved(id))?;
        record.delivered = true;
        Ok(resolution)
    }

    /// Map the identity named by a termination event back to its worker.
    pub fn attribute(&self, origin: &OsIdentity) -> Option<WorkerId> {
        self.origins.get(origin).copied()
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.records.get(&id)
    }

    fn get_mut(&mut self, id: WorkerId) -> Result<&mut WorkerRecord> {
        self.records
            .get_mut(&id)
            .ok_or(FanOutError::UnknownWorker(id))
    }

    /// Records in registration order
    pub fn records(&self) -> impl Iterator<Item = &WorkerRecord> + '_ {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn ids(&self) -> &[WorkerId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Spawned workers still waiting for a result, in registration order
    pub fn unresolved(&self) -> Vec<WorkerId> {
        self.records()
            .filter(|r| r.spawn == SpawnStatus::Spawned && !r.is_resolved())
            .map(|r| r.id)
            .collect()
    }

    /// Workers whose result has not been handed out yet
    pub fn undelivered(&self) -> usize {
        self.records().filter(|r| !r.delivered).count()
    }

    pub fn take_slot(&mut self, id: WorkerId) -> Option<ReturnSlot> {
        self.records.get_mut(&id).and_then(|r| r.slot.take())
    }

    pub fn take_thread(&mut self, id: WorkerId) -> Option<JoinHandle<()>> {
        self.records.get_mut(&id).and_then(|r| r.thread.take())
    }
}
