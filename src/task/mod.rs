//! Task bodies run by workers
//!
//! The coordinator does not care what a task computes. A task receives a
//! [`WorkerContext`] and returns a [`TaskOutput`]; the batch's channel decides
//! how that output travels back.

pub mod builtin;
pub mod registry;

pub use registry::TaskRegistry;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::counter::SharedCounter;
use crate::table::WorkerId;

/// Input handed to one worker at spawn time.
///
/// Kept as JSON so the same value can be copied into a thread or written to a
/// child's stdin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskInput(Value);

impl TaskInput {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.0.as_i64()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.0.as_f64()
    }

    /// Integer field of an object input
    pub fn field_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key)?.as_i64()
    }
}

impl From<i64> for TaskInput {
    fn from(v: i64) -> Self {
        Self(Value::from(v))
    }
}

impl From<f64> for TaskInput {
    fn from(v: f64) -> Self {
        Self(Value::from(v))
    }
}

impl From<Value> for TaskInput {
    fn from(v: Value) -> Self {
        Self(v)
    }
}

impl fmt::Display for TaskInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a task body hands back to its worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutput {
    Int(i64),
    Float(f64),
    Json(Value),
}

/// Everything a task body can see
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub worker: WorkerId,
    pub input: TaskInput,
    /// Shared across a thread batch; private to each process worker
    pub counter: SharedCounter,
}

/// A unit of work run once per worker
pub trait TaskBody: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn run(&self, ctx: &WorkerContext) -> anyhow::Result<TaskOutput>;
}

/// [`TaskBody`] built from a closure
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F> TaskBody for FnTask<F>
where
    F: Fn(&WorkerContext) -> anyhow::Result<TaskOutput> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &WorkerContext) -> anyhow::Result<TaskOutput> {
        (self.f)(ctx)
    }
}

/// Wrap a closure as a task body.
pub fn task_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn TaskBody>
where
    F: Fn(&WorkerContext) -> anyhow::Result<TaskOutput> + Send + Sync + 'static,
{
    Arc::new(FnTask {
        name: name.into(),
        f,
    })
}
