//! Built-in tasks
//!
//! Small numeric bodies used by the CLI and the integration tests. Object
//! inputs name their operands (`{"a": 3, "b": 4}`); bare numbers work where a
//! single operand is enough.

use anyhow::{anyhow, Context};
use std::thread;
use std::time::Duration;
use tracing::info;

use super::{task_fn, TaskOutput, TaskRegistry, WorkerContext};

/// Increments performed by `count` when the input does not say otherwise
pub const DEFAULT_ITERATIONS: i64 = 50;

/// Register every built-in task. Names are unique, so this cannot collide on
/// a fresh registry; collisions on a populated one are skipped.
pub fn register_builtins(registry: &mut TaskRegistry) {
    let tasks = [
        task_fn("count", count),
        task_fn("product", product),
        task_fn("max", max),
        task_fn("echo", echo),
        task_fn("delay", delay),
    ];
    for task in tasks {
        if !registry.contains(task.name()) {
            let _ = registry.register(task);
        }
    }
}

/// Bump the shared counter `iterations` times, logging what this worker saw.
pub fn count(ctx: &WorkerContext) -> anyhow::Result<TaskOutput> {
    let iterations = ctx
        .input
        .field_i64("iterations")
        .unwrap_or(DEFAULT_ITERATIONS);

    for i in 0..iterations {
        let seen = ctx.counter.increment();
        info!(worker = %ctx.worker, i, counter = seen, "count");
    }
    Ok(TaskOutput::Int(i64::from(ctx.worker.get())))
}

/// `a * b`. Can exceed what an exit code carries.
pub fn product(ctx: &WorkerContext) -> anyhow::Result<TaskOutput> {
    let (a, b) = operands(ctx)?;
    let value = a
        .checked_mul(b)
        .ok_or_else(|| anyhow!("{} * {} overflows", a, b))?;
    Ok(TaskOutput::Int(value))
}

pub fn max(ctx: &WorkerContext) -> anyhow::Result<TaskOutput> {
    let (a, b) = operands(ctx)?;
    Ok(TaskOutput::Int(a.max(b)))
}

/// Hand the numeric input straight back.
pub fn echo(ctx: &WorkerContext) -> anyhow::Result<TaskOutput> {
    let input = ctx.input.value();
    if let Some(v) = input.as_i64() {
        Ok(TaskOutput::Int(v))
    } else if let Some(v) = input.as_f64() {
        Ok(TaskOutput::Float(v))
    } else {
        Err(anyhow!("echo expects a number, got {}", input))
    }
}

/// Sleep `millis`, then return `value` (defaults to the worker id).
pub fn delay(ctx: &WorkerContext) -> anyhow::Result<TaskOutput> {
    let millis = ctx
        .input
        .field_i64("millis")
        .or_else(|| ctx.input.as_i64())
        .unwrap_or(0);
    let millis = u64::try_from(millis).context("delay must not be negative")?;
    thread::sleep(Duration::from_millis(millis));

    let value = ctx
        .input
        .field_i64("value")
        .unwrap_or_else(|| i64::from(ctx.worker.get()));
    Ok(TaskOutput::Int(value))
}

fn operands(ctx: &WorkerContext) -> anyhow::Result<(i64, i64)> {
    let a = ctx
        .input
        .field_i64("a")
        .with_context(|| format!("missing integer `a` in {}", ctx.input))?;
    let b = ctx
        .input
        .field_i64("b")
        .with_context(|| format!("missing integer `b` in {}", ctx.input))?;
    Ok((a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{CounterDiscipline, SharedCounter};
    use crate::table::WorkerId;
    use crate::task::TaskInput;
    use serde_json::json;

    fn ctx(worker: u32, input: TaskInput) -> WorkerContext {
        WorkerContext {
            worker: WorkerId::new(worker),
            input,
            counter: SharedCounter::new(0, CounterDiscipline::Atomic),
        }
    }

    #[test]
    fn test_count_returns_worker_id() {
        let ctx = ctx(3, TaskInput::default());
        assert_eq!(count(&ctx).unwrap(), TaskOutput::Int(3));
        assert_eq!(ctx.counter.get(), DEFAULT_ITERATIONS);
    }

    #[test]
    fn test_count_honours_iterations() {
        let ctx = ctx(1, TaskInput::from(json!({"iterations": 7})));
        count(&ctx).unwrap();
        assert_eq!(ctx.counter.get(), 7);
    }

    #[test]
    fn test_product_and_max() {
        let input = TaskInput::from(json!({"a": 20, "b": 15}));
        assert_eq!(product(&ctx(1, input.clone())).unwrap(), TaskOutput::Int(300));
        assert_eq!(max(&ctx(1, input)).unwrap(), TaskOutput::Int(20));
        assert!(product(&ctx(1, TaskInput::from(json!({"a": 2})))).is_err());
        assert!(product(&ctx(1, TaskInput::from(json!({"a": i64::MAX, "b": 2})))).is_err());
    }

    #[test]
    fn test_echo() {
        assert_eq!(echo(&ctx(1, TaskInput::from(2.25))).unwrap(), TaskOutput::Float(2.25));
        assert_eq!(echo(&ctx(1, TaskInput::from(9))).unwrap(), TaskOutput::Int(9));
        assert!(echo(&ctx(1, TaskInput::from(json!("nine")))).is_err());
    }

    #[test]
    fn test_delay_defaults_to_worker_id() {
        assert_eq!(delay(&ctx(4, TaskInput::from(1))).unwrap(), TaskOutput::Int(4));
        let input = TaskInput::from(json!({"millis": 1, "value": 12}));
        assert_eq!(delay(&ctx(4, input)).unwrap(), TaskOutput::Int(12));
        assert!(delay(&ctx(4, TaskInput::from(-5))).is_err());
    }
}
