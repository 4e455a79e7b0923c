//! Reductions over joined results
//!
//! Lost workers carry no value and are skipped by every fold here.

use crate::channel::ResultValue;
use crate::table::{Resolution, WorkerId};

/// Fold the resolved values of a joined batch.
pub fn aggregate<T, F>(results: &[(WorkerId, Resolution)], init: T, mut combine: F) -> T
where
    F: FnMut(T, WorkerId, &ResultValue) -> T,
{
    results
        .iter()
        .filter_map(|(id, resolution)| resolution.value().map(|value| (*id, value)))
        .fold(init, |acc, (id, value)| combine(acc, id, value))
}

/// Value produced by one worker, found by id
pub fn value_of(results: &[(WorkerId, Resolution)], worker: WorkerId) -> Option<&ResultValue> {
    results
        .iter()
        .find(|(id, _)| *id == worker)
        .and_then(|(_, resolution)| resolution.value())
}

/// Largest exit code in the batch
pub fn max_narrow_code(results: &[(WorkerId, Resolution)]) -> Option<u8> {
    aggregate(results, None, |best: Option<u8>, _, value| match value {
        ResultValue::NarrowCode(code) => Some(best.map_or(*code, |b| b.max(*code))),
        _ => best,
    })
}

/// Sum of every numeric value
pub fn sum(results: &[(WorkerId, Resolution)]) -> f64 {
    aggregate(results, 0.0, |acc, _, value| acc + value.as_f64().unwrap_or(0.0))
}

/// Workers that produced nothing
pub fn lost(results: &[(WorkerId, Resolution)]) -> Vec<WorkerId> {
    results
        .iter()
        .filter(|(_, resolution)| resolution.is_lost())
        .map(|(id, _)| *id)
        .collect()
}
