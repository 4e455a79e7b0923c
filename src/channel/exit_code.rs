//! Exit status as a result channel
//!
//! A process can hand back eight bits through its exit status and nothing
//! more. Anything wider is reduced modulo 256 before it leaves the worker.
//! The reduction is silent by contract: it is logged, never raised.

use async_trait::async_trait;
use std::process::ExitStatus;
use tracing::warn;

use super::{ChannelViolation, Consumer, Producer, ResultValue};
use crate::task::TaskOutput;

/// Reduce a value to the 8 bits an exit status can carry (`value mod 256`,
/// Euclidean, so `-1` becomes `255`).
pub fn truncate(value: i64) -> u8 {
    value.rem_euclid(256) as u8
}

/// True when `truncate(value) != value`.
pub fn is_lossy(value: i64) -> bool {
    !(0..=255).contains(&value)
}

/// Worker side: remembers the code the worker should exit with.
#[derive(Debug, Default)]
pub struct ExitCodeProducer {
    code: Option<u8>,
}

impl ExitCodeProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Code to pass to `std::process::exit`, once published
    pub fn code(&self) -> Option<u8> {
        self.code
    }
}

impl Producer for ExitCodeProducer {
    fn publish(&mut self, output: TaskOutput) -> Result<(), ChannelViolation> {
        if self.code.is_some() {
            return Err(ChannelViolation::AlreadyPublished);
        }

        let value = match &output {
            TaskOutput::Int(v) => *v,
            TaskOutput::Json(value) if value.is_i64() => value.as_i64().unwrap_or_default(),
            other => {
                return Err(ChannelViolation::Unsupported {
                    channel: "exit-code",
                    output: format!("{:?}", other),
                })
            }
        };

        let code = truncate(value);
        if is_lossy(value) {
            warn!(value, code, "exit code keeps only the low 8 bits");
        }
        self.code = Some(code);
        Ok(())
    }
}

/// Coordinator side: reads the status of a reaped process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitCodeConsumer;

#[async_trait]
impl Consumer for ExitCodeConsumer {
    type Source = ExitStatus;

    async fn collect(
        &mut self,
        status: ExitStatus,
    ) -> Result<Option<ResultValue>, ChannelViolation> {
        // No code means the process was terminated by a signal.
        Ok(status
            .code()
            .map(|code| ResultValue::NarrowCode(truncate(i64::from(code)))))
    }
}
