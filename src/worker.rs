//! Worker side of process fan-out
//!
//! Runs inside the re-executed binary: read the input from stdin, run the
//! task once, publish through the channel named on the command line.

use anyhow::{anyhow, bail, Context};
use std::io::{self, Read, Write};
use tracing::{debug, error};

use crate::channel::{ChannelKind, ExitCodeProducer, PipeProducer, Producer};
use crate::counter::{CounterDiscipline, SharedCounter};
use crate::table::WorkerId;
use crate::task::{TaskInput, TaskRegistry, WorkerContext};

#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub task: String,
    pub id: WorkerId,
    pub channel: ChannelKind,
    pub seed: i64,
    pub discipline: CounterDiscipline,
}

/// Run the worker against the real stdin and stdout and return the exit code.
///
/// Any failure aborts the process, which the coordinator records as a lost
/// worker.
pub fn run(args: &WorkerArgs, registry: &TaskRegistry) -> i32 {
    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    match execute(args, registry, stdin, stdout) {
        Ok(code) => code,
        Err(e) => {
            error!(worker = %args.id, task = %args.task, error = %format!("{:#}", e), "worker failed");
            std::process::abort()
        }
    }
}

/// Body of [`run`] over arbitrary streams.
pub fn execute<R: Read, W: Write>(
    args: &WorkerArgs,
    registry: &TaskRegistry,
    input: R,
    output: W,
) -> anyhow::Result<i32> {
    let task = registry.get(&args.task)?;
    let ctx = WorkerContext {
        worker: args.id,
        input: read_input(input)?,
        // Each process starts from the seed; nothing is shared with siblings.
        counter: SharedCounter::new(args.seed, args.discipline),
    };
    debug!(worker = %args.id, task = %args.task, input = %ctx.input, "worker started");

    let result = task
        .run(&ctx)
        .with_context(|| format!("task `{}` failed in worker {}", args.task, args.id))?;

    match args.channel {
        ChannelKind::ExitCode => {
            let mut producer = ExitCodeProducer::new();
            producer.publish(result)?;
            producer
                .code()
                .map(i32::from)
                .ok_or_else(|| anyhow!("exit code was not published"))
        }
        ChannelKind::Pipe(kind) => {
            PipeProducer::new(kind, output).publish(result)?;
            Ok(0)
        }
        ChannelKind::Return => bail!("the return channel is only available to thread workers"),
    }
}

/// Parse the JSON input; an empty stream is `null`.
pub fn read_input<R: Read>(mut reader: R) -> anyhow::Result<TaskInput> {
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .context("failed to read worker input")?;
    if text.trim().is_empty() {
        return Ok(TaskInput::default());
    }
    serde_json::from_str(&text).context("worker input is not valid JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PayloadKind;
    use serde_json::json;

    fn args(task: &str, channel: ChannelKind) -> WorkerArgs {
        WorkerArgs {
            task: task.to_string(),
            id: WorkerId::new(3),
            channel,
            seed: 0,
            discipline: CounterDiscipline::Unsynchronized,
        }
    }

    fn execute_with(args: &WorkerArgs, input: &str) -> anyhow::Result<(i32, Vec<u8>)> {
        let mut out = Vec::new();
        let code = execute(args, &TaskRegistry::with_builtins(), input.as_bytes(), &mut out)?;
        Ok((code, out))
    }

    #[test]
    fn test_exit_code_truncates_product() {
        let (code, out) = execute_with(&args("product", ChannelKind::ExitCode), r#"{"a":20,"b":15}"#).unwrap();
        assert_eq!(code, 300 % 256);
        assert!(out.is_empty());
    }

    #[test]
    fn test_pipe_writes_exact_payload() {
        let (code, out) =
            execute_with(&args("echo", ChannelKind::Pipe(PayloadKind::F32)), "0.1").unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, 0.1f32.to_ne_bytes().to_vec());
    }

    #[test]
    fn test_empty_input_is_null() {
        assert_eq!(read_input(&b""[..]).unwrap(), TaskInput::default());
        assert_eq!(read_input(&b" 7\n"[..]).unwrap(), TaskInput::from(json!(7)));
        assert!(read_input(&b"{"[..]).is_err());

        let (code, _) = execute_with(&args("count", ChannelKind::ExitCode), "").unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn test_failures_are_errors() {
        assert!(execute_with(&args("count", ChannelKind::Return), "").is_err());
        assert!(execute_with(&args("missing", ChannelKind::ExitCode), "").is_err());
        assert!(execute_with(&args("echo", ChannelKind::ExitCode), "1.5").is_err());
    }
}
