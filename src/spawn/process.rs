//! Process fan-out
//!
//! Each worker is a fresh run of the worker program (`fanjoin worker ...`).
//! The input goes in on stdin as JSON; the result comes back through the exit
//! status or a fixed-width payload on stdout. A watcher task per child
//! collects the result, reaps the child and reports its pid.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::{EventSender, OsIdentity, SpawnedWorker, Spawner, Termination, WorkerEvent};
use crate::channel::{
    ChannelKind, ChannelViolation, Consumer, ExitCodeConsumer, PipeConsumer, ResultValue,
};
use crate::core::config::{FanOutConfig, FanOutMode};
use crate::core::errors::{FanOutError, Result};
use crate::counter::CounterDiscipline;
use crate::table::WorkerId;
use crate::task::TaskInput;

#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    task: String,
    channel: ChannelKind,
    seed: i64,
    discipline: CounterDiscipline,
    runtime: Handle,
}

impl ProcessSpawner {
    /// Spawner for `task` on `program`. Must be called inside a tokio
    /// runtime; the watcher tasks run there.
    pub fn new(
        program: impl Into<PathBuf>,
        task: impl Into<String>,
        channel: ChannelKind,
    ) -> Result<Self> {
        if !channel.supports(FanOutMode::Process) {
            return Err(FanOutError::configuration_field(
                format!("{} channel is not available to process workers", channel),
                "channel",
            ));
        }
        let runtime = Handle::try_current().map_err(|_| {
            FanOutError::configuration("process fan-out requires a running tokio runtime")
        })?;

        Ok(Self {
            program: program.into(),
            task: task.into(),
            channel,
            seed: 0,
            discipline: CounterDiscipline::default(),
            runtime,
        })
    }

    /// Uses `worker_program` when set, otherwise the running executable.
    pub fn from_config(task: impl Into<String>, config: &FanOutConfig) -> Result<Self> {
        if config.mode != FanOutMode::Process {
            return Err(FanOutError::configuration_field(
                format!("process spawner used in {} mode", config.mode),
                "mode",
            ));
        }
        let program = match &config.worker_program {
            Some(path) => path.clone(),
            None => std::env::current_exe()
                .map_err(|e| FanOutError::io("locate worker program", e))?,
        };
        Ok(Self::new(program, task, config.channel)?
            .with_counter(config.counter_seed, config.counter))
    }

    /// Seed and discipline each child builds its private counter from
    pub fn with_counter(mut self, seed: i64, discipline: CounterDiscipline) -> Self {
        self.seed = seed;
        self.discipline = discipline;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn channel(&self) -> ChannelKind {
        self.channel
    }

    fn command(&self, worker: WorkerId) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--task")
            .arg(&self.task)
            .arg("--id")
            .arg(worker.to_string())
            .arg("--channel")
            .arg(self.channel.to_string())
            .arg(format!("--seed={}", self.seed))
            .arg("--discipline")
            .arg(self.discipline.to_string())
            .stdin(Stdio::piped())
            .stderr(Stdio::inherit());

        match self.channel {
            ChannelKind::Pipe(_) => cmd.stdout(Stdio::piped()),
            _ => cmd.stdout(Stdio::null()),
        };
        cmd
    }
}

impl Spawner for ProcessSpawner {
    fn mode(&self) -> FanOutMode {
        FanOutMode::Process
    }

    fn spawn(
        &self,
        worker: WorkerId,
        input: &TaskInput,
        events: &EventSender,
    ) -> io::Result<SpawnedWorker> {
        let payload = serde_json::to_vec(input)?;

        let _guard = self.runtime.enter();
        let mut child = self.command(worker).spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child reaped before pid was read"))?;
        debug!(worker = %worker, pid, program = %self.program.display(), "spawned worker process");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        self.runtime.spawn(watch_child(
            worker,
            pid,
            child,
            stdin,
            stdout,
            payload,
            self.channel,
            events.clone(),
        ));

        Ok(SpawnedWorker::process(pid))
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_child(
    worker: WorkerId,
    pid: u32,
    mut child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    payload: Vec<u8>,
    channel: ChannelKind,
    events: EventSender,
) {
    if let Some(mut stdin) = stdin {
        // A worker that never reads its input closes the pipe early.
        if let Err(e) = stdin.write_all(&payload).await {
            debug!(worker = %worker, pid, error = %e, "worker did not take its input");
        }
    }

    let collected = match (channel, stdout) {
        (ChannelKind::Pipe(kind), Some(stdout)) => {
            Some(PipeConsumer::new(kind).collect(Box::new(stdout)).await)
        }
        _ => None,
    };

    let termination = match child.wait().await {
        Ok(status) => match collected {
            Some(collected) => pipe_termination(status, collected),
            None => exit_code_termination(status).await,
        },
        Err(e) => Termination::Lost(format!("wait failed: {}", e)),
    };

    if let Termination::Lost(reason) = &termination {
        warn!(worker = %worker, pid, reason = %reason, "worker process lost");
    }

    let event = WorkerEvent {
        origin: OsIdentity::Pid(pid),
        termination,
    };
    if events.send(event).is_err() {
        debug!(worker = %worker, pid, "batch dropped before worker finished");
    }
}

async fn exit_code_termination(status: ExitStatus) -> Termination {
    match ExitCodeConsumer.collect(status).await {
        Ok(Some(value)) => Termination::Collected(value),
        Ok(None) => Termination::Lost(describe(status)),
        Err(violation) => Termination::Violated(violation),
    }
}

// Killed workers are lost, even when the pipe came up short.
fn pipe_termination(
    status: ExitStatus,
    collected: std::result::Result<Option<ResultValue>, ChannelViolation>,
) -> Termination {
    if status.code().is_none() {
        return Termination::Lost(describe(status));
    }
    match collected {
        Ok(Some(value)) => Termination::Collected(value),
        Ok(None) => Termination::Lost(describe(status)),
        Err(violation) => Termination::Violated(violation),
    }
}

/// Human-readable reason for a status without a usable code.
pub fn describe(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {}", signal);
        }
    }
    format!("terminated without a result ({})", status)
}
