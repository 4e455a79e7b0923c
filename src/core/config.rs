use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::channel::ChannelKind;
use crate::core::errors::{FanOutError, Result};
use crate::counter::CounterDiscipline;

/// Where workers run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutMode {
    /// Threads in the coordinator's address space
    #[default]
    Thread,
    /// Independent child processes
    Process,
}

impl FanOutMode {
    /// Channel used when the configuration does not name one
    pub fn default_channel(self) -> ChannelKind {
        match self {
            Self::Thread => ChannelKind::Return,
            Self::Process => ChannelKind::ExitCode,
        }
    }
}

impl fmt::Display for FanOutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => f.write_str("thread"),
            Self::Process => f.write_str("process"),
        }
    }
}

impl FromStr for FanOutMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            other => Err(format!("unknown mode `{}` (expected thread or process)", other)),
        }
    }
}

/// Fan-out configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
    /// Spawn mechanism
    pub mode: FanOutMode,
    /// Result transport; must suit `mode`
    pub channel: ChannelKind,
    /// Spawns past this many workers fail instead of queueing
    pub max_workers: usize,

    // Shared counter
    pub counter: CounterDiscipline,
    pub counter_seed: i64,

    // Process workers
    /// Program re-executed for process workers (defaults to the running binary)
    pub worker_program: Option<PathBuf>,

    // Thread workers
    pub thread_name_prefix: String,
    /// Stack size in bytes (None = platform default)
    pub thread_stack_size: Option<usize>,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            mode: FanOutMode::Thread,
            channel: ChannelKind::Return,
            max_workers: 256,
            counter: CounterDiscipline::Unsynchronized,
            counter_seed: 0,
            worker_program: None,
            thread_name_prefix: crate::spawn::thread::DEFAULT_NAME_PREFIX.to_string(),
            thread_stack_size: None,
        }
    }
}

impl FanOutConfig {
    /// Create a new builder for FanOutConfig
    pub fn builder() -> FanOutConfigBuilder {
        FanOutConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(FanOutError::configuration_field(
                "max_workers must be greater than 0",
                "max_workers",
            ));
        }
        if !self.channel.supports(self.mode) {
            return Err(FanOutError::configuration_field(
                format!(
                    "{} channel cannot be used in {} mode",
                    self.channel, self.mode
                ),
                "channel",
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(FanOutError::configuration_field(
                "thread_name_prefix cannot be empty",
                "thread_name_prefix",
            ));
        }
        if let Some(0) = self.thread_stack_size {
            return Err(FanOutError::configuration_field(
                "thread_stack_size must be greater than 0",
                "thread_stack_size",
            ));
        }
        Ok(())
    }

    /// Small thread batches with an exact counter
    pub fn development() -> Self {
        Self {
            max_workers: 16,
            counter: CounterDiscipline::Atomic,
            ..Default::default()
        }
    }

    /// Process workers reporting through their exit code
    pub fn process() -> Self {
        Self {
            mode: FanOutMode::Process,
            channel: ChannelKind::ExitCode,
            ..Default::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FanOutError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&text)
    }
}

/// Builder for FanOutConfig
#[derive(Debug, Default)]
pub struct FanOutConfigBuilder {
    config: FanOutConfig,
}

impl FanOutConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mode. Also resets the channel to that mode's default.
    pub fn mode(mut self, mode: FanOutMode) -> Self {
        self.config.mode = mode;
        self.config.channel = mode.default_channel();
        self
    }

    pub fn channel(mut self, channel: ChannelKind) -> Self {
        self.config.channel = channel;
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers;
        self
    }

    /// Set counter discipline and starting value
    pub fn counter(mut self, discipline: CounterDiscipline, seed: i64) -> Self {
        self.config.counter = discipline;
        self.config.counter_seed = seed;
        self
    }

    pub fn worker_program(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.worker_program = Some(path.into());
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn thread_stack_size(mut self, bytes: usize) -> Self {
        self.config.thread_stack_size = Some(bytes);
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<FanOutConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
