//! `fanjoin` command line
//!
//! `fanjoin run` fans a task out over threads or processes and prints what
//! came back. `fanjoin worker` is the entry point process workers are
//! re-executed with; it is not meant to be called by hand.

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;

use fanjoin::aggregate;
use fanjoin::channel::ChannelKind;
use fanjoin::coordinator::{BatchReport, Coordinator};
use fanjoin::core::config::{FanOutConfig, FanOutMode};
use fanjoin::core::errors::FanOutError;
use fanjoin::core::logging;
use fanjoin::counter::CounterDiscipline;
use fanjoin::table::{Resolution, WorkerId};
use fanjoin::task::{TaskInput, TaskRegistry};
use fanjoin::worker::{self, WorkerArgs};

/// Worker fan-out/join coordinator
#[derive(Parser, Debug)]
#[command(name = "fanjoin")]
#[command(about = "Fan a task out over threads or processes and join the results", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(global = true, short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Spawn a batch of workers and join them
    Run(RunArgs),

    /// List the tasks workers can run
    Tasks,

    /// Run a single process worker (used by process fan-out)
    #[command(hide = true)]
    Worker(WorkerCommand),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Task to run in every worker
    #[arg(short, long)]
    task: String,

    /// Number of workers; each gets its id as input
    #[arg(short = 'n', long, default_value_t = 5)]
    workers: usize,

    /// JSON input for one worker (repeat for more); overrides --workers
    #[arg(long = "input", value_name = "JSON")]
    inputs: Vec<String>,

    /// YAML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// thread or process
    #[arg(short, long)]
    mode: Option<FanOutMode>,

    /// exit-code, pipe:<f32|f64|i32|i64> or return
    #[arg(long)]
    channel: Option<ChannelKind>,

    /// unsynchronized or atomic
    #[arg(long)]
    counter: Option<CounterDiscipline>,

    /// Starting value of the shared counter
    #[arg(long, allow_hyphen_values = true)]
    seed: Option<i64>,

    /// Spawns beyond this many fail
    #[arg(long)]
    max_workers: Option<usize>,

    /// Join in completion order or worker by worker
    #[arg(long, value_enum, default_value_t = JoinOrder::Any)]
    join: JoinOrder,

    /// Reduction applied after the join
    #[arg(long, value_enum, default_value_t = Reduction::None)]
    aggregate: Reduction,

    /// Print results and the batch report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct WorkerCommand {
    #[arg(long)]
    task: String,

    #[arg(long)]
    id: u32,

    #[arg(long)]
    channel: ChannelKind,

    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    seed: i64,

    #[arg(long, default_value_t = CounterDiscipline::Unsynchronized)]
    discipline: CounterDiscipline,
}

impl From<WorkerCommand> for WorkerArgs {
    fn from(cmd: WorkerCommand) -> Self {
        WorkerArgs {
            task: cmd.task,
            id: WorkerId::new(cmd.id),
            channel: cmd.channel,
            seed: cmd.seed,
            discipline: cmd.discipline,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum JoinOrder {
    /// Completion order
    Any,
    /// Registration order, one worker at a time
    Each,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Reduction {
    None,
    Max,
    Sum,
}

#[derive(Serialize)]
struct RunOutput<'a> {
    results: &'a [(WorkerId, Resolution)],
    aggregate: Option<f64>,
    report: BatchReport,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let code = match cli.command {
        Commands::Worker(cmd) => worker::run(&cmd.into(), &TaskRegistry::with_builtins()),
        Commands::Tasks => {
            for name in TaskRegistry::with_builtins().names() {
                println!("{}", name);
            }
            0
        }
        Commands::Run(args) => match run(args).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("fanjoin: {:#}", e);
                e.downcast_ref::<FanOutError>()
                    .map(FanOutError::exit_code)
                    .unwrap_or(1)
            }
        },
    };

    std::process::exit(code);
}

fn load_config(args: &RunArgs) -> anyhow::Result<FanOutConfig> {
    let mut config = match &args.config {
        Some(path) => FanOutConfig::from_yaml_file(path)?,
        None => FanOutConfig::default(),
    };

    if let Some(mode) = args.mode {
        config.mode = mode;
        if args.channel.is_none() && !config.channel.supports(mode) {
            config.channel = mode.default_channel();
        }
    }
    if let Some(channel) = args.channel {
        config.channel = channel;
    }
    if let Some(counter) = args.counter {
        config.counter = counter;
    }
    if let Some(seed) = args.seed {
        config.counter_seed = seed;
    }
    if let Some(max_workers) = args.max_workers {
        config.max_workers = max_workers;
    }
    Ok(config)
}

fn inputs(args: &RunArgs) -> anyhow::Result<Vec<TaskInput>> {
    if args.inputs.is_empty() {
        return Ok((1..=args.workers as i64).map(TaskInput::from).collect());
    }
    args.inputs
        .iter()
        .map(|text| {
            serde_json::from_str(text).with_context(|| format!("--input `{}` is not valid JSON", text))
        })
        .collect()
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let coordinator = Coordinator::new(load_config(&args)?)?;
    let mut batch = coordinator.spawn_batch(&args.task, inputs(&args)?)?;

    let results = match args.join {
        JoinOrder::Any => batch.join_all().await?,
        JoinOrder::Each => {
            let mut results = Vec::with_capacity(batch.len());
            for id in batch.worker_ids() {
                let resolution = batch.join_worker(id).await?;
                results.push((id, resolution));
            }
            results
        }
    };

    let reduced = match args.aggregate {
        Reduction::None => None,
        Reduction::Sum => Some(aggregate::sum(&results)),
        Reduction::Max => aggregate::aggregate(&results, None, |best: Option<f64>, _, value| {
            match value.as_f64() {
                Some(v) => Some(best.map_or(v, |b| b.max(v))),
                None => best,
            }
        }),
    };

    if args.json {
        let output = RunOutput {
            results: &results,
            aggregate: reduced,
            report: batch.report(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for (id, resolution) in &results {
        println!("worker {}: {}", id, resolution);
    }
    if let Some(counter) = batch.counter() {
        println!("counter: {}", counter.get());
    }
    if let Some(value) = reduced {
        println!("{:?}: {}", args.aggregate, value);
    }
    Ok(())
}
