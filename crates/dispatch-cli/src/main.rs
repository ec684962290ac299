use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use dispatch_core::app::{App, AppBuilder, RunnerOptions, WorkerRunner};
use dispatch_core::config::{DispatchConfig, default_environment};
use dispatch_core::domain::{DispatchError, Invocation, TaskError};
use dispatch_core::impls::InMemoryQueueService;
use dispatch_core::observability::{StatsSnapshot, init_tracing};
use dispatch_core::typed::{Handler, RegistryBuilder, Task, TaskModule};

const DEMO_MODULE: &str = "demo.tasks.math";
const DEMO_QUEUE: &str = "math_tasks";

#[derive(Debug, Parser)]
#[command(name = "dispatch", about = "Distributed task dispatch over a message queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume every routed queue and execute tasks
    Worker(WorkerArgs),
    /// Run a worker and a publisher in one process and print results
    Demo {
        /// How many square/cube pairs to dispatch
        #[arg(long, default_value_t = 5)]
        count: i64,
        #[arg(long, default_value_t = 2)]
        workers: usize,
    },
}

#[derive(Debug, clap::Args)]
struct WorkerArgs {
    /// Settings file; falls back to SETTINGS_MODULE
    #[arg(long, env = "SETTINGS_MODULE")]
    config: Option<PathBuf>,
    #[arg(long)]
    workers: Option<usize>,
    /// Stop after this many receive calls per queue
    #[arg(long)]
    loop_count: Option<usize>,
    /// Messages per receive call (1..=10)
    #[arg(long)]
    num_messages: Option<usize>,
    /// Long-poll wait per receive call, seconds
    #[arg(long)]
    get_wait_time: Option<u64>,
}

// ===== demo tasks =====

struct Square;

impl Task for Square {
    const NAME: &'static str = "demo.tasks.math.square";
    type Args = (i64,);
    type Output = i64;
}

struct Cube;

impl Task for Cube {
    const NAME: &'static str = "demo.tasks.math.cube";
    type Args = (i64,);
    type Output = i64;
}

#[derive(Debug, Deserialize)]
struct GreetArgs {
    name: String,
}

struct Greet;

impl Task for Greet {
    const NAME: &'static str = "demo.tasks.math.greet";
    const RETURNS_RESULT: bool = false;
    type Args = GreetArgs;
    type Output = ();
}

struct MathHandler;

#[async_trait]
impl Handler<Square> for MathHandler {
    async fn handle(&self, (x,): (i64,), _inv: &Invocation) -> Result<i64, TaskError> {
        x.checked_mul(x)
            .ok_or_else(|| TaskError::failed(format!("square({x}) overflows")))
    }
}

#[async_trait]
impl Handler<Cube> for MathHandler {
    async fn handle(&self, (x,): (i64,), _inv: &Invocation) -> Result<i64, TaskError> {
        x.checked_mul(x)
            .and_then(|sq| sq.checked_mul(x))
            .ok_or_else(|| TaskError::failed(format!("cube({x}) overflows")))
    }
}

#[async_trait]
impl Handler<Greet> for MathHandler {
    async fn handle(&self, args: GreetArgs, inv: &Invocation) -> Result<(), TaskError> {
        let from = inv.header("sender").unwrap_or("anonymous");
        info!(name = %args.name, from, "hello");
        Ok(())
    }
}

struct DemoTasks;

impl TaskModule for DemoTasks {
    fn name(&self) -> &str {
        DEMO_MODULE
    }

    fn register(&self, registry: &mut RegistryBuilder) -> Result<(), DispatchError> {
        registry
            .register::<Square, _>(MathHandler)?
            .register::<Cube, _>(MathHandler)?
            .register::<Greet, _>(MathHandler)?;
        Ok(())
    }
}

fn build_app(config: DispatchConfig) -> Result<App> {
    let service = Arc::new(InMemoryQueueService::new());
    let app = AppBuilder::new(config, service)
        .module(DemoTasks)
        .build()
        .context("failed to build app")?;
    Ok(app)
}

fn report(stats: &StatsSnapshot) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(stats)?);
    Ok(())
}

/// ctrl-c で drain。`loop_count` を使い切った場合もそのまま drain して終わる
async fn run_until_stopped(runner: WorkerRunner) -> Result<StatsSnapshot> {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            warn!("interrupt received; draining");
        }
        _ = runner.stopped() => {
            info!("all fetchers finished");
        }
    }
    Ok(runner.drain().await)
}

async fn worker(args: WorkerArgs) -> Result<()> {
    let config = DispatchConfig::load_from(args.config.as_deref(), default_environment())
        .context("failed to load settings")?;
    let app = build_app(config)?;

    let mut options: RunnerOptions = app.worker_options();
    if let Some(workers) = args.workers {
        options.workers = workers.max(1);
    }
    if let Some(n) = args.num_messages {
        options.fetcher.batch_size = n.clamp(1, 10);
    }
    if let Some(secs) = args.get_wait_time {
        options.fetcher.wait_time = Duration::from_secs(secs);
    }
    options.fetcher.loop_count = args.loop_count;

    let runner = app.start_worker(options).await?;
    let stats = run_until_stopped(runner).await?;
    report(&stats)
}

async fn demo(count: i64, workers: usize) -> Result<()> {
    let config = DispatchConfig::from_json_str(&format!(
        r#"{{
            "queue": {{"endpoint": "memory://local", "poll_time": 1}},
            "tasks": ["{DEMO_MODULE}"],
            "routes": {{"{DEMO_MODULE}": "{DEMO_QUEUE}"}},
            "worker": {{"workers": {workers}}}
        }}"#
    ))?;
    let app = build_app(config)?;

    let mut options = app.worker_options();
    options.fetcher.wait_time = Duration::from_millis(200);
    let runner = app.start_worker(options).await?;

    let publisher = app.publisher();
    let mut pending = Vec::new();
    for x in 1..=count {
        for task in [Square::NAME, Cube::NAME] {
            if let Some(result) = publisher.invocation(task).dispatch_args([Value::from(x)]).await? {
                pending.push((task, x, result));
            }
        }
    }
    publisher
        .task::<Greet>()
        .with_header("sender", "dispatch demo")
        .dispatch(Vec::new(), [("name".to_string(), Value::from("world"))].into_iter().collect())
        .await?;

    for (task, x, mut result) in pending {
        match result.get_as::<i64>(Some(Duration::from_secs(5))).await {
            Ok(value) => println!("{task}({x}) = {value}"),
            Err(e) => println!("{task}({x}) failed: {e}"),
        }
    }

    publisher.shutdown().await?;
    let stats = runner.drain().await;
    report(&stats)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Worker(args) => worker(args).await,
        Command::Demo { count, workers } => demo(count, workers).await,
    }
}
