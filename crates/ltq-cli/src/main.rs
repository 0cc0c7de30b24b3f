//! Command-line harness for running LTQ workers.
//!
//! Rust has no runtime `module:symbol` lookup, so `run <target>` cannot load
//! arbitrary user code the way a dynamically-typed host can. This binary is
//! the thin harness described for that case: it links against a fixed,
//! built-in demo registration reachable as `demo:echo`, and `clear`/`size`
//! work against any broker URL directly. Production deployments are expected
//! to embed the `ltq` library in their own binary and call `register_worker`
//! there, using this CLI only as a reference for flag and exit-code
//! conventions.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use ltq::{App, Broker, Outcome, TaskOptions, Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "ltq")]
#[command(about = "Run LTQ workers and apps, or inspect a broker's queues", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a Worker (or, with --app, every Worker of an App) and block until signal.
    Run {
        /// `module:symbol`-style target. Only the built-in `demo:echo` harness is resolvable.
        target: String,

        /// Treat `target` as resolving to an App rather than a single Worker.
        #[arg(long)]
        app: bool,

        /// Override the Worker's concurrency.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Broker URL; defaults to `memory://`.
        #[arg(long, default_value = "memory://")]
        broker_url: String,

        /// Log level passed to the tracing EnvFilter (e.g. info, debug, ltq=trace).
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Delete all messages for a queue.
    Clear {
        queue: String,
        #[arg(long, default_value = "memory://")]
        redis_url: String,
    },
    /// Print the number of visible messages in a queue.
    Size {
        queue: String,
        #[arg(long, default_value = "memory://")]
        redis_url: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { target, app, concurrency, broker_url, log_level } => {
            init_tracing(&log_level);
            let broker = ltq::from_url(&broker_url).await.context("connecting to broker")?;
            if app {
                run_app(&target, broker, concurrency).await
            } else {
                run_worker(&target, broker, concurrency).await
            }
        }
        Commands::Clear { queue, redis_url } => {
            let broker = ltq::from_url(&redis_url).await.context("connecting to broker")?;
            broker.clear(&queue).await.context("clearing queue")?;
            Ok(())
        }
        Commands::Size { queue, redis_url } => {
            let broker = ltq::from_url(&redis_url).await.context("connecting to broker")?;
            let size = broker.size(&queue).await.context("reading queue size")?;
            println!("{size}");
            Ok(())
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn run_worker(target: &str, broker: Arc<dyn Broker>, concurrency: Option<usize>) -> Result<()> {
    let worker = resolve_demo_worker(target, broker, concurrency)?;
    let worker_task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.start().await })
    };
    wait_for_signal().await;
    worker.shutdown();
    worker_task.await.context("worker task panicked")?.context("worker exited with an error")?;
    Ok(())
}

async fn run_app(target: &str, broker: Arc<dyn Broker>, concurrency: Option<usize>) -> Result<()> {
    if target != "demo:app" {
        bail!(
            "cannot resolve target {target:?}: this harness only ships the built-in demo:app registration; embed ltq in your own binary for real deployments"
        );
    }

    let mut app = App::new();
    let worker = resolve_demo_worker("demo:echo", broker, concurrency)?;
    app.register_worker(worker).await;
    let app = Arc::new(app);

    let app_task = {
        let app = app.clone();
        tokio::spawn(async move { app.start().await })
    };
    wait_for_signal().await;
    app.stop();
    app_task.await.context("app task panicked")?.context("app exited with an error")?;
    Ok(())
}

/// Registers the built-in demo task: echoes its args back through a log
/// line. Stands in for a `module:symbol` resolution step this binary cannot
/// perform generically.
fn resolve_demo_worker(target: &str, broker: Arc<dyn Broker>, concurrency: Option<usize>) -> Result<Arc<Worker>> {
    if target != "demo:echo" {
        bail!(
            "cannot resolve target {target:?}: this harness only ships the built-in demo:echo registration; embed ltq in your own binary for real deployments"
        );
    }

    let mut config = WorkerConfig::default();
    if let Some(n) = concurrency {
        config.concurrency = n;
    }
    let worker = Worker::new("demo", broker, config);
    worker.register("echo", TaskOptions::new(), |args: Value, kwargs: Value| async move {
        tracing::info!(?args, ?kwargs, "echo");
        Ok(Outcome::Success)
    });
    Ok(worker)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
