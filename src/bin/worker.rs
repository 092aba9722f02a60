//! CLI surface (§6.2): `worker run`, `workflows list|run`, `runs
//! list|status|logs|cancel|children`, `setup --check`.
//!
//! Workflow discovery is out of scope (§1): this binary ships with whatever
//! workflow types an embedding application registers by editing
//! [`register_workflows`] before building; there is no dynamic module
//! loading to mirror here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use durable_workflow::config::{self, ConfigOverrides, WorkerConfig};
use durable_workflow::continuation::ScheduleTicker;
use durable_workflow::engine::{EngineConfig, StepRegistry, WorkflowExecutor};
use durable_workflow::observability::{init_telemetry, TelemetryConfig};
use durable_workflow::persistence::{InMemoryStore, Pagination, PostgresStore, RunFilter, StorageContract};
use durable_workflow::recovery::{RecoveryConfig, RecoverySweeper};
use durable_workflow::scheduler::{Broker, InMemoryBroker};
use durable_workflow::worker::{WorkerPool, WorkerPoolConfig};
use durable_workflow::Api;
use serde_json::Value;
use uuid::Uuid;

/// Exit codes (§6.2).
const EXIT_OK: i32 = 0;
const EXIT_USER_ERROR: i32 = 2;
const EXIT_UNEXPECTED: i32 = 1;

#[derive(Parser)]
#[command(name = "durable-worker")]
#[command(about = "Durable workflow engine worker/CLI")]
#[command(version)]
struct Cli {
    /// Path to pyworkflow.config.yaml
    #[arg(long, default_value = "pyworkflow.config.yaml")]
    config: PathBuf,

    #[arg(long)]
    storage_backend: Option<String>,

    #[arg(long)]
    storage_dsn: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker process.
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    /// Inspect or trigger registered workflows.
    Workflows {
        #[command(subcommand)]
        command: WorkflowsCommand,
    },
    /// Inspect or control runs.
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    /// Validate configuration and storage connectivity.
    Setup {
        #[arg(long)]
        check: bool,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    Run {
        #[arg(long, conflicts_with_all = ["step_only", "schedule"])]
        workflow_only: bool,
        #[arg(long, conflicts_with_all = ["workflow_only", "schedule"])]
        step_only: bool,
        #[arg(long)]
        schedule: bool,
    },
}

#[derive(Subcommand)]
enum WorkflowsCommand {
    List,
    Run {
        workflow_name: String,
        #[arg(long, default_value = "{}")]
        input: String,
    },
}

#[derive(Subcommand)]
enum RunsCommand {
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Status {
        run_id: Uuid,
    },
    Logs {
        run_id: Uuid,
    },
    Cancel {
        run_id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
    Children {
        run_id: Uuid,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let overrides = ConfigOverrides {
        storage_backend: cli.storage_backend.clone(),
        storage_dsn: cli.storage_dsn.clone(),
        ..Default::default()
    };
    let config = match config::resolve(&cli.config, overrides) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(EXIT_USER_ERROR);
        }
    };

    let _telemetry = init_telemetry(TelemetryConfig::from_worker_config(&config));

    let code = match config.storage.backend.as_str() {
        "memory" => run_with_store(Arc::new(InMemoryStore::new()), config, cli.command).await,
        "postgres" => match config.storage.dsn.as_deref() {
            Some(dsn) => match PostgresStore::connect(dsn).await {
                Ok(store) => run_with_store(Arc::new(store), config, cli.command).await,
                Err(e) => {
                    eprintln!("failed to connect to storage: {e}");
                    EXIT_UNEXPECTED
                }
            },
            None => {
                eprintln!("storage.dsn is required for the postgres backend");
                EXIT_USER_ERROR
            }
        },
        other => {
            eprintln!("unknown storage backend: {other}");
            EXIT_USER_ERROR
        }
    };

    std::process::exit(code);
}

/// Placeholder registration point: an embedding application would register
/// its own `Workflow` implementations here. No types are registered by
/// default since workflow discovery is out of scope (§1).
fn register_workflows<S: StorageContract, B: Broker>(_executor: &mut WorkflowExecutor<S, B>) {}

async fn run_with_store<S: StorageContract + 'static>(
    store: Arc<S>,
    config: WorkerConfig,
    command: Commands,
) -> i32 {
    let broker = Arc::new(InMemoryBroker::new());
    let mut executor = WorkflowExecutor::with_config(
        store.clone(),
        broker.clone(),
        EngineConfig {
            default_nesting_limit: config.nesting_limit,
            claim_ttl: Duration::from_secs(config.claim_ttl_secs),
            ..EngineConfig::default()
        },
    );
    register_workflows(&mut executor);
    let executor = Arc::new(executor);
    let api = Arc::new(Api::new(store.clone(), broker.clone(), executor.clone()));

    match command {
        Commands::Worker { command: WorkerCommand::Run { workflow_only, step_only, schedule } } => {
            run_worker(executor, store, broker, api, config, workflow_only, step_only, schedule).await
        }
        Commands::Workflows { command } => run_workflows_command(&api, command).await,
        Commands::Runs { command } => run_runs_command(&api, command).await,
        Commands::Setup { check } => run_setup(store.as_ref(), check).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker<S: StorageContract + 'static, B: Broker + 'static>(
    executor: Arc<WorkflowExecutor<S, B>>,
    store: Arc<S>,
    broker: Arc<B>,
    api: Arc<Api<S, B>>,
    config: WorkerConfig,
    workflow_only: bool,
    step_only: bool,
    schedule_only: bool,
) -> i32 {
    let pool_config = WorkerPoolConfig::default().with_max_step_concurrency(config.worker.concurrency as usize);
    let pool = WorkerPool::new(executor.clone(), Arc::new(StepRegistry::new()), pool_config);

    if !schedule_only {
        if let Err(e) = pool.start() {
            eprintln!("failed to start worker pool: {e}");
            return EXIT_UNEXPECTED;
        }
    }

    let recovery_config = RecoveryConfig {
        sweep_interval: Duration::from_secs(config.recovery.interval_secs),
    };
    let sweeper = RecoverySweeper::new(store, broker, executor, recovery_config);
    let (recovery_shutdown_tx, recovery_shutdown_rx) = tokio::sync::watch::channel(false);
    let recovery_handle = if !workflow_only && !step_only {
        Some(tokio::spawn(async move { sweeper.run(recovery_shutdown_rx).await }))
    } else {
        None
    };

    let ticker = ScheduleTicker::new(api);
    let (schedule_shutdown_tx, schedule_shutdown_rx) = tokio::sync::watch::channel(false);
    let schedule_handle = if schedule_only || (!workflow_only && !step_only) {
        Some(tokio::spawn(async move { ticker.run(schedule_shutdown_rx).await }))
    } else {
        None
    };

    tracing::info!("worker running; press ctrl-c to shut down");
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("failed to install ctrl-c handler; exiting immediately");
        return EXIT_UNEXPECTED;
    }

    let _ = recovery_shutdown_tx.send(true);
    let _ = schedule_shutdown_tx.send(true);
    if let Some(h) = recovery_handle {
        let _ = h.await;
    }
    if let Some(h) = schedule_handle {
        let _ = h.await;
    }
    if !schedule_only {
        if let Err(e) = pool.shutdown().await {
            eprintln!("worker pool shutdown error: {e}");
            return EXIT_UNEXPECTED;
        }
    }
    EXIT_OK
}

async fn run_workflows_command<S: StorageContract + 'static, B: Broker + 'static>(
    api: &Api<S, B>,
    command: WorkflowsCommand,
) -> i32 {
    match command {
        WorkflowsCommand::List => {
            for name in api.registered_workflow_types() {
                println!("{name}");
            }
            EXIT_OK
        }
        WorkflowsCommand::Run { workflow_name, input } => {
            let parsed: Value = match serde_json::from_str(&input) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("invalid --input JSON: {e}");
                    return EXIT_USER_ERROR;
                }
            };
            match api.start(&workflow_name, parsed, Default::default()).await {
                Ok(run_id) => {
                    println!("{run_id}");
                    EXIT_OK
                }
                Err(e) => {
                    eprintln!("{e}");
                    EXIT_UNEXPECTED
                }
            }
        }
    }
}

async fn run_runs_command<S: StorageContract + 'static, B: Broker + 'static>(api: &Api<S, B>, command: RunsCommand) -> i32 {
    match command {
        RunsCommand::List { status } => {
            let filter = RunFilter {
                status: status.and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok()),
                ..Default::default()
            };
            match api.list_runs(filter, Pagination::default()).await {
                Ok(page) => {
                    for run in page.runs {
                        println!("{} {} {}", run.run_id, run.workflow_name, run.status);
                    }
                    EXIT_OK
                }
                Err(e) => {
                    eprintln!("{e}");
                    EXIT_UNEXPECTED
                }
            }
        }
        RunsCommand::Status { run_id } => match api.get_run(run_id).await {
            Ok(run) => {
                println!("{}", serde_json::to_string_pretty(&run).unwrap_or_default());
                EXIT_OK
            }
            Err(e) => {
                eprintln!("{e}");
                EXIT_USER_ERROR
            }
        },
        RunsCommand::Logs { run_id } => match api.get_events(run_id).await {
            Ok(events) => {
                for event in events {
                    println!("{} {:?}", event.sequence, event.data);
                }
                EXIT_OK
            }
            Err(e) => {
                eprintln!("{e}");
                EXIT_USER_ERROR
            }
        },
        RunsCommand::Cancel { run_id, reason } => match api.cancel_tree(run_id, reason).await {
            Ok(()) => EXIT_OK,
            Err(e) => {
                eprintln!("{e}");
                EXIT_USER_ERROR
            }
        },
        RunsCommand::Children { run_id } => match api.list_outstanding_children(run_id).await {
            Ok(children) => {
                for child in children {
                    println!("{} {} {}", child.run_id, child.workflow_name, child.status);
                }
                EXIT_OK
            }
            Err(e) => {
                eprintln!("{e}");
                EXIT_USER_ERROR
            }
        },
    }
}

async fn run_setup<S: StorageContract>(store: &S, check: bool) -> i32 {
    if !check {
        println!("nothing to set up; storage schemas are applied via migrations at connect time");
        return EXIT_OK;
    }
    match store.list_runs(RunFilter::default(), Pagination { cursor: None, limit: 1 }).await {
        Ok(_) => {
            println!("storage: ok");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("storage: {e}");
            EXIT_UNEXPECTED
        }
    }
}
