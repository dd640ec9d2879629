use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use common::brokers;
use common::patterns::Registry;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;
use worker::sandbox::exec_task;
use worker::{Worker, WorkerConfig};

/// Worker de dagq: toma tareas pendientes del broker y las ejecuta.
#[derive(Parser, Debug)]
#[command(name = "dagq-worker", version, about, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Corre el worker (lo mismo que sin subcomando).
    Run(RunArgs),

    /// Lado hijo de un job en proceso aparte; lee la tarea de stdin.
    #[command(hide = true)]
    ExecTask {
        /// Sólo para que `ps` muestre algo útil.
        task_id: u64,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    /// Correr una sola tarea y salir.
    #[arg(short = '1', long = "one", conflicts_with = "to_end")]
    one: bool,

    /// Correr hasta vaciar la cola y salir.
    #[arg(short = '2', long = "to-end")]
    to_end: bool,

    /// Tope de cpus a usar.
    #[arg(long, env = "DAGQ_CPUS")]
    cpus: Option<f64>,

    /// URL del broker (memory:, http://host:puerto).
    #[arg(long, env = "DAGQ_BROKER")]
    broker: Option<String>,
}

/// Filtro del hijo de exec-task. Su stderr es la salida de la tarea, así que
/// no lee `RUST_LOG` (lo hereda del worker) y por defecto sólo deja warn.
const EXEC_LOG_ENV: &str = "DAGQ_EXEC_LOG";

fn init_tracing(filter: EnvFilter, to_stderr: bool) {
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // En exec-task stdout es la salida de la tarea.
    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let registry = Arc::new(Registry::with_builtins());

    match cli.command {
        Some(Command::ExecTask { task_id }) => {
            let filter = EnvFilter::try_from_env(EXEC_LOG_ENV)
                .unwrap_or_else(|_| EnvFilter::new("warn"));
            init_tracing(filter, true);
            tracing::debug!("exec-task {}", task_id);
            exec_task(registry).await
        }
        Some(Command::Run(args)) => run(args, registry).await,
        None => run(cli.run, registry).await,
    }
}

async fn run(args: RunArgs, registry: Arc<Registry>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("worker=debug,common=info"));
    init_tracing(filter, false);

    let broker = brokers::connect(args.broker.as_deref()).await?;
    let mut worker = Worker::new(
        broker,
        registry,
        WorkerConfig {
            max_cpus: args.cpus,
            ..WorkerConfig::default()
        },
    );

    // SIGHUP: terminar lo que está corriendo y salir.
    let stopper = worker.stop_handle();
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        if hangup.recv().await.is_some() {
            info!("SIGHUP recibido; terminando los jobs en curso");
            stopper.stop();
        }
    });

    if args.one {
        worker.run_one().await?;
    } else if args.to_end {
        worker.run_to_end().await?;
    } else {
        worker.run_forever().await?;
    }
    info!("worker terminado");
    Ok(())
}
