use anyhow::Context;
use clap::Parser;
use runner::cache::Cache;
use runner::config::Config;
use runner::worker::{Deps, WorkerOptions};
use runner::{evaluator, scorer, shutdown, stop_flag};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(clap::Parser, Debug)]
#[clap(author, version, about = "OptArena worker: evaluates and scores submitted solutions.", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start a worker process.
    Run(RunArgs),
    /// Ask a running worker to stop gracefully.
    Stop(StopArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Use the development configuration file by default.
    #[clap(long)]
    dev: bool,
    /// Configuration file (default: config.yml, or config.dev.yml with --dev).
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Name under which the stop flag of this worker is filed.
    #[clap(long = "name", env = "OPTARENA_PROCESS_NAME")]
    process_name: String,
    /// Which queue this worker consumes.
    #[clap(value_enum)]
    mode: Mode,
    /// Argv passed through to the containers.
    #[clap(trailing_var_arg = true)]
    command: Vec<String>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Evaluator,
    Scorer,
}

#[derive(clap::Args, Debug)]
struct StopArgs {
    /// Process name given to `run --name`.
    process_name: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Stop(args) => {
            init_tracing("info");
            stop_flag::set_stop_flag(&args.process_name)?;
            tracing::info!(process_name = %args.process_name, "stop flag set");
            Ok(())
        }
        Command::Run(args) => {
            let config_path = args.config.clone().unwrap_or_else(|| {
                PathBuf::from(if args.dev { "config.dev.yml" } else { "config.yml" })
            });
            let config = Config::load(&config_path)?;
            init_tracing(config.log_level.directive());

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let result = runtime.block_on(run_worker(args, config));
            runtime.shutdown_timeout(Duration::from_secs(5));
            result
        }
    }
}

/// Structured logs on stderr; `RUST_LOG` overrides the configured level.
fn init_tracing(directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");
}

async fn run_worker(args: RunArgs, config: Config) -> anyhow::Result<()> {
    // No work is claimed unless the docker daemon is reachable.
    let containers =
        docker_executor::DockerRunner::connect().context("connecting to the docker daemon")?;
    containers
        .check_accessible()
        .await
        .context("the docker daemon is not accessible")?;

    stop_flag::create_flag_file(&args.process_name, config.force)?;

    let aws = aws_sdk_config(&config).await;
    let (queue_url, queue_mode) = match args.mode {
        Mode::Evaluator => (&config.evaluator_queue_url, job_queue::QueueMode::Evaluator),
        Mode::Scorer => (&config.scorer_queue_url, job_queue::QueueMode::Scorer),
    };
    let queue = job_queue::SqsQueue::new(
        aws_sdk_sqs::Client::new(&aws),
        queue_url.clone(),
        queue_mode,
        Duration::from_secs(config.interval),
    );
    let store = trial_store::DynamoStore::new(
        aws_sdk_dynamodb::Client::new(&aws),
        config.table_name.clone(),
    );
    let matches =
        match_client::GraphQlMatchResolver::new(config.api_url.clone(), config.api_token.clone());

    let deps = Deps {
        queue: Arc::new(queue),
        store: Arc::new(store),
        matches: Arc::new(matches),
        containers: Arc::new(containers),
    };
    let options = WorkerOptions {
        process_name: args.process_name.clone(),
        timeout: config.timeout,
        num: config.num,
        rm: config.rm,
        command: args.command.clone(),
    };

    let cancel = tokio_util::sync::CancellationToken::new();
    shutdown::spawn_signal_handler(cancel.clone());
    stop_flag::spawn_stop_flag_watcher(args.process_name.clone(), cancel.clone());

    let result = match args.mode {
        Mode::Evaluator => evaluator::run(&options, &deps, &cancel).await,
        Mode::Scorer => {
            let mut cache = Cache::open_default().context("opening the history cache")?;
            scorer::run(&options, &deps, &mut cache, &cancel).await
        }
    };

    // The flag file goes away only on a stop-flag shutdown; any other exit
    // leaves it for inspection.
    match stop_flag::delete_flag_file(&args.process_name) {
        Ok(()) => tracing::info!("deleted the stop flag file"),
        Err(err) => tracing::debug!(
            ?err,
            "leaving the stop flag file in place"
        ),
    }
    result
}

async fn aws_sdk_config(config: &Config) -> aws_config::SdkConfig {
    let credentials = aws_credential_types::Credentials::new(
        config.access_key_id.clone(),
        config.secret_access_key.clone(),
        None,
        None,
        "worker-config",
    );
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region_name.clone()))
        .credentials_provider(credentials)
        .load()
        .await
}
