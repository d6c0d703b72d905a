#![forbid(unsafe_code)]

//! `fact`: run tasks on local and remote hosts.
//!
//! Loads configuration, applies command-line overrides, starts the operator
//! input reader, and hands the parsed task list to the scheduler.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Level};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use hostfact::scheduler::run_all;
use hostfact::stdin_queue::{self, StdinQueue};
use hostfact::tasks::{parse_tasks, TaskRegistry};
use hostfact::{AppError, CommonConfig, Env, Result};

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "fact", about = "Tasks executing via ssh and sh", version, long_about = None)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Tasks with arguments, e.g. `'uname -a'`, `run 'uptime' use_sudo=True`
    /// or `push:./dist,/srv/app`.
    #[arg(required = true)]
    command: Vec<String>,

    /// Connection strings `[user@]host[:port]`, separated by `,`.
    #[arg(short = 'H', long = "host")]
    hosts: Option<String>,

    /// Run the arguments with `run`.
    #[arg(short = 'r')]
    run: bool,

    /// Run the arguments with `sudo`.
    #[arg(short = 's')]
    sudo: bool,

    /// Do not echo output or forward keystrokes.
    #[arg(short = 'n', long)]
    non_interactive: bool,

    /// Run targets and tasks concurrently.
    #[arg(short = 'p', long)]
    parallel: bool,

    /// Run targets concurrently.
    #[arg(long)]
    parallel_targets: bool,

    /// Run the tasks of one target concurrently.
    #[arg(long)]
    parallel_tasks: bool,

    /// TOML or JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Login user for connection strings without one.
    #[arg(long)]
    user: Option<String>,

    /// Port for connection strings without one.
    #[arg(long)]
    port: Option<String>,

    /// Copy warnings and errors to stderr.
    #[arg(long)]
    show_errors: bool,

    /// Look up binaries with `which` instead of running commands.
    #[arg(long)]
    dry_run: bool,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log file, appended to.
    #[arg(long, default_value = "factory.log")]
    log_file: PathBuf,
}

fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    let show_errors = Arc::new(AtomicBool::new(args.show_errors));
    init_tracing(args.log_format, &args.log_file, Arc::clone(&show_errors))?;
    debug!(?args, "arguments parsed");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;
    let outcome = runtime.block_on(run(args, show_errors));
    // The stdin reader may still be parked in a blocking read.
    runtime.shutdown_background();
    outcome
}

async fn run(args: Cli, show_errors: Arc<AtomicBool>) -> Result<ExitCode> {
    let mut common = CommonConfig::load_or_default(args.config.as_deref());
    apply_cli(&mut common, &args);
    show_errors.store(common.show_errors, Ordering::Relaxed);

    let registry = TaskRegistry::with_builtins();
    let mut command = args.command;
    if args.sudo {
        command.insert(0, "sudo".to_owned());
    } else if args.run {
        command.insert(0, "run".to_owned());
    }
    let tasks = parse_tasks(&command, &registry, &common);
    debug!(?tasks, "tasks parsed");

    let queue = StdinQueue::new();
    let cancel = CancellationToken::new();
    let reader = common.interactive.then(|| {
        debug!("starting stdin reader");
        stdin_queue::spawn_reader(
            queue.clone(),
            tokio::io::stdin(),
            common.store_stdin,
            cancel.clone(),
        )
    });

    let targets = common.hosts.clone();
    let concurrency = common.concurrency();
    let env = Env::new(common).with_stdin(queue);
    let report = run_all(&env, &registry, &targets, &tasks, concurrency).await;

    cancel.cancel();
    if let Some(reader) = reader {
        if let Err(err) = reader.await {
            error!(%err, "stdin reader failed");
        }
    }

    if report.failed() {
        let failed = report.failed_targets().collect::<Vec<_>>().join(", ");
        error!(targets = %failed, "some targets failed");
        return Ok(ExitCode::FAILURE);
    }
    info!(targets = report.targets.len(), "all targets finished");
    Ok(ExitCode::SUCCESS)
}

fn apply_cli(common: &mut CommonConfig, args: &Cli) {
    if let Some(hosts) = &args.hosts {
        common.hosts = hosts
            .split(common.split_hosts.as_str())
            .filter(|host| !host.is_empty())
            .map(str::to_owned)
            .collect();
    }
    if let Some(user) = &args.user {
        common.user.clone_from(user);
    }
    if let Some(port) = &args.port {
        common.ssh_port.clone_from(port);
    }
    if args.show_errors {
        common.show_errors = true;
    }
    if args.non_interactive {
        common.interactive = false;
    }
    if args.parallel || args.parallel_targets {
        common.parallel_targets = true;
    }
    if args.parallel || args.parallel_tasks {
        common.parallel_tasks = true;
    }
    if args.dry_run {
        common.dry_run = true;
    }
}

fn init_tracing(log_format: LogFormat, log_file: &Path, show_errors: Arc<AtomicBool>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|err| AppError::Config(format!("cannot open log file {}: {err}", log_file.display())))?;

    let file_layer = match log_format {
        LogFormat::Text => fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(Mutex::new(file)).boxed(),
    };
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter_fn(move |meta| {
            show_errors.load(Ordering::Relaxed) && *meta.level() <= Level::WARN
        }));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?;

    Ok(())
}
