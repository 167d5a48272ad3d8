use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use batchq::config::BatchConfig;
use batchq::job::{self, Job, DEFAULT_LOG_TEMPLATE, UNKNOWN_RUNTIME};
use batchq::logging;
use batchq::producer::Launcher;
use batchq::queue::{AmqpQueue, JobQueue};
use batchq::shutdown::install_shutdown_handler;
use batchq::worker::{store_for, ArtifactTransfer, DaemonOutcome, WorkerDaemon};

/// Exit status of a daemon that stopped because a job failed.
const EXIT_BROKEN: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "batchq")]
#[command(version)]
#[command(about = "Distributed batch job queue: submit jobs and run worker daemons")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a worker daemon that claims and executes jobs
    Daemon(DaemonArgs),

    /// Publish a single job
    Submit(SubmitArgs),

    /// Publish every job in a JSON-lines file as one batch
    Batch(BatchArgs),

    /// Show the number of jobs waiting in the queue
    Status {
        #[command(flatten)]
        common: CommonArgs,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug, Clone)]
struct CommonArgs {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c', env = "BATCHQ_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Daemon Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DaemonArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Identifier of this instance, used in its log file name
    #[arg(long, default_value = "1")]
    instance_id: String,

    /// Run this many daemon instances as child processes
    #[arg(long, default_value = "1")]
    instances: usize,

    /// Concurrent job slots (overrides daemon.slots)
    #[arg(long)]
    slots: Option<usize>,
}

// =============================================================================
// Producer Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SubmitArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Batch to file the job under
    #[arg(long)]
    batch_id: Option<String>,

    /// Advisory CPU count
    #[arg(long, default_value = "1")]
    num_cpus: u32,

    /// Advisory runtime in seconds
    #[arg(long, default_value_t = UNKNOWN_RUNTIME, allow_negative_numbers = true)]
    expected_runtime: f64,

    /// Log file name; `{id}` is replaced by the job id
    #[arg(long, default_value = DEFAULT_LOG_TEMPLATE)]
    log_template: String,

    /// File the job must create for it to count as successful
    #[arg(long)]
    output_file: Option<PathBuf>,

    /// The command to run, without a shell
    #[arg(last = true, required = true)]
    argv: Vec<String>,
}

#[derive(Parser, Debug)]
struct BatchArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Batch id (random when omitted)
    #[arg(long)]
    batch_id: Option<String>,

    /// JSON-lines file, one job per line
    file: PathBuf,
}

/// One line of a batch file.
#[derive(Debug, Deserialize)]
struct BatchLine {
    command: Vec<String>,
    #[serde(default = "one_cpu")]
    num_cpus: u32,
    #[serde(default)]
    expected_runtime: Option<f64>,
    #[serde(default = "default_log_template")]
    log_file_template: String,
    #[serde(default)]
    output_file: Option<PathBuf>,
}

fn one_cpu() -> u32 {
    1
}

fn default_log_template() -> String {
    DEFAULT_LOG_TEMPLATE.to_string()
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    job_id: String,
    batch_id: String,
    submitted_at: String,
}

#[derive(Serialize)]
struct BatchOutput {
    batch_id: String,
    jobs: usize,
}

#[derive(Serialize)]
struct StatusOutput {
    queue: String,
    ready: u32,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn load_config(common: &CommonArgs) -> Result<BatchConfig, Box<dyn std::error::Error>> {
    Ok(BatchConfig::load(common.config.as_deref())?)
}

fn read_batch_file(path: &Path) -> Result<Vec<BatchLine>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let mut lines = Vec::new();
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: BatchLine = serde_json::from_str(line)
            .map_err(|e| format!("{}:{}: {}", path.display(), number + 1, e))?;
        lines.push(parsed);
    }
    Ok(lines)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Daemon Implementation
// =============================================================================

async fn run_daemon(args: DaemonArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut config = load_config(&args.common)?;
    if let Some(slots) = args.slots {
        config.daemon.slots = slots;
        config.validate()?;
    }

    if args.instances > 1 {
        return supervise_instances(&args, &config).await;
    }

    let _guard = logging::init_daemon(&config.daemon.log_dir, &args.instance_id)?;
    let cancel = install_shutdown_handler()?;

    tracing::info!(
        instance_id = %args.instance_id,
        slots = config.daemon.slots,
        queue = %config.queue.job_queue,
        store = %config.store.destination(),
        "Starting batchq daemon"
    );

    // validate() keeps slots within u16
    let prefetch = u16::try_from(config.daemon.slots)?;
    let consumer_prefix = format!("batchq-{}-{}", args.instance_id, std::process::id());
    let queue = AmqpQueue::connect(config.queue.clone(), prefetch, consumer_prefix).await?;
    let transfer = ArtifactTransfer::new(store_for(&config.store), &config.store);

    let mut daemon = WorkerDaemon::new(args.instance_id, &config.daemon, queue, transfer);
    match daemon.run(cancel).await {
        DaemonOutcome::Drained => Ok(ExitCode::SUCCESS),
        DaemonOutcome::Broken => Ok(ExitCode::from(EXIT_BROKEN)),
    }
}

/// Run `--instances` copies of this daemon as child processes and wait for
/// all of them, forwarding shutdown.
async fn supervise_instances(
    args: &DaemonArgs,
    config: &BatchConfig,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    logging::init_cli();
    let cancel = install_shutdown_handler()?;
    let exe = std::env::current_exe()?;

    let mut children: Vec<(String, tokio::process::Child)> = Vec::with_capacity(args.instances);
    for n in 1..=args.instances {
        let instance_id = format!("{}-{}", args.instance_id, n);
        let mut command = tokio::process::Command::new(&exe);
        command
            .arg("daemon")
            .arg("--instance-id")
            .arg(&instance_id)
            .arg("--slots")
            .arg(config.daemon.slots.to_string());
        if let Some(ref path) = args.common.config {
            command.arg("--config").arg(path);
        }
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    instance_id = %instance_id,
                    error = %e,
                    "Failed to start daemon instance, stopping the ones already running"
                );
                let pids: Vec<u32> = children.iter().filter_map(|(_, c)| c.id()).collect();
                terminate(&pids);
                for (instance_id, mut child) in children {
                    if let Err(wait_err) = child.wait().await {
                        tracing::warn!(instance_id = %instance_id, error = %wait_err, "Failed to reap daemon instance");
                    }
                }
                return Err(e.into());
            }
        };
        tracing::info!(instance_id = %instance_id, pid = ?child.id(), "Started daemon instance");
        children.push((instance_id, child));
    }

    let forward = cancel.clone();
    let pids: Vec<u32> = children.iter().filter_map(|(_, c)| c.id()).collect();
    tokio::spawn(async move {
        forward.cancelled().await;
        terminate(&pids);
    });

    let mut code = ExitCode::SUCCESS;
    for (instance_id, mut child) in children {
        let status = child.wait().await?;
        tracing::info!(instance_id = %instance_id, status = ?status.code(), "Daemon instance exited");
        if status.code() != Some(0) {
            code = ExitCode::from(EXIT_BROKEN);
        }
    }
    Ok(code)
}

/// Send SIGTERM to each daemon instance.
fn terminate(pids: &[u32]) {
    for &pid in pids {
        // Safety: kill(2) takes no pointers
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            tracing::warn!(pid, "Failed to forward SIGTERM to daemon instance");
        }
    }
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn connect_producer(config: &BatchConfig) -> Result<AmqpQueue, Box<dyn std::error::Error>> {
    let prefix = format!("batchq-client-{}", std::process::id());
    Ok(AmqpQueue::connect(config.queue.clone(), 0, prefix).await?)
}

async fn handle_submit(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.common)?;
    let mut launcher = Launcher::new(connect_producer(&config).await?);

    let mut job = Job::new(args.argv)
        .with_num_cpus(args.num_cpus)
        .with_expected_runtime(args.expected_runtime)
        .with_log_template(args.log_template);
    job.output_file = args.output_file;
    let batch_id = args.batch_id.unwrap_or_else(|| job::NO_BATCH.to_string());

    let job_id = launcher.post_job(job, Some(batch_id.clone())).await?;
    launcher.into_inner().close().await?;

    match args.common.output {
        OutputFormat::Json => print_json(&SubmitOutput {
            job_id,
            batch_id,
            submitted_at: chrono::Utc::now().to_rfc3339(),
        })?,
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID:   {}", job_id);
            println!("Batch ID: {}", batch_id);
        }
    }
    Ok(())
}

async fn handle_batch(args: BatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.common)?;
    let lines = read_batch_file(&args.file)?;
    if lines.is_empty() {
        return Err(format!("{} contains no jobs", args.file.display()).into());
    }

    let mut launcher = Launcher::new(connect_producer(&config).await?);
    for line in lines {
        launcher.stage_job(
            line.command,
            line.num_cpus,
            line.expected_runtime.unwrap_or(UNKNOWN_RUNTIME),
            line.log_file_template,
            line.output_file,
        );
    }
    let jobs = launcher.staged();
    let batch_id = launcher.flush(args.batch_id).await?;
    launcher.into_inner().close().await?;

    match args.common.output {
        OutputFormat::Json => print_json(&BatchOutput { batch_id, jobs })?,
        OutputFormat::Table => {
            println!("Batch submitted successfully!");
            println!("Batch ID: {}", batch_id);
            println!("Jobs:     {}", jobs);
        }
    }
    Ok(())
}

async fn handle_status(common: CommonArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&common)?;
    let mut queue = connect_producer(&config).await?;
    let ready = queue.queue_depth().await?;
    queue.close().await?;

    match common.output {
        OutputFormat::Json => print_json(&StatusOutput {
            queue: config.queue.job_queue,
            ready,
        })?,
        OutputFormat::Table => {
            println!("{:<24} READY", "QUEUE");
            println!("{:<24} {}", config.queue.job_queue, ready);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Daemon(daemon_args) => return run_daemon(daemon_args).await,
        Commands::Submit(submit_args) => {
            logging::init_cli();
            handle_submit(submit_args).await?;
        }
        Commands::Batch(batch_args) => {
            logging::init_cli();
            handle_batch(batch_args).await?;
        }
        Commands::Status { common } => {
            logging::init_cli();
            handle_status(common).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminate_stops_started_instances() {
        let mut children: Vec<tokio::process::Child> = (0..2)
            .map(|_| tokio::process::Command::new("sleep").arg("30").spawn().unwrap())
            .collect();
        let pids: Vec<u32> = children.iter().filter_map(|c| c.id()).collect();

        terminate(&pids);

        for child in &mut children {
            let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
                .await
                .expect("instance ignored SIGTERM")
                .unwrap();
            assert!(!status.success());
            assert_eq!(status.code(), None);
        }
    }
}
