use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use diagplane::config::{ObjectStoreConfig, PlaneConfig, RetryPolicy, TransferConfig};
use diagplane::ingress::Ingress;
use diagplane::node::ControlPlane;
use diagplane::scheduler::{FileType, Job, JobType};
use diagplane::shutdown::install_shutdown_handler;
use diagplane::transfer::{TransferParams, TransferSource, TransferStrategy, TransferWay};
use diagplane::worker::{CommandProvisioner, ElasticProvisioner, LoggingLauncher, WorkerRecord};

#[derive(Parser, Debug)]
#[command(name = "diagplane")]
#[command(version)]
#[command(about = "Job dispatch and worker-fleet control plane for diagnostics analyses")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the control plane, reading JSON commands from stdin and writing
    /// one JSON reply per command to stdout
    Server(ServerArgs),

    /// Land one artifact on a local worker and dispatch a job for it
    Dispatch(DispatchArgs),
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct TransferArgs {
    /// Remote for SCP transfers ("user@host")
    #[arg(long)]
    scp_remote: Option<String>,

    /// OSS endpoint base URL
    #[arg(long, requires = "oss_bucket")]
    oss_endpoint: Option<String>,

    #[arg(long)]
    oss_bucket: Option<String>,

    /// S3 endpoint base URL
    #[arg(long, requires = "s3_bucket")]
    s3_endpoint: Option<String>,

    #[arg(long)]
    s3_bucket: Option<String>,

    /// Transfer timeout in milliseconds
    #[arg(long, default_value = "600000")]
    transfer_timeout_ms: u64,
}

impl TransferArgs {
    fn into_config(self) -> TransferConfig {
        let store = |endpoint: Option<String>, bucket: Option<String>| match (endpoint, bucket) {
            (Some(endpoint), Some(bucket)) => Some(ObjectStoreConfig { endpoint, bucket }),
            _ => None,
        };
        TransferConfig {
            timeout_ms: self.transfer_timeout_ms,
            scp_remote: self.scp_remote,
            oss: store(self.oss_endpoint, self.oss_bucket),
            s3: store(self.s3_endpoint, self.s3_bucket),
        }
    }
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Static worker, repeatable.
    /// Format: "id=w1,root=/srv/w1,total=BYTES[,addr=HOST:PORT][,types=gc-log+heap-dump]"
    #[arg(long = "static-worker")]
    static_workers: Vec<String>,

    /// Shell command that provisions an elastic worker. Enables elastic workers.
    #[arg(long)]
    provision_command: Option<String>,

    /// Elastic workers not ready within this window become unreachable
    #[arg(long, default_value = "300000")]
    provisioning_timeout_ms: u64,

    /// Workers without a heartbeat for this long are not selectable
    #[arg(long, default_value = "30000")]
    heartbeat_staleness_ms: u64,

    #[arg(long, default_value = "10000")]
    maintenance_interval_ms: u64,

    /// Soft-delete files older than this many seconds (0 disables)
    #[arg(long, default_value = "604800")]
    retention_secs: u64,

    #[command(flatten)]
    transfer: TransferArgs,
}

// =============================================================================
// Dispatch Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DispatchArgs {
    /// Job type, e.g. GCLOG_ANALYSIS
    #[arg(long, short = 't')]
    job_type: String,

    /// Transfer way: URL, SCP, OSS, S3 or UPLOAD
    #[arg(long, short = 'w')]
    way: String,

    /// Transfer parameter, repeatable (e.g. --param path=/data/gc.log)
    #[arg(long = "param", short = 'p')]
    params: Vec<String>,

    /// Catalog path of the artifact (defaults to the addressing parameter)
    #[arg(long)]
    path: Option<String>,

    /// Artifact size in bytes, reserved on the worker
    #[arg(long, default_value = "0")]
    size: u64,

    /// Storage root of the local worker
    #[arg(long, default_value = "./diagplane-data")]
    worker_root: PathBuf,

    /// Capacity of the local worker in bytes
    #[arg(long, default_value = "1099511627776")]
    worker_total: u64,

    /// Selection attempts before the job fails
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    #[command(flatten)]
    transfer: TransferArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn parse_static_worker(flag: &str) -> Result<WorkerRecord, String> {
    let mut id = None;
    let mut root = None;
    let mut total = None;
    let mut addr = None;
    let mut types = None;

    for field in flag.split(',') {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{}'", field))?;
        match key.trim() {
            "id" => id = Some(value.to_string()),
            "root" => root = Some(PathBuf::from(value)),
            "total" => {
                total = Some(
                    value
                        .parse::<u64>()
                        .map_err(|e| format!("invalid total '{}': {}", value, e))?,
                )
            }
            "addr" => addr = Some(value.to_string()),
            "types" => {
                let parsed = value
                    .split('+')
                    .map(|t| t.parse::<FileType>().map_err(|e| e.to_string()))
                    .collect::<Result<Vec<_>, _>>()?;
                types = Some(parsed);
            }
            other => return Err(format!("unknown static worker field '{}'", other)),
        }
    }

    let id = id.ok_or("static worker needs id=")?;
    let root = root.ok_or("static worker needs root=")?;
    let total = total.ok_or("static worker needs total=")?;
    let addr = addr.unwrap_or_else(|| id.clone());

    let mut worker = WorkerRecord::new_static(id, addr, root, total);
    if let Some(types) = types {
        worker = worker.with_capabilities(types);
    }
    Ok(worker)
}

fn parse_params(pairs: &[String]) -> Result<TransferParams, String> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("expected key=value, got '{}'", pair))
        })
        .collect()
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        // stdout carries command replies and job output
        .with_writer(std::io::stderr)
        .init();
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let workers = args
        .static_workers
        .iter()
        .map(|flag| parse_static_worker(flag))
        .collect::<Result<Vec<_>, _>>()?;

    let mut config = PlaneConfig {
        heartbeat_staleness_ms: args.heartbeat_staleness_ms,
        maintenance_interval_ms: args.maintenance_interval_ms,
        file_retention_secs: (args.retention_secs > 0).then_some(args.retention_secs),
        transfer: args.transfer.into_config(),
        ..PlaneConfig::default()
    };
    let provisioner: Option<Arc<dyn ElasticProvisioner>> = match args.provision_command {
        Some(command) => {
            config = config.with_elastic(args.provisioning_timeout_ms);
            Some(Arc::new(CommandProvisioner::new(command)))
        }
        None => None,
    };

    if workers.is_empty() && provisioner.is_none() {
        tracing::warn!("No static workers and no provisioner; no job can be dispatched");
    }

    let transfers = TransferStrategy::from_config(&config.transfer);
    let plane = ControlPlane::new(config, transfers, Arc::new(LoggingLauncher), provisioner);
    for worker in workers {
        plane.registry.register(worker).await?;
    }

    let shutdown = install_shutdown_handler();
    let heartbeats = plane.spawn_heartbeat_receiver(shutdown.clone());
    let ingress = Ingress::new(&plane, heartbeats);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let (_, served) = tokio::join!(
        plane.run(shutdown.clone()),
        ingress.run(stdin, tokio::io::stdout(), shutdown.clone()),
    );
    if let Err(e) = served {
        tracing::error!(error = %e, "Command input failed");
    }
    Ok(())
}

async fn run_dispatch(args: DispatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let job_type: JobType = args.job_type.parse()?;
    let way: TransferWay = args.way.parse()?;
    let params = parse_params(&args.params)?;
    let source = TransferSource::new(way, params)?;

    let path = match args.path {
        Some(path) => path,
        None => way
            .required_parameters()
            .first()
            .and_then(|key| source.params.get(*key).cloned())
            .ok_or("--path is required for UPLOAD")?,
    };

    let config = PlaneConfig {
        file_retention_secs: None,
        transfer: args.transfer.into_config(),
        ..PlaneConfig::default()
    }
    .with_retry(RetryPolicy::immediate(args.max_attempts));

    let transfers = TransferStrategy::from_config(&config.transfer);
    let plane = ControlPlane::new(config, transfers, Arc::new(LoggingLauncher), None);
    plane
        .registry
        .register(WorkerRecord::new_static(
            "local",
            "localhost",
            args.worker_root,
            args.worker_total,
        ))
        .await?;

    let file_id = plane.catalog.ingest_from(source, path, args.size).await?;
    let job_id = plane.dispatcher.submit(job_type, file_id).await?;
    plane.dispatcher.dispatch(&job_id).await?;
    let job = plane.dispatcher.get_job(&job_id).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => print_job(&job),
    }
    Ok(())
}

fn print_job(job: &Job) {
    println!("Job ID:      {}", job.id);
    println!("Type:        {}", job.job_type);
    println!("State:       {}", job.state);
    println!("File ID:     {}", job.file_id);
    if let Some(worker) = &job.last_worker {
        println!("Worker:      {}", worker);
    }
    if let Some(path) = &job.landed_path {
        println!("Landed At:   {}", path.display());
    }
    println!("Attempts:    {}", job.attempts);
    if let Some(error) = &job.last_error {
        println!("Error:       [{}] {}", error.code, error.message);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Dispatch(dispatch_args) => run_dispatch(dispatch_args).await,
    }
}
