//! `courier` — run a broker, a worker, or a heartbeat monitor, or submit one
//! request.
//!
//! Usage:
//!   courier broker --listen 127.0.0.1:61616
//!   courier worker --processor hash
//!   courier submit ./clip.mov --option algorithm=blake3
//!   courier monitor --max-silence-secs 30

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand, ValueEnum};
use courier_core::{
    Address, ClockSource, Codec, ContentReference, ReplyStatus, SystemClock, TransformOptions,
};
use courier_node::channel::broker::BrokerServer;
use courier_node::channel::{self, MemoryBroker, MessageChannel};
use courier_node::config::NodeConfig;
use courier_node::dispatch::{Submission, SyncOutcome};
use courier_node::error::DispatchError;
use courier_node::health::{HeartbeatDao, HeartbeatMonitor, InMemoryHeartbeatDao};
use courier_node::node::{RequesterNode, WorkerNode};
use courier_node::processors::{ContentHashProcessor, ExternalCommandProcessor};
use courier_node::telemetry::{self, LogFormat};
use courier_node::transport::{FileTransport, WaitPolicy};
use courier_node::RequestProcessor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Content-processing dispatch over a message broker.
#[derive(Parser, Debug)]
#[command(name = "courier", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Broker URL: memory://<name>, tcp://host:port, failover:(tcp://a,tcp://b)
    #[arg(long, env = "COURIER_BROKER_URL", default_value = "memory://local", global = true)]
    broker_url: String,

    /// Body codec for outgoing messages (json, msgpack)
    #[arg(long, env = "COURIER_CODEC", default_value = "json", global = true)]
    codec: Codec,

    /// Console log layout
    #[arg(long, env = "COURIER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "COURIER_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    /// Queue requests are sent to and consumed from
    #[arg(long, env = "COURIER_REQUEST_QUEUE", default_value = "courier.requests", global = true)]
    request_queue: String,

    /// Queue replies are sent to
    #[arg(long, env = "COURIER_REPLY_QUEUE", default_value = "courier.replies", global = true)]
    reply_queue: String,

    /// Topic heartbeats are published to
    #[arg(long, env = "COURIER_HEARTBEAT_TOPIC", default_value = "courier.heartbeats", global = true)]
    heartbeat_topic: String,

    /// Directory for file:// content created by this process
    #[arg(long, env = "COURIER_FILE_ROOT", global = true)]
    file_root: Option<PathBuf>,

    /// S3-compatible endpoint, path-style
    #[arg(long, env = "COURIER_OBJECT_STORE_ENDPOINT", global = true)]
    object_store_endpoint: Option<String>,

    /// Bucket for content created on object storage
    #[arg(long, env = "COURIER_OBJECT_STORE_BUCKET", default_value = "courier", global = true)]
    object_store_bucket: String,

    /// Base URL of a WebDAV-like document store
    #[arg(long, env = "COURIER_REMOTE_BASE_URL", global = true)]
    remote_base_url: Option<String>,
}

impl CommonArgs {
    fn node_config(&self) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.channel.broker_url.clone_from(&self.broker_url);
        config.channel.codec = self.codec;

        let requests = Address::queue(&self.request_queue);
        let replies = Address::queue(&self.reply_queue);
        config.dispatch.request_address = requests.clone();
        config.dispatch.reply_address = replies.clone();
        config.worker.request_address = requests;
        config.worker.default_reply_address = replies;
        config.heartbeat.address = Address::topic(&self.heartbeat_topic);

        if let Some(root) = &self.file_root {
            config.transport.file_root.clone_from(root);
        }
        config
            .transport
            .object_store_endpoint
            .clone_from(&self.object_store_endpoint);
        config
            .transport
            .object_store_bucket
            .clone_from(&self.object_store_bucket);
        config.transport.remote_base_url.clone_from(&self.remote_base_url);
        config
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the TCP broker
    Broker {
        #[arg(long, env = "COURIER_BROKER_LISTEN", default_value = "127.0.0.1:61616")]
        listen: String,
    },
    /// Consume and process requests
    Worker(WorkerArgs),
    /// Upload a file and run one request against it
    Submit(SubmitArgs),
    /// Record heartbeats and report silent instances
    Monitor {
        /// Instances silent for longer than this are reported
        #[arg(long, default_value_t = 30)]
        max_silence_secs: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProcessorKind {
    /// Digest each source
    Hash,
    /// Run an external executable
    Command,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[arg(long, value_enum, default_value_t = ProcessorKind::Hash)]
    processor: ProcessorKind,

    /// Executable for the command processor
    #[arg(long, env = "COURIER_COMMAND")]
    command: Option<String>,

    /// Argument for the command processor; `{source}` and `{target}` are
    /// replaced with local paths
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Extension of targets the command processor creates
    #[arg(long, default_value = "out")]
    output_suffix: String,

    /// Upper bound on one command run
    #[arg(long, default_value_t = 600)]
    command_timeout_secs: u64,

    /// Parallel processing tasks
    #[arg(long, env = "COURIER_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Identity reported in heartbeats
    #[arg(long, env = "COURIER_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Bind address for /health endpoints
    #[arg(long, env = "COURIER_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// Seconds between heartbeats
    #[arg(long, default_value_t = 5)]
    heartbeat_secs: u64,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// File to upload as the request's source
    file: PathBuf,

    /// Media type of the source
    #[arg(long, default_value = "application/octet-stream")]
    media_type: String,

    /// Processing option, `key=value`; repeatable
    #[arg(long = "option", value_parser = parse_option)]
    options: Vec<(String, String)>,

    /// Explicit target URI; repeatable
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Return after sending and follow progress instead of waiting in place
    #[arg(long = "async")]
    asynchronous: bool,

    /// Give up after this many milliseconds; 0 waits forever
    #[arg(long, default_value_t = 120_000)]
    timeout_ms: i64,
}

fn parse_option(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = telemetry::init_tracing(cli.common.log_format, "info") {
        eprintln!("courier: {e:#}");
        return ExitCode::FAILURE;
    }
    if let Some(addr) = cli.common.metrics_addr {
        if let Err(e) = telemetry::install_metrics_exporter(addr) {
            error!(error = %e, "metrics exporter not started");
        }
    }

    let result = match cli.command {
        Command::Broker { listen } => run_broker(&listen).await,
        Command::Worker(args) => run_worker(&cli.common, args).await,
        Command::Submit(args) => run_submit(&cli.common, args).await,
        Command::Monitor { max_silence_secs } => {
            run_monitor(&cli.common, Duration::from_secs(max_silence_secs)).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            let message = format!("{e:#}");
            error!(error = %message, code, "courier failed");
            eprintln!("courier: {message}");
            ExitCode::from(code)
        }
    }
}

/// 2 content, 3 timeout, 4 remote failure, 1 anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<DispatchError>() {
        Some(DispatchError::Content(_)) => 2,
        Some(DispatchError::Timeout { .. }) => 3,
        Some(DispatchError::Remote { .. }) => 4,
        _ => 1,
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn run_broker(listen: &str) -> anyhow::Result<()> {
    let server = BrokerServer::bind(listen, Arc::new(MemoryBroker::new())).await?;
    info!(addr = %server.local_addr()?, "broker listening");
    let token = CancellationToken::new();
    let stop = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop.cancel();
    });
    server.serve(token).await;
    info!("broker stopped");
    Ok(())
}

async fn run_worker(common: &CommonArgs, args: WorkerArgs) -> anyhow::Result<()> {
    let mut config = common.node_config();
    config.worker.concurrency = args.concurrency.max(1);
    config.heartbeat.instance_id = args.instance_id;
    config.heartbeat.period = Duration::from_secs(args.heartbeat_secs.max(1));
    config.http_addr = args.http_addr;

    match args.processor {
        ProcessorKind::Hash => serve_worker(ContentHashProcessor::new(), config).await,
        ProcessorKind::Command => {
            let Some(program) = args.command else {
                bail!("--command is required with --processor command");
            };
            let processor = ExternalCommandProcessor::new(
                program,
                args.args,
                Duration::from_secs(args.command_timeout_secs),
            )
            .with_output_suffix(args.output_suffix);
            serve_worker(processor, config).await
        }
    }
}

async fn serve_worker<P: RequestProcessor>(processor: P, config: NodeConfig) -> anyhow::Result<()> {
    let running = WorkerNode::connect(processor, config).await?.start().await?;
    if let Some(addr) = running.health_addr() {
        info!(%addr, "health endpoint serving");
    }
    tokio::select! {
        () = shutdown_signal() => info!("shutdown requested"),
        () = running.drained() => info!("node drained"),
    }
    if !running.shutdown().await {
        warn!("in-flight work was cancelled");
    }
    Ok(())
}

async fn run_submit(common: &CommonArgs, args: SubmitArgs) -> anyhow::Result<()> {
    let config = common.node_config();
    let data = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let source = ContentReference::new(upload_uri(&config, &args.file), args.media_type.clone());

    let mut options = TransformOptions::new();
    for (key, value) in args.options {
        options.insert(key, value);
    }
    let mut submission = Submission::new(options).with_upload(source, Bytes::from(data));
    if !args.targets.is_empty() {
        let targets = args
            .targets
            .iter()
            .map(|uri| ContentReference::new(uri.clone(), "application/octet-stream"))
            .collect();
        submission = submission.with_targets(targets);
    }

    let requester = RequesterNode::connect(&config).await?;
    let cancel = CancellationToken::new();
    let outcome = if args.asynchronous {
        follow(&requester, submission, args.timeout_ms, &cancel).await
    } else {
        tokio::select! {
            outcome = requester.dispatcher().await_sync(submission, args.timeout_ms, &cancel) => outcome,
            () = shutdown_signal() => Ok(SyncOutcome::Cancelled),
        }
    };
    requester.shutdown().await;

    match outcome? {
        SyncOutcome::Completed(results) => {
            for result in results {
                println!("{}", result.reference.uri);
                if let Ok(text) = std::str::from_utf8(&result.data) {
                    if text.len() <= 1024 && !text.contains('\0') {
                        println!("{text}");
                    }
                }
            }
            Ok(())
        }
        SyncOutcome::Cancelled => bail!("cancelled"),
    }
}

/// Sends without waiting, then polls and prints progress until terminal.
async fn follow(
    requester: &RequesterNode,
    submission: Submission,
    timeout_ms: i64,
    cancel: &CancellationToken,
) -> Result<SyncOutcome, DispatchError> {
    let dispatcher = requester.dispatcher();
    let id = dispatcher.submit_async(submission).await?;
    println!("submitted {id}");

    let deadline = u64::try_from(timeout_ms)
        .ok()
        .filter(|ms| *ms > 0)
        .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
    let mut last = None;
    loop {
        let snapshot = dispatcher.poll_progress(&id)?;
        let seen = (snapshot.status, snapshot.progress.map(f32::to_bits));
        if last != Some(seen) {
            match snapshot.progress {
                Some(p) => println!("{id} {} {:.0}%", snapshot.status.as_str(), p * 100.0),
                None => println!("{id} {}", snapshot.status.as_str()),
            }
            last = Some(seen);
        }
        if snapshot.status == ReplyStatus::Error {
            return Err(DispatchError::Remote {
                request_id: id,
                detail: snapshot.detail.unwrap_or_default(),
            });
        }
        if snapshot.is_terminal() {
            let results = dispatcher
                .fetch_results(
                    &snapshot.target_refs,
                    &WaitPolicy::UntilAvailable(cancel.child_token()),
                )
                .await?;
            return Ok(SyncOutcome::Completed(results));
        }
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            return Err(DispatchError::Timeout {
                request_id: id,
                timeout_ms: u64::try_from(timeout_ms).unwrap_or_default(),
            });
        }
        tokio::select! {
            () = shutdown_signal() => return Ok(SyncOutcome::Cancelled),
            () = tokio::time::sleep(dispatcher.config().poll_interval) => {}
        }
    }
}

/// Where `file` is uploaded: the first configured backend, as for created
/// content.
fn upload_uri(config: &NodeConfig, file: &Path) -> String {
    let name = file
        .file_name()
        .map_or_else(|| "upload".into(), |n| n.to_string_lossy());
    let id = uuid::Uuid::new_v4();
    if config.transport.object_store_endpoint.is_some() {
        format!("s3://{}/uploads/{id}/{name}", config.transport.object_store_bucket)
    } else if let Some(base) = &config.transport.remote_base_url {
        format!("{}/{id}-{name}", base.trim_end_matches('/'))
    } else {
        let root = std::path::absolute(&config.transport.file_root)
            .unwrap_or_else(|_| config.transport.file_root.clone());
        FileTransport::uri_for(&root.join("uploads").join(format!("{id}-{name}")))
    }
}

async fn run_monitor(common: &CommonArgs, max_silence: Duration) -> anyhow::Result<()> {
    let config = common.node_config();
    let broker = channel::connect(&config.channel.broker_url).await?;
    let channel = MessageChannel::new(broker, &config.channel);
    let dao = Arc::new(InMemoryHeartbeatDao::new());
    let monitor = Arc::new(HeartbeatMonitor::new(Arc::clone(&dao) as Arc<dyn HeartbeatDao>));
    let listener = channel.start_listener(Some(&config.heartbeat.address), Arc::clone(&monitor))?;
    info!(topic = %config.heartbeat.address, "monitoring heartbeats");

    let mut ticker = tokio::time::interval(max_silence.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            () = shutdown_signal() => break,
            _ = ticker.tick() => {
                for hb in dao.latest().await? {
                    info!(
                        service = %hb.service_type,
                        instance = %hb.instance_id,
                        available = hb.available,
                        beats = dao.count(&hb.service_type, &hb.instance_id),
                        "instance"
                    );
                }
                for stale in monitor.stale_instances(SystemClock.now_millis(), max_silence).await? {
                    warn!(
                        service = %stale.service_type,
                        instance = %stale.instance_id,
                        last_seen = stale.timestamp,
                        "instance silent"
                    );
                }
            }
        }
    }
    listener.stop().await;
    Ok(())
}
