//! Requester and worker nodes talking through a real broker binding.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{ContentReference, ReplyStatus, Request, TransformOptions};
use courier_node::channel::broker::BrokerServer;
use courier_node::channel::{self, BrokerTransport, MemoryBroker, MessageChannel};
use courier_node::config::{ActionKind, ChannelConfig, NodeConfig};
use courier_node::dispatch::{ProcessingContext, RequestProcessor, Submission, SyncOutcome};
use courier_node::error::{DispatchError, ProcessingError, UnavailableKind};
use courier_node::lifecycle::NodeState;
use courier_node::node::{RequesterNode, WorkerNode};
use courier_node::processors::{ContentHashProcessor, ExternalCommandProcessor};
use courier_node::transport::{
    read_to_bytes, ContentTransport, FileTransport, MemoryObjectStore, ObjectStorageTransport,
    WaitPolicy,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

fn node_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.dispatch.poll_interval = Duration::from_millis(20);
    config.worker.progress_interval = Duration::ZERO;
    config.worker.concurrency = 2;
    config.drain_timeout = Duration::from_secs(2);
    config
}

fn object_transport(store: &Arc<MemoryObjectStore>) -> Arc<dyn ContentTransport> {
    Arc::new(ObjectStorageTransport::new(
        Arc::clone(store) as _,
        "courier",
        Duration::from_millis(10),
    ))
}

fn memory_channel() -> MessageChannel {
    MessageChannel::new(
        Arc::new(MemoryBroker::new()) as Arc<dyn BrokerTransport>,
        &ChannelConfig::default(),
    )
}

/// Copies the first source to the first target, pausing at half way until
/// released.
struct GatedCopy {
    gate: Arc<Notify>,
}

#[async_trait]
impl RequestProcessor for GatedCopy {
    fn service_type(&self) -> &'static str {
        "gated-copy"
    }

    async fn process(
        &self,
        request: &Request,
        ctx: &ProcessingContext,
    ) -> Result<Vec<ContentReference>, ProcessingError> {
        let source = &request.source_refs[0];
        let target = request
            .target_refs
            .as_ref()
            .and_then(|t| t.first())
            .cloned()
            .ok_or_else(|| ProcessingError::InvalidRequest("no target".to_string()))?;
        ctx.report_progress(0.5).await;
        self.gate.notified().await;

        let reader = ctx.transport.read(source, &WaitPolicy::Immediate).await?;
        let written = ctx.transport.write(reader, &target).await?;
        Ok(vec![target.with_size(written)])
    }
}

async fn poll_until(
    requester: &RequesterNode,
    id: &str,
    done: impl Fn(ReplyStatus, Option<f32>) -> bool,
) -> (ReplyStatus, Option<f32>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = requester.dispatcher().poll_progress(id).unwrap();
            if done(snapshot.status, snapshot.progress) {
                return (snapshot.status, snapshot.progress);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn async_request_reports_progress_then_is_collected() {
    let dir = tempfile::tempdir().unwrap();
    let transport: Arc<dyn ContentTransport> =
        Arc::new(FileTransport::new(dir.path().join("work"), Duration::from_millis(10)));
    let source_path = dir.path().join("src.mp4");
    tokio::fs::write(&source_path, b"frames").await.unwrap();
    let source = ContentReference::new(FileTransport::uri_for(&source_path), "video/mp4");
    let target = ContentReference::new(
        FileTransport::uri_for(&dir.path().join("dst.mp4")),
        "video/mp4",
    );

    let channel = memory_channel();
    let gate = Arc::new(Notify::new());
    let config = node_config();
    let worker = WorkerNode::new(
        Arc::new(GatedCopy { gate: Arc::clone(&gate) }),
        channel.clone(),
        Arc::clone(&transport),
        config.clone(),
    )
    .start()
    .await
    .unwrap();
    let requester = RequesterNode::start(channel, Arc::clone(&transport), config.dispatch).unwrap();

    let id = requester
        .dispatcher()
        .submit_async(
            Submission::new(TransformOptions::new())
                .with_source(source)
                .with_targets(vec![target.clone()]),
        )
        .await
        .unwrap();

    let (status, progress) = poll_until(&requester, &id, |_, p| p == Some(0.5)).await;
    assert_eq!((status, progress), (ReplyStatus::InProgress, Some(0.5)));

    gate.notify_one();
    let (status, _) = poll_until(&requester, &id, |s, _| s.is_terminal()).await;
    assert_eq!(status, ReplyStatus::Complete);

    // The terminal poll collected the entry.
    assert!(matches!(
        requester.dispatcher().poll_progress(&id),
        Err(DispatchError::NotFound(_))
    ));
    let copied = transport.read(&target, &WaitPolicy::Immediate).await.unwrap();
    assert_eq!(read_to_bytes(copied, &target.uri).await.unwrap(), Bytes::from_static(b"frames"));

    requester.shutdown().await;
    assert!(worker.shutdown().await);
}

#[tokio::test]
async fn sync_request_over_tcp_broker() {
    let server = BrokerServer::bind("127.0.0.1:0", Arc::new(MemoryBroker::new()))
        .await
        .unwrap();
    let url = format!("tcp://{}", server.local_addr().unwrap());
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(shutdown.clone()));

    let store = Arc::new(MemoryObjectStore::new());
    let config = node_config();

    let worker_channel = MessageChannel::new(channel::connect(&url).await.unwrap(), &config.channel);
    let worker = WorkerNode::new(
        Arc::new(ContentHashProcessor::new()),
        worker_channel,
        object_transport(&store),
        config.clone(),
    )
    .start()
    .await
    .unwrap();

    let requester_channel =
        MessageChannel::new(channel::connect(&url).await.unwrap(), &config.channel);
    let requester =
        RequesterNode::start(requester_channel, object_transport(&store), config.dispatch).unwrap();

    let submission = Submission::new(TransformOptions::new())
        .with_upload(ContentReference::new("s3://in/abc.txt", "text/plain"), Bytes::from_static(b"abc"));
    let outcome = requester
        .dispatcher()
        .await_sync(submission, 10_000, &CancellationToken::new())
        .await
        .unwrap();
    let SyncOutcome::Completed(results) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].data, Bytes::from_static(ABC_SHA256.as_bytes()));
    assert!(results[0].reference.uri.ends_with("/abc.txt.sha256"));
    assert!(requester.dispatcher().tracker().is_empty());

    requester.shutdown().await;
    assert!(worker.shutdown().await);
    shutdown.cancel();
}

#[tokio::test]
async fn msgpack_channel_round_trip() {
    let store = Arc::new(MemoryObjectStore::new());
    let mut config = node_config();
    config.channel.codec = courier_core::Codec::MsgPack;
    let channel = MessageChannel::new(
        Arc::new(MemoryBroker::new()) as Arc<dyn BrokerTransport>,
        &config.channel,
    );
    let worker = WorkerNode::new(
        Arc::new(ContentHashProcessor::new()),
        channel.clone(),
        object_transport(&store),
        config.clone(),
    )
    .start()
    .await
    .unwrap();
    let requester = RequesterNode::start(channel, object_transport(&store), config.dispatch).unwrap();

    let outcome = requester
        .dispatcher()
        .await_sync(
            Submission::new(TransformOptions::new().with("algorithm", "sha256"))
                .with_upload(ContentReference::new("s3://in/abc", "text/plain"), Bytes::from_static(b"abc")),
            5_000,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed(ref r) if r[0].data == ABC_SHA256.as_bytes()));

    requester.shutdown().await;
    assert!(worker.shutdown().await);
}

#[tokio::test]
async fn missing_executable_fails_request_and_drains_worker() {
    let store = Arc::new(MemoryObjectStore::new());
    let mut config = node_config();
    config.action.policies.clear();
    config
        .action
        .policies
        .insert(UnavailableKind::Executable, vec![ActionKind::Drain]);

    let channel = memory_channel();
    let worker = WorkerNode::new(
        Arc::new(ExternalCommandProcessor::new(
            "courier-missing-tool",
            vec!["{source}".to_string(), "{target}".to_string()],
            Duration::from_secs(1),
        )),
        channel.clone(),
        object_transport(&store),
        config.clone(),
    )
    .start()
    .await
    .unwrap();
    let requester = RequesterNode::start(channel, object_transport(&store), config.dispatch).unwrap();

    let err = requester
        .dispatcher()
        .await_sync(
            Submission::new(TransformOptions::new())
                .with_upload(ContentReference::new("s3://in/x", "text/plain"), Bytes::from_static(b"x")),
            5_000,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    let DispatchError::Remote { detail, .. } = err else {
        panic!("expected remote failure, got {err}");
    };
    assert!(detail.contains("courier-missing-tool"), "{detail}");

    tokio::time::timeout(Duration::from_secs(2), worker.drained())
        .await
        .unwrap();
    assert_eq!(worker.lifecycle().state(), NodeState::Draining);

    requester.shutdown().await;
    assert!(worker.shutdown().await);
}

#[tokio::test]
async fn sync_wait_without_worker_times_out() {
    let store = Arc::new(MemoryObjectStore::new());
    let mut config = node_config();
    config.dispatch.poll_interval = Duration::from_millis(50);
    let requester =
        RequesterNode::start(memory_channel(), object_transport(&store), config.dispatch).unwrap();

    let started = tokio::time::Instant::now();
    let err = requester
        .dispatcher()
        .await_sync(
            Submission::new(TransformOptions::new())
                .with_upload(ContentReference::new("s3://in/y", "text/plain"), Bytes::from_static(b"y")),
            200,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");
    assert!(started.elapsed() < Duration::from_millis(200 + 50 + 100));
    assert!(requester.dispatcher().tracker().is_empty());
    requester.shutdown().await;
}
