//! Runs an external executable against local copies of the content.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{ContentReference, Request};
use tokio::process::Command;
use tracing::{debug, info};

use crate::dispatch::{ProcessingContext, RequestProcessor};
use crate::error::{ComponentUnavailableError, ProcessingError, UnavailableKind};

/// Placeholder replaced by the source's local path.
pub const SOURCE_PLACEHOLDER: &str = "{source}";
/// Placeholder replaced by the target's local path.
pub const TARGET_PLACEHOLDER: &str = "{target}";

const STDERR_TAIL: usize = 512;

/// Runs `program args...` once per request.
///
/// The request's first source and first target (created on the primary
/// backend when absent) must both resolve to local paths, so this processor
/// only works over file-backed transports.
#[derive(Debug, Clone)]
pub struct ExternalCommandProcessor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    output_suffix: String,
}

impl ExternalCommandProcessor {
    /// Creates a processor running `program` with `args`, bounded by `timeout`.
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            output_suffix: "out".to_string(),
        }
    }

    /// Extension given to targets this processor creates.
    #[must_use]
    pub fn with_output_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.output_suffix = suffix.into();
        self
    }

    /// Executable name or path.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    fn unavailable(&self, reason: impl Into<String>) -> ComponentUnavailableError {
        ComponentUnavailableError::new(UnavailableKind::Executable, self.program.clone(), reason)
    }

    /// Resolves the program the way a shell would: paths as given, bare
    /// names through `PATH`.
    fn locate(&self) -> Option<PathBuf> {
        let program = Path::new(&self.program);
        if program.components().count() > 1 {
            return program.is_file().then(|| program.to_path_buf());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }

    fn render_args(&self, source: &Path, target: &Path) -> Vec<String> {
        let source = source.to_string_lossy();
        let target = target.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(SOURCE_PLACEHOLDER, &source)
                    .replace(TARGET_PLACEHOLDER, &target)
            })
            .collect()
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map_or(0, |(i, _)| i);
    text[start..].to_string()
}

#[async_trait]
impl RequestProcessor for ExternalCommandProcessor {
    fn service_type(&self) -> &'static str {
        "external-command"
    }

    async fn check_available(&self) -> Result<(), ComponentUnavailableError> {
        match self.locate() {
            Some(path) => {
                debug!(program = %path.display(), "executable located");
                Ok(())
            }
            None => Err(self.unavailable("executable not found")),
        }
    }

    async fn process(
        &self,
        request: &Request,
        ctx: &ProcessingContext,
    ) -> Result<Vec<ContentReference>, ProcessingError> {
        let source = request
            .source_refs
            .first()
            .ok_or_else(|| ProcessingError::InvalidRequest("request has no sources".to_string()))?;
        let source_path = ctx.transport.local_path(source)?;

        let target = match request.target_refs.as_ref().and_then(|t| t.first()) {
            Some(target) => target.clone(),
            None => {
                let stem = source_path
                    .file_stem()
                    .map_or_else(|| "content".into(), |s| s.to_string_lossy());
                let name = format!("{stem}.{}", self.output_suffix);
                ctx.transport.create(&name, &source.media_type).await?
            }
        };
        let target_path = ctx.transport.local_path(&target)?;

        let args = self.render_args(&source_path, &target_path);
        info!(program = %self.program, ?args, "running command");

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessingError::Unavailable(self.unavailable(e.to_string()))
            } else {
                ProcessingError::Failed(format!("could not start {}: {e}", self.program))
            }
        })?;

        let output = tokio::select! {
            () = ctx.cancel.cancelled() => {
                return Err(ProcessingError::Failed(format!("{} cancelled", self.program)));
            }
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(output) => output.map_err(|e| {
                    ProcessingError::Failed(format!("{} failed: {e}", self.program))
                })?,
                Err(_) => {
                    return Err(ProcessingError::Failed(format!(
                        "{} timed out after {}ms",
                        self.program,
                        self.timeout.as_millis()
                    )));
                }
            },
        };

        if !output.status.success() {
            let stderr = tail(&output.stderr);
            return Err(ProcessingError::Failed(if stderr.is_empty() {
                format!("{} exited with {}", self.program, output.status)
            } else {
                format!("{} exited with {}: {stderr}", self.program, output.status)
            }));
        }

        let size = ctx.transport.size(&target).await?;
        let target = match size {
            Some(size) => target.with_size(size),
            None => target,
        };
        Ok(vec![target])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_core::{Address, TransformOptions};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::channel::{BrokerTransport, MemoryBroker, MessageChannel};
    use crate::config::ChannelConfig;
    use crate::dispatch::ReplyEmitter;
    use crate::transport::{
        ContentTransport, FileTransport, MemoryObjectStore, ObjectStorageTransport,
    };

    fn context(transport: Arc<dyn ContentTransport>, request: &Request) -> ProcessingContext {
        let broker = Arc::new(MemoryBroker::new());
        let channel = MessageChannel::new(broker as Arc<dyn BrokerTransport>, &ChannelConfig::default());
        ProcessingContext {
            transport,
            emitter: Arc::new(ReplyEmitter::new(
                channel,
                request,
                &Address::queue("replies"),
                Duration::ZERO,
            )),
            cancel: CancellationToken::new(),
        }
    }

    fn sh(script: &str) -> ExternalCommandProcessor {
        ExternalCommandProcessor::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
    }

    async fn file_source(dir: &tempfile::TempDir, body: &[u8]) -> (Arc<dyn ContentTransport>, ContentReference) {
        let transport: Arc<dyn ContentTransport> =
            Arc::new(FileTransport::new(dir.path().join("work"), Duration::from_millis(10)));
        let path = dir.path().join("input.txt");
        tokio::fs::write(&path, body).await.unwrap();
        (transport, ContentReference::new(FileTransport::uri_for(&path), "text/plain"))
    }

    #[tokio::test]
    async fn runs_command_into_created_target() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, source) = file_source(&dir, b"hello").await;
        let request = Request::new(vec![source], TransformOptions::new());
        let processor = sh("tr a-z A-Z < {source} > {target}").with_output_suffix("upper");
        processor.check_available().await.unwrap();

        let targets = processor
            .process(&request, &context(Arc::clone(&transport), &request))
            .await
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert!(targets[0].uri.ends_with("-input.upper"));
        assert_eq!(targets[0].size, Some(5));
        let path = transport.local_path(&targets[0]).unwrap();
        assert_eq!(tokio::fs::read(path).await.unwrap(), b"HELLO");
    }

    #[tokio::test]
    async fn writes_to_requested_target() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, source) = file_source(&dir, b"abc").await;
        let target = ContentReference::new(
            FileTransport::uri_for(&dir.path().join("copy.txt")),
            "text/plain",
        );
        let request =
            Request::new(vec![source], TransformOptions::new()).with_targets(vec![target.clone()]);

        let targets = sh("cp {source} {target}")
            .process(&request, &context(Arc::clone(&transport), &request))
            .await
            .unwrap();
        assert_eq!(targets, vec![target.with_size(3)]);
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, source) = file_source(&dir, b"x").await;
        let request = Request::new(vec![source], TransformOptions::new());
        let err = sh("echo 'bad input' >&2; exit 3")
            .process(&request, &context(transport, &request))
            .await
            .unwrap_err();
        let ProcessingError::Failed(detail) = err else {
            panic!("expected failure, got {err}");
        };
        assert!(detail.contains("bad input"), "{detail}");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, source) = file_source(&dir, b"x").await;
        let request = Request::new(vec![source], TransformOptions::new());
        let processor = ExternalCommandProcessor::new(
            "sh",
            vec!["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
        );
        let err = processor
            .process(&request, &context(transport, &request))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn missing_executable_is_unavailable() {
        let processor = ExternalCommandProcessor::new(
            "courier-no-such-binary",
            vec![],
            Duration::from_secs(1),
        );
        let err = processor.check_available().await.unwrap_err();
        assert_eq!(err.kind, UnavailableKind::Executable);
        assert_eq!(err.component, "courier-no-such-binary");

        let absolute = ExternalCommandProcessor::new("/nonexistent/tool", vec![], Duration::from_secs(1));
        assert!(absolute.check_available().await.is_err());
    }

    #[tokio::test]
    async fn object_storage_has_no_local_path() {
        let transport: Arc<dyn ContentTransport> = Arc::new(ObjectStorageTransport::new(
            Arc::new(MemoryObjectStore::new()),
            "courier",
            Duration::from_millis(10),
        ));
        let request = Request::new(
            vec![ContentReference::new("s3://b/k", "text/plain")],
            TransformOptions::new(),
        );
        let err = sh("true")
            .process(&request, &context(transport, &request))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Content(_)), "{err}");
    }

    #[test]
    fn placeholders_are_substituted() {
        let processor = ExternalCommandProcessor::new(
            "ffmpeg",
            vec!["-i".into(), "{source}".into(), "out={target}".into()],
            Duration::from_secs(1),
        );
        assert_eq!(
            processor.render_args(Path::new("/in/a.mp4"), Path::new("/out/b.mkv")),
            vec!["-i", "/in/a.mp4", "out=/out/b.mkv"]
        );
    }

    #[test]
    fn tail_keeps_the_end() {
        let long = "x".repeat(2000) + "END";
        let kept = tail(long.as_bytes());
        assert!(kept.ends_with("END"));
        assert!(kept.len() <= STDERR_TAIL + 1);
    }
}
