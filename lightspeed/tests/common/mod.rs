//! Test doubles shared by the integration tests.
//!
//! External tools are `sh -c` scripts, storage is an in-memory map and the
//! HTTP source is a local axum server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use bytes::Bytes;
use futures::StreamExt;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use lightspeed::config::TransferSettings;
use lightspeed::history::{HistoryRecord, HistoryRecorder};
use lightspeed::identity::{Identity, IdentityProvider};
use lightspeed::storage::{CreatedObject, ObjectMetadata, RemoteStorage};
use lightspeed::transfer::{
    ByteStream, Capabilities, EncoderCommand, Endpoint, ExtractorCommand, ProgressEvent,
    ProgressReceiver, StrategyKind, TranscodeOptions, TransferPipeline,
};
use lightspeed::utils::http_client::build_streaming_client;
use lightspeed::{Error, Result};

pub const VALID_TOKEN: &str = "valid-token";
pub const USER: &str = "user@example.com";
pub const SOURCE_LEN: usize = 1_000_000;

pub fn identity() -> Identity {
    Identity {
        user: USER.to_string(),
        access_token: VALID_TOKEN.to_string(),
    }
}

/// Accepts exactly [`VALID_TOKEN`].
pub struct StaticIdentity;

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn resolve(&self, access_token: &str) -> Result<Identity> {
        if access_token == VALID_TOKEN {
            Ok(identity())
        } else {
            Err(Error::unauthenticated("Invalid or expired token"))
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

/// Storage kept in memory. Created objects get ids `created-<n>`.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
    next_id: AtomicUsize,
}

impl MemoryStorage {
    pub fn with_object(self, id: &str, name: &str, len: usize) -> Self {
        self.objects.lock().unwrap().insert(
            id.to_string(),
            StoredObject {
                name: name.to_string(),
                mime_type: "video/mp4".to_string(),
                data: Bytes::from(vec![7u8; len]),
            },
        );
        self
    }

    pub fn get(&self, id: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(id).cloned()
    }

    /// Objects written by transfers.
    pub fn created(&self) -> Vec<StoredObject> {
        let objects = self.objects.lock().unwrap();
        let mut created: Vec<_> = objects
            .iter()
            .filter(|(id, _)| id.starts_with("created-"))
            .map(|(_, object)| object.clone())
            .collect();
        created.sort_by(|a, b| a.name.cmp(&b.name));
        created
    }
}

#[async_trait]
impl RemoteStorage for MemoryStorage {
    async fn get_metadata(&self, _access_token: &str, object_id: &str) -> Result<ObjectMetadata> {
        let object = self
            .get(object_id)
            .ok_or_else(|| Error::source(format!("File not found: {object_id}")))?;
        Ok(ObjectMetadata {
            name: object.name,
            size: Some(object.data.len() as u64),
            mime_type: object.mime_type,
        })
    }

    async fn get_content(&self, _access_token: &str, object_id: &str) -> Result<ByteStream> {
        let object = self
            .get(object_id)
            .ok_or_else(|| Error::source(format!("File not found: {object_id}")))?;
        let chunks: Vec<std::io::Result<Bytes>> = object
            .data
            .chunks(64 * 1024)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn create_object(
        &self,
        _access_token: &str,
        name: &str,
        mime_type: &str,
        mut body: ByteStream,
        _declared_len: Option<u64>,
    ) -> Result<CreatedObject> {
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::sink(format!("Upload body failed: {e}")))?;
            data.extend_from_slice(&chunk);
        }

        let id = format!("created-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let size = data.len() as u64;
        self.objects.lock().unwrap().insert(
            id.clone(),
            StoredObject {
                name: name.to_string(),
                mime_type: mime_type.to_string(),
                data: Bytes::from(data),
            },
        );
        Ok(CreatedObject { id, size: Some(size) })
    }
}

#[derive(Default)]
pub struct RecordingHistory {
    records: Mutex<Vec<HistoryRecord>>,
    delay: Duration,
}

impl RecordingHistory {
    /// Each write takes `delay` before it lands.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryRecorder for RecordingHistory {
    async fn record(&self, record: &HistoryRecord) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Encoder double: one script for pipe mode, one for file mode.
///
/// File-mode scripts see the input path as `$1` and the output path as `$2`.
pub struct ScriptedEncoder {
    pipe: String,
    file: String,
}

impl ScriptedEncoder {
    /// Drains its input and writes `len` bytes of output.
    pub fn producing(len: usize) -> Self {
        Self {
            pipe: format!("cat > /dev/null; head -c {len} /dev/zero"),
            file: format!("head -c {len} /dev/zero > \"$2\""),
        }
    }

    pub fn failing() -> Self {
        let script = "echo 'Conversion failed!' >&2; exit 1".to_string();
        Self {
            pipe: script.clone(),
            file: script,
        }
    }

    pub fn hanging() -> Self {
        Self {
            pipe: "exec sleep 30".to_string(),
            file: "exec sleep 30".to_string(),
        }
    }

    /// Hangs like [`Self::hanging`], after writing its pid to `pid_file`.
    pub fn hanging_with_pid(pid_file: &Path) -> Self {
        let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());
        Self {
            pipe: script.clone(),
            file: script,
        }
    }
}

impl EncoderCommand for ScriptedEncoder {
    fn program(&self) -> &str {
        "sh"
    }

    fn args(&self, _options: &TranscodeOptions, input: &Endpoint, output: &Endpoint) -> Vec<String> {
        match (input, output) {
            (Endpoint::File(input), Endpoint::File(output)) => vec![
                "-c".to_string(),
                self.file.clone(),
                "sh".to_string(),
                input.display().to_string(),
                output.display().to_string(),
            ],
            _ => vec!["-c".to_string(), self.pipe.clone()],
        }
    }
}

/// Extractor double with fixed probe and stream scripts.
pub struct ScriptedExtractor {
    probe: String,
    stream: String,
}

impl ScriptedExtractor {
    pub fn new(probe: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            probe: probe.into(),
            stream: stream.into(),
        }
    }

    /// Probe reports `media_url` as a direct download.
    pub fn direct(title: &str, media_url: &str) -> Self {
        let json = serde_json::json!({
            "title": title,
            "url": media_url,
            "protocol": "http",
        });
        Self::new(format!("echo '{json}'"), "exit 1")
    }

    /// Probe finds only a manifest, so the media comes from the stream script.
    pub fn streaming(title: &str, len: usize) -> Self {
        let json = serde_json::json!({
            "title": title,
            "url": "https://cdn.example.com/index.m3u8",
            "protocol": "m3u8_native",
        });
        Self::new(format!("echo '{json}'"), format!("head -c {len} /dev/zero"))
    }

    pub fn failing() -> Self {
        Self::new("echo 'ERROR: Unsupported URL' >&2; exit 1", "exit 1")
    }
}

impl Default for ScriptedExtractor {
    fn default() -> Self {
        Self::failing()
    }
}

impl ExtractorCommand for ScriptedExtractor {
    fn program(&self) -> &str {
        "sh"
    }

    fn probe_args(&self, _url: &str) -> Vec<String> {
        vec!["-c".to_string(), self.probe.clone()]
    }

    fn stream_args(&self, _url: &str) -> Vec<String> {
        vec!["-c".to_string(), self.stream.clone()]
    }
}

pub fn settings(strategy: StrategyKind, scratch: &TempDir) -> TransferSettings {
    TransferSettings {
        max_concurrent: 5,
        strategy,
        scratch_dir: scratch.path().to_path_buf(),
        progress_interval: Duration::from_millis(10),
        diagnostic_tail_bytes: 4096,
        kill_grace: Duration::from_secs(1),
        channel_capacity: 64,
        connect_timeout: Duration::from_secs(5),
    }
}

pub struct Harness {
    pub pipeline: Arc<TransferPipeline>,
    pub storage: Arc<MemoryStorage>,
    pub history: Arc<RecordingHistory>,
    pub scratch: TempDir,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn new(
        strategy: StrategyKind,
        storage: MemoryStorage,
        encoder: ScriptedEncoder,
        extractor: ScriptedExtractor,
    ) -> Self {
        Self::with_capabilities(strategy, storage, encoder, extractor, all_tools())
    }

    pub fn with_capabilities(
        strategy: StrategyKind,
        storage: MemoryStorage,
        encoder: ScriptedEncoder,
        extractor: ScriptedExtractor,
        capabilities: Capabilities,
    ) -> Self {
        Self::with_history(
            strategy,
            storage,
            encoder,
            extractor,
            capabilities,
            RecordingHistory::default(),
        )
    }

    pub fn with_history(
        strategy: StrategyKind,
        storage: MemoryStorage,
        encoder: ScriptedEncoder,
        extractor: ScriptedExtractor,
        capabilities: Capabilities,
        history: RecordingHistory,
    ) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let storage = Arc::new(storage);
        let history = Arc::new(history);
        let shutdown = CancellationToken::new();
        let pipeline = TransferPipeline::new(
            settings(strategy, &scratch),
            build_streaming_client(Duration::from_secs(5)),
            storage.clone(),
            Arc::new(encoder),
            Arc::new(extractor),
        )
        .with_history(history.clone())
        .with_capabilities(capabilities)
        .with_shutdown_token(shutdown.clone());

        Self {
            pipeline: Arc::new(pipeline),
            storage,
            history,
            scratch,
            shutdown,
        }
    }

    /// True once no scratch directory is left behind.
    pub fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.scratch.path()).unwrap().next().is_none()
    }
}

pub fn all_tools() -> Capabilities {
    Capabilities {
        encoder: Some("scripted encoder".to_string()),
        extractor: Some("scripted extractor".to_string()),
    }
}

/// Read a progress stream to its end.
pub async fn collect(mut receiver: ProgressReceiver) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    let read = async {
        while let Some(event) = receiver.next_event().await {
            events.push(event.unwrap());
        }
    };
    tokio::time::timeout(Duration::from_secs(30), read)
        .await
        .expect("progress stream did not end");
    events
}

/// Statuses in order, with consecutive repeats collapsed.
pub fn statuses(events: &[ProgressEvent]) -> Vec<&'static str> {
    let mut statuses: Vec<&'static str> = events.iter().map(ProgressEvent::status).collect();
    statuses.dedup();
    statuses
}

/// Wait until `condition` holds, polling for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A local HTTP source.
///
/// - `/video.mp4` serves [`SOURCE_LEN`] bytes of `video/mp4`;
/// - `/slow.mp4` serves the same bytes in ten paced chunks;
/// - `/watch` serves an HTML page, so it needs the extractor.
pub struct Upstream {
    pub addr: SocketAddr,
}

impl Upstream {
    pub async fn start() -> Self {
        let app = Router::new()
            .route("/video.mp4", get(video))
            .route("/slow.mp4", get(slow_video))
            .route("/watch", get(page));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

async fn video() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "video/mp4")], vec![1u8; SOURCE_LEN])
}

async fn slow_video() -> impl IntoResponse {
    let chunk = SOURCE_LEN / 10;
    let body = futures::stream::iter(0..10).then(move |_| async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        Ok::<_, std::io::Error>(Bytes::from(vec![1u8; chunk]))
    });
    (
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (header::CONTENT_LENGTH, SOURCE_LEN.to_string()),
        ],
        Body::from_stream(body),
    )
}

async fn page() -> Html<&'static str> {
    Html("<html><body><video src=\"blob:\"></video></body></html>")
}
