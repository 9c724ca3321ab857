//! How fetch, transcode and upload are connected.
//!
//! [`StreamingStrategy`] pipes bytes straight through the stages without
//! touching disk. [`DiskBufferedStrategy`] spools to scratch files between
//! stages, for encoders or sources that misbehave on pipes.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use process_utils::{ManagedProcess, ProcessSpec};
use serde::{Deserialize, Serialize};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::oneshot;
use tracing::debug;

use super::io::{ByteStream, counted, exit_gated, feed, file_stream, on_end, spool};
use super::progress::ProgressHandle;
use super::request::{TransferMode, TransferRequest};
use super::session::{ProcessRole, ProcessSlot, Stage};
use super::sink::{SinkUploader, UploadReceipt};
use super::source::{ResolvedSource, SourceFetcher, SourceStream};
use super::transcode::{EncoderCommand, Endpoint, TranscodeObserver};
use crate::identity::Identity;
use crate::{Error, Result};

/// Mime type of every object written.
pub const OUTPUT_MIME_TYPE: &str = "video/mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Streaming,
    #[serde(rename = "disk")]
    DiskBuffered,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::DiskBuffered => "disk",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streaming" | "stream" | "pipe" => Ok(Self::Streaming),
            "disk" | "disk-buffered" | "file" => Ok(Self::DiskBuffered),
            other => Err(format!("unknown transfer strategy '{other}' (expected streaming or disk)")),
        }
    }
}

/// Per-session inputs of [`ConnectStream::connect`].
pub struct Connection<'a> {
    pub request: &'a TransferRequest,
    pub identity: &'a Identity,
    pub sink_name: &'a str,
    pub slot: &'a ProcessSlot,
    pub progress: &'a ProgressHandle,
    /// Private scratch space; present when the strategy needs one.
    pub scratch: Option<&'a Path>,
}

/// Moves a resolved source into storage, through the encoder when the
/// request transcodes.
#[async_trait]
pub trait ConnectStream: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn connect(&self, conn: &Connection<'_>, source: ResolvedSource) -> Result<UploadReceipt>;
}

/// What the strategies drive.
pub struct StageTools {
    pub fetcher: Arc<SourceFetcher>,
    pub encoder: Arc<dyn EncoderCommand>,
    pub sink: SinkUploader,
    pub tail_budget: usize,
    pub kill_grace: Duration,
}

impl StageTools {
    fn process_spec(&self, program: &str, args: Vec<String>) -> ProcessSpec {
        ProcessSpec::new(program, args)
            .with_tail_budget(self.tail_budget)
            .with_kill_grace(self.kill_grace)
    }

    /// Spawn the encoder with its stderr feeding the transcode position.
    fn spawn_encoder(
        &self,
        conn: &Connection<'_>,
        input: Endpoint,
        output: Endpoint,
    ) -> Result<ManagedProcess> {
        let args = self
            .encoder
            .args(&conn.request.transcode_options, &input, &output);
        let mut spec = self.process_spec(self.encoder.program(), args);
        if input == Endpoint::Pipe {
            spec = spec.with_stdin();
        }
        if output == Endpoint::Pipe {
            spec = spec.with_stdout();
        }

        let mut observer = TranscodeObserver::new(Arc::clone(conn.progress.meter()));
        ManagedProcess::spawn_observed(spec, move |line| observer.observe(line))
            .map_err(|e| Error::transcode(e.to_string()))
    }

    /// Spawn the extractor in streaming mode and install it.
    async fn start_extractor(&self, conn: &Connection<'_>, url: &str) -> Result<ChildStdout> {
        let mut process = self.fetcher.spawn_stream(url)?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| Error::extraction("extractor stdout unavailable", None))?;
        conn.slot.install(process, ProcessRole::Extractor).await?;
        Ok(stdout)
    }

    async fn upload(
        &self,
        conn: &Connection<'_>,
        body: ByteStream,
        total: Option<u64>,
    ) -> Result<UploadReceipt> {
        self.sink
            .upload(
                &conn.identity.access_token,
                conn.sink_name,
                OUTPUT_MIME_TYPE,
                body,
                total,
                conn.progress.meter(),
            )
            .await
    }

    fn fetcher_program(&self) -> String {
        self.fetcher.program().to_string()
    }

    async fn upload_file(&self, conn: &Connection<'_>, path: &Path) -> Result<UploadReceipt> {
        conn.progress.enter(Stage::Uploading);
        let (body, len) = file_stream(path).await?;
        self.upload(conn, body, Some(len)).await
    }
}

/// Count source bytes into the meter as they are read.
fn fetched(conn: &Connection<'_>, body: ByteStream) -> ByteStream {
    let meter = Arc::clone(conn.progress.meter());
    counted(body, move |n| meter.add_fetched(n))
}

/// Source bytes going straight to storage: the session stays in `Fetching`
/// while they flow and moves to `Uploading` once the source is drained.
fn fetched_then_upload(conn: &Connection<'_>, body: ByteStream) -> ByteStream {
    let progress = conn.progress.clone();
    on_end(fetched(conn, body), move || progress.enter(Stage::Uploading))
}

fn compress_needs_stream() -> Error {
    Error::Other("compress sources must be storage objects".to_string())
}

pub struct StreamingStrategy {
    tools: Arc<StageTools>,
}

impl StreamingStrategy {
    pub fn new(tools: Arc<StageTools>) -> Self {
        Self { tools }
    }

    async fn transcode(&self, conn: &Connection<'_>, source: SourceStream) -> Result<UploadReceipt> {
        let tools = &self.tools;
        let meter = conn.progress.meter();

        let mut process = tools.spawn_encoder(conn, Endpoint::Pipe, Endpoint::Pipe)?;
        let program = process.program().to_string();
        let (stdin, stdout) = take_pipes(&mut process)?;
        conn.slot.install(process, ProcessRole::Encoder).await?;

        meter.set_source_total(source.total);
        conn.progress.enter(Stage::Transcoding);

        let (exit_tx, exit_rx) = oneshot::channel();
        let input = fetched(conn, source.body);
        let output = exit_gated(stdout, exit_rx, program);

        let encode = async {
            conn.slot.supervise(Some(exit_tx)).await?;
            conn.progress.enter(Stage::Uploading);
            Ok::<_, Error>(())
        };

        let (written, receipt, ()) =
            tokio::try_join!(feed(input, stdin), tools.upload(conn, output, None), encode)?;
        debug!(written, size = receipt.size, "Pipelined transcode finished");
        Ok(receipt)
    }
}

fn take_pipes(process: &mut ManagedProcess) -> Result<(ChildStdin, ChildStdout)> {
    let stdin = process
        .take_stdin()
        .ok_or_else(|| Error::transcode("encoder stdin unavailable"))?;
    let stdout = process
        .take_stdout()
        .ok_or_else(|| Error::transcode("encoder stdout unavailable"))?;
    Ok((stdin, stdout))
}

#[async_trait]
impl ConnectStream for StreamingStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Streaming
    }

    async fn connect(&self, conn: &Connection<'_>, source: ResolvedSource) -> Result<UploadReceipt> {
        let meter = conn.progress.meter();

        match (conn.request.mode, source) {
            (TransferMode::Download, ResolvedSource::Stream(source)) => {
                meter.set_source_total(source.total);
                let body = fetched_then_upload(conn, source.body);
                self.tools.upload(conn, body, source.total).await
            }
            (TransferMode::Download, ResolvedSource::Extractor { url, estimate, .. }) => {
                let stdout = self.tools.start_extractor(conn, &url).await?;
                let (exit_tx, exit_rx) = oneshot::channel();
                let body = fetched_then_upload(
                    conn,
                    exit_gated(stdout, exit_rx, self.tools.fetcher_program()),
                );

                meter.set_source_total(estimate);
                let (receipt, _) = tokio::try_join!(
                    self.tools.upload(conn, body, estimate),
                    conn.slot.supervise(Some(exit_tx))
                )?;
                Ok(receipt)
            }
            (TransferMode::Compress, ResolvedSource::Stream(source)) => {
                self.transcode(conn, source).await
            }
            (TransferMode::Compress, ResolvedSource::Extractor { .. }) => Err(compress_needs_stream()),
        }
    }
}

pub struct DiskBufferedStrategy {
    tools: Arc<StageTools>,
}

impl DiskBufferedStrategy {
    pub fn new(tools: Arc<StageTools>) -> Self {
        Self { tools }
    }

    /// Spool the source into `path`.
    async fn spool_source(
        &self,
        conn: &Connection<'_>,
        source: ResolvedSource,
        path: &Path,
    ) -> Result<Option<u64>> {
        let meter = conn.progress.meter();

        match source {
            ResolvedSource::Stream(source) => {
                meter.set_source_total(source.total);
                let written = spool(fetched(conn, source.body), path).await?;
                debug!(written, path = %path.display(), "Source spooled");
                Ok(source.total)
            }
            ResolvedSource::Extractor { url, estimate, .. } => {
                meter.set_source_total(estimate);
                let stdout = self.tools.start_extractor(conn, &url).await?;
                let (exit_tx, exit_rx) = oneshot::channel();
                let body = fetched(
                    conn,
                    exit_gated(stdout, exit_rx, self.tools.fetcher_program()),
                );
                let (written, _) = tokio::try_join!(
                    spool(body, path),
                    conn.slot.supervise(Some(exit_tx))
                )?;
                debug!(written, path = %path.display(), "Extractor output spooled");
                Ok(Some(written))
            }
        }
    }
}

#[async_trait]
impl ConnectStream for DiskBufferedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DiskBuffered
    }

    async fn connect(&self, conn: &Connection<'_>, source: ResolvedSource) -> Result<UploadReceipt> {
        let scratch = conn
            .scratch
            .ok_or_else(|| Error::Other("disk strategy needs a scratch directory".to_string()))?;
        let input = scratch.join("source");

        match conn.request.mode {
            TransferMode::Download => {
                self.spool_source(conn, source, &input).await?;
                self.tools.upload_file(conn, &input).await
            }
            TransferMode::Compress => {
                if matches!(source, ResolvedSource::Extractor { .. }) {
                    return Err(compress_needs_stream());
                }
                self.spool_source(conn, source, &input).await?;

                let output = scratch.join("output.mp4");
                conn.progress.enter(Stage::Transcoding);
                let process = self.tools.spawn_encoder(
                    conn,
                    Endpoint::File(input.clone()),
                    Endpoint::File(output.clone()),
                )?;
                conn.slot.install(process, ProcessRole::Encoder).await?;
                conn.slot.supervise(None).await?;

                self.tools.upload_file(conn, &output).await
            }
        }
    }
}

/// Build the configured strategy.
pub fn build_strategy(kind: StrategyKind, tools: Arc<StageTools>) -> Arc<dyn ConnectStream> {
    match kind {
        StrategyKind::Streaming => Arc::new(StreamingStrategy::new(tools)),
        StrategyKind::DiskBuffered => Arc::new(DiskBufferedStrategy::new(tools)),
    }
}
