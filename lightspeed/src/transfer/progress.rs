//! Progress events and their delivery to the client.
//!
//! Every stage updates shared counters on a [`ProgressMeter`]; a single
//! [`Reporter`] per session samples them and writes events to the
//! [`ProgressChannel`], so a session has exactly one timeline.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

use super::request::TransferMode;
use super::session::Stage;
use crate::{Error, Result};

/// Progress of an in-flight stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgress {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_transferred: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
}

impl StageProgress {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            progress_percent: None,
            bytes_transferred: None,
            bytes_total: None,
        }
    }
}

/// Final report of a successful transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub message: String,
    pub result_id: String,
    pub progress_percent: u8,
    /// Size of the object written to storage.
    pub bytes_transferred: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savings_percent: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFailure {
    pub message: String,
    pub error_message: String,
}

/// One newline-delimited record of the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProgressEvent {
    Initializing { message: String },
    Fetching(StageProgress),
    Transcoding(StageProgress),
    Uploading(StageProgress),
    Finalizing { message: String },
    Success(TransferSummary),
    Error(TransferFailure),
}

impl ProgressEvent {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Initializing { .. } => "initializing",
            Self::Fetching(_) => "fetching",
            Self::Transcoding(_) => "transcoding",
            Self::Uploading(_) => "uploading",
            Self::Finalizing { .. } => "finalizing",
            Self::Success(_) => "success",
            Self::Error(_) => "error",
        }
    }

    pub fn progress_percent(&self) -> Option<u8> {
        match self {
            Self::Fetching(p) | Self::Transcoding(p) | Self::Uploading(p) => p.progress_percent,
            Self::Success(s) => Some(s.progress_percent),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Error(_))
    }
}

/// Sending half of a session's progress stream.
///
/// Emission never fails: once the consumer is gone the channel marks itself
/// closed and drops later events.
pub struct ProgressChannel {
    tx: Option<mpsc::Sender<Bytes>>,
    closed: bool,
}

/// Receiving half, turned into the HTTP response body.
pub struct ProgressReceiver {
    rx: mpsc::Receiver<Bytes>,
}

/// Resolves once the consumer has gone away.
#[derive(Clone)]
pub struct DisconnectWatch {
    tx: mpsc::Sender<Bytes>,
}

pub fn progress_channel(capacity: usize) -> (ProgressChannel, ProgressReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ProgressChannel {
            tx: Some(tx),
            closed: false,
        },
        ProgressReceiver { rx },
    )
}

impl ProgressChannel {
    /// Write one record; waits while the consumer is behind.
    pub async fn emit(&mut self, event: &ProgressEvent) {
        if self.closed {
            trace!(status = event.status(), "Progress channel closed; dropping event");
            return;
        }
        let Some(tx) = self.tx.as_ref() else {
            self.closed = true;
            return;
        };

        let mut line = match serde_json::to_vec(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, status = event.status(), "Failed to serialize progress event");
                return;
            }
        };
        line.push(b'\n');

        if tx.send(Bytes::from(line)).await.is_err() {
            debug!("Progress consumer disconnected");
            self.closed = true;
        }
    }

    /// Finish the stream. Idempotent.
    pub fn close(&mut self) {
        self.tx = None;
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }

    /// Watch for the consumer going away, independently of emission.
    pub fn watch(&self) -> Option<DisconnectWatch> {
        self.tx.as_ref().map(|tx| DisconnectWatch { tx: tx.clone() })
    }
}

impl DisconnectWatch {
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

impl ProgressReceiver {
    /// Next raw NDJSON record.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Next record, decoded.
    pub async fn next_event(&mut self) -> Option<Result<ProgressEvent>> {
        let line = self.rx.recv().await?;
        Some(serde_json::from_slice(&line).map_err(Error::from))
    }

    pub fn into_stream(self) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send {
        ReceiverStream::new(self.rx).map(Ok)
    }
}

/// Sentinel for "no transcode position known".
const UNKNOWN_RATIO: u32 = u32::MAX;

/// Byte and position counters shared by the stages of one session.
#[derive(Debug)]
pub struct ProgressMeter {
    fetched: AtomicU64,
    source_total: AtomicU64,
    uploaded: AtomicU64,
    upload_total: AtomicU64,
    transcode_permille: AtomicU32,
}

/// Point-in-time copy of a [`ProgressMeter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterSnapshot {
    pub fetched: u64,
    pub source_total: Option<u64>,
    pub uploaded: u64,
    pub upload_total: Option<u64>,
    pub transcode_ratio: Option<f64>,
}

impl Default for ProgressMeter {
    fn default() -> Self {
        Self {
            fetched: AtomicU64::new(0),
            source_total: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            upload_total: AtomicU64::new(0),
            transcode_permille: AtomicU32::new(UNKNOWN_RATIO),
        }
    }
}

impl ProgressMeter {
    pub fn add_fetched(&self, n: u64) {
        self.fetched.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, n: u64) {
        self.uploaded.fetch_add(n, Ordering::Relaxed);
    }

    /// Declared source size; zero counts as unknown.
    pub fn set_source_total(&self, total: Option<u64>) {
        self.source_total.store(total.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn set_upload_total(&self, total: Option<u64>) {
        self.upload_total.store(total.unwrap_or(0), Ordering::Relaxed);
    }

    /// Encoder position as a fraction of the media duration. Never moves back.
    pub fn set_transcode_ratio(&self, ratio: f64) {
        let permille = (ratio.clamp(0.0, 1.0) * 1000.0).round() as u32;
        let _ = self
            .transcode_permille
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current == UNKNOWN_RATIO || permille > current).then_some(permille)
            });
    }

    pub fn fetched(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        let nonzero = |v: u64| (v > 0).then_some(v);
        let permille = self.transcode_permille.load(Ordering::Relaxed);
        MeterSnapshot {
            fetched: self.fetched(),
            source_total: nonzero(self.source_total.load(Ordering::Relaxed)),
            uploaded: self.uploaded(),
            upload_total: nonzero(self.upload_total.load(Ordering::Relaxed)),
            transcode_ratio: (permille != UNKNOWN_RATIO).then(|| f64::from(permille) / 1000.0),
        }
    }
}

/// What the stages hold to report progress: the shared meter plus a way to
/// announce stage changes to the reporter.
#[derive(Clone)]
pub struct ProgressHandle {
    meter: Arc<ProgressMeter>,
    stages: mpsc::UnboundedSender<Stage>,
}

impl ProgressHandle {
    pub fn new(meter: Arc<ProgressMeter>) -> (Self, mpsc::UnboundedReceiver<Stage>) {
        let (stages, rx) = mpsc::unbounded_channel();
        (Self { meter, stages }, rx)
    }

    pub fn meter(&self) -> &Arc<ProgressMeter> {
        &self.meter
    }

    /// Announce that the session moved to `stage`.
    pub fn enter(&self, stage: Stage) {
        // The reporter outlives the stages; a send failure only happens during teardown.
        let _ = self.stages.send(stage);
    }
}

/// Share of the overall percentage a stage covers.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Band {
    start: f64,
    end: f64,
}

impl Band {
    const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    fn at(&self, ratio: f64) -> f64 {
        self.start + (self.end - self.start) * ratio.clamp(0.0, 1.0)
    }
}

fn band(mode: TransferMode, stage: Stage) -> Option<Band> {
    use TransferMode::*;

    match (mode, stage) {
        (Download, Stage::Fetching) => Some(Band::new(0.0, 50.0)),
        (Download, Stage::Uploading) => Some(Band::new(50.0, 95.0)),
        (Compress, Stage::Fetching) => Some(Band::new(0.0, 30.0)),
        (Compress, Stage::Transcoding) => Some(Band::new(30.0, 80.0)),
        (Compress, Stage::Uploading) => Some(Band::new(80.0, 95.0)),
        (_, Stage::Finalizing) => Some(Band::new(95.0, 95.0)),
        _ => None,
    }
}

/// Completed fraction of `stage` and the bytes it moved, if measurable.
fn stage_ratio(stage: Stage, snap: &MeterSnapshot) -> (Option<f64>, u64, Option<u64>) {
    let ratio = |done: u64, total: Option<u64>| total.map(|t| done as f64 / t as f64);

    match stage {
        Stage::Fetching => (
            ratio(snap.fetched, snap.source_total),
            snap.fetched,
            snap.source_total,
        ),
        Stage::Transcoding => (
            snap.transcode_ratio
                .or_else(|| ratio(snap.fetched, snap.source_total)),
            snap.fetched,
            snap.source_total,
        ),
        Stage::Uploading => (
            ratio(snap.uploaded, snap.upload_total),
            snap.uploaded,
            snap.upload_total,
        ),
        _ => (None, 0, None),
    }
}

fn stage_message(mode: TransferMode, stage: Stage) -> &'static str {
    match (mode, stage) {
        (TransferMode::Download, Stage::Initializing) => "Activating Light Speed Tunnel...",
        (TransferMode::Compress, Stage::Initializing) => "Preparing Super Compressor...",
        (TransferMode::Download, Stage::Fetching) => "Resolving source video...",
        (TransferMode::Compress, Stage::Fetching) => "Fetching video from Drive...",
        (_, Stage::Transcoding) => "Super Compressing (High Performance)...",
        (TransferMode::Download, Stage::Uploading) => "Streaming via Light Speed Tunnel...",
        (TransferMode::Compress, Stage::Uploading) => "Saving compressed video back to Drive...",
        (_, Stage::Finalizing) => "Finalizing transfer...",
        (TransferMode::Download, Stage::Success) => "Successfully saved to Drive!",
        (TransferMode::Compress, Stage::Success) => "Successfully compressed and saved!",
        (_, Stage::Failed) => "Transfer failed",
        (_, Stage::Cancelled) => "Transfer cancelled",
    }
}

/// Result of a completed transfer, as reported on success.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub result_id: String,
    /// Name of the object written to storage.
    pub name: String,
    /// Title of the source video.
    pub title: String,
    /// Size of the source, when known.
    pub original_size: Option<u64>,
    /// Size of the persisted object.
    pub final_size: u64,
}

impl TransferOutcome {
    /// Percent saved relative to the original, for compress transfers.
    pub fn savings_percent(&self) -> Option<u8> {
        let original = self.original_size.filter(|&s| s > 0)?;
        let saved = original.saturating_sub(self.final_size) as f64 / original as f64;
        Some((saved * 100.0).round().clamp(0.0, 100.0) as u8)
    }
}

/// The single emitter of a session's events.
///
/// Tracks the session stage, enforces the stage state machine and keeps
/// percentages monotonic.
pub struct Reporter {
    transfer_id: String,
    mode: TransferMode,
    stage: Stage,
    meter: Arc<ProgressMeter>,
    last_percent: u8,
    last_bytes: Option<u64>,
}

impl Reporter {
    pub fn new(transfer_id: impl Into<String>, mode: TransferMode, meter: Arc<ProgressMeter>) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            mode,
            stage: Stage::Initializing,
            meter,
            last_percent: 0,
            last_bytes: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Emit the opening `initializing` event.
    pub async fn begin(&mut self, channel: &mut ProgressChannel) {
        let event = ProgressEvent::Initializing {
            message: stage_message(self.mode, Stage::Initializing).to_string(),
        };
        channel.emit(&event).await;
    }

    /// Move to `to` and emit its entry event.
    pub async fn enter(&mut self, to: Stage, channel: &mut ProgressChannel) -> Result<()> {
        if to == self.stage {
            return Ok(());
        }
        self.stage = self.stage.transition(to)?;
        self.last_bytes = None;
        debug!(transfer_id = %self.transfer_id, stage = %to, "Stage entered");

        let event = match to {
            Stage::Finalizing => Some(ProgressEvent::Finalizing {
                message: stage_message(self.mode, to).to_string(),
            }),
            _ => self.stage_event(true),
        };
        if let Some(event) = event {
            channel.emit(&event).await;
        }
        Ok(())
    }

    /// Periodic sample; emits only when something visible changed.
    pub async fn sample(&mut self, channel: &mut ProgressChannel) {
        if let Some(event) = self.stage_event(false) {
            channel.emit(&event).await;
        }
    }

    /// Emit the terminal `success` event.
    pub async fn succeed(
        &mut self,
        outcome: &TransferOutcome,
        channel: &mut ProgressChannel,
    ) -> Result<()> {
        self.stage = self.stage.transition(Stage::Success)?;
        self.last_percent = 100;

        let compress = self.mode == TransferMode::Compress;
        let event = ProgressEvent::Success(TransferSummary {
            message: stage_message(self.mode, Stage::Success).to_string(),
            result_id: outcome.result_id.clone(),
            progress_percent: 100,
            bytes_transferred: outcome.final_size,
            bytes_total: Some(outcome.final_size),
            original_size: outcome.original_size.filter(|_| compress),
            savings_percent: if compress {
                outcome.savings_percent()
            } else {
                None
            },
        });
        channel.emit(&event).await;
        Ok(())
    }

    /// Emit the one terminal `error` event.
    pub async fn fail(&mut self, error: &Error, channel: &mut ProgressChannel) {
        if self.stage.is_terminal() {
            return;
        }
        self.stage = Stage::Failed;
        let event = ProgressEvent::Error(TransferFailure {
            message: error.summary().to_string(),
            error_message: error.detail(),
        });
        channel.emit(&event).await;
    }

    /// Record cancellation; nothing is emitted.
    pub fn cancel(&mut self) {
        if !self.stage.is_terminal() {
            self.stage = Stage::Cancelled;
        }
    }

    fn stage_event(&mut self, entering: bool) -> Option<ProgressEvent> {
        let band = band(self.mode, self.stage)?;
        let snap = self.meter.snapshot();
        let (ratio, bytes, total) = stage_ratio(self.stage, &snap);

        let mut progress = StageProgress::message(stage_message(self.mode, self.stage));
        match ratio {
            Some(ratio) => {
                let percent = band.at(ratio).floor().min(100.0) as u8;
                let percent = percent.max(self.last_percent);
                if !entering && percent == self.last_percent {
                    return None;
                }
                self.last_percent = percent;
                progress.progress_percent = Some(percent);
                progress.bytes_transferred = Some(bytes);
                progress.bytes_total = total;
            }
            None => {
                if !entering && (bytes == 0 || self.last_bytes == Some(bytes)) {
                    return None;
                }
                if entering {
                    let percent = (band.start as u8).max(self.last_percent);
                    self.last_percent = percent;
                    progress.progress_percent = Some(percent);
                }
                if bytes > 0 {
                    progress.bytes_transferred = Some(bytes);
                }
            }
        }
        self.last_bytes = Some(bytes);

        Some(match self.stage {
            Stage::Fetching => ProgressEvent::Fetching(progress),
            Stage::Transcoding => ProgressEvent::Transcoding(progress),
            _ => ProgressEvent::Uploading(progress),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter(mode: TransferMode) -> (Reporter, Arc<ProgressMeter>) {
        let meter = Arc::new(ProgressMeter::default());
        let reporter = Reporter::new("t-1", mode, Arc::clone(&meter));
        (reporter, meter)
    }

    async fn drain(rx: &mut ProgressReceiver) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(line) = rx.rx.try_recv() {
            events.push(serde_json::from_slice(&line).unwrap());
        }
        events
    }

    #[test]
    fn test_event_wire_format() {
        let event = ProgressEvent::Uploading(StageProgress {
            message: "Streaming".into(),
            progress_percent: Some(42),
            bytes_transferred: Some(420),
            bytes_total: Some(1000),
        });
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();

        assert_eq!(json["status"], "uploading");
        assert_eq!(json["progressPercent"], 42);
        assert_eq!(json["bytesTransferred"], 420);
        assert_eq!(json["bytesTotal"], 1000);

        let failure = ProgressEvent::Error(TransferFailure {
            message: "Compression failed".into(),
            error_message: "exit 1".into(),
        });
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["errorMessage"], "exit 1");
    }

    #[test]
    fn test_unknown_fields_are_omitted() {
        let event = ProgressEvent::Fetching(StageProgress::message("Resolving"));
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"status":"fetching","message":"Resolving"}"#);
    }

    #[tokio::test]
    async fn test_emit_writes_one_line_per_event() {
        let (mut channel, mut rx) = progress_channel(8);
        channel
            .emit(&ProgressEvent::Initializing {
                message: "hi".into(),
            })
            .await;

        let line = rx.recv().await.unwrap();
        assert!(line.ends_with(b"\n"));
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[tokio::test]
    async fn test_emit_after_disconnect_is_silent() {
        let (mut channel, rx) = progress_channel(8);
        let watch = channel.watch().unwrap();
        drop(rx);

        tokio::time::timeout(std::time::Duration::from_secs(1), watch.closed())
            .await
            .unwrap();

        let event = ProgressEvent::Initializing {
            message: "hi".into(),
        };
        channel.emit(&event).await;
        assert!(channel.is_closed());
        channel.emit(&event).await;
        channel.close();
        channel.close();
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let (mut channel, mut rx) = progress_channel(8);
        channel.close();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_into_stream_yields_lines_until_close() {
        let (mut channel, rx) = progress_channel(8);
        channel
            .emit(&ProgressEvent::Initializing {
                message: "hi".into(),
            })
            .await;
        channel.close();

        let lines: Vec<Bytes> = rx
            .into_stream()
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(br#"{"status":"initializing""#));
    }

    #[tokio::test]
    async fn test_percent_is_monotonic_and_bounded() {
        let (mut reporter, meter) = reporter(TransferMode::Download);
        let (mut channel, mut rx) = progress_channel(256);

        meter.set_source_total(Some(1000));
        meter.set_upload_total(Some(1000));
        reporter.enter(Stage::Fetching, &mut channel).await.unwrap();
        reporter.enter(Stage::Uploading, &mut channel).await.unwrap();
        for _ in 0..20 {
            meter.add_uploaded(100);
            reporter.sample(&mut channel).await;
        }

        let percents: Vec<u8> = drain(&mut rx)
            .await
            .iter()
            .filter_map(ProgressEvent::progress_percent)
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(percents.iter().all(|&p| p <= 95));
        assert_eq!(percents.last(), Some(&95));
    }

    #[tokio::test]
    async fn test_fetch_band_follows_source_bytes() {
        let (mut reporter, meter) = reporter(TransferMode::Download);
        let (mut channel, mut rx) = progress_channel(64);

        meter.set_source_total(Some(1000));
        reporter.enter(Stage::Fetching, &mut channel).await.unwrap();
        for _ in 0..4 {
            meter.add_fetched(250);
            reporter.sample(&mut channel).await;
        }

        let percents: Vec<u8> = drain(&mut rx)
            .await
            .iter()
            .filter(|e| e.status() == "fetching")
            .filter_map(ProgressEvent::progress_percent)
            .collect();
        assert_eq!(percents, [0, 12, 25, 37, 50]);
    }

    #[tokio::test]
    async fn test_sample_skips_unchanged_progress() {
        let (mut reporter, meter) = reporter(TransferMode::Download);
        let (mut channel, mut rx) = progress_channel(64);

        meter.set_upload_total(Some(1000));
        reporter.enter(Stage::Fetching, &mut channel).await.unwrap();
        reporter.enter(Stage::Uploading, &mut channel).await.unwrap();
        meter.add_uploaded(500);
        reporter.sample(&mut channel).await;
        reporter.sample(&mut channel).await;
        reporter.sample(&mut channel).await;

        let statuses: Vec<_> = drain(&mut rx).await.iter().map(|e| e.status()).collect();
        assert_eq!(statuses, ["fetching", "uploading", "uploading"]);
    }

    #[tokio::test]
    async fn test_unknown_total_reports_bytes_only() {
        let (mut reporter, meter) = reporter(TransferMode::Download);
        let (mut channel, mut rx) = progress_channel(64);

        reporter.enter(Stage::Fetching, &mut channel).await.unwrap();
        reporter.enter(Stage::Uploading, &mut channel).await.unwrap();
        meter.add_uploaded(4096);
        reporter.sample(&mut channel).await;

        let events = drain(&mut rx).await;
        let ProgressEvent::Uploading(last) = events.last().unwrap() else {
            panic!("expected an uploading event");
        };
        assert_eq!(last.progress_percent, None);
        assert_eq!(last.bytes_transferred, Some(4096));
    }

    #[test]
    fn test_transcode_ratio_is_recorded_and_never_regresses() {
        let meter = ProgressMeter::default();
        assert_eq!(meter.snapshot().transcode_ratio, None);

        meter.set_transcode_ratio(0.25);
        assert_eq!(meter.snapshot().transcode_ratio, Some(0.25));

        meter.set_transcode_ratio(0.1);
        assert_eq!(meter.snapshot().transcode_ratio, Some(0.25));

        meter.set_transcode_ratio(1.5);
        assert_eq!(meter.snapshot().transcode_ratio, Some(1.0));
    }

    #[tokio::test]
    async fn test_transcode_band_uses_encoder_position() {
        let (mut reporter, meter) = reporter(TransferMode::Compress);
        let (mut channel, mut rx) = progress_channel(64);

        reporter.enter(Stage::Fetching, &mut channel).await.unwrap();
        reporter.enter(Stage::Transcoding, &mut channel).await.unwrap();
        meter.set_transcode_ratio(0.5);
        reporter.sample(&mut channel).await;

        let events = drain(&mut rx).await;
        assert_eq!(events.last().unwrap().progress_percent(), Some(55));
    }

    #[tokio::test]
    async fn test_success_reports_savings_for_compress() {
        let (mut reporter, _meter) = reporter(TransferMode::Compress);
        let (mut channel, mut rx) = progress_channel(64);

        for stage in [
            Stage::Fetching,
            Stage::Transcoding,
            Stage::Uploading,
            Stage::Finalizing,
        ] {
            reporter.enter(stage, &mut channel).await.unwrap();
        }
        let outcome = TransferOutcome {
            result_id: "file-1".into(),
            name: "compressed-a.mp4".into(),
            title: "a.mp4".into(),
            original_size: Some(10_000_000),
            final_size: 3_000_000,
        };
        reporter.succeed(&outcome, &mut channel).await.unwrap();

        let events = drain(&mut rx).await;
        let ProgressEvent::Success(summary) = events.last().unwrap() else {
            panic!("expected success");
        };
        assert_eq!(summary.savings_percent, Some(70));
        assert_eq!(summary.bytes_transferred, 3_000_000);
        assert_eq!(summary.original_size, Some(10_000_000));
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let (mut reporter, _meter) = reporter(TransferMode::Download);
        let (mut channel, _rx) = progress_channel(8);

        let err = reporter
            .enter(Stage::Transcoding, &mut channel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_fail_emits_once() {
        let (mut reporter, _meter) = reporter(TransferMode::Compress);
        let (mut channel, mut rx) = progress_channel(8);

        let err = Error::transcode("ffmpeg exited with code 1");
        reporter.fail(&err, &mut channel).await;
        reporter.fail(&err, &mut channel).await;
        reporter.cancel();

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(reporter.stage(), Stage::Failed);
    }

    #[test]
    fn test_savings_percent() {
        let outcome = TransferOutcome {
            result_id: "x".into(),
            name: "x".into(),
            title: "x".into(),
            original_size: Some(100),
            final_size: 120,
        };
        assert_eq!(outcome.savings_percent(), Some(0));
        let unknown = TransferOutcome {
            original_size: None,
            ..outcome
        };
        assert_eq!(unknown.savings_percent(), None);
    }
}
