//! The transfer orchestrator.
//!
//! Admission (validation, capability check, concurrency gate) happens before
//! any response is streamed. An admitted transfer then runs as one task that
//! drives the stages and is the only writer of the session's progress
//! stream. Cancellation, failure and success all end in the same teardown.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::gate::{ConcurrencyGate, GatePermit};
use super::progress::{
    DisconnectWatch, ProgressChannel, ProgressHandle, ProgressReceiver, Reporter, TransferOutcome,
    progress_channel,
};
use super::request::{TransferMode, TransferRequest};
use super::session::{Stage, TransferSession};
use super::sink::SinkUploader;
use super::source::{ExtractorCommand, ResolvedSource, SourceFetcher};
use super::strategy::{ConnectStream, Connection, StageTools, StrategyKind, build_strategy};
use super::transcode::EncoderCommand;
use crate::config::TransferSettings;
use crate::history::{DisabledHistory, HistoryRecord, HistoryRecorder, RecordOutcome};
use crate::identity::Identity;
use crate::storage::RemoteStorage;
use crate::utils::filename::{compressed_name, download_name};
use crate::{Error, Result};

/// External tools found on this host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub encoder: Option<String>,
    pub extractor: Option<String>,
}

impl Capabilities {
    /// Probe the tools' version flags. Blocks; call once at startup.
    pub fn detect(encoder: &dyn EncoderCommand, extractor: &dyn ExtractorCommand) -> Self {
        let encoder_version = process_utils::detect_version(encoder.program(), encoder.version_flag());
        let extractor_version =
            process_utils::detect_version(extractor.program(), extractor.version_flag());

        match &encoder_version {
            Some(version) => info!(program = %encoder.program(), %version, "Encoder detected"),
            None => warn!(program = %encoder.program(), "Encoder not found; compression is disabled"),
        }
        match &extractor_version {
            Some(version) => info!(program = %extractor.program(), %version, "Extractor detected"),
            None => warn!(
                program = %extractor.program(),
                "Extractor not found; only direct media URLs can be downloaded"
            ),
        }

        Self {
            encoder: encoder_version,
            extractor: extractor_version,
        }
    }

    pub fn supports(&self, mode: TransferMode) -> bool {
        match mode {
            TransferMode::Download => true,
            TransferMode::Compress => self.encoder.is_some(),
        }
    }
}

/// A request that passed admission; holds its gate slot.
#[derive(Debug)]
pub struct Admission {
    request: TransferRequest,
    permit: GatePermit,
}

impl Admission {
    pub fn request(&self) -> &TransferRequest {
        &self.request
    }
}

pub struct TransferPipeline {
    settings: TransferSettings,
    gate: ConcurrencyGate,
    fetcher: Arc<SourceFetcher>,
    storage: Arc<dyn RemoteStorage>,
    history: Arc<dyn HistoryRecorder>,
    strategy: Arc<dyn ConnectStream>,
    capabilities: Capabilities,
    shutdown: CancellationToken,
}

impl TransferPipeline {
    pub fn new(
        settings: TransferSettings,
        client: reqwest::Client,
        storage: Arc<dyn RemoteStorage>,
        encoder: Arc<dyn EncoderCommand>,
        extractor: Arc<dyn ExtractorCommand>,
    ) -> Self {
        let fetcher = Arc::new(
            SourceFetcher::new(client, extractor)
                .with_process_limits(settings.diagnostic_tail_bytes, settings.kill_grace),
        );
        let tools = Arc::new(StageTools {
            fetcher: Arc::clone(&fetcher),
            encoder,
            sink: SinkUploader::new(Arc::clone(&storage)),
            tail_budget: settings.diagnostic_tail_bytes,
            kill_grace: settings.kill_grace,
        });

        Self {
            gate: ConcurrencyGate::new(settings.max_concurrent),
            strategy: build_strategy(settings.strategy, tools),
            settings,
            fetcher,
            storage,
            history: Arc::new(DisabledHistory),
            capabilities: Capabilities::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryRecorder>) -> Self {
        self.history = history;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sessions are cancelled when `token` is.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Admit a request: validate it, check the needed tools, take a gate slot.
    ///
    /// Nothing touches the network or spawns a process before this succeeds.
    pub fn admit(&self, request: TransferRequest) -> Result<Admission> {
        request.validate()?;

        if !self.capabilities.supports(request.mode) {
            return Err(Error::CapabilityUnavailable(
                "Compression is unavailable: no encoder is installed on this server".to_string(),
            ));
        }

        let permit = self.gate.try_acquire()?;
        Ok(Admission { request, permit })
    }

    /// Run an admitted transfer in the background and return its progress stream.
    pub fn start(self: &Arc<Self>, admission: Admission, identity: Identity) -> ProgressReceiver {
        let (channel, receiver) = progress_channel(self.settings.channel_capacity);
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.run(admission, identity, channel).await;
        });
        receiver
    }

    /// Drive one admitted transfer to a terminal stage.
    pub async fn run(
        &self,
        admission: Admission,
        identity: Identity,
        mut channel: ProgressChannel,
    ) -> Stage {
        let id = uuid::Uuid::new_v4().to_string();
        let Admission { request, permit } = admission;
        let span = info_span!("transfer", transfer_id = %id, mode = %request.mode);

        async move {
            info!(user = %identity.user, source = %request.source_descriptor, "Transfer started");
            let mode = request.mode;
            let mut session =
                TransferSession::new(&id, request, permit, self.shutdown.child_token());
            let mut reporter = Reporter::new(&id, mode, Arc::clone(session.meter()));
            let watch = channel.watch();

            reporter.begin(&mut channel).await;

            let result = match self.prepare(&mut session) {
                Ok(()) => {
                    self.drive(&session, &identity, &mut reporter, &mut channel, watch.as_ref())
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(outcome) => {
                    // Runs outside the select: once the work is done it is recorded.
                    self.record_history(&identity, mode, &outcome).await;
                    if let Err(e) = reporter.succeed(&outcome, &mut channel).await {
                        warn!(error = %e, "Could not report success");
                        reporter.fail(&e, &mut channel).await;
                    } else {
                        info!(
                            result_id = %outcome.result_id,
                            name = %outcome.name,
                            size = outcome.final_size,
                            "Transfer succeeded"
                        );
                    }
                }
                Err(Error::Cancelled) => {
                    reporter.cancel();
                    info!(stage = %reporter.stage(), "Transfer cancelled");
                }
                Err(e) => {
                    warn!(error = %e.detail(), "Transfer failed");
                    reporter.fail(&e, &mut channel).await;
                }
            }

            session.teardown().await;
            drop(session);
            drop(watch);
            channel.close();
            debug!(held = self.gate.held(), "Session released");
            reporter.stage()
        }
        .instrument(span)
        .await
    }

    fn prepare(&self, session: &mut TransferSession) -> Result<()> {
        if self.strategy.kind() == StrategyKind::DiskBuffered {
            session.create_scratch_dir(&self.settings.scratch_dir)?;
        }
        Ok(())
    }

    /// Run the stages while relaying their progress, until they finish, the
    /// consumer leaves or the session is cancelled.
    async fn drive(
        &self,
        session: &TransferSession,
        identity: &Identity,
        reporter: &mut Reporter,
        channel: &mut ProgressChannel,
        watch: Option<&DisconnectWatch>,
    ) -> Result<TransferOutcome> {
        let (progress, mut stages) = ProgressHandle::new(Arc::clone(session.meter()));
        let work = self.execute(session, identity, &progress);
        tokio::pin!(work);

        let mut ticker = tokio::time::interval(self.settings.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = session.cancel_token().cancelled() => break Err(Error::Cancelled),
                _ = consumer_gone(watch) => {
                    debug!("Consumer disconnected");
                    break Err(Error::Cancelled);
                }
                Some(stage) = stages.recv() => {
                    if let Err(e) = reporter.enter(stage, channel).await {
                        break Err(e);
                    }
                }
                result = &mut work => {
                    // Stage changes announced right before completion still get their event.
                    if let Err(e) = flush_stages(&mut stages, reporter, channel).await {
                        break Err(e);
                    }
                    break result;
                }
                _ = ticker.tick() => reporter.sample(channel).await,
            }
        }
    }

    /// The stages themselves: resolve, then connect.
    async fn execute(
        &self,
        session: &TransferSession,
        identity: &Identity,
        progress: &ProgressHandle,
    ) -> Result<TransferOutcome> {
        let request = session.request();
        progress.enter(Stage::Fetching);

        let source = self
            .fetcher
            .resolve(request, identity, self.storage.as_ref(), session.slot())
            .await?;
        let (title, declared_size) = match &source {
            ResolvedSource::Stream(stream) => (stream.title.clone(), stream.total),
            ResolvedSource::Extractor { title, estimate, .. } => (title.clone(), *estimate),
        };

        let sink_name = match request.mode {
            TransferMode::Download => download_name(request.requested_name().unwrap_or(&title)),
            TransferMode::Compress => compressed_name(request.requested_name(), &title),
        };
        debug!(%title, %sink_name, ?declared_size, "Source resolved");

        let conn = Connection {
            request,
            identity,
            sink_name: &sink_name,
            slot: session.slot(),
            progress,
            scratch: session.scratch_dir(),
        };
        let receipt = self.strategy.connect(&conn, source).await?;
        progress.enter(Stage::Finalizing);

        let fetched = session.meter().fetched();
        Ok(TransferOutcome {
            result_id: receipt.id,
            name: sink_name,
            title,
            original_size: declared_size.or((fetched > 0).then_some(fetched)),
            final_size: receipt.size,
        })
    }

    /// Best effort: a failed write is logged and never changes the outcome.
    async fn record_history(&self, identity: &Identity, mode: TransferMode, outcome: &TransferOutcome) {
        let record = HistoryRecord {
            user: identity.user.clone(),
            kind: mode,
            title: match mode {
                TransferMode::Download => outcome.title.clone(),
                TransferMode::Compress => outcome.name.clone(),
            },
            size_before: Some(outcome.original_size.unwrap_or(outcome.final_size)),
            size_after: outcome.final_size,
            outcome: RecordOutcome::Success,
            remote_id: outcome.result_id.clone(),
        };

        if let Err(e) = self.history.record(&record).await {
            warn!(error = %e, remote_id = %record.remote_id, "Failed to record transfer history");
        }
    }
}

async fn consumer_gone(watch: Option<&DisconnectWatch>) {
    match watch {
        Some(watch) => watch.closed().await,
        None => std::future::pending().await,
    }
}

async fn flush_stages(
    stages: &mut mpsc::UnboundedReceiver<Stage>,
    reporter: &mut Reporter,
    channel: &mut ProgressChannel,
) -> Result<()> {
    while let Ok(stage) = stages.try_recv() {
        reporter.enter(stage, channel).await?;
    }
    Ok(())
}
