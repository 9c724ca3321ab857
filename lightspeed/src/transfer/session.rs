//! Per-transfer state: stage machine, external process slot and teardown.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use process_utils::{ManagedProcess, ProcessError};
use tempfile::TempDir;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::gate::GatePermit;
use super::progress::ProgressMeter;
use super::request::TransferRequest;
use crate::{Error, Result};

/// Lifecycle of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Initializing,
    Fetching,
    Transcoding,
    Uploading,
    Finalizing,
    Success,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Fetching => "fetching",
            Self::Transcoding => "transcoding",
            Self::Uploading => "uploading",
            Self::Finalizing => "finalizing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, to: Stage) -> bool {
        use Stage::*;
        match (self, to) {
            (from, _) if from.is_terminal() => false,
            (_, Failed | Cancelled) => true,
            (Initializing, Fetching) => true,
            (Fetching, Transcoding | Uploading) => true,
            (Transcoding, Uploading) => true,
            (Uploading, Finalizing) => true,
            (Finalizing, Success) => true,
            _ => false,
        }
    }

    /// Validated transition.
    pub fn transition(self, to: Stage) -> Result<Stage> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a supervised process is for; decides how its failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Extractor,
    Encoder,
}

impl ProcessRole {
    fn failure(&self, err: ProcessError) -> Error {
        match (self, err) {
            (_, ProcessError::Killed { .. }) => Error::Cancelled,
            (_, ProcessError::Wait { source, .. }) => Error::Io(source),
            (Self::Extractor, err @ ProcessError::Exited { .. }) => {
                let diagnostics = err.diagnostics().map(str::to_string);
                Error::extraction(exit_summary(&err), diagnostics)
            }
            (Self::Encoder, err @ ProcessError::Exited { .. }) => Error::transcode(err.to_string()),
            (Self::Extractor, err) => Error::extraction(err.to_string(), None),
            (Self::Encoder, err) => Error::transcode(err.to_string()),
        }
    }
}

fn exit_summary(err: &ProcessError) -> String {
    match (err, err.exit_code()) {
        (ProcessError::Exited { program, .. }, Some(code)) => {
            format!("{program} exited with code {code}")
        }
        (ProcessError::Exited { program, .. }, None) => format!("{program} was terminated by a signal"),
        (other, _) => other.to_string(),
    }
}

struct Supervised {
    process: ManagedProcess,
    role: ProcessRole,
}

/// Holds the zero-or-one live external process of a session.
///
/// The handle is cleared as soon as the process has exited or been killed.
#[derive(Default)]
pub struct ProcessSlot {
    inner: Mutex<Option<Supervised>>,
}

impl ProcessSlot {
    /// Take ownership of a freshly spawned process.
    pub async fn install(&self, process: ManagedProcess, role: ProcessRole) -> Result<()> {
        let mut slot = self.inner.lock().await;
        if let Some(current) = slot.as_ref()
            && current.process.is_alive()
        {
            return Err(Error::Other(format!(
                "cannot start {}: {} is still running",
                process.program(),
                current.process.program()
            )));
        }
        debug!(program = %process.program(), pid = ?process.pid(), ?role, "Process installed");
        *slot = Some(Supervised { process, role });
        Ok(())
    }

    /// Wait for the installed process to exit and clear the slot.
    ///
    /// Returns the stderr tail of a successful run. `exit_tx` learns whether
    /// the process succeeded, releasing any stream gated on it. Cancel-safe:
    /// dropping the future leaves the process in the slot for
    /// [`kill`](Self::kill).
    pub async fn supervise(&self, exit_tx: Option<oneshot::Sender<bool>>) -> Result<String> {
        let mut slot = self.inner.lock().await;
        let Some(current) = slot.as_mut() else {
            if let Some(tx) = exit_tx {
                let _ = tx.send(true);
            }
            return Ok(String::new());
        };

        let result = current.process.wait_for_exit().await;
        let diagnostics = current.process.diagnostics();
        let role = current.role;
        *slot = None;

        if let Some(tx) = exit_tx {
            let _ = tx.send(result.is_ok());
        }
        result.map(|_| diagnostics).map_err(|err| role.failure(err))
    }

    /// Whether a process is installed and not yet reaped.
    pub fn is_live(&self) -> bool {
        match self.inner.try_lock() {
            Ok(slot) => slot.as_ref().is_some_and(|s| s.process.is_alive()),
            // Locked means a supervisor is waiting on a live process.
            Err(_) => true,
        }
    }

    /// Kill and clear the installed process. No-op when the slot is empty.
    pub async fn kill(&self) {
        let taken = self.inner.lock().await.take();
        if let Some(mut current) = taken {
            if current.process.is_alive() {
                debug!(program = %current.process.program(), pid = ?current.process.pid(), "Killing live process");
            }
            current.process.kill().await;
        }
    }
}

/// Everything one admitted transfer owns.
///
/// Dropped after [`teardown`](Self::teardown); the gate permit goes with it.
pub struct TransferSession {
    id: String,
    request: TransferRequest,
    meter: Arc<ProgressMeter>,
    cancel: CancellationToken,
    slot: ProcessSlot,
    scratch: Option<TempDir>,
    _permit: GatePermit,
}

impl TransferSession {
    pub fn new(
        id: impl Into<String>,
        request: TransferRequest,
        permit: GatePermit,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            request,
            meter: Arc::new(ProgressMeter::default()),
            cancel,
            slot: ProcessSlot::default(),
            scratch: None,
            _permit: permit,
        }
    }

    /// Allocate a private scratch directory under `root`, removed on teardown.
    pub fn create_scratch_dir(&mut self, root: &Path) -> Result<()> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("lightspeed-{}-", self.id))
            .tempdir_in(root)?;
        debug!(transfer_id = %self.id, path = %dir.path().display(), "Scratch directory created");
        self.scratch = Some(dir);
        Ok(())
    }

    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    pub fn meter(&self) -> &Arc<ProgressMeter> {
        &self.meter
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn slot(&self) -> &ProcessSlot {
        &self.slot
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// Release everything the session holds. Safe to call more than once.
    pub async fn teardown(&mut self) {
        self.slot.kill().await;

        if let Some(dir) = self.scratch.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(transfer_id = %self.id, path = %path.display(), error = %e, "Failed to remove scratch directory");
            }
        }
    }
}
