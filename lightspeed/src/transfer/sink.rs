//! Pushing a connected stream into remote storage.

use std::sync::Arc;

use tracing::{debug, info};

use super::io::{ByteStream, counted};
use super::progress::ProgressMeter;
use crate::storage::RemoteStorage;
use crate::Result;

/// The object a transfer produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub id: String,
    /// Persisted size: remote-reported when available, otherwise counted.
    pub size: u64,
}

#[derive(Clone)]
pub struct SinkUploader {
    storage: Arc<dyn RemoteStorage>,
}

impl SinkUploader {
    pub fn new(storage: Arc<dyn RemoteStorage>) -> Self {
        Self { storage }
    }

    /// Upload `body` as one new object, counting bytes into `meter`.
    ///
    /// `total` may be unknown; it only drives progress.
    pub async fn upload(
        &self,
        access_token: &str,
        name: &str,
        mime_type: &str,
        body: ByteStream,
        total: Option<u64>,
        meter: &Arc<ProgressMeter>,
    ) -> Result<UploadReceipt> {
        meter.set_upload_total(total);
        let counter = Arc::clone(meter);
        let body = counted(body, move |n| counter.add_uploaded(n));

        debug!(%name, ?total, "Starting upload");
        let created = self
            .storage
            .create_object(access_token, name, mime_type, body, total)
            .await?;

        let counted_size = meter.uploaded();
        let size = created.size.unwrap_or(counted_size);
        info!(id = %created.id, %name, size, counted_size, "Upload complete");

        Ok(UploadReceipt {
            id: created.id,
            size,
        })
    }
}
