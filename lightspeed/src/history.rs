//! Write-only log of completed transfers.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::config::HistoryConfig;
use crate::transfer::TransferMode;
use crate::{Error, Result};

/// Outcome column of a history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOutcome {
    Success,
}

/// One history row. Field names match the `transfers` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    #[serde(rename = "user_email")]
    pub user: String,
    #[serde(rename = "type")]
    pub kind: TransferMode,
    pub title: String,
    #[serde(rename = "original_size")]
    pub size_before: Option<u64>,
    #[serde(rename = "final_size")]
    pub size_after: u64,
    #[serde(rename = "status")]
    pub outcome: RecordOutcome,
    #[serde(rename = "drive_file_id")]
    pub remote_id: String,
}

/// Appends one record per completed transfer.
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    async fn record(&self, record: &HistoryRecord) -> Result<()>;
}

/// Recorder used when no history backend is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledHistory;

#[async_trait]
impl HistoryRecorder for DisabledHistory {
    async fn record(&self, record: &HistoryRecord) -> Result<()> {
        debug!(remote_id = %record.remote_id, "History disabled; record skipped");
        Ok(())
    }
}

/// Supabase (PostgREST) `transfers` table.
#[derive(Debug, Clone)]
pub struct SupabaseHistory {
    client: reqwest::Client,
    config: HistoryConfig,
}

impl SupabaseHistory {
    pub fn new(client: reqwest::Client, config: HistoryConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl HistoryRecorder for SupabaseHistory {
    async fn record(&self, record: &HistoryRecord) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/rest/v1/transfers", self.config.url))
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await
            .map_err(|e| Error::Other(format!("History insert failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!(
                "History insert rejected ({status}): {}",
                body.trim()
            )));
        }
        Ok(())
    }
}
