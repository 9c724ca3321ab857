//! API request and response bodies.

use serde::{Deserialize, Serialize};

use crate::transfer::{Resolution, TranscodeOptions, TransferRequest};
use crate::transfer::request::DEFAULT_QUALITY;

/// Body of `POST /api/download`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub sink_name: Option<String>,
}

impl From<DownloadRequest> for TransferRequest {
    fn from(body: DownloadRequest) -> Self {
        let request = TransferRequest::download(body.url);
        match body.sink_name {
            Some(name) => request.with_sink_name(name),
            None => request,
        }
    }
}

/// Body of `POST /api/compress`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressRequest {
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub new_name: Option<String>,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl From<CompressRequest> for TransferRequest {
    fn from(body: CompressRequest) -> Self {
        let options = TranscodeOptions {
            quality: body.quality.unwrap_or(DEFAULT_QUALITY),
            resolution: body.resolution.unwrap_or_default(),
        };
        let request = TransferRequest::compress(body.file_id, options);
        match body.new_name {
            Some(name) => request.with_sink_name(name),
            None => request,
        }
    }
}

/// Tools detected at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    pub encoder: Option<String>,
    pub extractor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub strategy: String,
    pub active_transfers: usize,
    pub max_concurrent_transfers: usize,
    pub capabilities: CapabilitiesResponse,
}
