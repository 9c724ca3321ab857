//! Resolving a source descriptor into bytes.
//!
//! Three paths lead to a stream:
//! - a URL that already serves media is fetched directly;
//! - any other URL goes through the extractor, which either yields a direct
//!   media URL or has to stream the media itself;
//! - a storage object id is read from remote storage.

use std::sync::Arc;
use std::time::Duration;

use process_utils::{ManagedProcess, ProcessSpec};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::io::{ByteStream, response_stream};
use super::request::{TransferMode, TransferRequest};
use super::session::{ProcessRole, ProcessSlot};
use crate::identity::Identity;
use crate::storage::RemoteStorage;
use crate::{Error, Result};

/// Content types fetched as-is without asking the extractor.
const MEDIA_CONTENT_TYPES: &[&str] = &["application/octet-stream", "application/mp4"];

/// Extractor protocols that cannot be fetched with a single GET.
const SEGMENTED_PROTOCOLS: &[&str] = &[
    "m3u8",
    "m3u8_native",
    "http_dash_segments",
    "dash",
    "f4m",
    "ism",
];

/// Builds the extractor invocations.
pub trait ExtractorCommand: Send + Sync {
    fn program(&self) -> &str;

    fn version_flag(&self) -> &str {
        "--version"
    }

    /// Arguments printing the media metadata as one JSON document on stdout.
    fn probe_args(&self, url: &str) -> Vec<String>;

    /// Arguments writing the media itself to stdout.
    fn stream_args(&self, url: &str) -> Vec<String>;
}

/// yt-dlp.
#[derive(Debug, Clone)]
pub struct YtDlp {
    path: String,
}

impl YtDlp {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl ExtractorCommand for YtDlp {
    fn program(&self) -> &str {
        &self.path
    }

    fn probe_args(&self, url: &str) -> Vec<String> {
        [
            url,
            "--dump-single-json",
            "--no-check-certificates",
            "--no-warnings",
            "-f",
            "best[ext=mp4]/best",
        ]
        .map(String::from)
        .to_vec()
    }

    fn stream_args(&self, url: &str) -> Vec<String> {
        [
            url,
            "--no-check-certificates",
            "--no-warnings",
            "--no-part",
            "--quiet",
            "-f",
            "best[ext=mp4]/best",
            "-o",
            "-",
        ]
        .map(String::from)
        .to_vec()
    }
}

/// The part of the extractor's metadata document the fetcher uses.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProbeInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filesize: Option<f64>,
    #[serde(default)]
    pub filesize_approx: Option<f64>,
    #[serde(default)]
    pub protocol: Option<String>,
}

impl ProbeInfo {
    pub fn title(&self) -> String {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("video")
            .to_string()
    }

    pub fn estimated_size(&self) -> Option<u64> {
        self.filesize
            .or(self.filesize_approx)
            .filter(|s| *s > 0.0)
            .map(|s| s as u64)
    }

    /// The media URL, when a single GET can fetch it.
    pub fn direct_url(&self) -> Option<&str> {
        let url = self.url.as_deref()?;
        if url.contains("manifest") || !(url.starts_with("http://") || url.starts_with("https://")) {
            return None;
        }
        if let Some(protocol) = self.protocol.as_deref()
            && SEGMENTED_PROTOCOLS.contains(&protocol)
        {
            return None;
        }
        Some(url)
    }
}

/// An open source byte stream.
pub struct SourceStream {
    pub title: String,
    pub mime_type: String,
    /// Declared size; `None` when the source does not say.
    pub total: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStream")
            .field("title", &self.title)
            .field("mime_type", &self.mime_type)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

/// Outcome of resolving a source descriptor.
#[derive(Debug)]
pub enum ResolvedSource {
    /// Bytes can be read directly.
    Stream(SourceStream),
    /// Only the extractor can produce the bytes, on its stdout.
    Extractor {
        title: String,
        url: String,
        estimate: Option<u64>,
    },
}

pub fn is_media_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("video/")
        || essence.starts_with("audio/")
        || MEDIA_CONTENT_TYPES.contains(&essence.as_str())
}

/// Title for a media URL: the last path segment without its extension.
fn title_from_url(url: &reqwest::Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|segment| segment.rsplit_once('.').map_or(segment, |(stem, _)| stem))
        .filter(|stem| !stem.is_empty())
        .unwrap_or("video")
        .to_string()
}

fn content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub struct SourceFetcher {
    client: reqwest::Client,
    extractor: Arc<dyn ExtractorCommand>,
    tail_budget: usize,
    kill_grace: Duration,
}

impl SourceFetcher {
    pub fn new(client: reqwest::Client, extractor: Arc<dyn ExtractorCommand>) -> Self {
        Self {
            client,
            extractor,
            tail_budget: 8 * 1024,
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn with_process_limits(mut self, tail_budget: usize, kill_grace: Duration) -> Self {
        self.tail_budget = tail_budget;
        self.kill_grace = kill_grace;
        self
    }

    pub fn program(&self) -> &str {
        self.extractor.program()
    }

    /// Resolve the request's source. Any extractor process runs in `slot`.
    pub async fn resolve(
        &self,
        request: &TransferRequest,
        identity: &Identity,
        storage: &dyn RemoteStorage,
        slot: &ProcessSlot,
    ) -> Result<ResolvedSource> {
        let descriptor = request.source_descriptor.trim();
        match request.mode {
            TransferMode::Download => self.resolve_url(descriptor, slot).await,
            TransferMode::Compress => {
                let token = identity.access_token.as_str();
                let metadata = storage.get_metadata(token, descriptor).await?;
                let body = storage.get_content(token, descriptor).await?;
                debug!(name = %metadata.name, size = ?metadata.size, "Storage object opened");
                Ok(ResolvedSource::Stream(SourceStream {
                    title: metadata.name,
                    mime_type: metadata.mime_type,
                    total: metadata.size,
                    body,
                }))
            }
        }
    }

    async fn resolve_url(&self, url: &str, slot: &ProcessSlot) -> Result<ResolvedSource> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::source(format!("Could not reach {url}: {e}")))?;

        let media_type = content_type(&response);
        if response.status().is_success() && is_media_content_type(&media_type) {
            info!(%url, content_type = %media_type, "Source serves media directly");
            let title = title_from_url(response.url());
            return Ok(ResolvedSource::Stream(open_response(response, title, None)));
        }
        drop(response);

        let info = self.probe(url, slot).await?;
        let title = info.title();

        match info.direct_url() {
            Some(media_url) => {
                debug!(%title, "Extractor found a direct media URL");
                let response = self
                    .client
                    .get(media_url)
                    .send()
                    .await
                    .map_err(|e| Error::source(format!("Source stream failed: {e}")))?;
                if !response.status().is_success() {
                    return Err(Error::source(format!(
                        "Source stream failed: {}",
                        response.status()
                    )));
                }
                Ok(ResolvedSource::Stream(open_response(
                    response,
                    title,
                    info.estimated_size(),
                )))
            }
            None => {
                info!(%title, protocol = ?info.protocol, "No direct media URL; streaming through the extractor");
                Ok(ResolvedSource::Extractor {
                    title,
                    url: url.to_string(),
                    estimate: info.estimated_size(),
                })
            }
        }
    }

    /// Run the extractor's metadata probe.
    pub async fn probe(&self, url: &str, slot: &ProcessSlot) -> Result<ProbeInfo> {
        let spec = ProcessSpec::new(self.extractor.program(), self.extractor.probe_args(url))
            .with_stdout()
            .with_tail_budget(self.tail_budget)
            .with_kill_grace(self.kill_grace);
        let mut process = ManagedProcess::spawn(spec)
            .map_err(|e| Error::extraction(e.to_string(), None))?;
        let mut stdout = process
            .take_stdout()
            .ok_or_else(|| Error::extraction("extractor stdout unavailable", None))?;
        slot.install(process, ProcessRole::Extractor).await?;

        let read = async {
            let mut output = Vec::new();
            stdout.read_to_end(&mut output).await?;
            Ok::<_, Error>(output)
        };
        let (output, diagnostics) = tokio::try_join!(read, slot.supervise(None))?;

        serde_json::from_slice::<ProbeInfo>(&output).map_err(|e| {
            Error::extraction(
                format!("Failed to parse video metadata: {e}"),
                Some(diagnostics).filter(|d| !d.is_empty()),
            )
        })
    }

    /// Spawn the extractor writing the media to stdout.
    pub fn spawn_stream(&self, url: &str) -> Result<ManagedProcess> {
        let spec = ProcessSpec::new(self.extractor.program(), self.extractor.stream_args(url))
            .with_stdout()
            .with_tail_budget(self.tail_budget)
            .with_kill_grace(self.kill_grace);
        ManagedProcess::spawn(spec).map_err(|e| Error::extraction(e.to_string(), None))
    }
}

fn open_response(response: reqwest::Response, title: String, estimate: Option<u64>) -> SourceStream {
    let mime_type = Some(content_type(&response))
        .filter(|t| is_media_content_type(t))
        .unwrap_or_else(|| "video/mp4".to_string());
    let total = response.content_length().filter(|&n| n > 0).or(estimate);
    SourceStream {
        title,
        mime_type,
        total,
        body: response_stream(response),
    }
}
