//! Transfer requests as accepted from clients.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Lowest (best) accepted quality value.
pub const MIN_QUALITY: u8 = 18;
/// Highest (smallest output) accepted quality value.
pub const MAX_QUALITY: u8 = 35;
pub const DEFAULT_QUALITY: u8 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Copy a public video URL into storage as-is.
    Download,
    /// Re-encode an existing storage object into a new, smaller object.
    Compress,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Compress => "compress",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output height constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Resolution {
    #[default]
    #[serde(rename = "original")]
    Original,
    #[serde(rename = "720")]
    P720,
    #[serde(rename = "480")]
    P480,
    #[serde(rename = "360")]
    P360,
}

impl Resolution {
    pub fn height(&self) -> Option<u32> {
        match self {
            Self::Original => None,
            Self::P720 => Some(720),
            Self::P480 => Some(480),
            Self::P360 => Some(360),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeOptions {
    /// Constant rate factor: lower is better quality and larger output.
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub resolution: Resolution,
}

fn default_quality() -> u8 {
    DEFAULT_QUALITY
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
            resolution: Resolution::Original,
        }
    }
}

/// An accepted transfer. Immutable once admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// An `http(s)` URL for downloads, a storage object id for compression.
    pub source_descriptor: String,
    /// Target object name; empty means "derive from the source".
    #[serde(default)]
    pub sink_name: String,
    pub mode: TransferMode,
    #[serde(default)]
    pub transcode_options: TranscodeOptions,
}

impl TransferRequest {
    pub fn download(url: impl Into<String>) -> Self {
        Self {
            source_descriptor: url.into(),
            sink_name: String::new(),
            mode: TransferMode::Download,
            transcode_options: TranscodeOptions::default(),
        }
    }

    pub fn compress(object_id: impl Into<String>, options: TranscodeOptions) -> Self {
        Self {
            source_descriptor: object_id.into(),
            sink_name: String::new(),
            mode: TransferMode::Compress,
            transcode_options: options,
        }
    }

    pub fn with_sink_name(mut self, name: impl Into<String>) -> Self {
        self.sink_name = name.into();
        self
    }

    /// Caller-chosen sink name, if any.
    pub fn requested_name(&self) -> Option<&str> {
        Some(self.sink_name.trim()).filter(|s| !s.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        let descriptor = self.source_descriptor.trim();
        if descriptor.is_empty() {
            return Err(match self.mode {
                TransferMode::Download => Error::invalid_request("URL is required"),
                TransferMode::Compress => Error::invalid_request("File ID is required"),
            });
        }

        match self.mode {
            TransferMode::Download => {
                let url = url::Url::parse(descriptor)
                    .map_err(|e| Error::invalid_request(format!("Invalid URL: {e}")))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(Error::invalid_request(format!(
                        "Unsupported URL scheme: {}",
                        url.scheme()
                    )));
                }
            }
            TransferMode::Compress => {
                if !descriptor
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                {
                    return Err(Error::invalid_request("Invalid file ID"));
                }
            }
        }

        let quality = self.transcode_options.quality;
        if !(MIN_QUALITY..=MAX_QUALITY).contains(&quality) {
            return Err(Error::invalid_request(format!(
                "Quality must be between {MIN_QUALITY} and {MAX_QUALITY}, got {quality}"
            )));
        }

        Ok(())
    }
}
