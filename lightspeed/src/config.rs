//! Service configuration loaded from environment variables.
//!
//! Every setting has a default so the service starts with only Google
//! credentials supplied by clients. A `.env` file is honoured through
//! `dotenvy` in `main`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::api::server::ApiServerConfig;
use crate::transfer::StrategyKind;
use crate::{Error, Result};

pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 5;
pub const DEFAULT_DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DEFAULT_DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
pub const DEFAULT_TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

/// Tunables of the transfer pipeline.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Ceiling of the concurrency gate.
    pub max_concurrent: usize,
    /// How stages are connected (pipes or scratch files).
    pub strategy: StrategyKind,
    /// Scratch space for the disk strategy.
    pub scratch_dir: PathBuf,
    /// Reporter sampling period.
    pub progress_interval: Duration,
    /// Budget of the stderr tail kept per external process.
    pub diagnostic_tail_bytes: usize,
    /// Bound on reaping a killed external process.
    pub kill_grace: Duration,
    /// Buffered progress records per session before emission waits on the client.
    pub channel_capacity: usize,
    /// Connect timeout for outbound HTTP.
    pub connect_timeout: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            strategy: StrategyKind::Streaming,
            scratch_dir: std::env::temp_dir(),
            progress_interval: Duration::from_millis(250),
            diagnostic_tail_bytes: 8 * 1024,
            kill_grace: Duration::from_secs(5),
            channel_capacity: 64,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Locations of the external tools.
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    pub ffmpeg_path: String,
    pub ytdlp_path: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_path: "yt-dlp".to_string(),
        }
    }
}

/// Google Drive endpoints.
#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub api_base: String,
    pub upload_base: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_DRIVE_API_BASE.to_string(),
            upload_base: DEFAULT_DRIVE_UPLOAD_BASE.to_string(),
        }
    }
}

/// Supabase project used for the transfer history.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ApiServerConfig,
    pub transfer: TransferSettings,
    pub tools: ToolsConfig,
    pub drive: DriveConfig,
    pub tokeninfo_url: String,
    /// `None` disables history recording.
    pub history: Option<HistoryConfig>,
    pub log_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ApiServerConfig::default(),
            transfer: TransferSettings::default(),
            tools: ToolsConfig::default(),
            drive: DriveConfig::default(),
            tokeninfo_url: DEFAULT_TOKENINFO_URL.to_string(),
            history: None,
            log_dir: "logs".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(addr) = get("API_BIND_ADDRESS") {
            config.server.bind_address = addr;
        }
        if let Some(port) = parse_var(&get, "API_PORT")? {
            config.server.port = port;
        }
        if let Some(cors) = parse_var(&get, "API_ENABLE_CORS")? {
            config.server.enable_cors = cors;
        }

        let transfer = &mut config.transfer;
        if let Some(max) = parse_var::<usize>(&get, "MAX_CONCURRENT_TRANSFERS")? {
            if max == 0 {
                return Err(Error::config("MAX_CONCURRENT_TRANSFERS must be at least 1"));
            }
            transfer.max_concurrent = max;
        }
        if let Some(strategy) = parse_var(&get, "TRANSFER_STRATEGY")? {
            transfer.strategy = strategy;
        }
        if let Some(dir) = get("SCRATCH_DIR") {
            transfer.scratch_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parse_var::<u64>(&get, "PROGRESS_INTERVAL_MS")? {
            transfer.progress_interval = Duration::from_millis(ms.max(10));
        }
        if let Some(bytes) = parse_var(&get, "DIAGNOSTIC_TAIL_BYTES")? {
            transfer.diagnostic_tail_bytes = bytes;
        }
        if let Some(ms) = parse_var(&get, "KILL_GRACE_MS")? {
            transfer.kill_grace = Duration::from_millis(ms);
        }

        if let Some(path) = get("FFMPEG_PATH") {
            config.tools.ffmpeg_path = path;
        }
        if let Some(path) = get("YTDLP_PATH") {
            config.tools.ytdlp_path = path;
        }

        if let Some(base) = get("DRIVE_API_BASE") {
            config.drive.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(base) = get("DRIVE_UPLOAD_BASE") {
            config.drive.upload_base = base.trim_end_matches('/').to_string();
        }
        if let Some(url) = get("TOKENINFO_URL") {
            config.tokeninfo_url = url;
        }

        let supabase_url = get("SUPABASE_URL").or_else(|| get("NEXT_PUBLIC_SUPABASE_URL"));
        let supabase_key =
            get("SUPABASE_ANON_KEY").or_else(|| get("NEXT_PUBLIC_SUPABASE_ANON_KEY"));
        config.history = match (supabase_url, supabase_key) {
            (Some(url), Some(api_key)) => Some(HistoryConfig {
                url: url.trim_end_matches('/').to_string(),
                api_key,
            }),
            _ => None,
        };

        if let Some(dir) = get("LOG_DIR") {
            config.log_dir = dir;
        }

        Ok(config)
    }
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::config(format!("{key}={raw:?} is invalid: {e}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.transfer.max_concurrent, 5);
        assert_eq!(config.transfer.strategy, StrategyKind::Streaming);
        assert_eq!(config.tools.ffmpeg_path, "ffmpeg");
        assert!(config.history.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("API_PORT", "8080"),
            ("MAX_CONCURRENT_TRANSFERS", "2"),
            ("TRANSFER_STRATEGY", "disk"),
            ("DRIVE_API_BASE", "http://localhost:9000/drive/"),
            ("SUPABASE_URL", "https://abc.supabase.co/"),
            ("SUPABASE_ANON_KEY", "anon"),
        ])
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.transfer.max_concurrent, 2);
        assert_eq!(config.transfer.strategy, StrategyKind::DiskBuffered);
        assert_eq!(config.drive.api_base, "http://localhost:9000/drive");
        let history = config.history.unwrap();
        assert_eq!(history.url, "https://abc.supabase.co");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            load(&[("API_PORT", "not-a-port")]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            load(&[("MAX_CONCURRENT_TRANSFERS", "0")]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            load(&[("TRANSFER_STRATEGY", "carrier-pigeon")]),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let config = load(&[("FFMPEG_PATH", "  ")]).unwrap();
        assert_eq!(config.tools.ffmpeg_path, "ffmpeg");
    }
}
