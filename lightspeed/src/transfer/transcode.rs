//! External encoder command lines and progress scraping.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::progress::ProgressMeter;
use super::request::TranscodeOptions;

/// Where the encoder reads from or writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// stdin for input, stdout for output.
    Pipe,
    File(PathBuf),
}

/// Builds the encoder invocation. The encoder is driven as a black box.
pub trait EncoderCommand: Send + Sync {
    fn program(&self) -> &str;

    /// Flag that prints the version, used to detect the tool at startup.
    fn version_flag(&self) -> &str {
        "-version"
    }

    fn args(&self, options: &TranscodeOptions, input: &Endpoint, output: &Endpoint) -> Vec<String>;
}

/// H.264/AAC re-encode through ffmpeg.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    path: String,
}

impl Ffmpeg {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl EncoderCommand for Ffmpeg {
    fn program(&self) -> &str {
        &self.path
    }

    fn args(&self, options: &TranscodeOptions, input: &Endpoint, output: &Endpoint) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into()];

        // `-nostdin` must not be combined with reading the input from stdin.
        if *input == Endpoint::Pipe {
            args.pop();
        }

        args.push("-i".into());
        args.push(match input {
            Endpoint::Pipe => "pipe:0".into(),
            Endpoint::File(path) => path.to_string_lossy().into_owned(),
        });

        let crf = options.quality.to_string();
        args.extend(
            [
                "-vcodec",
                "libx264",
                "-crf",
                crf.as_str(),
                "-preset",
                "veryfast",
                "-acodec",
                "aac",
                "-b:a",
                "128k",
            ]
            .map(String::from),
        );

        if let Some(height) = options.resolution.height() {
            args.push("-vf".into());
            args.push(format!("scale=-2:{height}"));
        }

        match output {
            Endpoint::Pipe => {
                // A seekable moov atom is impossible on a pipe; fragment instead.
                args.extend(
                    ["-f", "mp4", "-movflags", "frag_keyframe+empty_moov", "pipe:1"].map(String::from),
                );
            }
            Endpoint::File(path) => {
                args.push("-y".into());
                args.push(path.to_string_lossy().into_owned());
            }
        }

        args
    }
}

/// Parse an ffmpeg timestamp (`HH:MM:SS.ms`) into seconds.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

static DURATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Duration:\s*(\d+:\d{2}:\d{2}(?:\.\d+)?)").unwrap());
static TIME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=\s*(\d+:\d{2}:\d{2}(?:\.\d+)?)").unwrap());

fn capture<'a>(regex: &Regex, line: &'a str) -> Option<&'a str> {
    regex.captures(line)?.get(1).map(|m| m.as_str())
}

/// Turns encoder stderr lines into a position ratio on the meter.
///
/// Needs the input `Duration:` header; without it (typical for piped
/// input) the position stays unknown and progress falls back to bytes.
pub struct TranscodeObserver {
    meter: Arc<ProgressMeter>,
    duration: Option<f64>,
}

impl TranscodeObserver {
    pub fn new(meter: Arc<ProgressMeter>) -> Self {
        Self {
            meter,
            duration: None,
        }
    }

    pub fn observe(&mut self, line: &str) {
        if self.duration.is_none()
            && let Some(duration) = capture(&DURATION_REGEX, line).and_then(parse_timestamp)
        {
            self.duration = Some(duration).filter(|d| *d > 0.0);
            return;
        }

        let Some(duration) = self.duration else {
            return;
        };
        if let Some(position) = capture(&TIME_REGEX, line).and_then(parse_timestamp) {
            self.meter.set_transcode_ratio(position / duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::request::Resolution;

    fn options(quality: u8, resolution: Resolution) -> TranscodeOptions {
        TranscodeOptions {
            quality,
            resolution,
        }
    }

    #[test]
    fn test_pipe_to_pipe_args() {
        let args = Ffmpeg::default().args(
            &options(28, Resolution::Original),
            &Endpoint::Pipe,
            &Endpoint::Pipe,
        );

        assert_eq!(args[..3], ["-hide_banner", "-i", "pipe:0"]);
        assert!(args.windows(2).any(|w| w == ["-crf", "28"]));
        assert!(args.windows(2).any(|w| w == ["-movflags", "frag_keyframe+empty_moov"]));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
        assert!(!args.iter().any(|a| a == "-vf"));
        assert!(!args.iter().any(|a| a == "-nostdin"));
    }

    #[test]
    fn test_file_to_file_args_with_scaling() {
        let args = Ffmpeg::new("/usr/bin/ffmpeg").args(
            &options(35, Resolution::P480),
            &Endpoint::File("/tmp/in.mov".into()),
            &Endpoint::File("/tmp/out.mp4".into()),
        );

        assert!(args.contains(&"-nostdin".to_string()));
        assert!(args.windows(2).any(|w| w == ["-i", "/tmp/in.mov"]));
        assert!(args.windows(2).any(|w| w == ["-vf", "scale=-2:480"]));
        assert_eq!(args[args.len() - 2..], ["-y", "/tmp/out.mp4"]);
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("00:00:10.50"), Some(10.5));
        assert_eq!(parse_timestamp("01:02:03"), Some(3723.0));
        assert_eq!(parse_timestamp("N/A"), None);
        assert_eq!(parse_timestamp("1:2:3:4"), None);
    }

    #[test]
    fn test_observer_tracks_position() {
        let meter = Arc::new(ProgressMeter::default());
        let mut observer = TranscodeObserver::new(Arc::clone(&meter));

        observer.observe("  Duration: 00:01:40.00, start: 0.000000, bitrate: 1205 kb/s");
        observer.observe("frame=  250 fps=0.0 q=28.0 size=  1024kB time=00:00:25.00 bitrate=335.5kbits/s");

        assert_eq!(meter.snapshot().transcode_ratio, Some(0.25));
    }

    #[test]
    fn test_observer_without_duration_stays_indeterminate() {
        let meter = Arc::new(ProgressMeter::default());
        let mut observer = TranscodeObserver::new(Arc::clone(&meter));

        observer.observe("  Duration: N/A, start: 0.000000, bitrate: N/A");
        observer.observe("frame=  250 fps=0.0 q=28.0 size=  1024kB time=00:00:25.00");

        assert_eq!(meter.snapshot().transcode_ratio, None);
    }
}
