//! Naming of the objects written to storage.
//!
//! Titles come straight from video pages, so they can contain path
//! separators, control characters and other characters storage clients
//! choke on when the file is later synced to a desktop.

/// Characters replaced in object names.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '%'];

/// Windows reserved filenames (case-insensitive)
const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Fallback stem when a title sanitizes to nothing.
const FALLBACK_STEM: &str = "video";

/// Sanitize a title for use as a file name.
///
/// Invalid characters become `-` (runs collapse to one), control characters
/// are dropped, leading/trailing spaces and dots are trimmed, and Windows
/// reserved names get a `_` prefix.
///
/// ```
/// use lightspeed::utils::filename::sanitize_filename;
///
/// assert_eq!(sanitize_filename("AC/DC: Live?"), "AC-DC- Live-");
/// assert_eq!(sanitize_filename("   "), "video");
/// ```
pub fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;

    for c in input.chars() {
        if c.is_control() {
            continue;
        }
        if INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('-');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return FALLBACK_STEM.to_string();
    }

    let upper = trimmed.to_uppercase();
    for reserved in WINDOWS_RESERVED_NAMES {
        if upper == *reserved || upper.starts_with(&format!("{}.", reserved)) {
            return format!("_{}", trimmed);
        }
    }

    trimmed.to_string()
}

/// Ensure `name` ends with `.ext` (case-insensitive).
pub fn with_extension(name: &str, ext: &str) -> String {
    let suffix = format!(".{ext}");
    if name.to_lowercase().ends_with(&suffix.to_lowercase()) {
        name.to_string()
    } else {
        format!("{name}{suffix}")
    }
}

/// Object name for a downloaded video: the sanitized title as an `.mp4`.
pub fn download_name(title: &str) -> String {
    with_extension(&sanitize_filename(title), "mp4")
}

/// Object name for a compressed copy.
///
/// A caller-chosen name wins (forced to `.mp4`); otherwise the original name
/// gets a `compressed-` prefix.
pub fn compressed_name(requested: Option<&str>, original: &str) -> String {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => with_extension(&sanitize_filename(name), "mp4"),
        None => format!("compressed-{}", sanitize_filename(original)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_characters_collapse() {
        assert_eq!(sanitize_filename("a???b"), "a-b");
        assert_eq!(sanitize_filename("50% off"), "50- off");
    }

    #[test]
    fn test_control_characters_dropped() {
        assert_eq!(sanitize_filename("line\nbreak\ttab"), "linebreaktab");
    }

    #[test]
    fn test_unicode_preserved() {
        assert_eq!(sanitize_filename("观看一只青蛙"), "观看一只青蛙");
    }

    #[test]
    fn test_reserved_names() {
        assert_eq!(sanitize_filename("CON"), "_CON");
        assert_eq!(sanitize_filename("nul.txt"), "_nul.txt");
    }

    #[test]
    fn test_empty_falls_back() {
        assert_eq!(sanitize_filename(""), "video");
        assert_eq!(sanitize_filename(" .. "), "video");
    }

    #[test]
    fn test_with_extension() {
        assert_eq!(with_extension("clip", "mp4"), "clip.mp4");
        assert_eq!(with_extension("clip.MP4", "mp4"), "clip.MP4");
    }

    #[test]
    fn test_download_name() {
        assert_eq!(download_name("My Video: Part 1"), "My Video- Part 1.mp4");
    }

    #[test]
    fn test_compressed_name() {
        assert_eq!(compressed_name(Some("holiday"), "raw.mov"), "holiday.mp4");
        assert_eq!(compressed_name(Some("  "), "raw.mov"), "compressed-raw.mov");
        assert_eq!(compressed_name(None, "raw.mp4"), "compressed-raw.mp4");
    }
}
