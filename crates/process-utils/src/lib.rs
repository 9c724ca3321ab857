//! Process helpers for the external media tools (encoder, extractor).
//!
//! [`ManagedProcess`] owns one child process for its whole lifetime: it wires
//! stdin/stdout as stream endpoints, keeps a bounded tail of stderr for
//! diagnostics, and guarantees the child is terminated on `kill()` or drop.

use std::ffi::OsStr;

#[cfg(feature = "tokio")]
mod managed;
mod tail;

#[cfg(feature = "tokio")]
pub use managed::{LineObserver, ManagedProcess, ProcessError, ProcessSpec};
pub use tail::DiagnosticTail;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Run `program <flag>` and return the first line of its stdout.
///
/// Used at startup to find out whether a tool is installed. Returns `None`
/// when the binary is missing or exits unsuccessfully.
pub fn detect_version(program: &str, flag: &str) -> Option<String> {
    let output = std_command(program).arg(flag).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
        .filter(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_version_missing_binary() {
        assert_eq!(detect_version("definitely-not-a-real-tool-xyz", "--version"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_detect_version_first_line() {
        let version = detect_version("printf", "tool version 7.1\\nbuilt with gcc");
        assert_eq!(version, Some("tool version 7.1".to_string()));
    }
}
