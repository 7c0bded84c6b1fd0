//! On-disk wire format shared with the generated client script.
//!
//! One request round-trip is a family of files in the proxy directory, all
//! named `<uuid><suffix>`. Argv travels as NUL-separated raw bytes; the
//! final status is a single ASCII line `code` or `code:reason`. Both sides
//! publish atomically by writing a `.tmp` sibling and renaming it into
//! place, which is what lets the other side poll without ever seeing a
//! partial file.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

pub const REQ_SUFFIX: &str = ".req";
pub const REQ_TMP_SUFFIX: &str = ".req.tmp";
pub const STDIN_SUFFIX: &str = ".stdin";
pub const STDOUT_SUFFIX: &str = ".stdout";
pub const STDERR_SUFFIX: &str = ".stderr";
pub const EXIT_SUFFIX: &str = ".exit";
pub const EXIT_TMP_SUFFIX: &str = ".exit.tmp";

/// Single liveness file touched by every client while it waits.
pub const HEARTBEAT_FILE: &str = ".heartbeat";

/// Exit code the host assigns to requests rejected during shutdown.
pub const CODE_SHUTDOWN: u8 = 125;
/// Exit code when the bound command cannot be spawned.
pub const CODE_SPAWN_FAILED: u8 = 127;

/// Reason tokens carried after the `:` in an exit line.
pub mod reason {
    pub const TIMEOUT: &str = "timeout";
    pub const SHUTDOWN: &str = "shutdown";
    pub const KILLED: &str = "killed";
    pub const SPAWN_FAILED: &str = "spawn_failed";
}

/// Path of one per-request artifact: `<dir>/<id><suffix>`.
pub fn artifact(dir: &Path, id: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{id}{suffix}"))
}

/// Encode argv as NUL-terminated fields, the exact byte stream the client
/// script produces with `printf '%s\0'`.
pub fn encode_argv<S: AsRef<OsStr>>(argv: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for field in argv {
        out.extend_from_slice(field.as_ref().as_bytes());
        out.push(0);
    }
    out
}

/// Decode NUL-separated argv. A single trailing empty field (from the
/// terminating NUL) is dropped; interior empty fields are legitimate
/// arguments and kept.
pub fn parse_argv(bytes: &[u8]) -> Vec<OsString> {
    let mut fields: Vec<OsString> = bytes
        .split(|b| *b == 0)
        .map(|f| OsString::from_vec(f.to_vec()))
        .collect();
    if fields.last().is_some_and(|f| f.is_empty()) {
        fields.pop();
    }
    fields
}

/// Map a terminating signal to the conventional shell exit code.
pub fn signal_exit_code(signal: i32) -> u8 {
    (128i32.wrapping_add(signal) & 0xff) as u8
}

/// The final status line: `code` or `code:reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitLine {
    pub code: u8,
    pub reason: Option<String>,
}

impl ExitLine {
    pub fn code(code: u8) -> Self {
        Self { code, reason: None }
    }

    pub fn with_reason(code: u8, reason: &str) -> Self {
        Self {
            code,
            reason: Some(reason.to_string()),
        }
    }

    pub fn render(&self) -> String {
        match &self.reason {
            Some(reason) => format!("{}:{reason}", self.code),
            None => self.code.to_string(),
        }
    }

    /// Parse an exit line. Only the text before the first `:` must be a
    /// decimal code in 0..=255; everything after it is free-form reason.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches('\n');
        let (code_str, reason) = match line.split_once(':') {
            Some((c, r)) => (c, Some(r.to_string())),
            None => (line, None),
        };
        let code: u8 = code_str.parse().ok()?;
        Some(Self { code, reason })
    }
}
