//! Startup checks
//!
//! Verifies the external tools the concrete collaborators shell out to:
//! - `playerctl` for the control surface
//! - `journalctl` for the event source

use std::process::Command;
use thiserror::Error;

/// Tools probed before starting, with the argument that prints their version.
pub const REQUIRED_TOOLS: &[(&str, &str)] =
    &[("playerctl", "--version"), ("journalctl", "--version")];

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pull a version string out of `--version` output.
///
/// Handles the usual shapes:
/// - `v2.4.1` (playerctl)
/// - `systemd 252 (252.22-1~deb12u1)` (journalctl)
pub fn parse_tool_version(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    line.split_whitespace()
        .map(|token| token.trim_start_matches('v'))
        .find(|token| token.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

/// Run `tool arg` and require a successful exit.
///
/// Returns the parsed version, or the raw first line when it has no version.
pub fn check_tool_available(tool: &str, arg: &str) -> Result<String, StartupError> {
    let output = Command::new(tool).arg(arg).output().map_err(|e| {
        StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} {} failed; is it installed and in PATH? Error: {}", tool, arg, e),
        }
    })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} {} exited with {}", tool, arg, output.status),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_tool_version(&stdout)
        .unwrap_or_else(|| stdout.lines().next().unwrap_or("").trim().to_string()))
}

/// Run all startup checks in order, stopping at the first failure.
pub fn run_startup_checks() -> Result<(), StartupError> {
    for (tool, arg) in REQUIRED_TOOLS {
        let version = check_tool_available(tool, arg)?;
        tracing::debug!(tool, version = %version, "startup check passed");
    }
    Ok(())
}
