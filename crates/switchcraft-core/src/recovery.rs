use crate::model::PortId;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What the executor should do about a recognized failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Disable dual-mode on the offending port, then retry the failed
    /// command only.
    DisableDualMode { port: Option<PortId> },
    /// The command was an idempotent no-op; continue as success.
    TreatAsSuccess,
    /// Disable spanning-tree on the port, retry, re-enable afterwards.
    DisableStp { port: Option<PortId> },
    /// Reconnect once and retry the remaining plan from the failed point.
    Reconnect,
    /// Do not retry; escalate with full context.
    Fatal,
}

/// One recovery attempt as recorded in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub matched_pattern: String,
    pub action: RecoveryAction,
    pub succeeded: bool,
}

lazy_static! {
    static ref DUAL_MODE_PORT: Regex =
        Regex::new(r"(?i)port\s+(\d+/\d+/\d+)").unwrap();
    static ref INTERFACE_PORT: Regex =
        Regex::new(r"(?i)ethe(?:rnet)?\s+(\d+/\d+/\d+)").unwrap();
}

/// Pull a port id out of error output or, failing that, the command that
/// triggered it.
fn extract_port(output: &str, command: &str) -> Option<PortId> {
    DUAL_MODE_PORT
        .captures(output)
        .or_else(|| INTERFACE_PORT.captures(command))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Classify failure output into a recovery action. Matching is
/// case-insensitive substring matching; first hit wins. Unrecognized output
/// yields `None` and the failure surfaces as-is.
pub fn classify_failure(output: &str, command: &str) -> Option<(String, RecoveryAction)> {
    let lower = output.to_lowercase();

    if lower.contains("please disable dual mode") {
        return Some((
            "please disable dual mode".to_string(),
            RecoveryAction::DisableDualMode {
                port: extract_port(output, command),
            },
        ));
    }
    if lower.contains("already a member") {
        return Some(("already a member".to_string(), RecoveryAction::TreatAsSuccess));
    }
    if lower.contains("port is in spanning-tree") {
        return Some((
            "port is in spanning-tree".to_string(),
            RecoveryAction::DisableStp {
                port: extract_port(output, command),
            },
        ));
    }
    if lower.contains("invalid input") || lower.contains("unrecognized command") {
        return Some(("invalid input".to_string(), RecoveryAction::Fatal));
    }
    if lower.contains("connection closed")
        || lower.contains("connection reset")
        || lower.contains("timed out waiting for prompt")
    {
        return Some(("connection closed".to_string(), RecoveryAction::Reconnect));
    }
    None
}

/// Commands that disable dual-mode on a port, run individually before the
/// failed command is retried.
pub fn dual_mode_fix(port: &PortId) -> Vec<String> {
    vec![
        format!("interface ethe {}", port),
        "no dual-mode".to_string(),
        "exit".to_string(),
    ]
}

/// Disable spanning-tree on a port ahead of a retry.
pub fn stp_disable_fix(port: &PortId) -> Vec<String> {
    vec![
        format!("interface ethe {}", port),
        "no spanning-tree".to_string(),
        "exit".to_string(),
    ]
}

/// Re-enable spanning-tree; appended to post-commands after a successful
/// `DisableStp` recovery.
pub fn stp_reenable(port: &PortId) -> Vec<String> {
    vec![
        format!("interface ethe {}", port),
        "spanning-tree".to_string(),
        "exit".to_string(),
    ]
}
