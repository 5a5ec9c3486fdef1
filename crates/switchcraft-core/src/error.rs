use std::io;
use thiserror::Error;

/// Surface error taxonomy exposed to callers.
///
/// Every `SwitchcraftError` maps to exactly one kind; the kind decides the
/// local recovery policy (see the executor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect/auth/timeout/disconnected
    Transport,
    /// Unexpected prompt, parse failure
    Protocol,
    /// Input failed schema checks (VLAN range, port syntax, checksum mismatch)
    Validation,
    /// Device returned a recognized error pattern
    VendorReject,
    /// HIL or protected-entity guard triggered
    SafetyViolation,
    /// Another writer holds the device lock past deadline
    Conflict,
    /// Recovery and rollback both failed
    RollbackFailed,
    /// Caller cancelled or deadline exceeded
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Validation => "validation",
            ErrorKind::VendorReject => "vendor-reject",
            ErrorKind::SafetyViolation => "safety-violation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RollbackFailed => "rollback-failed",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Error, Debug)]
pub enum SwitchcraftError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("SSH error: {0}")]
    SshError(#[from] ssh2::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection error: failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("Timeout occurred while {action}")]
    Timeout { action: String },

    #[error("Prompt error: {0}")]
    PromptError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Device {device_id} rejected command {command:?}: {message}")]
    VendorReject {
        device_id: String,
        command: String,
        message: String,
    },

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Device {device_id} is locked by another writer")]
    WriterConflict { device_id: String },

    #[error("Rollback failed on {device_id}: {message}")]
    RollbackFailed { device_id: String, message: String },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Unsupported device type: {0}")]
    UnsupportedDeviceType(String),

    #[error("Unsupported on transport: {0}")]
    UnsupportedOnTransport(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Audit log error: {0}")]
    AuditError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl SwitchcraftError {
    pub fn connection_failed(addr: impl Into<String>, err: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source: err,
        }
    }

    pub fn timeout(action: impl Into<String>) -> Self {
        Self::Timeout {
            action: action.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    pub fn vendor_reject(
        device_id: impl Into<String>,
        command: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::VendorReject {
            device_id: device_id.into(),
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn rollback_failed(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RollbackFailed {
            device_id: device_id.into(),
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    /// Map this error onto the surface taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IoError(_)
            | Self::SshError(_)
            | Self::HttpError(_)
            | Self::AuthenticationError(_)
            | Self::ConnectionError(_)
            | Self::ConnectionFailed { .. }
            | Self::ReadError(_)
            | Self::WriteError(_)
            | Self::Timeout { .. } => ErrorKind::Transport,
            Self::RegexError(_)
            | Self::JsonError(_)
            | Self::PromptError(_)
            | Self::ParseError(_)
            | Self::VerificationFailed(_) => ErrorKind::Protocol,
            Self::ValidationError(_)
            | Self::UnsupportedDeviceType(_)
            | Self::UnsupportedOnTransport(_)
            | Self::ConfigError(_) => ErrorKind::Validation,
            Self::VendorReject { .. } => ErrorKind::VendorReject,
            Self::SafetyViolation(_) => ErrorKind::SafetyViolation,
            Self::WriterConflict { .. } => ErrorKind::Conflict,
            Self::RollbackFailed { .. } => ErrorKind::RollbackFailed,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::AuditError(_) => ErrorKind::Protocol,
        }
    }

    /// Transport errors are the only kind that retries with backoff during
    /// connection establishment.
    pub fn is_retryable_connect(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_taxonomy_strings() {
        assert_eq!(
            SwitchcraftError::validation("bad vlan").kind().to_string(),
            "validation"
        );
        assert_eq!(
            SwitchcraftError::vendor_reject("sw1", "vlan 5000", "Invalid input")
                .kind()
                .to_string(),
            "vendor-reject"
        );
        assert_eq!(
            SwitchcraftError::rollback_failed("sw1", "link down")
                .kind()
                .to_string(),
            "rollback-failed"
        );
        assert_eq!(
            SwitchcraftError::cancelled("deadline").kind().to_string(),
            "cancelled"
        );
    }

    #[test]
    fn timeout_is_transport() {
        let err = SwitchcraftError::timeout("reading until prompt");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable_connect());
    }
}
