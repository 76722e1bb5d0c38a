//! Error taxonomy shared by the access store, the session supervisor and the
//! offload client.
//!
//! Every variant is recoverable from the router's point of view: it is turned
//! into a reply and the dispatch loop keeps going.

use thiserror::Error;

/// Bad request shape: target, port, duration or approval token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid IP address '{0}'")]
    InvalidIp(String),
    #[error("invalid port '{0}', must be between 1 and 65535")]
    InvalidPort(String),
    #[error("invalid duration '{value}', must be between 1 and {max} seconds")]
    InvalidDuration { value: String, max: u64 },
    #[error("invalid duration format '{0}', use <N>h, <N>d, <N>m or 'permanent'")]
    InvalidDurationFormat(String),
}

/// Access decisions and admin actions that cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("user {0} is not authorized")]
    NotAuthorized(i64),
    #[error("user {0} has no pending application")]
    NoPendingApplication(i64),
    #[error("user {0} is not in the access list")]
    NotFound(i64),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Failures reading or writing the access file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("malformed record on line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("access file I/O failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Failures starting or stopping a probe session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("failed to spawn probe: {0}")]
    SpawnFailed(String),
    #[error("target {0} is outside the allowed networks")]
    TargetNotPermitted(String),
    #[error("user {owner} already has {active} active session(s)")]
    SessionLimit { owner: i64, active: usize },
    #[error("failed to terminate pid {pid}: {reason}")]
    TerminateFailed { pid: u32, reason: String },
}

/// Failures talking to the remote worker service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteServiceError {
    #[error("offload failed: {0}")]
    OffloadFailed(String),
    #[error("status fetch failed: {0}")]
    StatusFetchFailed(String),
    #[error("offload is not configured")]
    NotConfigured,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages() {
        let err = ValidationError::InvalidDuration {
            value: "601".to_string(),
            max: 600,
        };
        assert_eq!(
            err.to_string(),
            "invalid duration '601', must be between 1 and 600 seconds"
        );
        assert!(ValidationError::InvalidPort("0".to_string())
            .to_string()
            .contains("65535"));
    }

    #[test]
    fn test_auth_error_wraps_validation() {
        let err: AuthError = ValidationError::InvalidDurationFormat("5x".to_string()).into();
        assert!(matches!(
            err,
            AuthError::Validation(ValidationError::InvalidDurationFormat(_))
        ));
        assert!(err.to_string().contains("'5x'"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: PersistenceError = io.into();
        assert!(matches!(err, PersistenceError::Io(ref m) if m.contains("denied")));
    }
}
