//! Error types for the fleet core.

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::shell::ShellError;

/// Result type for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors surfaced by foreground fleet operations.
///
/// Per-test failures are reported as values inside result lists. Only
/// failures with no valid work left to report become a `FleetError`.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Robot unreachable or authentication refused.
    #[error("{message}")]
    Connectivity { robot_id: String, message: String },

    /// A remote command failed.
    #[error("{0}")]
    Execution(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    /// Robot is busy with another operation.
    #[error("{0}")]
    Conflict(String),

    #[error("Invalid definition catalog: {0}")]
    InvalidDefinition(#[from] CatalogError),
}

impl FleetError {
    pub fn connectivity(robot_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            robot_id: robot_id.into(),
            message: message.into(),
        }
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    /// HTTP status the transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Connectivity { .. } => 502,
            Self::Execution(_) => 500,
            Self::NotFound(_) => 404,
            Self::BadRequest(_) => 400,
            Self::Conflict(_) => 409,
            Self::InvalidDefinition(_) => 500,
        }
    }

    /// Stable machine readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connectivity { .. } => "CONNECTIVITY_ERROR",
            Self::Execution(_) => "EXECUTION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidDefinition(_) => "INVALID_DEFINITION",
        }
    }
}

impl From<ShellError> for FleetError {
    fn from(err: ShellError) -> Self {
        match err {
            ShellError::Connect { target, message } => Self::Connectivity {
                robot_id: target,
                message,
            },
            other => Self::Execution(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(FleetError::connectivity("r1", "down").status_code(), 502);
        assert_eq!(FleetError::not_found("x").status_code(), 404);
        assert_eq!(FleetError::conflict("busy").status_code(), 409);
        assert_eq!(FleetError::bad_request("bad").error_code(), "BAD_REQUEST");
    }

    #[test]
    fn test_shell_connect_error_maps_to_connectivity() {
        let err: FleetError = ShellError::Connect {
            target: "r1".to_string(),
            message: "refused".to_string(),
        }
        .into();
        assert!(err.is_connectivity());
        assert_eq!(err.to_string(), "refused");
    }
}
