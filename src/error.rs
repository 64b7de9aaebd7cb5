//! Unified error handling for the engine.
//!
//! One error enum covers the whole public surface. Validation failures are
//! reported before any state is touched; storage failures roll the enclosing
//! transaction back; detection cancellation is a first-class state rather
//! than an error thrown across threads.

use thiserror::Error;

/// Engine error taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Any call before `init`.
    #[error("engine is not initialized")]
    NotInitialized,

    /// `init` called with a different database path in the same process.
    #[error("engine already initialized with a different path: {existing}")]
    AlreadyInitializedDifferentPath { existing: String },

    /// Input validation failure (id, name, coords, offsets).
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// A referenced id does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Uniqueness violation, e.g. a duplicate route name within a sport.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Disk, serialization, or schema migration failure.
    #[error("storage failure: {message}")]
    Storage { message: String },

    /// Detection was superseded or the engine was cleared mid-job.
    #[error("operation cancelled")]
    Cancelled,

    /// Invariant violation; a bug, never expected at runtime.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        EngineError::Conflict {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        EngineError::Storage {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EngineError::Internal {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Storage {
            message: e.to_string(),
        }
    }
}

impl From<rusqlite_migration::Error> for EngineError {
    fn from(e: rusqlite_migration::Error) -> Self {
        EngineError::Storage {
            message: format!("migration failed: {e}"),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage {
            message: format!("serialization failed: {e}"),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Validate an opaque id or user-facing name: non-empty, at most 255 bytes,
/// no ASCII control characters.
pub fn validate_identifier(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(EngineError::invalid(format!("{what} must not be empty")));
    }
    if value.len() > 255 {
        return Err(EngineError::invalid(format!(
            "{what} exceeds 255 bytes ({} bytes)",
            value.len()
        )));
    }
    if let Some(c) = value.chars().find(|c| c.is_ascii_control()) {
        return Err(EngineError::invalid(format!(
            "{what} contains control character {:#04x}",
            c as u32
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_accepts_normal_ids() {
        assert!(validate_identifier("activity-123", "id").is_ok());
        assert!(validate_identifier("Home Loop", "name").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_empty() {
        assert!(matches!(
            validate_identifier("", "id"),
            Err(EngineError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_validate_identifier_rejects_control_chars() {
        assert!(validate_identifier("bad\x07id", "id").is_err());
        assert!(validate_identifier("bad\x7fid", "id").is_err());
        // Newlines and tabs are control characters too.
        assert!(validate_identifier("two\nlines", "name").is_err());
    }

    #[test]
    fn test_validate_identifier_rejects_oversized() {
        let long = "x".repeat(256);
        assert!(validate_identifier(&long, "id").is_err());
        let ok = "x".repeat(255);
        assert!(validate_identifier(&ok, "id").is_ok());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::not_found("section", "sec_run_0");
        assert!(err.to_string().contains("sec_run_0"));
    }
}
