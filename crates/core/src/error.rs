use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Which kind of entity a [`NarrativeError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Story,
    Chapter,
    Character,
    StoryBible,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Story => "story",
            Self::Chapter => "chapter",
            Self::Character => "character",
            Self::StoryBible => "story bible",
        };
        f.write_str(label)
    }
}

/// Failure taxonomy shared by every narrative crate.
///
/// Only generation failures reach the caller as failures; retrieval and
/// embedding errors are degraded locally and persistence errors after a
/// stream are logged.
#[derive(Debug, Error)]
pub enum NarrativeError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Uuid },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("malformed backend response: {0}")]
    MalformedBackendResponse(String),

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NarrativeError {
    pub fn not_found(kind: EntityKind, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }
}

pub type Result<T> = std::result::Result<T, NarrativeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_the_entity() {
        let id = Uuid::nil();
        let err = NarrativeError::not_found(EntityKind::Chapter, id);
        assert_eq!(err.to_string(), format!("chapter not found: {id}"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: NarrativeError = io.into();
        assert!(matches!(err, NarrativeError::Io(_)));
    }
}
