// Runtime error taxonomy. Component-level failures map onto these classes;
// the HTTP facade translates them to status codes in `http`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Another live runtime instance holds the workbook.
    #[error("workbook `{workbook_id}` is locked by running process {owner_pid}")]
    LockConflict { workbook_id: String, owner_pid: u32 },

    /// A managed process (postgres or worker) failed to start or crashed.
    #[error("{service} process failure: {message}")]
    ProcessFailure { service: &'static str, message: String },

    /// The pool cannot reach a running database process.
    #[error("database connection error: {0}")]
    Connection(String),

    /// A sync was aborted before any side effect because named secrets
    /// could not be resolved.
    #[error("Missing secrets: {}", names.join(", "))]
    MissingSecrets { names: Vec<String> },

    /// A sync handler failed; isolated to that source.
    #[error("sync failed for source `{source_id}`: {message}")]
    SyncFailure { source_id: String, message: String },

    /// Bad table/source name or malformed input.
    #[error("{0}")]
    Validation(String),

    /// Requested resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Operation attempted before the database finished booting.
    #[error("database is not ready")]
    NotReady,
}

impl RuntimeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::RuntimeError;

    #[test]
    fn missing_secrets_message_enumerates_names() {
        let error = RuntimeError::MissingSecrets {
            names: vec!["GITHUB_TOKEN".into(), "API_KEY".into()],
        };
        assert_eq!(error.to_string(), "Missing secrets: GITHUB_TOKEN, API_KEY");
    }

    #[test]
    fn lock_conflict_names_the_owner() {
        let error = RuntimeError::LockConflict { workbook_id: "wb".into(), owner_pid: 99 };
        assert!(error.to_string().contains("99"));
        assert!(error.to_string().contains("wb"));
    }
}
