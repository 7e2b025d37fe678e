//! Error taxonomy for the webhook reconciliation pipeline.
//!
//! Only three conditions affect the HTTP response to the webhook sender:
//! a bad signature (403), a malformed payload (400), and an unlinked
//! repository (404). Everything else — no matching task, unknown committer,
//! broadcast failure — is handled internally and reported as success.

use thiserror::Error;

/// Failure modes of a single webhook delivery.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Signature header missing, malformed, or mismatched. No side effects.
    #[error("signature verification failed: {0}")]
    Authentication(#[from] crate::signature::SignatureError),

    /// Required payload fields missing or unparseable. No side effects.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] crate::payload::PayloadError),

    /// No linked repository matches the payload's repository URL. No writes.
    #[error("no linked repository for {0}")]
    UnknownRepository(String),

    /// A store read or write failed mid-delivery.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error during {op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store task panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn database(op: &'static str, source: rusqlite::Error) -> Self {
        StoreError::Database { op, source }
    }
}
