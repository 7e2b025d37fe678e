//! Push payload normalization.
//!
//! Parses a verified provider push payload into a [`NormalizedPush`] — the
//! one commit record the rest of the pipeline operates on.
//!
//! Policy: a multi-commit push is collapsed to its **last** (most recent)
//! commit for both matching and storage. One delivery, one commit row; the
//! intermediate commits of a batched push do not appear in the activity feed.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    /// Body is not valid JSON or is missing `repository`, `commits`, or `ref`.
    #[error("invalid push payload: {0}")]
    Invalid(#[from] serde_json::Error),

    /// `commits` was present but empty (e.g. a branch-delete push).
    #[error("push contains no commits")]
    EmptyPush,
}

// ── Wire shape ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PushPayload {
    repository: RepositoryInfo,
    commits: Vec<PushCommit>,
    #[serde(rename = "ref")]
    git_ref: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryInfo {
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct PushCommit {
    message: String,
    author: CommitAuthor,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    name: String,
    #[serde(default)]
    username: Option<String>,
}

// ── Normalized record ─────────────────────────────────────────────────────────

/// Canonical commit record extracted from one push delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPush {
    /// Canonical web URL of the source repository — the linked-repo lookup key.
    pub repo_url: String,
    pub message: String,
    pub author_name: String,
    /// Provider username of the committer, when the provider sent one.
    pub author_username: Option<String>,
    pub branch: String,
}

/// Parse raw (already signature-verified) body bytes into a [`NormalizedPush`].
pub fn normalize(body: &[u8]) -> Result<NormalizedPush, PayloadError> {
    let mut payload: PushPayload = serde_json::from_slice(body)?;
    // Last commit in the push is "the" commit for this delivery.
    let latest = payload.commits.pop().ok_or(PayloadError::EmptyPush)?;
    Ok(NormalizedPush {
        repo_url: payload.repository.html_url,
        message: latest.message,
        author_name: latest.author.name,
        author_username: latest.author.username,
        branch: branch_from_ref(&payload.git_ref),
    })
}

/// Extract a branch name from a git ref.
///
/// Keeps the full path after `refs/heads/`, so `refs/heads/feature/login`
/// yields `feature/login` rather than truncating to the final segment.
/// Non-branch refs (tags, etc.) fall back to the final path segment.
pub fn branch_from_ref(git_ref: &str) -> String {
    if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
        return branch.to_string();
    }
    git_ref.rsplit('/').next().unwrap_or(git_ref).to_string()
}
