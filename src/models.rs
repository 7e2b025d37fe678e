//! Persistent data model: tasks, commits, linked repositories, users.
//!
//! Rows are owned by the store (`crate::store`); the reconciliation pipeline
//! only reads and writes them through that interface. Ids are UUIDv4 strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    /// Stable column encoding. Matches the values stored in `tasks.status`.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "TODO",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Done => "DONE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TODO" => Some(TaskStatus::Todo),
            "IN_PROGRESS" => Some(TaskStatus::InProgress),
            "DONE" => Some(TaskStatus::Done),
            _ => None,
        }
    }
}

/// A task on a project board.
///
/// Mutated by manual board actions (out of scope) and by the reconciler when a
/// push references its title. Once `Done`, the reconciliation path never
/// reopens it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub assignee_id: Option<String>,
    pub creator_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A recorded commit. Immutable once created; one row per accepted delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Commit {
    pub id: String,
    pub project_id: String,
    pub message: String,
    pub author: String,
    pub branch: String,
    pub created_at: DateTime<Utc>,
}

/// The repository linked to a project. One per project; the `repo_url` is the
/// lookup key for inbound webhook deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkedRepository {
    pub id: String,
    pub project_id: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub repo_url: String,
    pub webhook_id: Option<i64>,
}

/// A platform user. Commit authors are resolved against `username`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
}
