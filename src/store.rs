//! SQLite-backed persistence for projects, tasks, commits, and linked repos.
//!
//! The reconciler consumes the narrow [`Store`] trait; everything else
//! (seeding, lookups for tests and tooling) lives as inherent methods on
//! [`SqliteStore`]. Synchronous rusqlite calls run on the blocking pool via
//! `tokio::task::spawn_blocking` so they never stall the async runtime.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Commit, LinkedRepository, Task, TaskStatus, User};

/// Persistence operations the reconciliation pipeline depends on.
#[async_trait]
pub trait Store: Send + Sync {
    /// Resolve the linked repository for an inbound repository URL.
    async fn find_linked_repository(
        &self,
        repo_url: &str,
    ) -> Result<Option<LinkedRepository>, StoreError>;

    /// All tasks in TODO or IN_PROGRESS for a project, in stable query order
    /// (`created_at, id`). The matcher's first-match tie-break relies on this
    /// order being deterministic.
    async fn find_open_tasks(&self, project_id: &str) -> Result<Vec<Task>, StoreError>;

    /// One-way DONE transition, expressed as a single conditional UPDATE
    /// guarded by `status != 'DONE'`. Returns the updated row when the guard
    /// passed and `None` when the task was already DONE (or does not exist) —
    /// a redelivered or racing webhook lands here and becomes a no-op.
    ///
    /// `assignee_id` of `None` leaves the current assignee untouched.
    async fn complete_task_if_open(
        &self,
        task_id: &str,
        assignee_id: Option<&str>,
    ) -> Result<Option<Task>, StoreError>;

    /// Append a commit row. Commits are never deduplicated.
    async fn insert_commit(
        &self,
        project_id: &str,
        message: &str,
        author: &str,
        branch: &str,
    ) -> Result<Commit, StoreError>;

    /// Resolve a commit author's provider username to a platform user.
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;
}

/// SQLite store. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY,
    username     TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS linked_repos (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL UNIQUE REFERENCES projects(id),
    repo_owner  TEXT NOT NULL,
    repo_name   TEXT NOT NULL,
    repo_url    TEXT NOT NULL,
    webhook_id  INTEGER
);
CREATE INDEX IF NOT EXISTS idx_linked_repos_url ON linked_repos(repo_url);

CREATE TABLE IF NOT EXISTS tasks (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL REFERENCES projects(id),
    title       TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status      TEXT NOT NULL CHECK (status IN ('TODO', 'IN_PROGRESS', 'DONE')),
    priority    INTEGER NOT NULL DEFAULT 0,
    assignee_id TEXT REFERENCES users(id),
    creator_id  TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_project_status ON tasks(project_id, status);

CREATE TABLE IF NOT EXISTS commits (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL REFERENCES projects(id),
    message     TEXT NOT NULL,
    author      TEXT NOT NULL,
    branch      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_commits_project ON commits(project_id);
"#;

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    ///
    /// WAL journal mode for crash safety under concurrent deliveries, 5 s
    /// busy timeout so a briefly locked database retries instead of failing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::database("open database", e))?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::database("open in-memory database", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // In-memory databases report journal_mode=memory; that's fine.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(|e| StoreError::database("set journal_mode", e))?;
        conn.execute_batch("PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;")
            .map_err(|e| StoreError::database("configure pragmas", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::database("create schema", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking closure against the shared connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&conn.lock())).await?
    }

    // ── Seeding / lookup helpers (board CRUD surfaces and tests) ─────────────

    pub async fn insert_project(&self, name: &str) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let name = name.to_string();
        let row_id = id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, name) VALUES (?1, ?2)",
                params![row_id, name],
            )
            .map_err(|e| StoreError::database("insert project", e))?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    pub async fn insert_user(
        &self,
        username: &str,
        display_name: &str,
    ) -> Result<User, StoreError> {
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            display_name: display_name.to_string(),
        };
        let row = user.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (id, username, display_name) VALUES (?1, ?2, ?3)",
                params![row.id, row.username, row.display_name],
            )
            .map_err(|e| StoreError::database("insert user", e))?;
            Ok(())
        })
        .await?;
        Ok(user)
    }

    pub async fn insert_task(
        &self,
        project_id: &str,
        title: &str,
        status: TaskStatus,
        creator_id: &str,
    ) -> Result<Task, StoreError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            title: title.to_string(),
            description: String::new(),
            status,
            priority: 0,
            assignee_id: None,
            creator_id: creator_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        let row = task.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, project_id, title, description, status, priority,
                                    assignee_id, creator_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.id,
                    row.project_id,
                    row.title,
                    row.description,
                    row.status.as_str(),
                    row.priority,
                    row.assignee_id,
                    row.creator_id,
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::database("insert task", e))?;
            Ok(())
        })
        .await?;
        Ok(task)
    }

    pub async fn link_repository(
        &self,
        project_id: &str,
        repo_owner: &str,
        repo_name: &str,
        repo_url: &str,
    ) -> Result<LinkedRepository, StoreError> {
        let linked = LinkedRepository {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            repo_owner: repo_owner.to_string(),
            repo_name: repo_name.to_string(),
            repo_url: repo_url.to_string(),
            webhook_id: None,
        };
        let row = linked.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO linked_repos (id, project_id, repo_owner, repo_name, repo_url, webhook_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.id,
                    row.project_id,
                    row.repo_owner,
                    row.repo_name,
                    row.repo_url,
                    row.webhook_id,
                ],
            )
            .map_err(|e| StoreError::database("link repository", e))?;
            Ok(())
        })
        .await?;
        Ok(linked)
    }

    pub async fn find_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, project_id, title, description, status, priority,
                        assignee_id, creator_id, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![task_id],
                task_from_row,
            )
            .optional()
            .map_err(|e| StoreError::database("find task", e))
        })
        .await
    }

    pub async fn commits_for_project(&self, project_id: &str) -> Result<Vec<Commit>, StoreError> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, project_id, message, author, branch, created_at
                     FROM commits WHERE project_id = ?1 ORDER BY created_at, id",
                )
                .map_err(|e| StoreError::database("prepare commits query", e))?;
            let rows = stmt
                .query_map(params![project_id], commit_from_row)
                .map_err(|e| StoreError::database("query commits", e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::database("read commit row", e))?;
            Ok(rows)
        })
        .await
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_linked_repository(
        &self,
        repo_url: &str,
    ) -> Result<Option<LinkedRepository>, StoreError> {
        let repo_url = repo_url.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, project_id, repo_owner, repo_name, repo_url, webhook_id
                 FROM linked_repos WHERE repo_url = ?1",
                params![repo_url],
                |row| {
                    Ok(LinkedRepository {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        repo_owner: row.get(2)?,
                        repo_name: row.get(3)?,
                        repo_url: row.get(4)?,
                        webhook_id: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::database("find linked repository", e))
        })
        .await
    }

    async fn find_open_tasks(&self, project_id: &str) -> Result<Vec<Task>, StoreError> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, project_id, title, description, status, priority,
                            assignee_id, creator_id, created_at, updated_at
                     FROM tasks
                     WHERE project_id = ?1 AND status IN ('TODO', 'IN_PROGRESS')
                     ORDER BY created_at, id",
                )
                .map_err(|e| StoreError::database("prepare open tasks query", e))?;
            let rows = stmt
                .query_map(params![project_id], task_from_row)
                .map_err(|e| StoreError::database("query open tasks", e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::database("read task row", e))?;
            Ok(rows)
        })
        .await
    }

    async fn complete_task_if_open(
        &self,
        task_id: &str,
        assignee_id: Option<&str>,
    ) -> Result<Option<Task>, StoreError> {
        let task_id = task_id.to_string();
        let assignee_id = assignee_id.map(str::to_string);
        self.with_conn(move |conn| {
            // Single conditional write: the WHERE clause is the idempotency
            // and concurrency guard, not a prior read of the status column.
            let updated = conn
                .execute(
                    "UPDATE tasks
                     SET status = 'DONE',
                         assignee_id = COALESCE(?2, assignee_id),
                         updated_at = ?3
                     WHERE id = ?1 AND status != 'DONE'",
                    params![task_id, assignee_id, Utc::now().to_rfc3339()],
                )
                .map_err(|e| StoreError::database("complete task", e))?;
            if updated == 0 {
                return Ok(None);
            }
            conn.query_row(
                "SELECT id, project_id, title, description, status, priority,
                        assignee_id, creator_id, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![task_id],
                task_from_row,
            )
            .optional()
            .map_err(|e| StoreError::database("read completed task", e))
        })
        .await
    }

    async fn insert_commit(
        &self,
        project_id: &str,
        message: &str,
        author: &str,
        branch: &str,
    ) -> Result<Commit, StoreError> {
        let commit = Commit {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            message: message.to_string(),
            author: author.to_string(),
            branch: branch.to_string(),
            created_at: Utc::now(),
        };
        let row = commit.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO commits (id, project_id, message, author, branch, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.id,
                    row.project_id,
                    row.message,
                    row.author,
                    row.branch,
                    row.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::database("insert commit", e))?;
            Ok(())
        })
        .await?;
        Ok(commit)
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, username, display_name FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        display_name: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::database("find user", e))
        })
        .await
    }
}

// ── Row mapping ───────────────────────────────────────────────────────────────

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(4)?;
    let status = TaskStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown task status '{status_raw}'").into(),
        )
    })?;
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status,
        priority: row.get(5)?,
        assignee_id: row.get(6)?,
        creator_id: row.get(7)?,
        created_at: datetime_column(row, 8)?,
        updated_at: datetime_column(row, 9)?,
    })
}

fn commit_from_row(row: &Row<'_>) -> rusqlite::Result<Commit> {
    Ok(Commit {
        id: row.get(0)?,
        project_id: row.get(1)?,
        message: row.get(2)?,
        author: row.get(3)?,
        branch: row.get(4)?,
        created_at: datetime_column(row, 5)?,
    })
}

/// Timestamps are stored as RFC 3339 text; reject anything that doesn't parse.
fn datetime_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}
