//! Reconciliation: the single write path for one verified webhook delivery.
//!
//! Resolves the linked repository, matches the commit message against the
//! project's open tasks, applies the one-way DONE transition, records the
//! commit, and fans the resulting events out to live viewers. Broadcast
//! happens after the writes and never affects the outcome — data-layer
//! consistency outranks notification delivery.

use std::sync::Arc;

use crate::broadcast::{Event, SubscriptionRegistry};
use crate::error::ReconcileError;
use crate::matcher;
use crate::models::{Commit, Task, User};
use crate::payload::NormalizedPush;
use crate::store::Store;

/// Result of a successfully processed delivery.
#[derive(Debug)]
pub struct Outcome {
    pub project_id: String,
    /// The commit row recorded for this delivery (always exactly one).
    pub commit: Commit,
    /// Present when this delivery completed a task.
    pub completed: Option<CompletedTask>,
}

#[derive(Debug)]
pub struct CompletedTask {
    pub task: Task,
    /// The platform user the committer resolved to, when known.
    pub assignee: Option<User>,
}

pub struct Reconciler<S> {
    store: S,
    registry: Arc<SubscriptionRegistry>,
}

impl<S: Store> Reconciler<S> {
    pub fn new(store: S, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Process one normalized push delivery.
    ///
    /// An unlinked repository is the only not-found condition; a message that
    /// matches no task, a task already DONE, and a committer with no platform
    /// account are all normal outcomes of a successful delivery.
    pub async fn process(&self, push: &NormalizedPush) -> Result<Outcome, ReconcileError> {
        let Some(linked) = self.store.find_linked_repository(&push.repo_url).await? else {
            return Err(ReconcileError::UnknownRepository(push.repo_url.clone()));
        };
        let project_id = linked.project_id;

        let open_tasks = self.store.find_open_tasks(&project_id).await?;
        let matched = matcher::find_match(&open_tasks, &push.message);

        let completed = match matched {
            Some(task) => self.complete(task, push).await?,
            None => {
                tracing::debug!(
                    %project_id,
                    open = open_tasks.len(),
                    "no task referenced by commit message"
                );
                None
            }
        };

        // The commit row is recorded for every accepted delivery, matched or
        // not. If the task update already applied and this insert fails, the
        // two writes for this delivery have diverged — say so loudly before
        // surfacing the error.
        let commit = match self
            .store
            .insert_commit(&project_id, &push.message, &push.author_name, &push.branch)
            .await
        {
            Ok(commit) => commit,
            Err(e) => {
                if let Some(done) = &completed {
                    tracing::error!(
                        %project_id,
                        task_id = %done.task.id,
                        "partial write: task completed but commit insert failed — \
                         task board and activity feed have diverged for this delivery: {e}"
                    );
                }
                return Err(e.into());
            }
        };

        if let Some(done) = &completed {
            tracing::info!(
                %project_id,
                task_id = %done.task.id,
                task_title = %done.task.title,
                assignee = done.assignee.as_ref().map(|u| u.username.as_str()),
                "task completed by commit"
            );
            self.registry.broadcast(&Event::TaskCompleted {
                project_id: project_id.clone(),
                task_id: done.task.id.clone(),
                assignee_id: done.assignee.as_ref().map(|u| u.id.clone()),
                assignee_name: done.assignee.as_ref().map(|u| u.username.clone()),
            });
        }
        self.registry.broadcast(&Event::NewCommit {
            project_id: project_id.clone(),
            commit_id: commit.id.clone(),
            message: commit.message.clone(),
            author: commit.author.clone(),
            branch: commit.branch.clone(),
            timestamp: commit.created_at,
        });

        Ok(Outcome {
            project_id,
            commit,
            completed,
        })
    }

    /// Apply the DONE transition for a matched task.
    ///
    /// Committer resolution failing is a degraded success: the task still
    /// completes, the assignee is left as-is. A conditional update that does
    /// not apply (already DONE — redelivery or a concurrent delivery won the
    /// race) yields `None` and nothing is broadcast for the task.
    async fn complete(
        &self,
        task: &Task,
        push: &NormalizedPush,
    ) -> Result<Option<CompletedTask>, ReconcileError> {
        let assignee = match &push.author_username {
            Some(username) => {
                let user = self.store.find_user_by_username(username).await?;
                if user.is_none() {
                    tracing::info!(
                        %username,
                        task_id = %task.id,
                        "committer is not a known user; completing task unassigned"
                    );
                }
                user
            }
            None => None,
        };

        let updated = self
            .store
            .complete_task_if_open(&task.id, assignee.as_ref().map(|u| u.id.as_str()))
            .await?;

        match updated {
            Some(task) => Ok(Some(CompletedTask { task, assignee })),
            None => {
                tracing::debug!(
                    task_id = %task.id,
                    "task already DONE; completion skipped (redelivery or concurrent delivery)"
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::{LinkedRepository, TaskStatus};
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    const REPO_URL: &str = "https://github.com/acme/widget";

    struct Fixture {
        store: SqliteStore,
        registry: Arc<SubscriptionRegistry>,
        reconciler: Reconciler<SqliteStore>,
        project_id: String,
    }

    async fn fixture() -> Fixture {
        let store = SqliteStore::open_in_memory().unwrap();
        let project_id = store.insert_project("widget").await.unwrap();
        store
            .link_repository(&project_id, "acme", "widget", REPO_URL)
            .await
            .unwrap();
        let registry = Arc::new(SubscriptionRegistry::new());
        let reconciler = Reconciler::new(store.clone(), registry.clone());
        Fixture {
            store,
            registry,
            reconciler,
            project_id,
        }
    }

    fn push(message: &str, username: Option<&str>) -> NormalizedPush {
        NormalizedPush {
            repo_url: REPO_URL.to_string(),
            message: message.to_string(),
            author_name: "Ada Lovelace".to_string(),
            author_username: username.map(str::to_string),
            branch: "main".to_string(),
        }
    }

    fn subscribe(fx: &Fixture) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        fx.registry.join(1, &fx.project_id, tx);
        rx
    }

    fn event_names(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            names.push(v["event"].as_str().unwrap().to_string());
        }
        names
    }

    #[tokio::test]
    async fn matched_commit_completes_task_and_records_commit() {
        let fx = fixture().await;
        let user = fx.store.insert_user("ada", "Ada Lovelace").await.unwrap();
        let task = fx
            .store
            .insert_task(&fx.project_id, "Fix login bug", TaskStatus::Todo, "u1")
            .await
            .unwrap();
        let mut rx = subscribe(&fx);

        let outcome = fx
            .reconciler
            .process(&push("Fix login bug and refactor", Some("ada")))
            .await
            .unwrap();

        let done = outcome.completed.expect("task should have completed");
        assert_eq!(done.task.id, task.id);
        assert_eq!(done.task.status, TaskStatus::Done);
        assert_eq!(done.task.assignee_id.as_deref(), Some(user.id.as_str()));

        let commits = fx.store.commits_for_project(&fx.project_id).await.unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].message, "Fix login bug and refactor");

        assert_eq!(event_names(&mut rx), vec!["task_completed", "new_commit"]);
    }

    #[tokio::test]
    async fn redelivery_is_idempotent_for_the_task_not_the_commit() {
        let fx = fixture().await;
        fx.store.insert_user("ada", "Ada Lovelace").await.unwrap();
        let task = fx
            .store
            .insert_task(&fx.project_id, "Fix login bug", TaskStatus::Todo, "u1")
            .await
            .unwrap();

        let delivery = push("Fix login bug and refactor", Some("ada"));
        let first = fx.reconciler.process(&delivery).await.unwrap();
        assert!(first.completed.is_some());

        let mut rx = subscribe(&fx);
        let second = fx.reconciler.process(&delivery).await.unwrap();
        assert!(second.completed.is_none(), "DONE is a one-way transition");

        let current = fx.store.find_task(&task.id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Done);

        // Commits are never deduplicated: two deliveries, two rows.
        let commits = fx.store.commits_for_project(&fx.project_id).await.unwrap();
        assert_eq!(commits.len(), 2);

        // Redelivery broadcasts only the commit, not a second completion.
        assert_eq!(event_names(&mut rx), vec!["new_commit"]);
    }

    #[tokio::test]
    async fn no_match_records_commit_and_leaves_tasks_alone() {
        let fx = fixture().await;
        let task = fx
            .store
            .insert_task(&fx.project_id, "Fix login bug", TaskStatus::Todo, "u1")
            .await
            .unwrap();
        let mut rx = subscribe(&fx);

        let outcome = fx
            .reconciler
            .process(&push("Refactor session handling", Some("ada")))
            .await
            .unwrap();
        assert!(outcome.completed.is_none());

        let current = fx.store.find_task(&task.id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Todo);
        assert_eq!(
            fx.store
                .commits_for_project(&fx.project_id)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(event_names(&mut rx), vec!["new_commit"]);
    }

    #[tokio::test]
    async fn unknown_repository_rejects_with_zero_writes() {
        let fx = fixture().await;
        let task = fx
            .store
            .insert_task(&fx.project_id, "Fix login bug", TaskStatus::Todo, "u1")
            .await
            .unwrap();

        let mut delivery = push("Fix login bug", Some("ada"));
        delivery.repo_url = "https://github.com/acme/unlinked".to_string();

        let err = fx.reconciler.process(&delivery).await.unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownRepository(_)));

        let current = fx.store.find_task(&task.id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Todo);
        assert!(fx
            .store
            .commits_for_project(&fx.project_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_committer_completes_unassigned() {
        let fx = fixture().await;
        let task = fx
            .store
            .insert_task(&fx.project_id, "Fix login bug", TaskStatus::Todo, "u1")
            .await
            .unwrap();
        let mut rx = subscribe(&fx);

        let outcome = fx
            .reconciler
            .process(&push("Fix login bug", Some("stranger")))
            .await
            .unwrap();

        let done = outcome.completed.expect("degraded success still completes");
        assert_eq!(done.task.id, task.id);
        assert_eq!(done.task.status, TaskStatus::Done);
        assert_eq!(done.task.assignee_id, None, "assignee left as-is");
        assert!(done.assignee.is_none());

        // Completion event still goes out, with null assignee fields.
        let frame = rx.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["event"], "task_completed");
        assert!(v["data"]["assignee_id"].is_null());
    }

    #[tokio::test]
    async fn push_without_username_completes_unassigned() {
        let fx = fixture().await;
        fx.store
            .insert_task(&fx.project_id, "Fix login bug", TaskStatus::Todo, "u1")
            .await
            .unwrap();

        let outcome = fx
            .reconciler
            .process(&push("Fix login bug", None))
            .await
            .unwrap();
        let done = outcome.completed.unwrap();
        assert_eq!(done.task.assignee_id, None);
    }

    /// Store double whose commit insert always fails; everything else
    /// delegates to a real in-memory store.
    struct CommitInsertFails(SqliteStore);

    #[async_trait]
    impl Store for CommitInsertFails {
        async fn find_linked_repository(
            &self,
            repo_url: &str,
        ) -> Result<Option<LinkedRepository>, StoreError> {
            self.0.find_linked_repository(repo_url).await
        }

        async fn find_open_tasks(&self, project_id: &str) -> Result<Vec<Task>, StoreError> {
            self.0.find_open_tasks(project_id).await
        }

        async fn complete_task_if_open(
            &self,
            task_id: &str,
            assignee_id: Option<&str>,
        ) -> Result<Option<Task>, StoreError> {
            self.0.complete_task_if_open(task_id, assignee_id).await
        }

        async fn insert_commit(
            &self,
            _project_id: &str,
            _message: &str,
            _author: &str,
            _branch: &str,
        ) -> Result<Commit, StoreError> {
            Err(StoreError::database(
                "insert commit",
                rusqlite::Error::InvalidQuery,
            ))
        }

        async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
            self.0.find_user_by_username(username).await
        }
    }

    #[tokio::test]
    async fn commit_insert_failure_surfaces_after_task_completed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let project_id = store.insert_project("widget").await.unwrap();
        store
            .link_repository(&project_id, "acme", "widget", REPO_URL)
            .await
            .unwrap();
        let task = store
            .insert_task(&project_id, "Fix login bug", TaskStatus::Todo, "u1")
            .await
            .unwrap();

        let registry = Arc::new(SubscriptionRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.join(1, &project_id, tx);
        let reconciler = Reconciler::new(CommitInsertFails(store.clone()), registry);

        let err = reconciler
            .process(&push("Fix login bug", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Storage(_)));

        // The task update had already applied; the delivery's two writes have
        // diverged and the completed side stays completed.
        let current = store.find_task(&task.id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Done);

        // No events go out for a delivery that errored before broadcast.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn first_task_in_query_order_wins_ambiguous_match() {
        let fx = fixture().await;
        let first = fx
            .store
            .insert_task(&fx.project_id, "Fix bug", TaskStatus::Todo, "u1")
            .await
            .unwrap();
        let second = fx
            .store
            .insert_task(&fx.project_id, "Fix bug in search", TaskStatus::Todo, "u1")
            .await
            .unwrap();

        let outcome = fx
            .reconciler
            .process(&push("Fix bug", None))
            .await
            .unwrap();
        let done = outcome.completed.unwrap();
        assert_eq!(done.task.id, first.id, "earliest-created task wins");

        let untouched = fx.store.find_task(&second.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, TaskStatus::Todo);
    }
}
