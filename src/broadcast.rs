//! Live-update fan-out: project rooms and best-effort event delivery.
//!
//! Each WebSocket connection owns an unbounded outbox; the registry maps
//! project ids to the outboxes of connections that joined that project's
//! room. Delivery is fire-and-forget — a closed outbox is dropped from the
//! registry and the event is simply not seen by that client. Nothing is
//! persisted or retried; a reconnecting client starts from current state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

/// Process-local connection identifier, assigned by the server on upgrade.
pub type ConnId = u64;

/// Sender half of a connection's outbox. Carries pre-serialized frames.
pub type Outbox = mpsc::UnboundedSender<String>;

// ── Events ────────────────────────────────────────────────────────────────────

/// A state-change notification for a project's live viewers.
///
/// Payloads are denormalized so a client can render the update without a
/// follow-up fetch. `NewTask` and `TaskAssigned` are emitted by the board
/// CRUD surfaces; the reconciler emits `NewCommit` and `TaskCompleted`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    NewCommit {
        project_id: String,
        commit_id: String,
        message: String,
        author: String,
        branch: String,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        project_id: String,
        task_id: String,
        assignee_id: Option<String>,
        assignee_name: Option<String>,
    },
    NewTask {
        project_id: String,
        task_id: String,
        title: String,
    },
    TaskAssigned {
        project_id: String,
        task_id: String,
        assignee_id: String,
        assignee_name: String,
    },
}

impl Event {
    /// The project whose room this event targets.
    pub fn project_id(&self) -> &str {
        match self {
            Event::NewCommit { project_id, .. }
            | Event::TaskCompleted { project_id, .. }
            | Event::NewTask { project_id, .. }
            | Event::TaskAssigned { project_id, .. } => project_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Event::NewCommit { .. } => "new_commit",
            Event::TaskCompleted { .. } => "task_completed",
            Event::NewTask { .. } => "new_task",
            Event::TaskAssigned { .. } => "task_assigned",
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Rooms {
    /// project id → members' outboxes.
    by_project: HashMap<String, HashMap<ConnId, Outbox>>,
    /// connection → the one project it currently watches.
    membership: HashMap<ConnId, String>,
}

/// Tracks which live connections watch which project.
///
/// A connection watches at most one project at a time: joining a new room
/// implicitly leaves the previous one. Disconnect removes the connection from
/// everything; no explicit leave is required.
#[derive(Default)]
pub struct SubscriptionRegistry {
    rooms: RwLock<Rooms>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `conn_id` to `project_id`, leaving any previous room.
    pub fn join(&self, conn_id: ConnId, project_id: &str, outbox: Outbox) {
        let mut rooms = self.rooms.write();
        if let Some(previous) = rooms.membership.remove(&conn_id) {
            if let Some(members) = rooms.by_project.get_mut(&previous) {
                members.remove(&conn_id);
                if members.is_empty() {
                    rooms.by_project.remove(&previous);
                }
            }
        }
        rooms
            .by_project
            .entry(project_id.to_string())
            .or_default()
            .insert(conn_id, outbox);
        rooms.membership.insert(conn_id, project_id.to_string());
        tracing::debug!(conn_id, project_id, "connection joined project room");
    }

    /// Remove `conn_id` from its room, if any. Called on disconnect and on an
    /// explicit leave.
    pub fn disconnect(&self, conn_id: ConnId) {
        let mut rooms = self.rooms.write();
        if let Some(project_id) = rooms.membership.remove(&conn_id) {
            if let Some(members) = rooms.by_project.get_mut(&project_id) {
                members.remove(&conn_id);
                if members.is_empty() {
                    rooms.by_project.remove(&project_id);
                }
            }
            tracing::debug!(conn_id, %project_id, "connection left project room");
        }
    }

    /// Publish `event` to every connection in its project's room.
    ///
    /// Best-effort: outboxes whose receiving side is gone are pruned, the
    /// event is not retried, and failures never propagate to the caller.
    pub fn broadcast(&self, event: &Event) {
        let frame = match serde_json::to_string(event) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("failed to serialize {} event: {e}", event.name());
                return;
            }
        };

        let project_id = event.project_id();
        let mut guard = self.rooms.write();
        let rooms = &mut *guard;
        let Some(members) = rooms.by_project.get_mut(project_id) else {
            tracing::debug!(project_id, event = event.name(), "no live viewers");
            return;
        };

        let mut gone: Vec<ConnId> = Vec::new();
        for (&conn_id, outbox) in members.iter() {
            if outbox.send(frame.clone()).is_err() {
                gone.push(conn_id);
            }
        }
        let delivered = members.len() - gone.len();
        for conn_id in gone {
            members.remove(&conn_id);
            rooms.membership.remove(&conn_id);
            tracing::debug!(conn_id, "pruned dead connection during broadcast");
        }
        if rooms
            .by_project
            .get(project_id)
            .is_some_and(HashMap::is_empty)
        {
            rooms.by_project.remove(project_id);
        }
        tracing::debug!(
            project_id,
            event = event.name(),
            delivered,
            "broadcast dispatched"
        );
    }

    /// Number of live members in a project's room.
    pub fn room_size(&self, project_id: &str) -> usize {
        self.rooms
            .read()
            .by_project
            .get(project_id)
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_event(project_id: &str) -> Event {
        Event::NewCommit {
            project_id: project_id.to_string(),
            commit_id: "c1".to_string(),
            message: "Fix login bug".to_string(),
            author: "Ada".to_string(),
            branch: "main".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn joined_connection_receives_project_events() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.join(1, "p1", tx);

        registry.broadcast(&commit_event("p1"));
        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "new_commit");
        assert_eq!(value["data"]["project_id"], "p1");
        assert_eq!(value["data"]["message"], "Fix login bug");
    }

    #[tokio::test]
    async fn other_projects_do_not_receive() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.join(1, "p2", tx);

        registry.broadcast(&commit_event("p1"));
        assert!(rx.try_recv().is_err(), "viewer of p2 must not see p1 events");
    }

    #[tokio::test]
    async fn disconnect_stops_delivery() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.join(1, "p1", tx);
        registry.disconnect(1);

        registry.broadcast(&commit_event("p1"));
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.room_size("p1"), 0);
    }

    #[tokio::test]
    async fn joining_new_room_leaves_previous() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.join(1, "p1", tx.clone());
        registry.join(1, "p2", tx);

        registry.broadcast(&commit_event("p1"));
        assert!(rx.try_recv().is_err(), "left p1 when joining p2");

        registry.broadcast(&commit_event("p2"));
        assert!(rx.try_recv().is_ok());
        assert_eq!(registry.room_size("p1"), 0);
        assert_eq!(registry.room_size("p2"), 1);
    }

    #[tokio::test]
    async fn multiple_connections_share_a_room() {
        let registry = SubscriptionRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.join(1, "p1", tx1);
        registry.join(2, "p1", tx2);

        registry.broadcast(&commit_event("p1"));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_not_fatal() {
        let registry = SubscriptionRegistry::new();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        registry.join(1, "p1", tx_dead);
        registry.join(2, "p1", tx_live);
        drop(rx_dead);

        registry.broadcast(&commit_event("p1"));
        assert!(rx_live.try_recv().is_ok(), "live viewer still receives");
        assert_eq!(registry.room_size("p1"), 1, "dead connection pruned");
    }

    #[tokio::test]
    async fn same_project_events_arrive_in_broadcast_order() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.join(1, "p1", tx);

        registry.broadcast(&Event::TaskCompleted {
            project_id: "p1".to_string(),
            task_id: "t1".to_string(),
            assignee_id: Some("u1".to_string()),
            assignee_name: Some("ada".to_string()),
        });
        registry.broadcast(&commit_event("p1"));

        let first: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["event"], "task_completed");
        assert_eq!(second["event"], "new_commit");
    }

    #[test]
    fn board_events_share_the_broadcast_shape() {
        // Emitted by the board CRUD surfaces rather than the reconciler, but
        // delivered through the same rooms with the same frame layout.
        let created = Event::NewTask {
            project_id: "p1".to_string(),
            task_id: "t1".to_string(),
            title: "Fix login bug".to_string(),
        };
        let value = serde_json::to_value(&created).unwrap();
        assert_eq!(value["event"], "new_task");
        assert_eq!(value["data"]["title"], "Fix login bug");
        assert_eq!(created.project_id(), "p1");

        let assigned = Event::TaskAssigned {
            project_id: "p1".to_string(),
            task_id: "t1".to_string(),
            assignee_id: "u1".to_string(),
            assignee_name: "ada".to_string(),
        };
        let value = serde_json::to_value(&assigned).unwrap();
        assert_eq!(value["event"], "task_assigned");
        assert_eq!(value["data"]["assignee_name"], "ada");
        assert_eq!(assigned.project_id(), "p1");
    }

    #[tokio::test]
    async fn board_events_reach_joined_viewers() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.join(1, "p1", tx);

        registry.broadcast(&Event::NewTask {
            project_id: "p1".to_string(),
            task_id: "t1".to_string(),
            title: "Fix login bug".to_string(),
        });
        let frame: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "new_task");
    }

    #[test]
    fn task_completed_payload_carries_assignee_fields() {
        let event = Event::TaskCompleted {
            project_id: "p1".to_string(),
            task_id: "t1".to_string(),
            assignee_id: None,
            assignee_name: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["data"]["task_id"], "t1");
        assert!(value["data"]["assignee_id"].is_null());
    }
}
