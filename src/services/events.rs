//! Event bus for tracker mutations
//!
//! Services emit a [`TrackerEvent`] after each committed change. The binary
//! attaches a logging listener; tests subscribe directly.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub enum TrackerEvent {
    ProjectCreated {
        project: String,
        creator: String,
    },
    ResourcesAdded {
        project: String,
        root_id: i64,
        nodes: usize,
    },
    ResourcesCompleted {
        project: String,
        ids: Vec<i64>,
    },
    ResourcesRemoved {
        project: String,
        removed: Vec<i64>,
        detached: Vec<i64>,
    },
    ResourceUpdated {
        project: String,
        id: i64,
    },
    DeadlineSet {
        project: String,
        resource_id: Option<i64>,
        deadline: i64,
    },
    MembershipChanged {
        project: String,
        user_id: String,
        added: bool,
    },
    SubscriptionChanged {
        project: String,
        user_id: String,
        resource_id: Option<i64>,
        subscribed: bool,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &TrackerEvent);
}

pub struct EventBus {
    sender: broadcast::Sender<TrackerEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: TrackerEvent) {
        trace!(event = ?event, "Emitting tracker event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes every event to the log at debug level
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &TrackerEvent) {
        match event {
            TrackerEvent::ProjectCreated { project, creator } => {
                debug!(project = %project, creator = %creator, "Project created");
            }
            TrackerEvent::ResourcesAdded { project, root_id, nodes } => {
                debug!(project = %project, root_id, nodes, "Resources added");
            }
            TrackerEvent::ResourcesCompleted { project, ids } => {
                debug!(project = %project, count = ids.len(), "Resources completed");
            }
            TrackerEvent::ResourcesRemoved { project, removed, detached } => {
                debug!(
                    project = %project,
                    removed = removed.len(),
                    detached = detached.len(),
                    "Resources removed"
                );
            }
            _ => {
                debug!(event = ?event, "Tracker event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
