//! Service layer for quartermaster
//!
//! Services sit between the command boundary and the repositories:
//!
//! ```text
//! POST /command (thin)
//!     ↓
//! Services::execute → ProjectService / ShardAggregator / RecipeCatalog
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod command;
pub mod events;
pub mod project_service;

pub use command::{Command, CommandOutcome};
pub use events::{spawn_logging_listener, EventBus, EventListener, TrackerEvent};
pub use project_service::ProjectService;

use std::sync::Arc;

use crate::catalog::RecipeCatalog;
use crate::db::TrackerDb;
use crate::notify::Notifier;
use crate::shard::ShardAggregator;

/// Service container shared by the HTTP server and the scheduler
pub struct Services {
    pub db: Arc<TrackerDb>,
    pub projects: Arc<ProjectService>,
    pub notifier: Arc<Notifier>,
    pub shards: Arc<ShardAggregator>,
    pub catalog: Arc<RecipeCatalog>,
    pub events: Arc<EventBus>,
}

impl Services {
    pub fn new(
        db: Arc<TrackerDb>,
        catalog: Arc<RecipeCatalog>,
        notifier: Arc<Notifier>,
        shards: Arc<ShardAggregator>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            projects: Arc::new(ProjectService::new(db.clone(), catalog.clone(), notifier.clone(), events.clone())),
            db,
            notifier,
            shards,
            catalog,
            events,
        }
    }
}
