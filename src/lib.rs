//! Quartermaster - project resource tracker for sharded chat agents
//!
//! Groups of players track what they still have to gather and build. A
//! request for an item is expanded through the recipe catalog into a tree of
//! ingredients, progress and completion roll through that tree, and
//! subscribers are told when work finishes or a deadline approaches.
//!
//! ## Architecture
//!
//! - **db**: SQLite store shared by every shard process
//! - **catalog / expansion**: recipe lookup and dependency trees
//! - **services**: project operations behind a JSON command boundary
//! - **notify / scheduler**: completion fan-out and deadline reminders
//! - **shard / http**: scatter-gather search across shard processes
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/quartermaster/
//! ├── tracker.db             # Projects, resources, subscriptions, members
//! └── config.toml            # Configuration
//! ```

pub mod catalog;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod expansion;
pub mod http;
pub mod notify;
pub mod render;
pub mod scheduler;
pub mod services;
pub mod shard;

// Re-exports
pub use catalog::RecipeCatalog;
pub use chat::{ChatAdapter, GatewayChatAdapter, LogChatAdapter};
pub use config::Config;
pub use db::TrackerDb;
pub use error::TrackerError;
pub use expansion::{DependencyExpander, ResourceSpec};
pub use http::HttpServer;
pub use notify::Notifier;
pub use scheduler::{DeadlineScheduler, SchedulerConfig};
pub use services::{Command, CommandOutcome, EventBus, ProjectService, Services};
pub use shard::{HttpShardPeer, LocalShard, ShardAggregator, ShardPeer};
