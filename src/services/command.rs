//! Command documents accepted at the command boundary
//!
//! Front ends post a JSON document tagged by `op` and get back a document
//! tagged by `kind`:
//!
//! ```text
//! {"op": "update_progress", "actor": "42", "project": "Keep", "resource": "Wall", "delta": 6}
//! {"kind": "progress", "project": "Keep", "resource": {...}, "became_completed": true, ...}
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::CraftInfo;
use crate::db::projects::ProjectRow;
use crate::error::TrackerError;
use crate::render;
use crate::shard::{SearchOutcome, StatsOutcome};

use super::project_service::{
    AddedResources, CompletionResult, DeadlineResult, MembershipResult, ProgressResult,
    ProjectSummary, RemovalResult, ResourceListing, SubscriptionResult,
};
use super::Services;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    CreateProject {
        actor: String,
        name: String,
        #[serde(default)]
        thread_handle: Option<String>,
    },
    AddResource {
        actor: String,
        project: String,
        resource: String,
        amount: i64,
        #[serde(default, rename = "type")]
        resource_type: Option<String>,
        #[serde(default = "default_true")]
        expand: bool,
    },
    Complete {
        actor: String,
        project: String,
        resource: String,
    },
    CompleteOne {
        actor: String,
        project: String,
        resource: String,
    },
    EditResource {
        actor: String,
        project: String,
        resource: String,
        #[serde(default)]
        amount: Option<i64>,
        #[serde(default, rename = "type")]
        resource_type: Option<String>,
    },
    RemoveResource {
        actor: String,
        project: String,
        resource: String,
        #[serde(default)]
        cascade: bool,
    },
    UpdateProgress {
        actor: String,
        project: String,
        resource: String,
        delta: i64,
    },
    SetProgress {
        actor: String,
        project: String,
        resource: String,
        progress: i64,
    },
    ListResources {
        project: String,
    },
    Subscribe {
        actor: String,
        project: String,
        #[serde(default)]
        resource: Option<String>,
    },
    Unsubscribe {
        actor: String,
        project: String,
        #[serde(default)]
        resource: Option<String>,
    },
    AddMember {
        actor: String,
        project: String,
        user_id: String,
    },
    RemoveMember {
        actor: String,
        project: String,
        user_id: String,
    },
    SetDeadline {
        actor: String,
        project: String,
        deadline: String,
    },
    ResourceDeadline {
        actor: String,
        project: String,
        resource: String,
        deadline: String,
    },
    Summary {
        project: String,
    },
    Search {
        query: String,
    },
    ShardStatus,
    Craft {
        query: String,
    },
    Suggest {
        fragment: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateProject { .. } => "create_project",
            Self::AddResource { .. } => "add_resource",
            Self::Complete { .. } => "complete",
            Self::CompleteOne { .. } => "complete_one",
            Self::EditResource { .. } => "edit_resource",
            Self::RemoveResource { .. } => "remove_resource",
            Self::UpdateProgress { .. } => "update_progress",
            Self::SetProgress { .. } => "set_progress",
            Self::ListResources { .. } => "list_resources",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::AddMember { .. } => "add_member",
            Self::RemoveMember { .. } => "remove_member",
            Self::SetDeadline { .. } => "set_deadline",
            Self::ResourceDeadline { .. } => "resource_deadline",
            Self::Summary { .. } => "summary",
            Self::Search { .. } => "search",
            Self::ShardStatus => "shard_status",
            Self::Craft { .. } => "craft",
            Self::Suggest { .. } => "suggest",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandOutcome {
    Project(ProjectRow),
    Added(AddedResources),
    Completion(CompletionResult),
    Progress(ProgressResult),
    Removal(RemovalResult),
    Listing(ResourceListing),
    Subscription(SubscriptionResult),
    Membership(MembershipResult),
    Deadline(DeadlineResult),
    Summary(ProjectSummary),
    Search {
        query: String,
        rendered: String,
        partial: bool,
        #[serde(flatten)]
        outcome: SearchOutcome,
    },
    ShardStatus(StatsOutcome),
    Craft {
        query: String,
        recipes: Vec<CraftInfo>,
    },
    Suggestions {
        names: Vec<String>,
    },
}

impl Services {
    /// Run one command document against the services
    pub async fn execute(&self, command: Command) -> Result<CommandOutcome, TrackerError> {
        debug!(op = command.name(), "Executing command");
        let p = &self.projects;

        let outcome = match command {
            Command::CreateProject { actor, name, thread_handle } => CommandOutcome::Project(
                p.create_project(&actor, &name, thread_handle.as_deref()).await?,
            ),
            Command::AddResource { actor, project, resource, amount, resource_type, expand } => {
                CommandOutcome::Added(
                    p.add_resource(&actor, &project, &resource, amount, resource_type.as_deref(), expand)
                        .await?,
                )
            }
            Command::Complete { actor, project, resource } => {
                CommandOutcome::Completion(p.complete(&actor, &project, &resource).await?)
            }
            Command::CompleteOne { actor, project, resource } => {
                CommandOutcome::Progress(p.complete_one(&actor, &project, &resource).await?)
            }
            Command::EditResource { actor, project, resource, amount, resource_type } => {
                CommandOutcome::Progress(
                    p.edit_resource(&actor, &project, &resource, amount, resource_type.as_deref())
                        .await?,
                )
            }
            Command::RemoveResource { actor, project, resource, cascade } => {
                CommandOutcome::Removal(p.remove_resource(&actor, &project, &resource, cascade).await?)
            }
            Command::UpdateProgress { actor, project, resource, delta } => {
                CommandOutcome::Progress(p.update_progress(&actor, &project, &resource, delta).await?)
            }
            Command::SetProgress { actor, project, resource, progress } => {
                CommandOutcome::Progress(p.set_progress(&actor, &project, &resource, progress).await?)
            }
            Command::ListResources { project } => CommandOutcome::Listing(p.list_resources(&project)?),
            Command::Subscribe { actor, project, resource } => {
                CommandOutcome::Subscription(p.subscribe(&actor, &project, resource.as_deref())?)
            }
            Command::Unsubscribe { actor, project, resource } => {
                CommandOutcome::Subscription(p.unsubscribe(&actor, &project, resource.as_deref())?)
            }
            Command::AddMember { actor, project, user_id } => {
                CommandOutcome::Membership(p.add_member(&actor, &project, &user_id)?)
            }
            Command::RemoveMember { actor, project, user_id } => {
                CommandOutcome::Membership(p.remove_member(&actor, &project, &user_id)?)
            }
            Command::SetDeadline { actor, project, deadline } => {
                CommandOutcome::Deadline(p.set_deadline(&actor, &project, &deadline)?)
            }
            Command::ResourceDeadline { actor, project, resource, deadline } => {
                CommandOutcome::Deadline(p.resource_deadline(&actor, &project, &resource, &deadline)?)
            }
            Command::Summary { project } => CommandOutcome::Summary(p.summary(&project)?),
            Command::Search { query } => {
                let query = query.trim().to_string();
                if query.is_empty() {
                    return Err(TrackerError::Validation("search query must not be empty".into()));
                }
                let outcome = self.shards.search(&query).await;
                CommandOutcome::Search {
                    rendered: render::render_search(&query, &outcome),
                    partial: outcome.is_partial(),
                    query,
                    outcome,
                }
            }
            Command::ShardStatus => CommandOutcome::ShardStatus(self.shards.stats().await),
            Command::Craft { query } => CommandOutcome::Craft {
                recipes: self.catalog.craft_lookup(&query),
                query,
            },
            Command::Suggest { fragment } => CommandOutcome::Suggestions {
                names: self.catalog.suggest(&fragment).into_iter().map(str::to_string).collect(),
            },
        };

        Ok(outcome)
    }
}
