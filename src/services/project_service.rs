//! Project service - command-boundary operations on projects and resources
//!
//! Every operation resolves the project first (`NotFound`), then checks
//! membership for writes (`PermissionDenied`), then resolves the resource.
//! Input validation happens before any of that, and all checks finish
//! before a tree transaction opens.
//!
//! Status lines to the project thread and completion notifications are sent
//! after the store change commits and never fail the operation.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::RecipeCatalog;
use crate::db::projects::{self, ProjectRow};
use crate::db::resources::{self, DeleteOutcome, ProgressOutcome, ResourceRow};
use crate::db::{self, subscriptions, TrackerDb};
use crate::error::TrackerError;
use crate::expansion::{DependencyExpander, ResourceSpec};
use crate::notify::{DeliveryReport, Notifier};
use crate::render;

use super::events::{EventBus, TrackerEvent};

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AddedResources {
    pub project: String,
    pub root_id: i64,
    pub nodes: usize,
    pub tree: ResourceSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionResult {
    pub project: String,
    pub resource: ResourceRow,
    /// Ids that moved into the completed state
    pub completed: Vec<i64>,
    pub notified: DeliveryReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressResult {
    pub project: String,
    pub resource: ResourceRow,
    pub became_completed: bool,
    pub notified: DeliveryReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovalResult {
    pub project: String,
    pub resource: String,
    pub cascade: bool,
    #[serde(flatten)]
    pub outcome: DeleteOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceListing {
    pub project: String,
    pub resources: Vec<ResourceRow>,
    pub rendered: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionResult {
    pub project: String,
    pub resource: Option<String>,
    /// False when the call found nothing to change
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MembershipResult {
    pub project: String,
    pub user_id: String,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadlineResult {
    pub project: String,
    pub resource: Option<String>,
    /// Unix seconds, UTC
    pub deadline: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    pub project: String,
    pub deadline: Option<i64>,
    pub members: Vec<String>,
    pub resources: u64,
    pub completed: u64,
    pub percent: u64,
}

// =============================================================================
// Helpers
// =============================================================================

/// Parse a deadline: RFC 3339, `YYYY-MM-DDTHH:MM[:SS]` (UTC) or `YYYY-MM-DD`
pub fn parse_deadline(input: &str) -> Result<i64, TrackerError> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.timestamp());
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc().timestamp());
        }
    }

    Err(TrackerError::Validation(format!(
        "invalid deadline {:?}, use YYYY-MM-DD or ISO 8601",
        input
    )))
}

fn validate_name(kind: &str, name: &str) -> Result<(), TrackerError> {
    if name.trim().is_empty() {
        return Err(TrackerError::Validation(format!("{} name must not be empty", kind)));
    }
    Ok(())
}

fn validate_amount(amount: i64) -> Result<(), TrackerError> {
    if amount <= 0 {
        return Err(TrackerError::Validation(format!("amount must be positive, got {}", amount)));
    }
    Ok(())
}

fn find_project(conn: &Connection, name: &str) -> Result<ProjectRow, TrackerError> {
    projects::get_project_by_name(conn, name.trim())?
        .ok_or_else(|| TrackerError::NotFound(format!("project {}", name)))
}

fn require_member(conn: &Connection, actor: &str, project: &ProjectRow) -> Result<(), TrackerError> {
    if subscriptions::is_member(conn, actor, project.id)? {
        Ok(())
    } else {
        Err(TrackerError::PermissionDenied {
            user_id: actor.to_string(),
            project: project.name.clone(),
        })
    }
}

fn find_resource(
    conn: &Connection,
    project: &ProjectRow,
    name: &str,
    open_first: bool,
) -> Result<ResourceRow, TrackerError> {
    resources::find_by_name(conn, project.id, name, open_first)?
        .ok_or_else(|| TrackerError::NotFound(format!("resource {} in project {}", name, project.name)))
}

/// Resolve project, membership and resource for a write to one node
fn writable_resource(
    conn: &Connection,
    actor: &str,
    project: &str,
    resource: &str,
    open_first: bool,
) -> Result<(ProjectRow, ResourceRow), TrackerError> {
    let project = find_project(conn, project)?;
    require_member(conn, actor, &project)?;
    let node = find_resource(conn, &project, resource, open_first)?;
    Ok((project, node))
}

// =============================================================================
// Service
// =============================================================================

pub struct ProjectService {
    db: Arc<TrackerDb>,
    catalog: Arc<RecipeCatalog>,
    notifier: Arc<Notifier>,
    events: Arc<EventBus>,
}

impl ProjectService {
    pub fn new(
        db: Arc<TrackerDb>,
        catalog: Arc<RecipeCatalog>,
        notifier: Arc<Notifier>,
        events: Arc<EventBus>,
    ) -> Self {
        Self { db, catalog, notifier, events }
    }

    async fn post_status(&self, project: &ProjectRow, message: &str) {
        let Some(handle) = project.thread_handle.as_deref() else {
            return;
        };
        if let Err(e) = self.notifier.chat().post_to_thread(handle, message).await {
            warn!(project = %project.name, error = %e, "Thread status post failed");
        }
    }

    async fn notify(&self, project: &ProjectRow, nodes: &[ResourceRow]) -> DeliveryReport {
        if nodes.is_empty() {
            return DeliveryReport::default();
        }
        match self.notifier.notify_completed(&project.name, nodes).await {
            Ok(report) => report,
            Err(e) => {
                warn!(project = %project.name, error = %e, "Could not resolve completion recipients");
                DeliveryReport::default()
            }
        }
    }

    async fn progress_result(&self, project: ProjectRow, outcome: ProgressOutcome) -> ProgressResult {
        let notified = if outcome.became_completed {
            self.notify(&project, std::slice::from_ref(&outcome.node)).await
        } else {
            DeliveryReport::default()
        };

        self.events.emit(TrackerEvent::ResourceUpdated {
            project: project.name.clone(),
            id: outcome.node.id,
        });

        ProgressResult {
            project: project.name,
            resource: outcome.node,
            became_completed: outcome.became_completed,
            notified,
        }
    }

    // =========================================================================
    // Projects
    // =========================================================================

    /// Create a project; the creator becomes its first member
    pub async fn create_project(
        &self,
        actor: &str,
        name: &str,
        thread_handle: Option<&str>,
    ) -> Result<ProjectRow, TrackerError> {
        validate_name("project", name)?;

        let project = self.db.with_conn_mut(|conn| {
            let tx = db::write_tx(conn)?;
            let project = projects::create_project(&tx, name.trim(), thread_handle)?;
            subscriptions::add_member(&tx, actor, project.id)?;
            db::commit(tx)?;
            Ok(project)
        })?;

        info!(project = %project.name, creator = actor, "Project created");
        self.events.emit(TrackerEvent::ProjectCreated {
            project: project.name.clone(),
            creator: actor.to_string(),
        });
        self.post_status(&project, &format!("Tracking project: **{}**", project.name)).await;

        Ok(project)
    }

    pub fn summary(&self, project: &str) -> Result<ProjectSummary, TrackerError> {
        self.db.with_conn(|conn| {
            let project = find_project(conn, project)?;
            let counts = projects::project_counts(conn, project.id)?;
            let members = subscriptions::members(conn, project.id)?;
            let percent = if counts.resources == 0 {
                0
            } else {
                ((counts.completed as f64 / counts.resources as f64) * 100.0).round() as u64
            };

            Ok(ProjectSummary {
                project: project.name,
                deadline: project.deadline,
                members: members.into_iter().collect(),
                resources: counts.resources,
                completed: counts.completed,
                percent,
            })
        })
    }

    pub fn set_deadline(&self, actor: &str, project: &str, deadline: &str) -> Result<DeadlineResult, TrackerError> {
        let deadline = parse_deadline(deadline)?;

        let project = self.db.with_conn(|conn| {
            let project = find_project(conn, project)?;
            require_member(conn, actor, &project)?;
            projects::set_project_deadline(conn, project.id, Some(deadline))?;
            Ok(project)
        })?;

        self.events.emit(TrackerEvent::DeadlineSet {
            project: project.name.clone(),
            resource_id: None,
            deadline,
        });
        Ok(DeadlineResult {
            project: project.name,
            resource: None,
            deadline,
        })
    }

    // =========================================================================
    // Members and subscriptions
    // =========================================================================

    pub fn add_member(&self, actor: &str, project: &str, user_id: &str) -> Result<MembershipResult, TrackerError> {
        self.change_membership(actor, project, user_id, true)
    }

    pub fn remove_member(&self, actor: &str, project: &str, user_id: &str) -> Result<MembershipResult, TrackerError> {
        self.change_membership(actor, project, user_id, false)
    }

    fn change_membership(
        &self,
        actor: &str,
        project: &str,
        user_id: &str,
        add: bool,
    ) -> Result<MembershipResult, TrackerError> {
        validate_name("user", user_id)?;

        let (project, changed) = self.db.with_conn(|conn| {
            let project = find_project(conn, project)?;
            require_member(conn, actor, &project)?;
            let changed = if add {
                subscriptions::add_member(conn, user_id, project.id)?
            } else {
                subscriptions::remove_member(conn, user_id, project.id)?
            };
            Ok((project, changed))
        })?;

        if changed {
            self.events.emit(TrackerEvent::MembershipChanged {
                project: project.name.clone(),
                user_id: user_id.to_string(),
                added: add,
            });
        }
        Ok(MembershipResult {
            project: project.name,
            user_id: user_id.to_string(),
            changed,
        })
    }

    /// Subscribe to a project, or to one resource when `resource` is given
    pub fn subscribe(&self, actor: &str, project: &str, resource: Option<&str>) -> Result<SubscriptionResult, TrackerError> {
        self.change_subscription(actor, project, resource, true)
    }

    pub fn unsubscribe(&self, actor: &str, project: &str, resource: Option<&str>) -> Result<SubscriptionResult, TrackerError> {
        self.change_subscription(actor, project, resource, false)
    }

    fn change_subscription(
        &self,
        actor: &str,
        project: &str,
        resource: Option<&str>,
        subscribe: bool,
    ) -> Result<SubscriptionResult, TrackerError> {
        let (project, node, changed) = self.db.with_conn(|conn| {
            let project = find_project(conn, project)?;
            let node = match resource {
                Some(name) => Some(find_resource(conn, &project, name, false)?),
                None => None,
            };
            let resource_id = node.as_ref().map(|n| n.id);
            let changed = if subscribe {
                subscriptions::subscribe(conn, actor, project.id, resource_id)?
            } else {
                subscriptions::unsubscribe(conn, actor, project.id, resource_id)?
            };
            Ok((project, node, changed))
        })?;

        if changed {
            self.events.emit(TrackerEvent::SubscriptionChanged {
                project: project.name.clone(),
                user_id: actor.to_string(),
                resource_id: node.as_ref().map(|n| n.id),
                subscribed: subscribe,
            });
        }
        Ok(SubscriptionResult {
            project: project.name,
            resource: node.map(|n| n.resource),
            changed,
        })
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Add a resource, expanding it into its recipe tree when `expand` is set
    pub async fn add_resource(
        &self,
        actor: &str,
        project: &str,
        resource: &str,
        amount: i64,
        resource_type: Option<&str>,
        expand: bool,
    ) -> Result<AddedResources, TrackerError> {
        validate_name("resource", resource)?;
        validate_amount(amount)?;

        let project = self.db.with_conn(|conn| {
            let project = find_project(conn, project)?;
            require_member(conn, actor, &project)?;
            Ok(project)
        })?;

        let tree = if expand {
            DependencyExpander::new(&self.catalog).expand(resource, amount, resource_type)
        } else {
            ResourceSpec::leaf(resource.trim(), amount, resource_type.map(str::to_string))
        };

        let root_id = self
            .db
            .with_conn_mut(|conn| resources::create_subtree(conn, project.id, None, &tree))?;
        let nodes = tree.node_count();

        info!(project = %project.name, resource = %tree.resource, nodes, "Resources added");
        self.events.emit(TrackerEvent::ResourcesAdded {
            project: project.name.clone(),
            root_id,
            nodes,
        });

        let type_suffix = tree
            .resource_type
            .as_deref()
            .map(|t| format!(" ({})", t))
            .unwrap_or_default();
        self.post_status(
            &project,
            &format!("Resource added: **{}** x{}{}", tree.resource, tree.amount, type_suffix),
        )
        .await;

        Ok(AddedResources {
            project: project.name,
            root_id,
            nodes,
            tree,
        })
    }

    pub fn list_resources(&self, project: &str) -> Result<ResourceListing, TrackerError> {
        let (project, nodes) = self.db.with_conn(|conn| {
            let project = find_project(conn, project)?;
            let nodes = resources::get_tree(conn, project.id)?;
            Ok((project, nodes))
        })?;

        Ok(ResourceListing {
            project: project.name,
            rendered: render::render_tree(&nodes),
            resources: nodes,
        })
    }

    /// Complete a resource and all of its sub-resources
    pub async fn complete(&self, actor: &str, project: &str, resource: &str) -> Result<CompletionResult, TrackerError> {
        let (project, outcome) = self.db.with_conn_mut(|conn| {
            let (project, node) = writable_resource(conn, actor, project, resource, true)?;
            let outcome = resources::cascade_complete(conn, node.id)?;
            Ok((project, outcome))
        })?;

        // The cascade root is always signalled, even if it was already done
        let mut signalled = outcome.newly_completed.clone();
        if !signalled.iter().any(|n| n.id == outcome.root.id) {
            signalled.insert(0, outcome.root.clone());
        }
        let notified = self.notify(&project, &signalled).await;

        let completed: Vec<i64> = outcome.newly_completed.iter().map(|n| n.id).collect();
        self.events.emit(TrackerEvent::ResourcesCompleted {
            project: project.name.clone(),
            ids: completed.clone(),
        });
        self.post_status(
            &project,
            &format!("Resource **{}** and all sub-resources marked as completed.", outcome.root.resource),
        )
        .await;

        Ok(CompletionResult {
            project: project.name,
            resource: outcome.root,
            completed,
            notified,
        })
    }

    /// Complete only the named node
    pub async fn complete_one(&self, actor: &str, project: &str, resource: &str) -> Result<ProgressResult, TrackerError> {
        let (project, outcome) = self.db.with_conn_mut(|conn| {
            let (project, node) = writable_resource(conn, actor, project, resource, true)?;
            let outcome = resources::complete_single(conn, node.id)?;
            Ok((project, outcome))
        })?;
        Ok(self.progress_result(project, outcome).await)
    }

    pub async fn edit_resource(
        &self,
        actor: &str,
        project: &str,
        resource: &str,
        amount: Option<i64>,
        resource_type: Option<&str>,
    ) -> Result<ProgressResult, TrackerError> {
        if let Some(amount) = amount {
            validate_amount(amount)?;
        }

        let (project, outcome) = self.db.with_conn_mut(|conn| {
            let (project, node) = writable_resource(conn, actor, project, resource, false)?;
            let outcome = resources::edit_resource(conn, node.id, amount, resource_type)?;
            Ok((project, outcome))
        })?;
        Ok(self.progress_result(project, outcome).await)
    }

    pub async fn update_progress(
        &self,
        actor: &str,
        project: &str,
        resource: &str,
        delta: i64,
    ) -> Result<ProgressResult, TrackerError> {
        let (project, outcome) = self.db.with_conn_mut(|conn| {
            let (project, node) = writable_resource(conn, actor, project, resource, false)?;
            let outcome = resources::update_progress(conn, node.id, delta)?;
            Ok((project, outcome))
        })?;
        Ok(self.progress_result(project, outcome).await)
    }

    pub async fn set_progress(
        &self,
        actor: &str,
        project: &str,
        resource: &str,
        progress: i64,
    ) -> Result<ProgressResult, TrackerError> {
        if progress < 0 {
            return Err(TrackerError::Validation(format!("progress must not be negative, got {}", progress)));
        }

        let (project, outcome) = self.db.with_conn_mut(|conn| {
            let (project, node) = writable_resource(conn, actor, project, resource, false)?;
            let outcome = resources::set_progress(conn, node.id, progress)?;
            Ok((project, outcome))
        })?;
        Ok(self.progress_result(project, outcome).await)
    }

    pub async fn remove_resource(
        &self,
        actor: &str,
        project: &str,
        resource: &str,
        cascade: bool,
    ) -> Result<RemovalResult, TrackerError> {
        let (project, node, outcome) = self.db.with_conn_mut(|conn| {
            let (project, node) = writable_resource(conn, actor, project, resource, false)?;
            let outcome = resources::cascade_delete(conn, node.id, cascade)?;
            Ok((project, node, outcome))
        })?;

        self.events.emit(TrackerEvent::ResourcesRemoved {
            project: project.name.clone(),
            removed: outcome.removed.clone(),
            detached: outcome.detached.clone(),
        });
        self.post_status(
            &project,
            &format!(
                "Resource **{}**{} removed.",
                node.resource,
                if cascade { " and all sub-resources" } else { "" }
            ),
        )
        .await;

        Ok(RemovalResult {
            project: project.name,
            resource: node.resource,
            cascade,
            outcome,
        })
    }

    pub fn resource_deadline(
        &self,
        actor: &str,
        project: &str,
        resource: &str,
        deadline: &str,
    ) -> Result<DeadlineResult, TrackerError> {
        let deadline = parse_deadline(deadline)?;

        let (project, node) = self.db.with_conn(|conn| {
            let (project, node) = writable_resource(conn, actor, project, resource, false)?;
            resources::set_resource_deadline(conn, node.id, Some(deadline))?;
            Ok((project, node))
        })?;

        self.events.emit(TrackerEvent::DeadlineSet {
            project: project.name.clone(),
            resource_id: Some(node.id),
            deadline,
        });
        Ok(DeadlineResult {
            project: project.name,
            resource: Some(node.resource),
            deadline,
        })
    }
}
