//! Subscriber resolution and best-effort delivery
//!
//! Delivery never fails from the caller's point of view: errors from the
//! chat adapter are logged and counted, never retried.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chat::ChatAdapter;
use crate::db::resources::ResourceRow;
use crate::db::{subscriptions, TrackerDb};
use crate::error::TrackerError;

/// Counts from one fan-out
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn merge(&mut self, other: DeliveryReport) {
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

pub struct Notifier {
    db: Arc<TrackerDb>,
    chat: Arc<dyn ChatAdapter>,
}

impl Notifier {
    pub fn new(db: Arc<TrackerDb>, chat: Arc<dyn ChatAdapter>) -> Self {
        Self { db, chat }
    }

    pub fn chat(&self) -> &Arc<dyn ChatAdapter> {
        &self.chat
    }

    /// Project-level subscribers plus subscribers of exactly this node
    pub fn recipient_set(&self, resource: &ResourceRow) -> Result<BTreeSet<String>, TrackerError> {
        self.db.with_conn(|conn| {
            let mut users = subscriptions::project_subscribers(conn, resource.project_id)?;
            users.extend(subscriptions::resource_subscribers(conn, resource.id)?);
            Ok(users)
        })
    }

    /// Members plus project subscribers, plus resource subscribers for a resource
    pub fn deadline_recipients(
        &self,
        project_id: i64,
        resource_id: Option<i64>,
    ) -> Result<BTreeSet<String>, TrackerError> {
        self.db.with_conn(|conn| {
            let mut users = subscriptions::members(conn, project_id)?;
            users.extend(subscriptions::project_subscribers(conn, project_id)?);
            if let Some(resource_id) = resource_id {
                users.extend(subscriptions::resource_subscribers(conn, resource_id)?);
            }
            Ok(users)
        })
    }

    /// Attempt one direct message; failures are logged and reported as false
    pub async fn deliver(&self, user_id: &str, message: &str) -> bool {
        match self.chat.send_direct(user_id, message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(user_id, error = %e, "Direct message delivery failed");
                false
            }
        }
    }

    /// Deliver the same message to every recipient concurrently
    pub async fn deliver_all(&self, recipients: &BTreeSet<String>, message: &str) -> DeliveryReport {
        let results = join_all(recipients.iter().map(|user| self.deliver(user, message))).await;
        let delivered = results.iter().filter(|ok| **ok).count();
        DeliveryReport {
            attempted: results.len(),
            delivered,
            failed: results.len() - delivered,
        }
    }

    /// Notify subscribers about nodes that just became completed
    ///
    /// Each recipient gets one message naming every node whose recipient set
    /// contains them.
    pub async fn notify_completed(
        &self,
        project_name: &str,
        nodes: &[ResourceRow],
    ) -> Result<DeliveryReport, TrackerError> {
        let mut per_user: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for node in nodes {
            for user in self.recipient_set(node)? {
                per_user.entry(user).or_default().push(node.resource.as_str());
            }
        }

        let mut report = DeliveryReport::default();
        let sends = per_user.iter().map(|(user, names)| {
            let message = completion_message(project_name, names);
            async move { self.deliver(user, &message).await }
        });
        for ok in join_all(sends).await {
            report.merge(DeliveryReport {
                attempted: 1,
                delivered: usize::from(ok),
                failed: usize::from(!ok),
            });
        }

        debug!(project = project_name, nodes = nodes.len(), recipients = report.attempted, "Completion notifications sent");
        Ok(report)
    }
}

fn completion_message(project_name: &str, names: &[&str]) -> String {
    match names {
        [single] => format!(
            "Resource **{}** in project **{}** has been completed!",
            single, project_name
        ),
        _ => format!(
            "Resources completed in project **{}**: {}",
            project_name,
            names.iter().map(|n| format!("**{}**", n)).collect::<Vec<_>>().join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Community;
    use crate::db::{projects, resources};
    use crate::expansion::ResourceSpec;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, String)>>,
        blocked: Vec<String>,
    }

    #[async_trait]
    impl ChatAdapter for Recorder {
        async fn send_direct(&self, user_id: &str, message: &str) -> Result<(), TrackerError> {
            if self.blocked.iter().any(|b| b == user_id) {
                return Err(TrackerError::Delivery(format!("{} blocks DMs", user_id)));
            }
            self.sent.lock().unwrap().push((user_id.to_string(), message.to_string()));
            Ok(())
        }

        async fn post_to_thread(&self, _: &str, _: &str) -> Result<(), TrackerError> {
            Ok(())
        }

        async fn communities(&self) -> Result<Vec<Community>, TrackerError> {
            Ok(Vec::new())
        }
    }

    fn setup(recorder: Arc<Recorder>) -> (Notifier, Vec<ResourceRow>) {
        let db = Arc::new(TrackerDb::open_in_memory().unwrap());
        let tree = db
            .with_conn_mut(|conn| {
                let project = projects::create_project(conn, "Keep", None)?;
                let spec = ResourceSpec {
                    resource: "Wall".into(),
                    amount: 10,
                    resource_type: None,
                    children: vec![ResourceSpec::leaf("Brick", 40, None)],
                };
                resources::create_subtree(conn, project.id, None, &spec)?;
                let tree = resources::get_tree(conn, project.id)?;

                subscriptions::subscribe(conn, "ana", project.id, None)?;
                subscriptions::subscribe(conn, "ana", project.id, Some(tree[0].id))?;
                subscriptions::subscribe(conn, "bo", project.id, Some(tree[0].id))?;
                subscriptions::subscribe(conn, "cy", project.id, Some(tree[1].id))?;
                subscriptions::add_member(conn, "dee", project.id)?;
                Ok(tree)
            })
            .unwrap();
        (Notifier::new(db, recorder), tree)
    }

    #[test]
    fn test_recipient_set_is_deduplicated_union() {
        let (notifier, tree) = setup(Arc::new(Recorder::default()));

        let wall: Vec<_> = notifier.recipient_set(&tree[0]).unwrap().into_iter().collect();
        assert_eq!(wall, vec!["ana", "bo"]);

        // Subscribing to the parent does not cover the child
        let brick: Vec<_> = notifier.recipient_set(&tree[1]).unwrap().into_iter().collect();
        assert_eq!(brick, vec!["ana", "cy"]);
    }

    #[test]
    fn test_deadline_recipients_include_members() {
        let (notifier, tree) = setup(Arc::new(Recorder::default()));
        let project_only: Vec<_> = notifier
            .deadline_recipients(tree[0].project_id, None)
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(project_only, vec!["ana", "dee"]);

        let with_resource = notifier
            .deadline_recipients(tree[0].project_id, Some(tree[1].id))
            .unwrap();
        assert!(with_resource.contains("cy"));
    }

    #[tokio::test]
    async fn test_notify_completed_batches_per_user() {
        let recorder = Arc::new(Recorder::default());
        let (notifier, tree) = setup(recorder.clone());

        let report = notifier.notify_completed("Keep", &tree).await.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 3);

        let sent = recorder.sent.lock().unwrap();
        let ana: Vec<_> = sent.iter().filter(|(u, _)| u == "ana").collect();
        assert_eq!(ana.len(), 1);
        assert!(ana[0].1.contains("**Wall**") && ana[0].1.contains("**Brick**"));
    }

    #[tokio::test]
    async fn test_delivery_failures_are_swallowed() {
        let recorder = Arc::new(Recorder {
            blocked: vec!["bo".into()],
            ..Default::default()
        });
        let (notifier, tree) = setup(recorder.clone());

        let report = notifier.notify_completed("Keep", &tree[..1]).await.unwrap();
        assert_eq!(report, DeliveryReport { attempted: 2, delivered: 1, failed: 1 });
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_completion_message_forms() {
        assert_eq!(
            completion_message("Keep", &["Wall"]),
            "Resource **Wall** in project **Keep** has been completed!"
        );
        assert_eq!(
            completion_message("Keep", &["Wall", "Brick"]),
            "Resources completed in project **Keep**: **Wall**, **Brick**"
        );
    }
}
