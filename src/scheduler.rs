//! Deadline reminder scheduler
//!
//! ## Overview
//!
//! A periodic task, independent of request handling, that:
//! 1. Pages through projects with a deadline in `[now - window, now + window]`
//! 2. Pages through open resources in the same window
//! 3. Sends each match an OVERDUE or DUE SOON reminder
//!
//! Recipients are project members, project subscribers and, for resources,
//! subscribers of that resource. Pages are fetched with keyset pagination
//! and the task yields between pages so a long scan does not hold up
//! concurrent requests on the same runtime.

use chrono::{TimeZone, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{Config, ReminderPolicy};
use crate::db::{projects, resources, TrackerDb};
use crate::error::TrackerError;
use crate::notify::{DeliveryReport, Notifier};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub window_hours: i64,
    pub page_size: u32,
    pub policy: ReminderPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            window_hours: 24,
            page_size: 200,
            policy: ReminderPolicy::EveryTick,
        }
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.reminder_interval(),
            window_hours: config.reminder_window_hours,
            page_size: config.reminder_page_size,
            policy: config.reminder_policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReminderKind {
    Overdue,
    DueSoon,
}

impl ReminderKind {
    pub fn classify(deadline: i64, now: i64) -> Self {
        if deadline < now {
            Self::Overdue
        } else {
            Self::DueSoon
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Overdue => "OVERDUE",
            Self::DueSoon => "DUE SOON",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Entity {
    Project(i64),
    Resource(i64),
}

/// Outcome of one scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub projects: usize,
    pub resources: usize,
    /// Entities skipped by the once-per-stage policy
    pub suppressed: usize,
    pub delivery: DeliveryReport,
}

pub struct DeadlineScheduler {
    db: Arc<TrackerDb>,
    notifier: Arc<Notifier>,
    config: SchedulerConfig,
    /// Last stage reminded per entity (once-per-stage policy only)
    stages: Mutex<HashMap<Entity, ReminderKind>>,
}

impl DeadlineScheduler {
    pub fn new(db: Arc<TrackerDb>, notifier: Arc<Notifier>, config: SchedulerConfig) -> Self {
        Self {
            db,
            notifier,
            config,
            stages: Mutex::new(HashMap::new()),
        }
    }

    /// Run the scan loop until a shutdown signal arrives
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                window_hours = self.config.window_hours,
                policy = ?self.config.policy,
                "Starting deadline scheduler"
            );

            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_once(Utc::now().timestamp()).await {
                            Ok(report) => debug!(?report, "Deadline scan finished"),
                            Err(e) => warn!(error = %e, "Deadline scan failed"),
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Deadline scheduler shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// One full scan at time `now` (unix seconds)
    pub async fn run_once(&self, now: i64) -> Result<ScanReport, TrackerError> {
        let window = self.config.window_hours.saturating_mul(3600);
        let (from, to) = (now.saturating_sub(window), now.saturating_add(window));
        let limit = self.config.page_size.max(1);

        let mut report = ScanReport::default();
        let mut seen = HashSet::new();

        let mut after = 0;
        loop {
            let page = self
                .db
                .with_conn(|conn| projects::projects_due_between(conn, from, to, after, limit))?;

            for project in &page {
                let Some(deadline) = project.deadline else { continue };
                report.projects += 1;
                let entity = Entity::Project(project.id);
                seen.insert(entity);

                let kind = ReminderKind::classify(deadline, now);
                if !self.should_remind(entity, kind)? {
                    report.suppressed += 1;
                    continue;
                }

                let recipients = self.notifier.deadline_recipients(project.id, None)?;
                let message = format!(
                    "[{}] Project **{}** deadline: {}",
                    kind.tag(),
                    project.name,
                    format_deadline(deadline)
                );
                report.delivery.merge(self.notifier.deliver_all(&recipients, &message).await);
            }

            match page.last() {
                Some(last) if page.len() as u32 == limit => after = last.id,
                _ => break,
            }
            tokio::task::yield_now().await;
        }

        let mut after = 0;
        loop {
            let page = self
                .db
                .with_conn(|conn| resources::resources_due_between(conn, from, to, after, limit))?;

            for due in &page {
                let Some(deadline) = due.resource.deadline else { continue };
                report.resources += 1;
                let entity = Entity::Resource(due.resource.id);
                seen.insert(entity);

                let kind = ReminderKind::classify(deadline, now);
                if !self.should_remind(entity, kind)? {
                    report.suppressed += 1;
                    continue;
                }

                let recipients = self
                    .notifier
                    .deadline_recipients(due.resource.project_id, Some(due.resource.id))?;
                let message = format!(
                    "[{}] Resource **{}** in project **{}** deadline: {}",
                    kind.tag(),
                    due.resource.resource,
                    due.project_name,
                    format_deadline(deadline)
                );
                report.delivery.merge(self.notifier.deliver_all(&recipients, &message).await);
            }

            match page.last() {
                Some(last) if page.len() as u32 == limit => after = last.resource.id,
                _ => break,
            }
            tokio::task::yield_now().await;
        }

        self.forget_unseen(&seen)?;

        info!(
            projects = report.projects,
            resources = report.resources,
            suppressed = report.suppressed,
            delivered = report.delivery.delivered,
            "Deadline scan complete"
        );
        Ok(report)
    }

    fn should_remind(&self, entity: Entity, kind: ReminderKind) -> Result<bool, TrackerError> {
        if self.config.policy == ReminderPolicy::EveryTick {
            return Ok(true);
        }
        let mut stages = self.stages.lock()
            .map_err(|e| TrackerError::Internal(format!("Lock poisoned: {}", e)))?;
        Ok(stages.insert(entity, kind) != Some(kind))
    }

    fn forget_unseen(&self, seen: &HashSet<Entity>) -> Result<(), TrackerError> {
        let mut stages = self.stages.lock()
            .map_err(|e| TrackerError::Internal(format!("Lock poisoned: {}", e)))?;
        stages.retain(|entity, _| seen.contains(entity));
        Ok(())
    }
}

fn format_deadline(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatAdapter, Community, LogChatAdapter};
    use crate::db::subscriptions;
    use crate::expansion::ResourceSpec;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Inbox(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl ChatAdapter for Inbox {
        async fn send_direct(&self, user_id: &str, message: &str) -> Result<(), TrackerError> {
            self.0.lock().unwrap().push((user_id.to_string(), message.to_string()));
            Ok(())
        }

        async fn post_to_thread(&self, _: &str, _: &str) -> Result<(), TrackerError> {
            Ok(())
        }

        async fn communities(&self) -> Result<Vec<Community>, TrackerError> {
            Ok(vec![])
        }
    }

    const NOW: i64 = 1_800_000_000;
    const HOUR: i64 = 3600;

    fn scheduler(policy: ReminderPolicy, page_size: u32) -> (Arc<TrackerDb>, DeadlineScheduler) {
        let db = Arc::new(TrackerDb::open_in_memory().unwrap());
        let notifier = Arc::new(Notifier::new(db.clone(), Arc::new(LogChatAdapter)));
        let config = SchedulerConfig {
            page_size,
            policy,
            ..Default::default()
        };
        (db.clone(), DeadlineScheduler::new(db, notifier, config))
    }

    fn seed(db: &TrackerDb) {
        db.with_conn_mut(|conn| {
            // Three projects in the window, one far in the future
            for (name, offset) in [("Late", -2 * HOUR), ("Soon", 3 * HOUR), ("Edge", 24 * HOUR), ("Far", 72 * HOUR)] {
                let project = projects::create_project(conn, name, None)?;
                projects::set_project_deadline(conn, project.id, Some(NOW + offset))?;
                subscriptions::add_member(conn, "ana", project.id)?;
            }
            let late = projects::get_project_by_name(conn, "Late")?.unwrap();
            let open = resources::create_subtree(conn, late.id, None, &ResourceSpec::leaf("Gate", 1, None))?;
            let done = resources::create_subtree(conn, late.id, None, &ResourceSpec::leaf("Tower", 1, None))?;
            resources::set_resource_deadline(conn, open, Some(NOW - HOUR))?;
            resources::set_resource_deadline(conn, done, Some(NOW - HOUR))?;
            resources::complete_single(conn, done)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_classify() {
        assert_eq!(ReminderKind::classify(NOW - 1, NOW), ReminderKind::Overdue);
        assert_eq!(ReminderKind::classify(NOW, NOW), ReminderKind::DueSoon);
        assert_eq!(ReminderKind::Overdue.tag(), "OVERDUE");
    }

    #[tokio::test]
    async fn test_scan_finds_window_across_pages() {
        let (db, scheduler) = scheduler(ReminderPolicy::EveryTick, 1);
        seed(&db);

        let report = scheduler.run_once(NOW).await.unwrap();
        assert_eq!(report.projects, 3);
        assert_eq!(report.resources, 1);
        assert_eq!(report.delivery.attempted, 4);
    }

    #[tokio::test]
    async fn test_every_tick_repeats() {
        let (db, scheduler) = scheduler(ReminderPolicy::EveryTick, 50);
        seed(&db);

        scheduler.run_once(NOW).await.unwrap();
        let second = scheduler.run_once(NOW + 60).await.unwrap();
        assert_eq!(second.suppressed, 0);
        assert_eq!(second.delivery.attempted, 4);
    }

    #[tokio::test]
    async fn test_once_per_stage_suppresses_until_stage_changes() {
        let (db, scheduler) = scheduler(ReminderPolicy::OncePerStage, 50);
        seed(&db);

        let first = scheduler.run_once(NOW).await.unwrap();
        assert_eq!(first.suppressed, 0);

        let second = scheduler.run_once(NOW + 60).await.unwrap();
        assert_eq!(second.suppressed, 4);
        assert_eq!(second.delivery.attempted, 0);

        // "Soon" becomes overdue four hours later
        let third = scheduler.run_once(NOW + 4 * HOUR).await.unwrap();
        assert_eq!(third.delivery.attempted, 1);
    }

    #[tokio::test]
    async fn test_resource_reminder_reaches_each_user_once() {
        let db = Arc::new(TrackerDb::open_in_memory().unwrap());
        let inbox = Arc::new(Inbox::default());
        let notifier = Arc::new(Notifier::new(db.clone(), inbox.clone()));
        let scheduler = DeadlineScheduler::new(db.clone(), notifier, SchedulerConfig::default());

        db.with_conn_mut(|conn| {
            let keep = projects::create_project(conn, "Keep", None)?;
            let wall = resources::create_subtree(conn, keep.id, None, &ResourceSpec::leaf("Wall", 5, None))?;
            resources::set_resource_deadline(conn, wall, Some(NOW + HOUR))?;
            // ana is reachable three ways, bo only through the resource
            subscriptions::add_member(conn, "ana", keep.id)?;
            subscriptions::subscribe(conn, "ana", keep.id, None)?;
            subscriptions::subscribe(conn, "ana", keep.id, Some(wall))?;
            subscriptions::subscribe(conn, "bo", keep.id, Some(wall))?;
            Ok(())
        })
        .unwrap();

        let report = scheduler.run_once(NOW).await.unwrap();
        assert_eq!(report.projects, 0);
        assert_eq!(report.resources, 1);
        assert_eq!(report.delivery.attempted, 2);

        let sent = inbox.0.lock().unwrap().clone();
        let to_ana: Vec<_> = sent.iter().filter(|(user, _)| user == "ana").collect();
        assert_eq!(to_ana.len(), 1);
        assert!(to_ana[0].1.starts_with("[DUE SOON] Resource **Wall** in project **Keep**"));
        assert_eq!(sent.iter().filter(|(user, _)| user == "bo").count(), 1);
    }

    #[tokio::test]
    async fn test_spawn_stops_on_shutdown() {
        let (_db, scheduler) = scheduler(ReminderPolicy::EveryTick, 10);
        let (tx, rx) = broadcast::channel(1);

        let handle = Arc::new(scheduler).spawn(rx);
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }

    #[test]
    fn test_format_deadline() {
        assert_eq!(format_deadline(0), "1970-01-01 00:00 UTC");
    }
}
