//! Cross-shard scatter-gather
//!
//! Every shard process serves a disjoint set of communities but reads the
//! same store. A search is broadcast to all shards (this process included,
//! through [`LocalShard`]) and the answers are flattened without dedup.
//!
//! Each peer call is bounded by a timeout. A peer that errors or does not
//! answer in time contributes nothing and is listed in
//! [`SearchOutcome::failed`]; the other shards' results are still returned.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::chat::ChatAdapter;
use crate::db::projects::{self, ProjectHit};
use crate::db::TrackerDb;
use crate::error::TrackerError;

// =============================================================================
// Wire types
// =============================================================================

/// A project matched by one shard, with that shard's community names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectMatch {
    #[serde(flatten)]
    pub project: ProjectHit,
    pub communities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSearchRequest {
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSearchResponse {
    pub shard_id: u32,
    pub matches: Vec<ProjectMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardStats {
    pub shard_id: u32,
    pub communities: usize,
    pub projects: u64,
}

/// Match tagged with the shard that produced it
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ShardMatch {
    pub shard_id: u32,
    #[serde(flatten)]
    pub project: ProjectHit,
    pub communities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PeerFailure {
    pub shard_id: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    /// Flattened matches; order across shards is not defined
    pub matches: Vec<ShardMatch>,
    pub responded: Vec<u32>,
    pub failed: Vec<PeerFailure>,
}

impl SearchOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsOutcome {
    pub shards: Vec<ShardStats>,
    pub failed: Vec<PeerFailure>,
    pub total_communities: usize,
    /// Largest per-shard count; every shard reads the same store
    pub total_projects: u64,
}

// =============================================================================
// Peers
// =============================================================================

#[async_trait]
pub trait ShardPeer: Send + Sync {
    fn shard_id(&self) -> u32;

    /// Local case-insensitive substring search on that shard
    async fn search(&self, query: &str) -> Result<Vec<ProjectMatch>, TrackerError>;

    async fn stats(&self) -> Result<ShardStats, TrackerError>;
}

/// This process, answering from its own view of the store
pub struct LocalShard {
    shard_id: u32,
    db: Arc<TrackerDb>,
    chat: Arc<dyn ChatAdapter>,
}

impl LocalShard {
    pub fn new(shard_id: u32, db: Arc<TrackerDb>, chat: Arc<dyn ChatAdapter>) -> Self {
        Self { shard_id, db, chat }
    }

    async fn community_names(&self) -> Vec<String> {
        match self.chat.communities().await {
            Ok(list) => list.into_iter().map(|c| c.name).collect(),
            Err(e) => {
                warn!(shard_id = self.shard_id, error = %e, "Could not list communities");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl ShardPeer for LocalShard {
    fn shard_id(&self) -> u32 {
        self.shard_id
    }

    async fn search(&self, query: &str) -> Result<Vec<ProjectMatch>, TrackerError> {
        let hits = self.db.with_conn(|conn| projects::search_projects(conn, query))?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let communities = self.community_names().await;
        Ok(hits
            .into_iter()
            .map(|project| ProjectMatch {
                project,
                communities: communities.clone(),
            })
            .collect())
    }

    async fn stats(&self) -> Result<ShardStats, TrackerError> {
        let projects = self.db.with_conn(projects::count_projects)?;
        Ok(ShardStats {
            shard_id: self.shard_id,
            communities: self.community_names().await.len(),
            projects,
        })
    }
}

/// A peer shard reached over its HTTP RPC endpoint
pub struct HttpShardPeer {
    shard_id: u32,
    base_url: String,
    client: reqwest::Client,
}

impl HttpShardPeer {
    pub fn new(shard_id: u32, base_url: impl Into<String>, timeout: Duration) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrackerError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            shard_id,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> TrackerError {
        if e.is_timeout() {
            TrackerError::Timeout(format!("shard {}", self.shard_id))
        } else {
            TrackerError::Connection(format!("shard {} at {}: {}", self.shard_id, self.base_url, e))
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(&self, response: reqwest::Response) -> Result<T, TrackerError> {
        if !response.status().is_success() {
            return Err(TrackerError::Connection(format!(
                "shard {} returned {}",
                self.shard_id,
                response.status()
            )));
        }
        response.json().await.map_err(|e| self.transport_error(e))
    }
}

#[async_trait]
impl ShardPeer for HttpShardPeer {
    fn shard_id(&self) -> u32 {
        self.shard_id
    }

    async fn search(&self, query: &str) -> Result<Vec<ProjectMatch>, TrackerError> {
        let response = self
            .client
            .post(format!("{}/shard/search", self.base_url))
            .json(&ShardSearchRequest { query: query.to_string() })
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let body: ShardSearchResponse = self.decode(response).await?;
        if body.shard_id != self.shard_id {
            warn!(expected = self.shard_id, actual = body.shard_id, "Peer answered with unexpected shard id");
        }
        Ok(body.matches)
    }

    async fn stats(&self) -> Result<ShardStats, TrackerError> {
        let response = self
            .client
            .get(format!("{}/shard/stats", self.base_url))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.decode(response).await
    }
}

// =============================================================================
// Aggregator
// =============================================================================

pub struct ShardAggregator {
    peers: Vec<Arc<dyn ShardPeer>>,
    timeout: Duration,
}

impl ShardAggregator {
    pub fn new(peers: Vec<Arc<dyn ShardPeer>>, timeout: Duration) -> Self {
        Self { peers, timeout }
    }

    pub fn shard_count(&self) -> usize {
        self.peers.len()
    }

    /// Call every peer concurrently, each under the per-shard timeout
    async fn gather<T, F, Fut>(&self, call: F) -> Vec<(u32, Result<T, TrackerError>)>
    where
        F: Fn(Arc<dyn ShardPeer>) -> Fut,
        Fut: Future<Output = Result<T, TrackerError>>,
    {
        let calls = self.peers.iter().map(|peer| {
            let shard_id = peer.shard_id();
            let fut = call(Arc::clone(peer));
            async move {
                let result = match tokio::time::timeout(self.timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(TrackerError::Timeout(format!(
                        "shard {} did not answer within {}ms",
                        shard_id,
                        self.timeout.as_millis()
                    ))),
                };
                (shard_id, result)
            }
        });
        join_all(calls).await
    }

    pub async fn search(&self, query: &str) -> SearchOutcome {
        let query = query.trim().to_string();
        let results = self
            .gather(|peer| {
                let query = query.clone();
                async move { peer.search(&query).await }
            })
            .await;

        let mut outcome = SearchOutcome::default();
        for (shard_id, result) in results {
            match result {
                Ok(matches) => {
                    outcome.responded.push(shard_id);
                    outcome.matches.extend(matches.into_iter().map(|m| ShardMatch {
                        shard_id,
                        project: m.project,
                        communities: m.communities,
                    }));
                }
                Err(e) => {
                    warn!(shard_id, error = %e, "Shard search failed");
                    outcome.failed.push(PeerFailure {
                        shard_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        debug!(
            query = %query,
            matches = outcome.matches.len(),
            responded = outcome.responded.len(),
            failed = outcome.failed.len(),
            "Scatter-gather search complete"
        );
        outcome
    }

    pub async fn stats(&self) -> StatsOutcome {
        let results = self.gather(|peer| async move { peer.stats().await }).await;

        let mut outcome = StatsOutcome::default();
        for (shard_id, result) in results {
            match result {
                Ok(stats) => {
                    outcome.total_communities += stats.communities;
                    outcome.total_projects = outcome.total_projects.max(stats.projects);
                    outcome.shards.push(stats);
                }
                Err(e) => {
                    warn!(shard_id, error = %e, "Shard stats failed");
                    outcome.failed.push(PeerFailure {
                        shard_id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        outcome.shards.sort_by_key(|s| s.shard_id);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{Community, LogChatAdapter};

    struct FixedChat(Vec<&'static str>);

    #[async_trait]
    impl ChatAdapter for FixedChat {
        async fn send_direct(&self, _: &str, _: &str) -> Result<(), TrackerError> {
            Ok(())
        }

        async fn post_to_thread(&self, _: &str, _: &str) -> Result<(), TrackerError> {
            Ok(())
        }

        async fn communities(&self) -> Result<Vec<Community>, TrackerError> {
            Ok(self
                .0
                .iter()
                .map(|name| Community { id: name.to_lowercase(), name: name.to_string() })
                .collect())
        }
    }

    struct BrokenPeer(u32);

    #[async_trait]
    impl ShardPeer for BrokenPeer {
        fn shard_id(&self) -> u32 {
            self.0
        }

        async fn search(&self, _: &str) -> Result<Vec<ProjectMatch>, TrackerError> {
            Err(TrackerError::Connection("refused".into()))
        }

        async fn stats(&self) -> Result<ShardStats, TrackerError> {
            Err(TrackerError::Connection("refused".into()))
        }
    }

    fn seeded_db() -> Arc<TrackerDb> {
        let db = Arc::new(TrackerDb::open_in_memory().unwrap());
        db.with_conn_mut(|conn| {
            let keep = projects::create_project(conn, "Stone Keep", None)?;
            crate::db::resources::create_subtree(
                conn,
                keep.id,
                None,
                &crate::expansion::ResourceSpec::leaf("Outer Wall", 4, None),
            )?;
            projects::create_project(conn, "Harbor", None)?;
            Ok(())
        })
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_local_search_matches_resources_and_names() {
        let local = LocalShard::new(0, seeded_db(), Arc::new(FixedChat(vec!["Guild A"])));

        let by_resource = local.search("WALL").await.unwrap();
        assert_eq!(by_resource.len(), 1);
        assert_eq!(by_resource[0].project.project, "Stone Keep");
        assert_eq!(by_resource[0].project.resources, vec!["Outer Wall"]);
        assert_eq!(by_resource[0].communities, vec!["Guild A"]);

        let by_name = local.search("harb").await.unwrap();
        assert_eq!(by_name[0].project.project, "Harbor");
        assert!(local.search("xyz").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_peer_yields_partial_outcome() {
        let db = seeded_db();
        let aggregator = ShardAggregator::new(
            vec![
                Arc::new(LocalShard::new(0, db, Arc::new(LogChatAdapter))),
                Arc::new(BrokenPeer(1)),
            ],
            Duration::from_millis(200),
        );

        let outcome = aggregator.search("keep").await;
        assert!(outcome.is_partial());
        assert_eq!(outcome.responded, vec![0]);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].shard_id, 0);
        assert_eq!(outcome.failed[0].shard_id, 1);
    }

    #[tokio::test]
    async fn test_stats_totals() {
        let db = seeded_db();
        let aggregator = ShardAggregator::new(
            vec![
                Arc::new(LocalShard::new(1, db.clone(), Arc::new(FixedChat(vec!["B", "C"])))),
                Arc::new(LocalShard::new(0, db, Arc::new(FixedChat(vec!["A"])))),
                Arc::new(BrokenPeer(2)),
            ],
            Duration::from_millis(200),
        );

        let outcome = aggregator.stats().await;
        assert_eq!(outcome.shards.len(), 2);
        assert_eq!(outcome.shards[0].shard_id, 0);
        assert_eq!(outcome.total_communities, 3);
        // Shards share one store, so project totals are not summed
        assert_eq!(outcome.total_projects, 2);
        assert_eq!(outcome.failed.len(), 1);
    }

    #[test]
    fn test_project_match_wire_format() {
        let m = ProjectMatch {
            project: ProjectHit { project: "Keep".into(), resources: vec!["Wall".into()] },
            communities: vec!["Guild".into()],
        };
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["project"], "Keep");
        assert_eq!(json["resources"][0], "Wall");
        let back: ProjectMatch = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }
}
