//! Chat-platform adapter
//!
//! The tracker never talks to the chat platform directly. It posts status
//! lines to a project's thread, sends direct messages, and asks which
//! communities this shard serves, all through [`ChatAdapter`].
//!
//! Authorization is not the adapter's job; write access is decided by
//! project membership rows alone.

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::TrackerError;

/// A community (server/guild) visible to this shard
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Community {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Deliver a private message to a user
    async fn send_direct(&self, user_id: &str, message: &str) -> Result<(), TrackerError>;

    /// Post a status line into a project's conversation thread
    async fn post_to_thread(&self, thread_handle: &str, message: &str) -> Result<(), TrackerError>;

    /// Communities served by this shard
    async fn communities(&self) -> Result<Vec<Community>, TrackerError>;
}

#[derive(Serialize)]
struct MessageBody<'a> {
    content: &'a str,
}

/// Adapter speaking JSON over HTTP to a chat gateway
///
/// User ids and thread handles are sent as single percent-encoded path
/// segments.
pub struct GatewayChatAdapter {
    base_url: Url,
    client: reqwest::Client,
}

impl GatewayChatAdapter {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrackerError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = base_url.into();
        let base_url = Url::parse(&base_url)
            .map_err(|e| TrackerError::Config(format!("invalid chat gateway URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(TrackerError::Config(format!("chat gateway URL {} cannot carry a path", base_url)));
        }

        Ok(Self { base_url, client })
    }

    /// Base URL with `segments` appended, each one encoded on its own
    fn endpoint(&self, segments: &[&str]) -> Result<Url, TrackerError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TrackerError::Config(format!("chat gateway URL {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post_message(&self, url: Url, message: &str) -> Result<(), TrackerError> {
        let response = self
            .client
            .post(url.clone())
            .json(&MessageBody { content: message })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TrackerError::Timeout(url.to_string())
                } else {
                    TrackerError::Delivery(format!("{}: {}", url, e))
                }
            })?;

        if !response.status().is_success() {
            return Err(TrackerError::Delivery(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatAdapter for GatewayChatAdapter {
    async fn send_direct(&self, user_id: &str, message: &str) -> Result<(), TrackerError> {
        let url = self.endpoint(&["users", user_id, "messages"])?;
        self.post_message(url, message).await
    }

    async fn post_to_thread(&self, thread_handle: &str, message: &str) -> Result<(), TrackerError> {
        let url = self.endpoint(&["threads", thread_handle, "messages"])?;
        self.post_message(url, message).await
    }

    async fn communities(&self) -> Result<Vec<Community>, TrackerError> {
        let url = self.endpoint(&["communities"])?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TrackerError::Connection(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(TrackerError::Connection(format!("{} returned {}", url, response.status())));
        }

        response
            .json()
            .await
            .map_err(|e| TrackerError::Connection(format!("Invalid communities response: {}", e)))
    }
}

/// Adapter used when no gateway is configured: messages are only logged
#[derive(Debug, Default)]
pub struct LogChatAdapter;

#[async_trait]
impl ChatAdapter for LogChatAdapter {
    async fn send_direct(&self, user_id: &str, message: &str) -> Result<(), TrackerError> {
        info!(user_id, message, "Direct message");
        Ok(())
    }

    async fn post_to_thread(&self, thread_handle: &str, message: &str) -> Result<(), TrackerError> {
        info!(thread = thread_handle, message, "Thread post");
        Ok(())
    }

    async fn communities(&self) -> Result<Vec<Community>, TrackerError> {
        debug!("No chat gateway, reporting no communities");
        Ok(Vec::new())
    }
}
