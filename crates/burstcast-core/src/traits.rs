//! Collaborator traits consumed by the dispatch engine.
//!
//! The chat platform's gateway/REST protocol and its UI widgets live behind
//! these traits; the engine never speaks the wire protocol itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    ButtonState, ChannelInfo, EndpointIdentity, EndpointListing, Member, TargetConfig,
};

/// Durable key/value store of target configuration and the running flag.
///
/// Calls are short and synchronous; implementations must not block on the
/// network.
pub trait ConfigStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<TargetConfig>>;
    fn list(&self) -> Result<HashMap<String, TargetConfig>>;
    fn upsert(&self, id: &str, config: &TargetConfig) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
    fn set_running(&self, id: &str, running: bool) -> Result<()>;
}

/// Remote messaging platform operations.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Full endpoint listing for an owning group.
    async fn list_endpoints(&self, group_id: &str) -> Result<Vec<EndpointListing>>;

    async fn create_endpoint(&self, channel_id: &str, name: &str) -> Result<EndpointIdentity>;

    async fn delete_endpoint(&self, endpoint_id: &str) -> Result<()>;

    /// Deliver `content` through `endpoint`, into `sub_target_id` when given.
    async fn send(
        &self,
        endpoint: &EndpointIdentity,
        sub_target_id: Option<&str>,
        content: &str,
    ) -> Result<()>;

    async fn create_sub_target(&self, channel_id: &str, name: &str) -> Result<String>;

    async fn archive_or_delete_sub_target(&self, sub_target_id: &str, delete: bool) -> Result<()>;

    /// Every channel and sub-target of a group.
    async fn list_children(&self, group_id: &str) -> Result<Vec<ChannelInfo>>;

    /// Local view of a channel; `None` while it is not yet visible.
    async fn resolve_channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>>;
}

/// Vote panel widget operations.
#[async_trait]
pub trait InteractionUI: Send + Sync {
    /// Post a panel with a vote button, returning its message id.
    async fn post_panel(
        &self,
        endpoint: &EndpointIdentity,
        location_id: &str,
        text: &str,
        button: ButtonState,
    ) -> Result<String>;

    async fn update_panel(
        &self,
        endpoint: &EndpointIdentity,
        message_id: &str,
        button: ButtonState,
    ) -> Result<()>;

    async fn delete_panel(
        &self,
        endpoint: &EndpointIdentity,
        location_id: &str,
        message_id: &str,
    ) -> Result<()>;
}

/// Group membership lookups.
#[async_trait]
pub trait RoleMembership: Send + Sync {
    /// One page of members, ordered by id, starting after `after`.
    async fn list_members(
        &self,
        group_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Member>>;

    /// Human members holding `role_id`, paginating the whole member list.
    async fn count_eligible(&self, group_id: &str, role_id: &str, page_size: usize) -> Result<u64> {
        let page_size = page_size.max(1);
        let mut count = 0u64;
        let mut after: Option<String> = None;
        loop {
            let page = self.list_members(group_id, after.as_deref(), page_size).await?;
            count += page
                .iter()
                .filter(|m| !m.bot && m.roles.iter().any(|r| r == role_id))
                .count() as u64;
            if page.len() < page_size {
                break;
            }
            after = page.last().map(|m| m.id.clone());
        }
        Ok(count)
    }
}

/// Callback the messaging layer invokes on every rate-limit violation.
pub type RateLimitCallback = Arc<dyn Fn() + Send + Sync>;

/// Source of rate-limit-exceeded signals.
pub trait RateLimitSignal: Send + Sync {
    fn subscribe(&self, callback: RateLimitCallback);
}
