//! In-memory fakes for the collaborator traits, with call counters.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use burstcast_core::{
    BurstError, ButtonState, ChannelInfo, ChannelKind, EndpointIdentity, EndpointListing,
    InteractionUI, Member, MessagingClient, RateLimitCallback, RateLimitSignal, Result,
    RoleMembership,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub endpoint_id: String,
    pub sub_target: Option<String>,
    pub content: String,
}

#[derive(Default)]
struct PlatformState {
    channels: Vec<ChannelInfo>,
    listings: Vec<EndpointListing>,
    hidden: HashMap<String, usize>,
    failing_creates: HashSet<String>,
    fail_listing: bool,
    send_failures: HashMap<String, usize>,
    send_attempts: HashMap<String, usize>,
    sends: Vec<SentMessage>,
    list_delay: Duration,
    send_delay: Duration,
    next_id: u64,
    created_endpoints: usize,
    created_sub_targets: usize,
    deleted_endpoints: usize,
    archived_sub_targets: usize,
    deleted_sub_targets: usize,
    list_endpoint_calls: usize,
}

impl PlatformState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn group_of(&self, channel_id: &str) -> Option<String> {
        self.channels
            .iter()
            .find(|c| c.id == channel_id)
            .map(|c| c.group_id.clone())
    }
}

/// Fake chat platform: channels, endpoint listings, sends.
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, group: &str, id: &str, name: &str, kind: ChannelKind, parent: Option<&str>) {
        lock(&self.state).channels.push(ChannelInfo {
            id: id.into(),
            name: name.into(),
            group_id: group.into(),
            kind,
            parent_id: parent.map(str::to_string),
        });
    }

    pub fn add_channel(&self, group: &str, id: &str, name: &str, parent: Option<&str>) {
        self.add(group, id, name, ChannelKind::Text, parent);
    }

    pub fn add_category(&self, group: &str, id: &str, name: &str) {
        self.add(group, id, name, ChannelKind::Category, None);
    }

    pub fn add_sub_target(&self, group: &str, channel: &str, id: &str, name: &str) {
        self.add(group, id, name, ChannelKind::SubTarget, Some(channel));
    }

    /// Pre-existing endpoint; `token: None` models one owned by another app.
    pub fn seed_endpoint(&self, _group: &str, channel: &str, name: &str, token: Option<&str>) {
        let mut state = lock(&self.state);
        let id = state.next_id("seed");
        state.listings.push(EndpointListing {
            id,
            channel_id: channel.into(),
            name: name.into(),
            token: token.map(str::to_string),
        });
    }

    pub fn set_list_delay(&self, delay: Duration) {
        lock(&self.state).list_delay = delay;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        lock(&self.state).send_delay = delay;
    }

    pub fn fail_creates_in(&self, channel: &str) {
        lock(&self.state).failing_creates.insert(channel.into());
    }

    pub fn fail_listing(&self, fail: bool) {
        lock(&self.state).fail_listing = fail;
    }

    /// `resolve_channel` reports the channel missing for the next `calls` lookups.
    pub fn hide_channel_for(&self, channel: &str, calls: usize) {
        lock(&self.state).hidden.insert(channel.into(), calls);
    }

    /// Fail the next `failures` sends via `endpoint_id`; `usize::MAX` fails forever.
    pub fn fail_sends_via(&self, endpoint_id: &str, failures: usize) {
        lock(&self.state).send_failures.insert(endpoint_id.into(), failures);
    }

    pub fn created_endpoints(&self) -> usize {
        lock(&self.state).created_endpoints
    }

    pub fn created_sub_targets(&self) -> usize {
        lock(&self.state).created_sub_targets
    }

    pub fn deleted_endpoints(&self) -> usize {
        lock(&self.state).deleted_endpoints
    }

    /// `(archived, deleted)` sub-target counts.
    pub fn retired_sub_targets(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.archived_sub_targets, state.deleted_sub_targets)
    }

    pub fn list_endpoint_calls(&self) -> usize {
        lock(&self.state).list_endpoint_calls
    }

    pub fn sends(&self) -> Vec<SentMessage> {
        lock(&self.state).sends.clone()
    }

    pub fn send_attempts_via(&self, endpoint_id: &str) -> usize {
        lock(&self.state)
            .send_attempts
            .get(endpoint_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingClient for FakePlatform {
    async fn list_endpoints(&self, group_id: &str) -> Result<Vec<EndpointListing>> {
        let delay = {
            let mut state = lock(&self.state);
            state.list_endpoint_calls += 1;
            state.list_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = lock(&self.state);
        if state.fail_listing {
            return Err(BurstError::CacheFetch("listing unavailable".into()));
        }
        Ok(state
            .listings
            .iter()
            .filter(|l| state.group_of(&l.channel_id).as_deref() == Some(group_id))
            .cloned()
            .collect())
    }

    async fn create_endpoint(&self, channel_id: &str, name: &str) -> Result<EndpointIdentity> {
        let mut state = lock(&self.state);
        if state.failing_creates.contains(channel_id) {
            return Err(BurstError::Provisioning(format!("creation refused in {channel_id}")));
        }
        let id = state.next_id("wh");
        let token = format!("tok-{id}");
        state.listings.push(EndpointListing {
            id: id.clone(),
            channel_id: channel_id.into(),
            name: name.into(),
            token: Some(token.clone()),
        });
        state.created_endpoints += 1;
        Ok(EndpointIdentity { id, token })
    }

    async fn delete_endpoint(&self, endpoint_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.listings.retain(|l| l.id != endpoint_id);
        state.deleted_endpoints += 1;
        Ok(())
    }

    async fn send(
        &self,
        endpoint: &EndpointIdentity,
        sub_target_id: Option<&str>,
        content: &str,
    ) -> Result<()> {
        let delay = {
            let mut state = lock(&self.state);
            *state.send_attempts.entry(endpoint.id.clone()).or_default() += 1;
            if let Some(remaining) = state.send_failures.get_mut(&endpoint.id) {
                if *remaining > 0 {
                    if *remaining != usize::MAX {
                        *remaining -= 1;
                    }
                    return Err(BurstError::Send(format!("send via {} refused", endpoint.id)));
                }
            }
            state.send_delay
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        lock(&self.state).sends.push(SentMessage {
            endpoint_id: endpoint.id.clone(),
            sub_target: sub_target_id.map(str::to_string),
            content: content.into(),
        });
        Ok(())
    }

    async fn create_sub_target(&self, channel_id: &str, name: &str) -> Result<String> {
        let mut state = lock(&self.state);
        let group = state
            .group_of(channel_id)
            .ok_or_else(|| BurstError::NotFound(channel_id.into()))?;
        let id = state.next_id("thread");
        state.channels.push(ChannelInfo {
            id: id.clone(),
            name: name.into(),
            group_id: group,
            kind: ChannelKind::SubTarget,
            parent_id: Some(channel_id.into()),
        });
        state.created_sub_targets += 1;
        Ok(id)
    }

    async fn archive_or_delete_sub_target(&self, sub_target_id: &str, delete: bool) -> Result<()> {
        let mut state = lock(&self.state);
        if delete {
            state.channels.retain(|c| c.id != sub_target_id);
            state.deleted_sub_targets += 1;
        } else {
            state.archived_sub_targets += 1;
        }
        Ok(())
    }

    async fn list_children(&self, group_id: &str) -> Result<Vec<ChannelInfo>> {
        let state = lock(&self.state);
        if state.fail_listing {
            return Err(BurstError::CacheFetch("children unavailable".into()));
        }
        Ok(state
            .channels
            .iter()
            .filter(|c| c.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn resolve_channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>> {
        let mut state = lock(&self.state);
        if let Some(remaining) = state.hidden.get_mut(channel_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(None);
            }
        }
        Ok(state.channels.iter().find(|c| c.id == channel_id).cloned())
    }
}

/// A posted vote panel.
#[derive(Debug, Clone)]
pub struct PostedPanel {
    pub message_id: String,
    pub location_id: String,
    pub text: String,
    pub button: ButtonState,
}

#[derive(Default)]
struct UiState {
    posts: Vec<PostedPanel>,
    updates: Vec<(String, ButtonState)>,
    deleted: Vec<String>,
    post_failures: usize,
    post_attempts: usize,
    next_id: u64,
}

/// Fake panel widget host.
#[derive(Default)]
pub struct FakeUi {
    state: Mutex<UiState>,
}

impl FakeUi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` posts; `usize::MAX` fails forever.
    pub fn fail_posts(&self, n: usize) {
        lock(&self.state).post_failures = n;
    }

    pub fn posts(&self) -> Vec<PostedPanel> {
        lock(&self.state).posts.clone()
    }

    pub fn post_attempts(&self) -> usize {
        lock(&self.state).post_attempts
    }

    pub fn updates(&self) -> Vec<(String, ButtonState)> {
        lock(&self.state).updates.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }
}

#[async_trait]
impl InteractionUI for FakeUi {
    async fn post_panel(
        &self,
        _endpoint: &EndpointIdentity,
        location_id: &str,
        text: &str,
        button: ButtonState,
    ) -> Result<String> {
        let mut state = lock(&self.state);
        state.post_attempts += 1;
        if state.post_failures > 0 {
            if state.post_failures != usize::MAX {
                state.post_failures -= 1;
            }
            return Err(BurstError::VotePost("panel rejected".into()));
        }
        state.next_id += 1;
        let message_id = format!("panel-{}", state.next_id);
        state.posts.push(PostedPanel {
            message_id: message_id.clone(),
            location_id: location_id.into(),
            text: text.into(),
            button,
        });
        Ok(message_id)
    }

    async fn update_panel(
        &self,
        _endpoint: &EndpointIdentity,
        message_id: &str,
        button: ButtonState,
    ) -> Result<()> {
        lock(&self.state).updates.push((message_id.into(), button));
        Ok(())
    }

    async fn delete_panel(
        &self,
        _endpoint: &EndpointIdentity,
        _location_id: &str,
        message_id: &str,
    ) -> Result<()> {
        lock(&self.state).deleted.push(message_id.into());
        Ok(())
    }
}

/// Fake member directory, paged by id.
#[derive(Default)]
pub struct FakeMembership {
    members: Mutex<Vec<Member>>,
    pages: AtomicUsize,
    panics: AtomicUsize,
}

impl FakeMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, id: &str, roles: &[&str], bot: bool) {
        let mut members = lock(&self.members);
        members.push(Member {
            id: id.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            bot,
        });
        members.sort_by(|a, b| a.id.cmp(&b.id));
    }

    /// `count` human members `m00..` holding `role`.
    pub fn with_voters(count: usize, role: &str) -> Self {
        let membership = Self::new();
        for i in 0..count {
            membership.add_member(&format!("m{i:02}"), &[role], false);
        }
        membership
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages.load(Ordering::SeqCst)
    }

    /// The next `calls` listings panic, modelling a crashing collaborator.
    pub fn panic_on_next_lists(&self, calls: usize) {
        self.panics.store(calls, Ordering::SeqCst);
    }
}

#[async_trait]
impl RoleMembership for FakeMembership {
    async fn list_members(
        &self,
        _group_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Member>> {
        let armed = self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            panic!("member directory crashed");
        }
        self.pages.fetch_add(1, Ordering::SeqCst);
        let members = lock(&self.members);
        Ok(members
            .iter()
            .filter(|m| after.is_none_or(|a| m.id.as_str() > a))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Fake rate-limit signal source.
#[derive(Default)]
pub struct FakeSignal {
    callbacks: Mutex<Vec<RateLimitCallback>>,
}

impl FakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        let callbacks: Vec<RateLimitCallback> = lock(&self.callbacks).clone();
        for cb in callbacks {
            cb();
        }
    }
}

impl RateLimitSignal for FakeSignal {
    fn subscribe(&self, callback: RateLimitCallback) {
        lock(&self.callbacks).push(callback);
    }
}

/// Poll `cond` every few milliseconds, panicking after five seconds.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
