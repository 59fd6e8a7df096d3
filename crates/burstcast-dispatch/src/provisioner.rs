//! Endpoint provisioning — discovers or creates the delivery endpoints and
//! sub-targets a target dispatches through.
//!
//! The provider's endpoint listing is fetched once per owning group and
//! cached with a TTL. Each group has its own fetch lock, so concurrent
//! `prepare` calls for the same group collapse into a single fetch.
//! Creation and deletion go through the shared [`ProvisioningLimiter`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use burstcast_core::config::{ErasePolicy, ProvisioningTunables};
use burstcast_core::{
    BurstError, ChannelInfo, ChannelKind, EndpointIdentity, EndpointListing, MessagingClient,
    Result, TargetConfig, TargetKind,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::executor::sleep_or_cancel;
use crate::limits::ProvisioningLimiter;

/// Endpoints and sub-targets prepared for one concrete channel.
#[derive(Debug, Clone)]
pub struct ChannelPool {
    pub channel_id: String,
    pub group_id: String,
    pub endpoints: Vec<EndpointIdentity>,
    pub sub_targets: Arc<Vec<String>>,
}

/// One endpoint plus the sub-targets it fans out to.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub channel_id: String,
    pub endpoint: EndpointIdentity,
    pub sub_targets: Arc<Vec<String>>,
}

/// Everything a dispatch session sends through. Never persisted.
#[derive(Debug, Clone)]
pub struct EndpointPool {
    pub target_id: String,
    pub channels: Vec<ChannelPool>,
    built_at: Instant,
}

impl EndpointPool {
    pub fn new(target_id: &str, channels: Vec<ChannelPool>) -> Self {
        Self {
            target_id: target_id.to_string(),
            channels,
            built_at: Instant::now(),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.channels.iter().map(|c| c.endpoints.len()).sum()
    }

    pub fn sub_target_count(&self) -> usize {
        self.channels.iter().map(|c| c.sub_targets.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoint_count() == 0
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.built_at.elapsed() < ttl
    }

    /// Flattened endpoint list, copied into `buf` (cleared first).
    pub fn fill_entries(&self, buf: &mut Vec<PoolEntry>) {
        buf.clear();
        for channel in &self.channels {
            for endpoint in &channel.endpoints {
                buf.push(PoolEntry {
                    channel_id: channel.channel_id.clone(),
                    endpoint: endpoint.clone(),
                    sub_targets: channel.sub_targets.clone(),
                });
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    by_channel: HashMap<String, Vec<EndpointListing>>,
    fetched_at: Instant,
}

#[derive(Default)]
struct GroupCache {
    entry: RwLock<Option<Arc<CacheEntry>>>,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl GroupCache {
    fn fresh(&self, ttl: Duration) -> Option<Arc<CacheEntry>> {
        let guard = match self.entry.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .as_ref()
            .filter(|e| e.fetched_at.elapsed() < ttl)
            .cloned()
    }

    fn store(&self, entry: Option<Arc<CacheEntry>>) {
        let mut guard = match self.entry.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = entry;
    }

    /// Copy-on-write insert of a freshly created endpoint.
    fn remember(&self, listing: EndpointListing) {
        let mut guard = match self.entry.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(current) = guard.as_ref() {
            let mut next = CacheEntry::clone(current);
            next.by_channel
                .entry(listing.channel_id.clone())
                .or_default()
                .push(listing);
            *guard = Some(Arc::new(next));
        }
    }
}

/// Discovers, creates and retires endpoints and sub-targets.
pub struct EndpointProvisioner {
    client: Arc<dyn MessagingClient>,
    limiter: ProvisioningLimiter,
    tunables: ProvisioningTunables,
    groups: Mutex<HashMap<String, Arc<GroupCache>>>,
    fetches: AtomicU64,
}

impl EndpointProvisioner {
    pub fn new(
        client: Arc<dyn MessagingClient>,
        limiter: ProvisioningLimiter,
        tunables: ProvisioningTunables,
    ) -> Self {
        Self {
            client,
            limiter,
            tunables,
            groups: Mutex::new(HashMap::new()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Number of bulk listing fetches issued so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn group(&self, group_id: &str) -> Arc<GroupCache> {
        let mut groups = match self.groups.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        groups.entry(group_id.to_string()).or_default().clone()
    }

    /// Drop a group's cached listing; the next lookup refetches.
    pub fn invalidate(&self, group_id: &str) {
        self.group(group_id).store(None);
    }

    /// Build the endpoint pool for a target.
    ///
    /// Channels that yield no endpoint are skipped; the call fails only when
    /// nothing at all could be prepared, a bulk listing fetch failed or
    /// `cancel` fired while waiting on visibility or the provisioning limiter.
    pub async fn prepare(&self, target: &TargetConfig, cancel: &CancellationToken) -> Result<EndpointPool> {
        let root = self.await_channel(&target.id, cancel).await?;

        let needs_children = target.kind == TargetKind::Category || target.sub_target_count > 0;
        let children = if needs_children {
            self.client.list_children(&root.group_id).await.map_err(|e| {
                BurstError::CacheFetch(format!("children of group {}: {e}", root.group_id))
            })?
        } else {
            Vec::new()
        };

        let mut channels: Vec<ChannelInfo> = match target.kind {
            TargetKind::Channel => vec![root.clone()],
            TargetKind::Category => children
                .iter()
                .filter(|c| c.kind == ChannelKind::Text && c.parent_id.as_deref() == Some(root.id.as_str()))
                .cloned()
                .collect(),
        };
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        if channels.is_empty() {
            return Err(BurstError::Provisioning(format!(
                "category '{}' has no text channels",
                target.name
            )));
        }

        let mut pools = Vec::with_capacity(channels.len());
        for channel in &channels {
            match self
                .build_channel_pool(channel, target.sub_target_count, &children, cancel)
                .await
            {
                Ok(Some(pool)) => pools.push(pool),
                Ok(None) => {}
                Err(e @ (BurstError::CacheFetch(_) | BurstError::Cancelled)) => return Err(e),
                Err(e) => {
                    tracing::warn!("⚠️ Skipping channel {} of '{}': {e}", channel.id, target.name);
                }
            }
        }

        if pools.is_empty() {
            return Err(BurstError::Provisioning(format!(
                "no endpoint could be obtained for '{}'",
                target.name
            )));
        }

        let pool = EndpointPool::new(&target.id, pools);
        tracing::info!(
            "🧰 Prepared '{}': {} channel(s), {} endpoint(s), {} sub-target(s)",
            target.name,
            pool.channels.len(),
            pool.endpoint_count(),
            pool.sub_target_count()
        );
        Ok(pool)
    }

    /// Wait for a just-configured channel to appear in the local view.
    async fn await_channel(&self, channel_id: &str, cancel: &CancellationToken) -> Result<ChannelInfo> {
        let attempts = self.tunables.parent_wait_attempts.max(1);
        for attempt in 1..=attempts {
            match self.client.resolve_channel(channel_id).await {
                Ok(Some(channel)) => return Ok(channel),
                Ok(None) => {}
                Err(e) => tracing::debug!("resolve {channel_id} (attempt {attempt}): {e}"),
            }
            if attempt < attempts && !sleep_or_cancel(self.tunables.parent_wait(), cancel).await {
                return Err(BurstError::Cancelled);
            }
        }
        Err(BurstError::NotFound(format!(
            "channel {channel_id} not visible after {attempts} attempts"
        )))
    }

    /// Cached endpoint listing for a group, fetched at most once per TTL.
    async fn group_listing(&self, group_id: &str) -> Result<Arc<CacheEntry>> {
        let ttl = self.tunables.cache_ttl();
        let group = self.group(group_id);
        if let Some(entry) = group.fresh(ttl) {
            return Ok(entry);
        }

        let _fetching = group.fetch_lock.lock().await;
        // another caller may have filled it while we waited
        if let Some(entry) = group.fresh(ttl) {
            return Ok(entry);
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let listings = self
            .client
            .list_endpoints(group_id)
            .await
            .map_err(|e| BurstError::CacheFetch(format!("endpoints of group {group_id}: {e}")))?;

        let mut by_channel: HashMap<String, Vec<EndpointListing>> = HashMap::new();
        for listing in listings {
            by_channel.entry(listing.channel_id.clone()).or_default().push(listing);
        }
        let entry = Arc::new(CacheEntry {
            by_channel,
            fetched_at: Instant::now(),
        });
        group.store(Some(entry.clone()));
        tracing::debug!("📦 Cached endpoint listing for group {group_id}");
        Ok(entry)
    }

    async fn create_endpoint(
        &self,
        channel: &ChannelInfo,
        cancel: &CancellationToken,
    ) -> Result<EndpointIdentity> {
        let name = self.tunables.endpoint_name.as_str();
        let endpoint = self
            .limiter
            .run(cancel, || self.client.create_endpoint(&channel.id, name))
            .await
            .map_err(|e| match e {
                BurstError::Cancelled => e,
                e => BurstError::Provisioning(format!("create endpoint in {}: {e}", channel.id)),
            })?;

        self.group(&channel.group_id).remember(EndpointListing {
            id: endpoint.id.clone(),
            channel_id: channel.id.clone(),
            name: name.to_string(),
            token: Some(endpoint.token.clone()),
        });
        Ok(endpoint)
    }

    async fn build_channel_pool(
        &self,
        channel: &ChannelInfo,
        sub_target_count: usize,
        children: &[ChannelInfo],
        cancel: &CancellationToken,
    ) -> Result<Option<ChannelPool>> {
        let wanted = self.tunables.endpoints_per_channel;
        let listing = self.group_listing(&channel.group_id).await?;

        let mut endpoints: Vec<EndpointIdentity> = listing
            .by_channel
            .get(&channel.id)
            .map(|found| {
                found
                    .iter()
                    .filter(|l| l.name == self.tunables.endpoint_name)
                    .filter_map(EndpointListing::identity)
                    .take(wanted)
                    .collect()
            })
            .unwrap_or_default();
        let reused = endpoints.len();

        while endpoints.len() < wanted {
            match self.create_endpoint(channel, cancel).await {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(BurstError::Cancelled) => return Err(BurstError::Cancelled),
                Err(e) => {
                    tracing::warn!("⚠️ {e}");
                    break;
                }
            }
        }

        if endpoints.is_empty() {
            tracing::warn!("⚠️ No endpoint available in channel {}, skipping", channel.id);
            return Ok(None);
        }
        tracing::debug!(
            "🔗 Channel {}: {} reused, {} created",
            channel.id,
            reused,
            endpoints.len() - reused
        );

        let sub_targets = if sub_target_count > 0 {
            self.provision_sub_targets(channel, sub_target_count, children, cancel).await
        } else {
            Vec::new()
        };

        Ok(Some(ChannelPool {
            channel_id: channel.id.clone(),
            group_id: channel.group_id.clone(),
            endpoints,
            sub_targets: Arc::new(sub_targets),
        }))
    }

    /// Reuse sub-targets with the expected name, creating the rest.
    async fn provision_sub_targets(
        &self,
        channel: &ChannelInfo,
        wanted: usize,
        children: &[ChannelInfo],
        cancel: &CancellationToken,
    ) -> Vec<String> {
        let name = self.tunables.sub_target_name.as_str();
        let mut ids: Vec<String> = children
            .iter()
            .filter(|c| {
                c.kind == ChannelKind::SubTarget
                    && c.parent_id.as_deref() == Some(channel.id.as_str())
                    && c.name == name
            })
            .map(|c| c.id.clone())
            .take(wanted)
            .collect();

        while ids.len() < wanted {
            match self
                .limiter
                .run(cancel, || self.client.create_sub_target(&channel.id, name))
                .await
            {
                Ok(id) => ids.push(id),
                Err(BurstError::Cancelled) => break,
                Err(e) => {
                    tracing::warn!("⚠️ Sub-target creation failed in {}: {e}", channel.id);
                    break;
                }
            }
        }
        ids
    }

    /// Endpoint used to post vote panels in `location_id`.
    pub async fn posting_endpoint(
        &self,
        location_id: &str,
        cancel: &CancellationToken,
    ) -> Result<EndpointIdentity> {
        let channel = self.await_channel(location_id, cancel).await?;
        let listing = self.group_listing(&channel.group_id).await?;
        let existing = listing.by_channel.get(&channel.id).and_then(|found| {
            found
                .iter()
                .filter(|l| l.name == self.tunables.endpoint_name)
                .find_map(EndpointListing::identity)
        });
        match existing {
            Some(endpoint) => Ok(endpoint),
            None => self.create_endpoint(&channel, cancel).await,
        }
    }

    /// Release a pool's provider-side resources according to `policy`.
    /// Failures are logged; returns how many calls failed.
    pub async fn retire(&self, pool: &EndpointPool, policy: ErasePolicy) -> usize {
        let delete = policy == ErasePolicy::Delete;
        let never = CancellationToken::new();
        let mut failures = 0;
        for channel in &pool.channels {
            for sub in channel.sub_targets.iter() {
                if let Err(e) = self
                    .limiter
                    .run(&never, || self.client.archive_or_delete_sub_target(sub, delete))
                    .await
                {
                    tracing::warn!("⚠️ Could not retire sub-target {sub}: {e}");
                    failures += 1;
                }
            }
            if delete {
                for endpoint in &channel.endpoints {
                    if let Err(e) = self
                        .limiter
                        .run(&never, || self.client.delete_endpoint(&endpoint.id))
                        .await
                    {
                        tracing::warn!("⚠️ Could not delete endpoint {}: {e}", endpoint.id);
                        failures += 1;
                    }
                }
                self.invalidate(&channel.group_id);
            }
        }
        tracing::info!(
            "🧹 Retired pool of {} ({:?}, {} failure(s))",
            pool.target_id,
            policy,
            failures
        );
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::FakePlatform;

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    fn tunables() -> ProvisioningTunables {
        ProvisioningTunables {
            endpoints_per_channel: 3,
            create_pace_ms: 0,
            parent_wait_attempts: 3,
            parent_wait_ms: 5,
            ..ProvisioningTunables::default()
        }
    }

    fn provisioner(platform: &Arc<FakePlatform>) -> EndpointProvisioner {
        EndpointProvisioner::new(
            platform.clone(),
            ProvisioningLimiter::new(Duration::ZERO),
            tunables(),
        )
    }

    #[tokio::test]
    async fn test_creates_missing_endpoints_then_reuses() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_channel("g1", "c1", "general", None);
        let prov = provisioner(&platform);
        let target = TargetConfig::channel("c1", "general", "ping");

        let pool = prov.prepare(&target, &never()).await.unwrap();
        assert_eq!(pool.endpoint_count(), 3);
        assert_eq!(platform.created_endpoints(), 3);

        prov.invalidate("g1");
        let again = prov.prepare(&target, &never()).await.unwrap();
        assert_eq!(again.endpoint_count(), 3);
        assert_eq!(platform.created_endpoints(), 3);
        assert_eq!(prov.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_foreign_endpoints_ignored() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_channel("g1", "c1", "general", None);
        platform.seed_endpoint("g1", "c1", "someone-else", Some("tok"));
        platform.seed_endpoint("g1", "c1", "burstcast", None);
        let prov = provisioner(&platform);

        let pool = prov.prepare(&TargetConfig::channel("c1", "general", "ping"), &never()).await.unwrap();
        assert_eq!(pool.endpoint_count(), 3);
        assert_eq!(platform.created_endpoints(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_prepare_fetches_group_once() {
        let platform = Arc::new(FakePlatform::new());
        platform.set_list_delay(Duration::from_millis(30));
        for i in 0..6 {
            platform.add_channel("g1", &format!("c{i}"), &format!("chan-{i}"), None);
        }
        let prov = Arc::new(provisioner(&platform));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let prov = prov.clone();
                tokio::spawn(async move {
                    let target = TargetConfig::channel(&format!("c{i}"), &format!("chan-{i}"), "x");
                    prov.prepare(&target, &never()).await.map(|p| p.endpoint_count())
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 3);
        }
        assert_eq!(platform.list_endpoint_calls(), 1);
        assert_eq!(prov.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_category_aggregates_children() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_category("g1", "cat", "raids");
        platform.add_channel("g1", "a", "alpha", Some("cat"));
        platform.add_channel("g1", "b", "beta", Some("cat"));
        platform.add_channel("g1", "z", "elsewhere", None);
        let prov = provisioner(&platform);

        let mut target = TargetConfig::channel("cat", "raids", "ping");
        target.kind = TargetKind::Category;
        let pool = prov.prepare(&target, &never()).await.unwrap();
        let ids: Vec<_> = pool.channels.iter().map(|c| c.channel_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(pool.endpoint_count(), 6);
    }

    #[tokio::test]
    async fn test_channel_without_endpoints_is_skipped() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_category("g1", "cat", "raids");
        platform.add_channel("g1", "a", "alpha", Some("cat"));
        platform.add_channel("g1", "b", "beta", Some("cat"));
        platform.fail_creates_in("b");
        let prov = provisioner(&platform);

        let mut target = TargetConfig::channel("cat", "raids", "ping");
        target.kind = TargetKind::Category;
        let pool = prov.prepare(&target, &never()).await.unwrap();
        assert_eq!(pool.channels.len(), 1);
        assert_eq!(pool.channels[0].channel_id, "a");
    }

    #[tokio::test]
    async fn test_all_channels_failing_is_an_error() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_channel("g1", "c1", "general", None);
        platform.fail_creates_in("c1");
        let prov = provisioner(&platform);
        let err = prov.prepare(&TargetConfig::channel("c1", "general", "x"), &never()).await.unwrap_err();
        assert!(matches!(err, BurstError::Provisioning(_)));
    }

    #[tokio::test]
    async fn test_listing_failure_propagates() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_channel("g1", "c1", "general", None);
        platform.fail_listing(true);
        let prov = provisioner(&platform);
        let err = prov.prepare(&TargetConfig::channel("c1", "general", "x"), &never()).await.unwrap_err();
        assert!(matches!(err, BurstError::CacheFetch(_)));
    }

    #[tokio::test]
    async fn test_waits_for_channel_visibility() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_channel("g1", "c1", "general", None);
        platform.hide_channel_for("c1", 2);
        let prov = provisioner(&platform);
        assert!(prov.prepare(&TargetConfig::channel("c1", "general", "x"), &never()).await.is_ok());

        let err = prov.prepare(&TargetConfig::channel("ghost", "ghost", "x"), &never()).await.unwrap_err();
        assert!(matches!(err, BurstError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_visibility_wait_stops_on_cancel() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_channel("g1", "c1", "general", None);
        platform.hide_channel_for("c1", 100);
        let prov = Arc::new(EndpointProvisioner::new(
            platform.clone(),
            ProvisioningLimiter::new(Duration::ZERO),
            ProvisioningTunables {
                parent_wait_attempts: 10,
                parent_wait_ms: 60_000,
                ..tunables()
            },
        ));

        let cancel = CancellationToken::new();
        let preparing = {
            let (prov, cancel) = (prov.clone(), cancel.clone());
            tokio::spawn(async move {
                prov.prepare(&TargetConfig::channel("c1", "general", "x"), &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let out = tokio::time::timeout(Duration::from_secs(1), preparing).await.unwrap().unwrap();
        assert!(matches!(out, Err(BurstError::Cancelled)));
        assert_eq!(platform.created_endpoints(), 0);
    }

    #[tokio::test]
    async fn test_sub_targets_reused_before_created() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_channel("g1", "c1", "general", None);
        platform.add_sub_target("g1", "c1", "t-old", "burstcast-thread");
        platform.add_sub_target("g1", "c1", "t-other", "unrelated");
        let prov = provisioner(&platform);

        let mut target = TargetConfig::channel("c1", "general", "x");
        target.sub_target_count = 3;
        let pool = prov.prepare(&target, &never()).await.unwrap();
        let subs = &pool.channels[0].sub_targets;
        assert_eq!(subs.len(), 3);
        assert_eq!(subs[0], "t-old");
        assert_eq!(platform.created_sub_targets(), 2);
    }

    #[tokio::test]
    async fn test_retire_with_delete_policy() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_channel("g1", "c1", "general", None);
        let prov = provisioner(&platform);
        let mut target = TargetConfig::channel("c1", "general", "x");
        target.sub_target_count = 2;
        let pool = prov.prepare(&target, &never()).await.unwrap();

        assert_eq!(prov.retire(&pool, ErasePolicy::Delete).await, 0);
        assert_eq!(platform.deleted_endpoints(), 3);
        assert_eq!(platform.retired_sub_targets(), (0, 2));
    }

    #[tokio::test]
    async fn test_posting_endpoint_created_once() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_channel("g1", "votes", "votes", None);
        let prov = provisioner(&platform);
        let first = prov.posting_endpoint("votes", &never()).await.unwrap();
        let second = prov.posting_endpoint("votes", &never()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(platform.created_endpoints(), 1);
    }
}
