//! Burstcast configuration system.
//!
//! Every numeric range that varied between deployments (jitter, round counts,
//! cycle delays) is a tunable here. Defaults use the widest ranges observed
//! in production.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BurstError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BurstcastConfig {
    #[serde(default)]
    pub dispatch: DispatchTunables,
    #[serde(default)]
    pub provisioning: ProvisioningTunables,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub vote: VoteTunables,
    #[serde(default)]
    pub store: StoreConfig,
}

impl BurstcastConfig {
    /// Load config from the default path (~/.burstcast/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BurstError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| BurstError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| BurstError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Burstcast home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".burstcast")
    }

    /// Reject inverted ranges and zero capacities.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        check_range("dispatch.rounds", d.rounds_min, d.rounds_max)?;
        check_range("dispatch.cycle_delay_secs", d.cycle_delay_min_secs, d.cycle_delay_max_secs)?;
        check_range("dispatch.throughput", d.throughput_min, d.throughput_max)?;
        check_range("dispatch.start_jitter_ms", d.start_jitter_min_ms, d.start_jitter_max_ms)?;
        if d.rounds_min == 0 || d.throughput_min == 0 {
            return Err(BurstError::Config(
                "dispatch.rounds_min and dispatch.throughput_min must be at least 1".into(),
            ));
        }
        if d.send_concurrency == 0 {
            return Err(BurstError::Config("dispatch.send_concurrency must be at least 1".into()));
        }
        if self.provisioning.endpoints_per_channel == 0 {
            return Err(BurstError::Config(
                "provisioning.endpoints_per_channel must be at least 1".into(),
            ));
        }
        if self.breaker.threshold == 0 {
            return Err(BurstError::Config("breaker.threshold must be at least 1".into()));
        }
        Ok(())
    }
}

fn check_range(name: &str, min: u64, max: u64) -> Result<()> {
    if min > max {
        return Err(BurstError::Config(format!("{name}: min {min} exceeds max {max}")));
    }
    Ok(())
}

/// Per-round and per-cycle dispatch tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTunables {
    /// Global cap on in-flight sends across all sessions.
    #[serde(default = "default_send_concurrency")]
    pub send_concurrency: usize,
    #[serde(default)]
    pub start_jitter_min_ms: u64,
    #[serde(default = "default_start_jitter_max_ms")]
    pub start_jitter_max_ms: u64,
    /// Target sends per second, picked per round.
    #[serde(default = "default_throughput_min")]
    pub throughput_min: u64,
    #[serde(default = "default_throughput_max")]
    pub throughput_max: u64,
    /// Retries after the first failed attempt.
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Insert a pacing pause every N sub-target sends.
    #[serde(default = "default_sub_target_pace_every")]
    pub sub_target_pace_every: usize,
    #[serde(default = "default_sub_target_pace_ms")]
    pub sub_target_pace_ms: u64,
    #[serde(default = "default_rounds_min")]
    pub rounds_min: u64,
    #[serde(default = "default_rounds_max")]
    pub rounds_max: u64,
    #[serde(default = "default_cycle_delay_min_secs")]
    pub cycle_delay_min_secs: u64,
    #[serde(default = "default_cycle_delay_max_secs")]
    pub cycle_delay_max_secs: u64,
}

fn default_send_concurrency() -> usize { 50 }
fn default_start_jitter_max_ms() -> u64 { 250 }
fn default_throughput_min() -> u64 { 20 }
fn default_throughput_max() -> u64 { 50 }
fn default_send_retries() -> u32 { 2 }
fn default_retry_backoff_ms() -> u64 { 500 }
fn default_sub_target_pace_every() -> usize { 5 }
fn default_sub_target_pace_ms() -> u64 { 250 }
fn default_rounds_min() -> u64 { 1 }
fn default_rounds_max() -> u64 { 1000 }
fn default_cycle_delay_min_secs() -> u64 { 30 }
fn default_cycle_delay_max_secs() -> u64 { 600 }

impl Default for DispatchTunables {
    fn default() -> Self {
        Self {
            send_concurrency: default_send_concurrency(),
            start_jitter_min_ms: 0,
            start_jitter_max_ms: default_start_jitter_max_ms(),
            throughput_min: default_throughput_min(),
            throughput_max: default_throughput_max(),
            send_retries: default_send_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            sub_target_pace_every: default_sub_target_pace_every(),
            sub_target_pace_ms: default_sub_target_pace_ms(),
            rounds_min: default_rounds_min(),
            rounds_max: default_rounds_max(),
            cycle_delay_min_secs: default_cycle_delay_min_secs(),
            cycle_delay_max_secs: default_cycle_delay_max_secs(),
        }
    }
}

impl DispatchTunables {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn sub_target_pace(&self) -> Duration {
        Duration::from_millis(self.sub_target_pace_ms)
    }
}

/// What happens to provisioned resources when a target's config is erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErasePolicy {
    /// Archive sub-targets, keep endpoints for reuse.
    Archive,
    /// Delete sub-targets and endpoints.
    Delete,
}

/// Endpoint and sub-target provisioning tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningTunables {
    #[serde(default = "default_endpoints_per_channel")]
    pub endpoints_per_channel: usize,
    /// Fixed name used to recognize endpoints created by Burstcast.
    #[serde(default = "default_endpoint_name")]
    pub endpoint_name: String,
    /// Expected sub-target name; existing sub-targets with this name are reused.
    #[serde(default = "default_sub_target_name")]
    pub sub_target_name: String,
    /// Minimum spacing between creation/deletion calls.
    #[serde(default = "default_create_pace_ms")]
    pub create_pace_ms: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// How often to look for a freshly configured channel before giving up.
    #[serde(default = "default_parent_wait_attempts")]
    pub parent_wait_attempts: u32,
    #[serde(default = "default_parent_wait_ms")]
    pub parent_wait_ms: u64,
    #[serde(default = "default_erase_policy")]
    pub erase_policy: ErasePolicy,
}

fn default_endpoints_per_channel() -> usize { 10 }
fn default_endpoint_name() -> String { "burstcast".into() }
fn default_sub_target_name() -> String { "burstcast-thread".into() }
fn default_create_pace_ms() -> u64 { 1200 }
fn default_cache_ttl_secs() -> u64 { 300 }
fn default_parent_wait_attempts() -> u32 { 10 }
fn default_parent_wait_ms() -> u64 { 500 }
fn default_erase_policy() -> ErasePolicy { ErasePolicy::Archive }

impl Default for ProvisioningTunables {
    fn default() -> Self {
        Self {
            endpoints_per_channel: default_endpoints_per_channel(),
            endpoint_name: default_endpoint_name(),
            sub_target_name: default_sub_target_name(),
            create_pace_ms: default_create_pace_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            parent_wait_attempts: default_parent_wait_attempts(),
            parent_wait_ms: default_parent_wait_ms(),
            erase_policy: default_erase_policy(),
        }
    }
}

impl ProvisioningTunables {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn create_pace(&self) -> Duration {
        Duration::from_millis(self.create_pace_ms)
    }

    pub fn parent_wait(&self) -> Duration {
        Duration::from_millis(self.parent_wait_ms)
    }
}

/// Rate-limit circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Signals within the window that trip the breaker.
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    #[serde(default = "default_breaker_window_secs")]
    pub window_secs: u64,
    /// How long new starts stay refused after a trip (0 = clear right after StopAll).
    #[serde(default)]
    pub cooldown_secs: u64,
}

fn default_breaker_threshold() -> u32 { 5 }
fn default_breaker_window_secs() -> u64 { 10 }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            window_secs: default_breaker_window_secs(),
            cooldown_secs: 0,
        }
    }
}

/// Vote gate tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteTunables {
    #[serde(default = "default_member_page_size")]
    pub member_page_size: usize,
    /// Pause between the final panel update and its deletion.
    #[serde(default = "default_panel_settle_ms")]
    pub panel_settle_ms: u64,
    #[serde(default = "default_post_attempts")]
    pub post_attempts: u32,
    #[serde(default = "default_post_retry_ms")]
    pub post_retry_ms: u64,
}

fn default_member_page_size() -> usize { 1000 }
fn default_panel_settle_ms() -> u64 { 1500 }
fn default_post_attempts() -> u32 { 3 }
fn default_post_retry_ms() -> u64 { 2000 }

impl Default for VoteTunables {
    fn default() -> Self {
        Self {
            member_page_size: default_member_page_size(),
            panel_settle_ms: default_panel_settle_ms(),
            post_attempts: default_post_attempts(),
            post_retry_ms: default_post_retry_ms(),
        }
    }
}

impl VoteTunables {
    pub fn panel_settle(&self) -> Duration {
        Duration::from_millis(self.panel_settle_ms)
    }

    pub fn post_retry(&self) -> Duration {
        Duration::from_millis(self.post_retry_ms)
    }
}

/// Target config store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.burstcast/targets.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

impl StoreConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }
}
