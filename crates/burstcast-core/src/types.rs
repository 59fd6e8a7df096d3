//! Data model shared by the engine and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BurstError, Result};

/// Longest accepted timed-mode run: 30 days.
pub const MAX_INTERVAL_SECS: u64 = 30 * 24 * 60 * 60;

/// Whether a target is one channel or every channel under a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Channel,
    Category,
}

/// Vote gate settings; the gate is active only when both ids are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteGateSettings {
    /// Channel the vote panel is posted in.
    pub location_id: String,
    /// Role whose members may vote.
    pub role_id: String,
    /// Percentage of eligible members required to resume.
    pub threshold_percent: u32,
    pub panel_text: String,
}

impl VoteGateSettings {
    pub fn is_enabled(&self) -> bool {
        !self.location_id.is_empty() && !self.role_id.is_empty()
    }
}

/// Persisted per-target configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    pub name: String,
    pub kind: TargetKind,
    pub message: String,
    /// Body posted into sub-targets; empty means reuse `message`.
    #[serde(default)]
    pub sub_message: String,
    #[serde(default)]
    pub sub_target_count: usize,
    /// Fixed run duration in seconds; 0 selects random/cycle mode.
    #[serde(default)]
    pub interval_secs: u64,
    /// Serial targets dispatch one at a time through the shared queue.
    #[serde(default)]
    pub serial: bool,
    #[serde(default)]
    pub vote: Option<VoteGateSettings>,
    #[serde(default)]
    pub running: bool,
}

impl TargetConfig {
    /// Create a channel target in random mode with default settings.
    pub fn channel(id: &str, name: &str, message: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind: TargetKind::Channel,
            message: message.to_string(),
            sub_message: String::new(),
            sub_target_count: 0,
            interval_secs: 0,
            serial: false,
            vote: None,
            running: false,
        }
    }

    /// Vote gate settings, only when the gate is fully configured.
    pub fn vote_gate(&self) -> Option<&VoteGateSettings> {
        self.vote.as_ref().filter(|v| v.is_enabled())
    }

    pub fn is_timed(&self) -> bool {
        self.interval_secs > 0
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(BurstError::Config("target id is empty".into()));
        }
        if self.message.trim().is_empty() {
            return Err(BurstError::Config(format!("target {} has no message", self.id)));
        }
        check_interval(self.interval_secs)?;
        if let Some(vote) = &self.vote {
            if vote.threshold_percent == 0 || vote.threshold_percent > 100 {
                return Err(BurstError::Config(format!(
                    "vote threshold must be 1-100, got {}",
                    vote.threshold_percent
                )));
            }
        }
        Ok(())
    }

    /// Body for sub-target messages.
    pub fn sub_body(&self) -> &str {
        if self.sub_message.is_empty() {
            &self.message
        } else {
            &self.sub_message
        }
    }
}

/// Timed-mode durations above [`MAX_INTERVAL_SECS`] are refused.
pub fn check_interval(secs: u64) -> Result<()> {
    if secs > MAX_INTERVAL_SECS {
        return Err(BurstError::Config(format!(
            "interval {secs}s exceeds the {MAX_INTERVAL_SECS}s maximum"
        )));
    }
    Ok(())
}

/// A delivery handle: id plus secret token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointIdentity {
    pub id: String,
    pub token: String,
}

/// Provider-side endpoint listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointListing {
    pub id: String,
    pub channel_id: String,
    pub name: String,
    /// Absent when the endpoint was created by another application.
    pub token: Option<String>,
}

impl EndpointListing {
    pub fn identity(&self) -> Option<EndpointIdentity> {
        self.token.as_ref().map(|token| EndpointIdentity {
            id: self.id.clone(),
            token: token.clone(),
        })
    }
}

/// Channel kinds as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Category,
    SubTarget,
}

/// Resolved channel metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    /// Owning group (guild).
    pub group_id: String,
    pub kind: ChannelKind,
    pub parent_id: Option<String>,
}

/// Guild member as returned by membership pagination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub roles: Vec<String>,
    pub bot: bool,
}

/// Visible state of the vote panel button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonState {
    pub votes: u32,
    pub quorum: u32,
}

impl ButtonState {
    pub fn new(votes: u32, quorum: u32) -> Self {
        Self { votes, quorum }
    }

    pub fn is_met(&self) -> bool {
        self.votes >= self.quorum
    }

    /// Button label, e.g. `3/5`.
    pub fn label(&self) -> String {
        format!("{}/{}", self.votes, self.quorum)
    }

    pub fn style(&self) -> ButtonStyle {
        if self.is_met() {
            ButtonStyle::Met
        } else {
            ButtonStyle::Pending
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ButtonStyle {
    Pending,
    Met,
}

/// A vote button press.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteInteraction {
    /// Panel message the button belongs to.
    pub message_id: String,
    pub member_id: String,
    pub member_roles: Vec<String>,
}

/// Result of handling a vote interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteOutcome {
    Recorded { votes: u32, needed: u32 },
    QuorumReached { votes: u32 },
    NotActive,
    NotPaused,
    StalePanel,
    NotEligible,
    Duplicate,
}

/// Lifecycle phase of a dispatch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Starting,
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Starting => write!(f, "starting"),
            SessionPhase::Running => write!(f, "running"),
            SessionPhase::Paused => write!(f, "paused"),
            SessionPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSnapshot {
    pub target_id: String,
    pub name: String,
    pub phase: SessionPhase,
    pub serial: bool,
    pub rounds_total: u64,
    pub rounds_done: u64,
    pub next_run: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub vote_message_id: Option<String>,
    pub votes: u32,
    pub needed_votes: u32,
}

impl LoopSnapshot {
    pub fn is_paused(&self) -> bool {
        self.phase == SessionPhase::Paused
    }
}
