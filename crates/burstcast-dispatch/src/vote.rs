//! Vote gate — a per-cycle barrier that parks a session until enough
//! eligible members press the panel's vote button.

use std::sync::Arc;

use burstcast_core::config::VoteTunables;
use burstcast_core::{
    BurstError, ButtonState, InteractionUI, MessagingClient, Result, RoleMembership,
    VoteGateSettings, VoteInteraction, VoteOutcome,
};
use tokio_util::sync::CancellationToken;

use crate::executor::sleep_or_cancel;
use crate::provisioner::EndpointProvisioner;
use crate::registry::{LoopState, PanelRef};

/// Votes needed to resume: `ceil(eligible * percent / 100)`, never below one.
pub fn quorum(eligible: u64, threshold_percent: u32) -> u32 {
    let needed = (eligible * u64::from(threshold_percent)).div_ceil(100);
    needed.clamp(1, u64::from(u32::MAX)) as u32
}

/// Posts vote panels, tallies votes and releases paused sessions.
pub struct VoteGate {
    client: Arc<dyn MessagingClient>,
    ui: Arc<dyn InteractionUI>,
    membership: Arc<dyn RoleMembership>,
    provisioner: Arc<EndpointProvisioner>,
    tunables: VoteTunables,
}

impl VoteGate {
    pub fn new(
        client: Arc<dyn MessagingClient>,
        ui: Arc<dyn InteractionUI>,
        membership: Arc<dyn RoleMembership>,
        provisioner: Arc<EndpointProvisioner>,
        tunables: VoteTunables,
    ) -> Self {
        Self {
            client,
            ui,
            membership,
            provisioner,
            tunables,
        }
    }

    async fn eligible_count(&self, settings: &VoteGateSettings) -> Result<u64> {
        let location = self
            .client
            .resolve_channel(&settings.location_id)
            .await?
            .ok_or_else(|| BurstError::NotFound(format!("vote location {}", settings.location_id)))?;
        self.membership
            .count_eligible(&location.group_id, &settings.role_id, self.tunables.member_page_size)
            .await
    }

    /// Park `state` until quorum is reached (`true`) or the session is
    /// cancelled (`false`). A panel that cannot be posted leaves the session
    /// paused until a manual resume or stop.
    ///
    /// When the eligible count cannot be fetched the previous pause's quorum
    /// is reused; only a first pause falls back to a single vote.
    pub async fn pause(&self, state: &LoopState, settings: &VoteGateSettings) -> bool {
        let needed = match self.eligible_count(settings).await {
            Ok(eligible) => {
                let needed = quorum(eligible, settings.threshold_percent);
                tracing::info!(
                    "🗳️ '{}' paused for vote: {needed} of {eligible} eligible needed",
                    state.name()
                );
                needed
            }
            Err(e) => {
                let needed = state.last_quorum().unwrap_or(1);
                tracing::error!(
                    "❌ Eligible-member count for '{}' failed, pausing with quorum {needed}: {e}",
                    state.name()
                );
                needed
            }
        };
        state.enter_pause(&settings.role_id, needed);

        match self.post_panel(state, settings, needed).await {
            Ok(panel) => state.attach_panel(panel),
            Err(_) if state.is_cancelled() => {}
            Err(e) => tracing::warn!(
                "⚠️ '{}' stays paused without a panel, manual resume required: {e}",
                state.name()
            ),
        }

        let resumed = state.wait_resumed().await;
        let panel = state.finish_pause();
        if resumed {
            sleep_or_cancel(self.tunables.panel_settle(), state.cancel_token()).await;
        }
        if let Some(panel) = panel {
            if let Err(e) = self
                .ui
                .delete_panel(&panel.endpoint, &panel.location_id, &panel.message_id)
                .await
            {
                tracing::warn!("⚠️ Could not delete vote panel {}: {e}", panel.message_id);
            }
        }
        if resumed {
            tracing::info!("▶️ '{}' resumed by vote", state.name());
        }
        resumed
    }

    /// Post the panel with bounded retries, racing cancellation.
    async fn post_panel(
        &self,
        state: &LoopState,
        settings: &VoteGateSettings,
        needed: u32,
    ) -> Result<PanelRef> {
        let attempts = self.tunables.post_attempts.max(1);
        let mut last_err = BurstError::VotePost("no attempt made".into());
        for attempt in 1..=attempts {
            match self.try_post(settings, needed, state.cancel_token()).await {
                Ok(panel) => return Ok(panel),
                Err(BurstError::Cancelled) => return Err(BurstError::Cancelled),
                Err(e) => {
                    tracing::debug!("vote panel attempt {attempt}/{attempts} for {}: {e}", state.name());
                    last_err = e;
                }
            }
            if attempt < attempts
                && !sleep_or_cancel(self.tunables.post_retry(), state.cancel_token()).await
            {
                break;
            }
        }
        Err(BurstError::VotePost(last_err.to_string()))
    }

    async fn try_post(
        &self,
        settings: &VoteGateSettings,
        needed: u32,
        cancel: &CancellationToken,
    ) -> Result<PanelRef> {
        let endpoint = self.provisioner.posting_endpoint(&settings.location_id, cancel).await?;
        let message_id = self
            .ui
            .post_panel(
                &endpoint,
                &settings.location_id,
                &settings.panel_text,
                ButtonState::new(0, needed),
            )
            .await?;
        Ok(PanelRef {
            endpoint,
            location_id: settings.location_id.clone(),
            message_id,
        })
    }

    /// Apply a button press, refresh the panel and wake the session on quorum.
    pub async fn handle_vote(&self, state: &LoopState, vote: &VoteInteraction) -> VoteOutcome {
        let outcome = state.record_vote(vote);
        if !matches!(outcome, VoteOutcome::Recorded { .. } | VoteOutcome::QuorumReached { .. }) {
            return outcome;
        }

        if let Some((panel, button)) = state.panel_button() {
            tracing::debug!("🗳️ '{}' panel now {}", state.name(), button.label());
            if let Err(e) = self.ui.update_panel(&panel.endpoint, &panel.message_id, button).await {
                tracing::warn!("⚠️ Could not update vote panel {}: {e}", panel.message_id);
            }
        }
        if let VoteOutcome::QuorumReached { votes } = outcome {
            tracing::info!("✅ Quorum reached for '{}' with {votes} vote(s)", state.name());
            state.signal_resume();
        }
        outcome
    }
}
