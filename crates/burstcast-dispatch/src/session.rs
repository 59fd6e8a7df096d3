//! Session loop — drives one target from Running to Stopped.
//!
//! Timed mode runs back-to-back rounds until the deadline; random mode runs
//! cycles of a random round count followed by a random delay or a vote
//! pause. Serial sessions end after their first cycle (and its vote pause,
//! when one is configured) so the queue rotates.

use std::sync::Arc;
use std::time::Duration;

use burstcast_core::config::DispatchTunables;
use burstcast_core::{MAX_INTERVAL_SECS, SessionPhase, TargetConfig};
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::executor::{RoundExecutor, RoundPayload, sleep_or_cancel};
use crate::provisioner::{EndpointPool, PoolEntry};
use crate::random::RandomSource;
use crate::registry::LoopState;
use crate::vote::VoteGate;

/// Why a session loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Cancelled,
    /// The session task panicked.
    Aborted,
    DeadlineReached,
    /// A serial session finished its cycle.
    CycleComplete,
}

impl SessionEnd {
    pub fn is_natural(self) -> bool {
        matches!(self, SessionEnd::DeadlineReached | SessionEnd::CycleComplete)
    }
}

fn wall_clock_after(delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
}

pub struct SessionRunner {
    executor: RoundExecutor,
    vote: VoteGate,
    rng: Arc<dyn RandomSource>,
    tunables: DispatchTunables,
}

impl SessionRunner {
    pub fn new(
        executor: RoundExecutor,
        vote: VoteGate,
        rng: Arc<dyn RandomSource>,
        tunables: DispatchTunables,
    ) -> Self {
        Self {
            executor,
            vote,
            rng,
            tunables,
        }
    }

    pub fn vote_gate(&self) -> &VoteGate {
        &self.vote
    }

    /// Run `target` against `pool` until cancelled or finished.
    pub async fn run(&self, state: &LoopState, target: &TargetConfig, pool: &EndpointPool) -> SessionEnd {
        state.set_phase(SessionPhase::Running);
        let sub_body = (pool.sub_target_count() > 0).then(|| target.sub_body());
        let payload = RoundPayload::new(&target.message, sub_body);
        let mut buf = Vec::with_capacity(pool.endpoint_count());

        tracing::info!(
            "🚀 Session '{}' running ({} mode, {} endpoint(s))",
            target.name,
            if target.is_timed() { "timed" } else { "random" },
            pool.endpoint_count()
        );
        let end = if target.is_timed() {
            self.run_timed(state, target, pool, &payload, &mut buf).await
        } else {
            self.run_cycles(state, target, pool, &payload, &mut buf).await
        };
        tracing::info!(
            "⏹️ Session '{}' ended ({:?}) after {} round(s) this cycle",
            target.name,
            end,
            state.rounds_done()
        );
        end
    }

    async fn run_timed(
        &self,
        state: &LoopState,
        target: &TargetConfig,
        pool: &EndpointPool,
        payload: &RoundPayload,
        buf: &mut Vec<PoolEntry>,
    ) -> SessionEnd {
        let window = Duration::from_secs(target.interval_secs.min(MAX_INTERVAL_SECS));
        let Some(deadline) = Instant::now().checked_add(window) else {
            tracing::error!("❌ '{}' run window of {}s is out of range", target.name, window.as_secs());
            return SessionEnd::DeadlineReached;
        };
        state.set_deadline(wall_clock_after(window));
        state.begin_cycle(0);

        let cancel = state.cancel_token();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return SessionEnd::DeadlineReached,
                report = self.executor.execute_round(pool, payload, buf, cancel) => {
                    if report.cancelled {
                        return SessionEnd::Cancelled;
                    }
                    state.round_completed();
                }
            }
        }
    }

    async fn run_cycles(
        &self,
        state: &LoopState,
        target: &TargetConfig,
        pool: &EndpointPool,
        payload: &RoundPayload,
        buf: &mut Vec<PoolEntry>,
    ) -> SessionEnd {
        let t = &self.tunables;
        loop {
            if state.is_cancelled() {
                return SessionEnd::Cancelled;
            }
            let rounds = self.rng.range(t.rounds_min.max(1), t.rounds_max);
            state.begin_cycle(rounds);
            tracing::debug!("🔄 '{}' cycle of {rounds} round(s)", target.name);

            for _ in 0..rounds {
                let report = self
                    .executor
                    .execute_round(pool, payload, buf, state.cancel_token())
                    .await;
                if report.cancelled || state.is_cancelled() {
                    return SessionEnd::Cancelled;
                }
                state.round_completed();
            }

            match target.vote_gate() {
                Some(settings) => {
                    if !self.vote.pause(state, settings).await {
                        return SessionEnd::Cancelled;
                    }
                }
                // rotation replaces the cycle delay
                None if state.is_serial() => {}
                None => {
                    let delay = Duration::from_secs(
                        self.rng.range(t.cycle_delay_min_secs, t.cycle_delay_max_secs),
                    );
                    state.set_next_run(wall_clock_after(delay));
                    tracing::debug!("💤 '{}' sleeping {}s before next cycle", target.name, delay.as_secs());
                    let slept = sleep_or_cancel(delay, state.cancel_token()).await;
                    state.set_next_run(None);
                    if !slept {
                        return SessionEnd::Cancelled;
                    }
                }
            }

            if state.is_serial() {
                return SessionEnd::CycleComplete;
            }
        }
    }
}
