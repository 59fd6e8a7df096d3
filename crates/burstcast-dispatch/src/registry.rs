//! Loop registry — the single source of truth for "is this target dispatching".
//!
//! Each live session owns one `LoopState`: its cancellation token, the resume
//! signal used by the vote gate, the ballot, and progress counters. The
//! registry guarantees at most one state per target id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use burstcast_core::{ButtonState, EndpointIdentity, LoopSnapshot, SessionPhase, VoteInteraction, VoteOutcome};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Where a vote panel was posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelRef {
    pub endpoint: EndpointIdentity,
    pub location_id: String,
    pub message_id: String,
}

#[derive(Debug, Default)]
struct Ballot {
    paused: bool,
    required_role: String,
    needed: u32,
    voters: HashSet<String>,
    quorum_reached: bool,
    panel: Option<PanelRef>,
}

#[derive(Debug, Default)]
struct Schedule {
    next_run: Option<DateTime<Utc>>,
    deadline: Option<DateTime<Utc>>,
}

/// Transient per-session state.
#[derive(Debug)]
pub struct LoopState {
    target_id: String,
    name: String,
    serial: bool,
    cancel: CancellationToken,
    resume: Notify,
    phase: Mutex<SessionPhase>,
    ballot: Mutex<Ballot>,
    schedule: Mutex<Schedule>,
    rounds_total: AtomicU64,
    rounds_done: AtomicU64,
}

impl LoopState {
    pub fn new(target_id: &str, name: &str, serial: bool) -> Self {
        Self {
            target_id: target_id.to_string(),
            name: name.to_string(),
            serial,
            cancel: CancellationToken::new(),
            resume: Notify::new(),
            phase: Mutex::new(SessionPhase::Starting),
            ballot: Mutex::new(Ballot::default()),
            schedule: Mutex::new(Schedule::default()),
            rounds_total: AtomicU64::new(0),
            rounds_done: AtomicU64::new(0),
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_serial(&self) -> bool {
        self.serial
    }

    // ─── Cancellation ─────────────────────────────────────────

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Close the cancellation signal. Returns `false` if it was already closed.
    pub fn cancel(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ─── Progress ─────────────────────────────────────────────

    pub fn phase(&self) -> SessionPhase {
        *lock(&self.phase)
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        *lock(&self.phase) = phase;
    }

    /// Start a new cycle of `total` rounds.
    pub fn begin_cycle(&self, total: u64) {
        self.rounds_total.store(total, Ordering::SeqCst);
        self.rounds_done.store(0, Ordering::SeqCst);
    }

    pub fn round_completed(&self) {
        self.rounds_done.fetch_add(1, Ordering::SeqCst);
    }

    pub fn rounds_total(&self) -> u64 {
        self.rounds_total.load(Ordering::SeqCst)
    }

    pub fn rounds_done(&self) -> u64 {
        self.rounds_done.load(Ordering::SeqCst)
    }

    pub fn set_next_run(&self, at: Option<DateTime<Utc>>) {
        lock(&self.schedule).next_run = at;
    }

    pub fn set_deadline(&self, at: Option<DateTime<Utc>>) {
        lock(&self.schedule).deadline = at;
    }

    // ─── Vote gate ────────────────────────────────────────────

    /// Reset the ballot and mark the session paused.
    pub fn enter_pause(&self, required_role: &str, needed: u32) {
        {
            let mut ballot = lock(&self.ballot);
            *ballot = Ballot {
                paused: true,
                required_role: required_role.to_string(),
                needed: needed.max(1),
                ..Ballot::default()
            };
        }
        self.set_phase(SessionPhase::Paused);
    }

    pub fn attach_panel(&self, panel: PanelRef) {
        lock(&self.ballot).panel = Some(panel);
    }

    pub fn panel(&self) -> Option<PanelRef> {
        lock(&self.ballot).panel.clone()
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.ballot).paused
    }

    /// Quorum of the most recent pause, if there was one.
    pub fn last_quorum(&self) -> Option<u32> {
        let needed = lock(&self.ballot).needed;
        (needed > 0).then_some(needed)
    }

    /// Current panel plus the button state it should show.
    pub fn panel_button(&self) -> Option<(PanelRef, ButtonState)> {
        let ballot = lock(&self.ballot);
        let panel = ballot.panel.clone()?;
        Some((panel, ButtonState::new(ballot.voters.len() as u32, ballot.needed)))
    }

    /// Apply a vote to the ballot.
    ///
    /// Only the vote that first reaches quorum yields `QuorumReached`; any
    /// later vote in the same pause is merely recorded.
    pub fn record_vote(&self, vote: &VoteInteraction) -> VoteOutcome {
        let mut ballot = lock(&self.ballot);
        if !ballot.paused {
            return VoteOutcome::NotPaused;
        }
        match &ballot.panel {
            Some(panel) if panel.message_id == vote.message_id => {}
            _ => return VoteOutcome::StalePanel,
        }
        if !vote.member_roles.iter().any(|r| *r == ballot.required_role) {
            return VoteOutcome::NotEligible;
        }
        if !ballot.voters.insert(vote.member_id.clone()) {
            return VoteOutcome::Duplicate;
        }

        let votes = ballot.voters.len() as u32;
        if votes >= ballot.needed && !ballot.quorum_reached {
            ballot.quorum_reached = true;
            VoteOutcome::QuorumReached { votes }
        } else {
            VoteOutcome::Recorded {
                votes,
                needed: ballot.needed,
            }
        }
    }

    /// Wake the paused session. Dropped if nobody is waiting; the waiter
    /// re-checks the ballot, so no wakeup is lost.
    pub fn signal_resume(&self) {
        self.resume.notify_waiters();
    }

    /// Manual override: treat the current pause as having reached quorum.
    pub fn force_resume(&self) -> bool {
        {
            let mut ballot = lock(&self.ballot);
            if !ballot.paused {
                return false;
            }
            ballot.quorum_reached = true;
        }
        self.signal_resume();
        true
    }

    /// Block until quorum is reached (`true`) or the session is cancelled (`false`).
    pub async fn wait_resumed(&self) -> bool {
        loop {
            let notified = self.resume.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if lock(&self.ballot).quorum_reached {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancel.cancelled() => return false,
            }
        }
    }

    /// Clear pause state, handing back the panel for deletion.
    pub fn finish_pause(&self) -> Option<PanelRef> {
        let panel = {
            let mut ballot = lock(&self.ballot);
            ballot.paused = false;
            ballot.quorum_reached = false;
            ballot.voters.clear();
            ballot.panel.take()
        };
        if !self.is_cancelled() {
            self.set_phase(SessionPhase::Running);
        }
        panel
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        let (vote_message_id, votes, needed_votes) = {
            let ballot = lock(&self.ballot);
            (
                ballot.panel.as_ref().map(|p| p.message_id.clone()),
                ballot.voters.len() as u32,
                if ballot.paused { ballot.needed } else { 0 },
            )
        };
        let (next_run, deadline) = {
            let schedule = lock(&self.schedule);
            (schedule.next_run, schedule.deadline)
        };
        LoopSnapshot {
            target_id: self.target_id.clone(),
            name: self.name.clone(),
            phase: self.phase(),
            serial: self.serial,
            rounds_total: self.rounds_total(),
            rounds_done: self.rounds_done(),
            next_run,
            deadline,
            vote_message_id,
            votes,
            needed_votes,
        }
    }
}

/// Concurrent map of target id → live session state.
#[derive(Debug, Default)]
pub struct LoopRegistry {
    sessions: Mutex<HashMap<String, Arc<LoopState>>>,
}

impl LoopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically create and register a session state, or `None` if the
    /// target already has one.
    pub fn reserve(&self, target_id: &str, name: &str, serial: bool) -> Option<Arc<LoopState>> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(target_id) {
            return None;
        }
        let state = Arc::new(LoopState::new(target_id, name, serial));
        sessions.insert(target_id.to_string(), state.clone());
        Some(state)
    }

    pub fn unregister(&self, target_id: &str) -> Option<Arc<LoopState>> {
        lock(&self.sessions).remove(target_id)
    }

    /// Remove the entry only if it still belongs to `state`.
    pub fn unregister_if(&self, state: &Arc<LoopState>) -> bool {
        let mut sessions = lock(&self.sessions);
        match sessions.get(state.target_id()) {
            Some(current) if Arc::ptr_eq(current, state) => {
                sessions.remove(state.target_id());
                true
            }
            _ => false,
        }
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<Arc<LoopState>> {
        lock(&self.sessions).drain().map(|(_, s)| s).collect()
    }

    pub fn get(&self, target_id: &str) -> Option<Arc<LoopState>> {
        lock(&self.sessions).get(target_id).cloned()
    }

    pub fn contains(&self, target_id: &str) -> bool {
        lock(&self.sessions).contains_key(target_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> HashMap<String, LoopSnapshot> {
        let states: Vec<Arc<LoopState>> = lock(&self.sessions).values().cloned().collect();
        states
            .into_iter()
            .map(|s| (s.target_id().to_string(), s.snapshot()))
            .collect()
    }
}
