//! Serial queue — exactly one serial target dispatches at a time.
//!
//! The raw list is kept sorted by name; each pass consumes a freshly shuffled
//! working copy, so every queued target runs once per pass without a fixed
//! repetition order.

use std::collections::VecDeque;

use serde::Serialize;

use crate::random::{RandomSource, shuffle};

/// A target waiting for its serial turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub target_id: String,
    pub name: String,
}

/// Ordered serial queue plus its shuffled working copy.
#[derive(Debug, Default)]
pub struct SerialQueue {
    entries: Vec<QueueEntry>,
    working: VecDeque<String>,
    active: Option<String>,
    passes: u64,
    total_launched: u64,
}

impl SerialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target. Returns `false` if it is already queued.
    ///
    /// A target added mid-pass joins the current pass.
    pub fn enqueue(&mut self, target_id: &str, name: &str) -> bool {
        if self.contains(target_id) {
            return false;
        }
        self.entries.push(QueueEntry {
            target_id: target_id.to_string(),
            name: name.to_string(),
        });
        self.entries
            .sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.target_id.cmp(&b.target_id)));
        if !self.working.is_empty() {
            self.working.push_back(target_id.to_string());
        }
        tracing::debug!(
            "📥 Serial enqueue: {} (queued: {}, active: {:?})",
            target_id,
            self.entries.len(),
            self.active
        );
        true
    }

    /// Pop the next target and mark it active. `None` while another target is
    /// active or the queue is empty.
    pub fn take_next(&mut self, rng: &dyn RandomSource) -> Option<String> {
        if self.active.is_some() || self.entries.is_empty() {
            return None;
        }
        if self.working.is_empty() {
            self.refill(rng);
        }
        let next = self.working.pop_front()?;
        self.active = Some(next.clone());
        self.total_launched += 1;
        Some(next)
    }

    fn refill(&mut self, rng: &dyn RandomSource) {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.target_id.clone()).collect();
        shuffle(rng, &mut ids);
        self.working = ids.into();
        self.passes += 1;
    }

    /// Release the active slot if `target_id` holds it.
    pub fn complete(&mut self, target_id: &str) -> bool {
        if self.active.as_deref() == Some(target_id) {
            self.active = None;
            true
        } else {
            false
        }
    }

    /// Remove a target from both copies and the active slot. Idempotent.
    pub fn remove(&mut self, target_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.target_id != target_id);
        self.working.retain(|id| id != target_id);
        if self.active.as_deref() == Some(target_id) {
            self.active = None;
        }
        self.entries.len() < before
    }

    /// Empty the queue, returning the ids that were queued.
    pub fn clear(&mut self) -> Vec<String> {
        self.working.clear();
        self.active = None;
        self.entries.drain(..).map(|e| e.target_id).collect()
    }

    pub fn contains(&self, target_id: &str) -> bool {
        self.entries.iter().any(|e| e.target_id == target_id)
    }

    pub fn in_working_copy(&self, target_id: &str) -> bool {
        self.working.iter().any(|id| id == target_id)
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.entries.len(),
            remaining_in_pass: self.working.len(),
            active: self.active.clone(),
            passes: self.passes,
            total_launched: self.total_launched,
        }
    }
}

/// Serial queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub remaining_in_pass: usize,
    pub active: Option<String>,
    pub passes: u64,
    pub total_launched: u64,
}
