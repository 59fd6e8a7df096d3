//! Dispatcher — the engine's public surface.
//!
//! Starts targets in parallel or through the serial queue, stops them,
//! manages stored configuration, routes vote interactions and reacts to the
//! rate-limit circuit breaker. Serial rotation is driven by completion
//! events handled on a coordinator task, never by a session relaunching its
//! successor from inside its own completion path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use burstcast_core::{
    BurstError, BurstcastConfig, ConfigStore, InteractionUI, LoopSnapshot, MessagingClient,
    RateLimitSignal, Result, RoleMembership, SessionPhase, TargetConfig, VoteInteraction,
    VoteOutcome, check_interval,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::breaker::CircuitBreaker;
use crate::executor::RoundExecutor;
use crate::limits::{ProvisioningLimiter, SendLimiter};
use crate::provisioner::{EndpointPool, EndpointProvisioner};
use crate::queue::{QueueStats, SerialQueue};
use crate::random::{RandomSource, ThreadRandom};
use crate::registry::{LoopRegistry, LoopState};
use crate::session::{SessionEnd, SessionRunner};
use crate::vote::VoteGate;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// External services the engine talks to.
pub struct Collaborators {
    pub store: Arc<dyn ConfigStore>,
    pub client: Arc<dyn MessagingClient>,
    pub ui: Arc<dyn InteractionUI>,
    pub membership: Arc<dyn RoleMembership>,
    pub rng: Arc<dyn RandomSource>,
}

impl Collaborators {
    /// Collaborators with the default thread-local random source.
    pub fn new(
        store: Arc<dyn ConfigStore>,
        client: Arc<dyn MessagingClient>,
        ui: Arc<dyn InteractionUI>,
        membership: Arc<dyn RoleMembership>,
    ) -> Self {
        Self {
            store,
            client,
            ui,
            membership,
            rng: Arc::new(ThreadRandom),
        }
    }
}

/// Per-target outcome of a `batch_start` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    /// Parallel targets launched.
    pub started: Vec<String>,
    /// Serial targets added to the queue.
    pub queued: Vec<String>,
    pub already_running: Vec<String>,
    /// Targets skipped, with the reason.
    pub failed: Vec<(String, String)>,
}

impl StartReport {
    fn accepted(&self) -> usize {
        self.started.len() + self.queued.len()
    }
}

/// Last pool built for a target. Outlives its session so `delete_config`
/// can retire it; a config change only stops it being reused.
struct HeldPool {
    pool: Arc<EndpointPool>,
    reusable: bool,
}

#[derive(Debug)]
enum SessionEvent {
    SerialFinished { target_id: String },
}

pub struct Dispatcher {
    config: BurstcastConfig,
    store: Arc<dyn ConfigStore>,
    rng: Arc<dyn RandomSource>,
    provisioner: Arc<EndpointProvisioner>,
    runner: SessionRunner,
    breaker: CircuitBreaker,
    registry: LoopRegistry,
    queue: Mutex<SerialQueue>,
    /// Effective config (override applied) of queued serial targets.
    serial_configs: Mutex<HashMap<String, TargetConfig>>,
    pools: Mutex<HashMap<String, HeldPool>>,
    sessions: TaskTracker,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Dispatcher {
    /// Build the engine and spawn its coordinator. Must be called inside a
    /// Tokio runtime.
    pub fn new(config: BurstcastConfig, deps: Collaborators) -> Arc<Self> {
        let provisioner = Arc::new(EndpointProvisioner::new(
            deps.client.clone(),
            ProvisioningLimiter::new(config.provisioning.create_pace()),
            config.provisioning.clone(),
        ));
        let sends = SendLimiter::new(config.dispatch.send_concurrency);
        let send_slots = sends.capacity();
        let executor = RoundExecutor::new(
            deps.client.clone(),
            sends,
            deps.rng.clone(),
            config.dispatch.clone(),
        );
        let vote = VoteGate::new(
            deps.client,
            deps.ui,
            deps.membership,
            provisioner.clone(),
            config.vote.clone(),
        );
        let runner = SessionRunner::new(executor, vote, deps.rng.clone(), config.dispatch.clone());

        let (events, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            breaker: CircuitBreaker::new(&config.breaker),
            config,
            store: deps.store,
            rng: deps.rng,
            provisioner,
            runner,
            registry: LoopRegistry::new(),
            queue: Mutex::new(SerialQueue::new()),
            serial_configs: Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
            sessions: TaskTracker::new(),
            events,
        });
        tokio::spawn(coordinate(Arc::downgrade(&dispatcher), rx));
        tracing::info!(
            "📡 Dispatcher ready (send concurrency {}, breaker {}/{}s)",
            send_slots,
            dispatcher.config.breaker.threshold,
            dispatcher.config.breaker.window_secs
        );
        dispatcher
    }

    // ─── Start ────────────────────────────────────────────────

    /// Start a batch of targets. Parallel targets launch immediately; serial
    /// targets join the queue and only its head runs.
    ///
    /// Fails only when the breaker is engaged, the override interval is out
    /// of range or nothing could be started.
    pub async fn batch_start(
        self: &Arc<Self>,
        target_ids: &[String],
        override_interval: Option<u64>,
    ) -> Result<StartReport> {
        if self.breaker.is_engaged() {
            tracing::warn!("🚫 Start refused: circuit breaker engaged");
            return Err(BurstError::CircuitOpen);
        }
        if let Some(secs) = override_interval {
            check_interval(secs)?;
        }

        let mut report = StartReport::default();
        let mut config_failures = 0;
        for id in target_ids {
            let mut target = match self.store.get(id)? {
                Some(target) => target,
                None => {
                    config_failures += 1;
                    report.failed.push((id.clone(), "not configured".into()));
                    continue;
                }
            };
            if let Some(secs) = override_interval {
                target.interval_secs = secs;
            }
            if let Err(e) = target.validate() {
                config_failures += 1;
                report.failed.push((id.clone(), e.to_string()));
                continue;
            }
            if self.is_active_or_queued(id) {
                report.already_running.push(id.clone());
                continue;
            }

            let outcome = if target.serial {
                self.queue_serial(target).await
            } else {
                self.start_parallel(target).await
            };
            match outcome {
                Ok(Launch::Started) => report.started.push(id.clone()),
                Ok(Launch::Queued) => report.queued.push(id.clone()),
                Ok(Launch::AlreadyRunning) => report.already_running.push(id.clone()),
                Err(e) => {
                    tracing::warn!("⚠️ Could not start {id}: {e}");
                    report.failed.push((id.clone(), e.to_string()));
                }
            }
        }

        if !report.queued.is_empty() {
            self.launch_next_serial().await;
        }

        if report.accepted() == 0 && !report.failed.is_empty() {
            if config_failures == report.failed.len() {
                return Err(BurstError::Config(format!(
                    "no usable configuration for {}",
                    report.failed.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>().join(", ")
                )));
            }
            return Err(BurstError::NoTargetsPrepared);
        }
        tracing::info!(
            "▶️ Batch start: {} started, {} queued, {} already running, {} failed",
            report.started.len(),
            report.queued.len(),
            report.already_running.len(),
            report.failed.len()
        );
        Ok(report)
    }

    fn is_active_or_queued(&self, target_id: &str) -> bool {
        self.registry.contains(target_id) || lock(&self.queue).contains(target_id)
    }

    async fn start_parallel(self: &Arc<Self>, target: TargetConfig) -> Result<Launch> {
        let Some(state) = self.registry.reserve(&target.id, &target.name, false) else {
            return Ok(Launch::AlreadyRunning);
        };
        let pool = match self.prepare_fresh(&target, state.cancel_token()).await {
            Ok(pool) => pool,
            Err(BurstError::Cancelled) => {
                self.registry.unregister_if(&state);
                return Ok(Launch::AlreadyRunning);
            }
            Err(e) => {
                self.registry.unregister_if(&state);
                return Err(e);
            }
        };
        if state.is_cancelled() {
            // stopped while preparing
            self.registry.unregister_if(&state);
            return Ok(Launch::AlreadyRunning);
        }
        self.mark_running(&target.id, true);
        self.spawn_session(state, target, pool);
        Ok(Launch::Started)
    }

    async fn queue_serial(&self, target: TargetConfig) -> Result<Launch> {
        // no session owns the target yet
        self.prepare_fresh(&target, &CancellationToken::new()).await?;
        let added = lock(&self.queue).enqueue(&target.id, &target.name);
        if !added {
            return Ok(Launch::AlreadyRunning);
        }
        self.mark_running(&target.id, true);
        lock(&self.serial_configs).insert(target.id.clone(), target);
        Ok(Launch::Queued)
    }

    /// Launch the queue head unless a serial session is already active.
    async fn launch_next_serial(self: &Arc<Self>) {
        loop {
            let next = lock(&self.queue).take_next(self.rng.as_ref());
            let Some(id) = next else {
                return;
            };
            match self.launch_serial(&id).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!("⚠️ Dropping serial target {id} from the queue: {e}");
                    lock(&self.queue).remove(&id);
                    lock(&self.serial_configs).remove(&id);
                    self.mark_running(&id, false);
                }
            }
        }
    }

    async fn launch_serial(self: &Arc<Self>, target_id: &str) -> Result<()> {
        let queued = lock(&self.serial_configs).get(target_id).cloned();
        let target = match queued {
            Some(target) => target,
            None => self
                .store
                .get(target_id)?
                .ok_or_else(|| BurstError::Config(format!("no configuration for {target_id}")))?,
        };
        let state = self
            .registry
            .reserve(&target.id, &target.name, true)
            .ok_or_else(|| BurstError::AlreadyRunning(target_id.to_string()))?;
        let pool = match self.cached_or_prepare(&target, state.cancel_token()).await {
            Ok(pool) => pool,
            Err(e) => {
                self.registry.unregister_if(&state);
                return Err(e);
            }
        };
        tracing::info!("🎯 Serial turn: '{}'", target.name);
        self.spawn_session(state, target, pool);
        Ok(())
    }

    fn spawn_session(
        self: &Arc<Self>,
        state: Arc<LoopState>,
        target: TargetConfig,
        pool: Arc<EndpointPool>,
    ) {
        let this = Arc::clone(self);
        self.sessions.spawn(async move {
            // a panicking run must still reach the terminal transition
            let run = {
                let (this, state) = (Arc::clone(&this), Arc::clone(&state));
                tokio::spawn(async move { this.runner.run(&state, &target, &pool).await })
            };
            let end = match run.await {
                Ok(end) => end,
                Err(e) => {
                    tracing::error!("💥 Session '{}' crashed: {e}", state.name());
                    state.cancel();
                    SessionEnd::Aborted
                }
            };
            this.finish_session(&state, end);
        });
    }

    /// Terminal transition of every session.
    fn finish_session(&self, state: &Arc<LoopState>, end: SessionEnd) {
        state.set_phase(SessionPhase::Stopped);
        let owned = self.registry.unregister_if(state);
        if owned && state.is_serial() && end == SessionEnd::Aborted {
            lock(&self.queue).remove(state.target_id());
            lock(&self.serial_configs).remove(state.target_id());
        }
        let requeued = state.is_serial()
            && end.is_natural()
            && lock(&self.queue).contains(state.target_id());
        if owned && !requeued {
            self.mark_running(state.target_id(), false);
        }
        if state.is_serial() {
            let event = SessionEvent::SerialFinished {
                target_id: state.target_id().to_string(),
            };
            if self.events.send(event).is_err() {
                tracing::debug!("coordinator gone, serial queue not advanced");
            }
        }
    }

    async fn on_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::SerialFinished { target_id } => {
                lock(&self.queue).complete(&target_id);
                self.launch_next_serial().await;
            }
        }
    }

    fn pools_lock(&self) -> MutexGuard<'_, HashMap<String, HeldPool>> {
        lock(&self.pools)
    }

    /// Fresh pool for a stopped-to-started transition.
    async fn prepare_fresh(
        &self,
        target: &TargetConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<EndpointPool>> {
        let pool = Arc::new(self.provisioner.prepare(target, cancel).await?);
        self.pools_lock().insert(
            target.id.clone(),
            HeldPool {
                pool: pool.clone(),
                reusable: true,
            },
        );
        Ok(pool)
    }

    /// Cached pool while within the TTL, rebuilt otherwise.
    async fn cached_or_prepare(
        &self,
        target: &TargetConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<EndpointPool>> {
        let ttl = self.config.provisioning.cache_ttl();
        let cached = self
            .pools_lock()
            .get(&target.id)
            .filter(|held| held.reusable && held.pool.is_fresh(ttl))
            .map(|held| held.pool.clone());
        match cached {
            Some(pool) => Ok(pool),
            None => self.prepare_fresh(target, cancel).await,
        }
    }

    fn mark_running(&self, target_id: &str, running: bool) {
        if let Err(e) = self.store.set_running(target_id, running) {
            tracing::debug!("running flag for {target_id} not persisted: {e}");
        }
    }

    // ─── Stop ─────────────────────────────────────────────────

    /// Stop one target. Idempotent for configured targets; an id that is
    /// neither configured nor running is `NotFound`.
    pub fn stop(&self, target_id: &str) -> Result<()> {
        let was_queued = lock(&self.queue).remove(target_id);
        lock(&self.serial_configs).remove(target_id);
        let state = self.registry.unregister(target_id);
        if let Some(state) = &state {
            state.cancel();
        }

        match self.store.set_running(target_id, false) {
            Ok(()) => {}
            Err(BurstError::NotFound(_)) if state.is_none() && !was_queued => {
                return Err(BurstError::NotFound(target_id.to_string()));
            }
            Err(e) => tracing::debug!("running flag for {target_id} not cleared: {e}"),
        }
        if state.is_some() || was_queued {
            tracing::info!("⏹️ Stopped {target_id}");
        }
        Ok(())
    }

    /// Stop every session and empty the serial queue.
    pub fn stop_all(&self) {
        let stopped = self.halt_all();
        for id in &stopped {
            self.mark_running(id, false);
        }
        tracing::info!("🛑 Stopped all dispatch ({} target(s))", stopped.len());
    }

    /// Cancel everything without touching the store. Returns affected ids.
    fn halt_all(&self) -> Vec<String> {
        let mut ids = lock(&self.queue).clear();
        lock(&self.serial_configs).clear();
        for state in self.registry.drain() {
            state.cancel();
            if !ids.iter().any(|id| id == state.target_id()) {
                ids.push(state.target_id().to_string());
            }
        }
        ids
    }

    // ─── Configuration ────────────────────────────────────────

    /// Create or replace a target's configuration, keeping its running flag.
    pub fn set_config(&self, mut target: TargetConfig) -> Result<()> {
        target.validate()?;
        target.running = self
            .store
            .get(&target.id)?
            .map(|existing| existing.running)
            .unwrap_or(false);
        self.store.upsert(&target.id, &target)?;
        if let Some(held) = self.pools_lock().get_mut(&target.id) {
            held.reusable = false;
        }
        tracing::info!("📝 Saved config for '{}' ({})", target.name, target.id);
        Ok(())
    }

    /// Stop a target, erase its configuration and retire the last pool
    /// built for it, however its session ended.
    pub async fn delete_config(&self, target_id: &str) -> Result<()> {
        self.stop(target_id)?;
        self.store.delete(target_id)?;
        let pool = self.pools_lock().remove(target_id).map(|held| held.pool);
        if let Some(pool) = pool {
            let failures = self
                .provisioner
                .retire(&pool, self.config.provisioning.erase_policy)
                .await;
            if failures > 0 {
                tracing::warn!("⚠️ {failures} resource(s) of {target_id} could not be retired");
            }
        }
        tracing::info!("🗑️ Deleted config {target_id}");
        Ok(())
    }

    pub fn list_configured(&self) -> Result<HashMap<String, TargetConfig>> {
        self.store.list()
    }

    pub fn list_active(&self) -> HashMap<String, LoopSnapshot> {
        self.registry.snapshot()
    }

    pub fn queue_stats(&self) -> QueueStats {
        lock(&self.queue).stats()
    }

    // ─── Votes ────────────────────────────────────────────────

    pub async fn handle_vote(&self, target_id: &str, vote: &VoteInteraction) -> VoteOutcome {
        match self.registry.get(target_id) {
            Some(state) => self.runner.vote_gate().handle_vote(&state, vote).await,
            None => VoteOutcome::NotActive,
        }
    }

    /// Resume a paused session without a vote. `Ok(false)` if it was not paused.
    pub fn force_resume(&self, target_id: &str) -> Result<bool> {
        let state = self
            .registry
            .get(target_id)
            .ok_or_else(|| BurstError::NotFound(target_id.to_string()))?;
        let resumed = state.force_resume();
        if resumed {
            tracing::info!("⏩ Force-resumed '{}'", state.name());
        }
        Ok(resumed)
    }

    // ─── Rate-limit breaker ───────────────────────────────────

    /// Count one rate-limit violation; a burst stops everything.
    pub fn on_rate_limit_signal(self: &Arc<Self>) {
        if !self.breaker.record_signal() || !self.breaker.try_engage() {
            return;
        }
        tracing::warn!(
            "🚨 Rate-limit storm detected (trip #{}), stopping all dispatch",
            self.breaker.trips()
        );
        self.stop_all();

        let cooldown = self.breaker.cooldown();
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) if !cooldown.is_zero() => handle,
            _ => {
                self.breaker.release();
                return;
            }
        };
        let this = Arc::clone(self);
        handle.spawn(async move {
            tokio::time::sleep(cooldown).await;
            this.breaker.release();
            tracing::info!("✅ Circuit breaker cleared after {}s", cooldown.as_secs());
        });
    }

    /// Subscribe to a rate-limit signal source.
    pub fn attach_rate_limit_signal(self: &Arc<Self>, signal: &dyn RateLimitSignal) {
        let weak = Arc::downgrade(self);
        signal.subscribe(Arc::new(move || {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.on_rate_limit_signal();
            }
        }));
    }

    pub fn is_breaker_engaged(&self) -> bool {
        self.breaker.is_engaged()
    }

    // ─── Lifecycle ────────────────────────────────────────────

    /// Start every stored target whose running flag is set.
    pub async fn restore_running(self: &Arc<Self>) -> Result<StartReport> {
        let mut ids: Vec<String> = self
            .store
            .list()?
            .into_values()
            .filter(|t| t.running)
            .map(|t| t.id)
            .collect();
        if ids.is_empty() {
            return Ok(StartReport::default());
        }
        ids.sort();
        tracing::info!("♻️ Restoring {} running target(s)", ids.len());
        self.batch_start(&ids, None).await
    }

    /// Cancel every session and wait for all of them to quiesce. Running
    /// flags are kept so `restore_running` can pick them up again.
    pub async fn shutdown(&self) {
        let halted = self.halt_all();
        self.sessions.close();
        self.sessions.wait().await;
        tracing::info!("👋 Dispatcher shut down ({} target(s) halted)", halted.len());
    }
}

enum Launch {
    Started,
    Queued,
    AlreadyRunning,
}

/// Applies session completion events until the dispatcher is dropped.
async fn coordinate(dispatcher: Weak<Dispatcher>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(dispatcher) = dispatcher.upgrade() else {
            break;
        };
        dispatcher.on_event(event).await;
    }
}
