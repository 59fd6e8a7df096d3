//! Round executor — one full pass over an endpoint pool.
//!
//! Endpoints are shuffled, launched with a throughput-derived spacing and a
//! small random start jitter, and each send passes through the global
//! [`SendLimiter`]. A task always posts its main-channel message before its
//! sub-target messages. Every wait races the session's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use burstcast_core::config::DispatchTunables;
use burstcast_core::{EndpointIdentity, MessagingClient};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::limits::SendLimiter;
use crate::provisioner::{EndpointPool, PoolEntry};
use crate::random::{RandomSource, shuffle};

/// Message bodies for one round.
#[derive(Debug, Clone)]
pub struct RoundPayload {
    pub content: Arc<str>,
    /// Sub-target body; `None` skips sub-target delivery.
    pub sub_content: Option<Arc<str>>,
}

impl RoundPayload {
    pub fn new(content: &str, sub_content: Option<&str>) -> Self {
        Self {
            content: Arc::from(content),
            sub_content: sub_content.map(Arc::from),
        }
    }
}

/// Outcome counters for one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Endpoint tasks launched.
    pub launched: usize,
    pub delivered: usize,
    /// Sends that exhausted their retries.
    pub failed: usize,
    /// Sends dropped because the session was cancelled.
    pub abandoned: usize,
    pub cancelled: bool,
}

impl RoundReport {
    fn absorb(&mut self, tally: SendTally) {
        self.delivered += tally.delivered;
        self.failed += tally.failed;
        self.abandoned += tally.abandoned;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SendTally {
    delivered: usize,
    failed: usize,
    abandoned: usize,
}

impl SendTally {
    fn add(&mut self, result: SendResult) {
        match result {
            SendResult::Delivered => self.delivered += 1,
            SendResult::Failed => self.failed += 1,
            SendResult::Abandoned => self.abandoned += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendResult {
    Delivered,
    Failed,
    Abandoned,
}

/// Sleep for `duration` unless `cancel` fires first. Returns `false` on cancel.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Everything a spawned send task needs, cheap to clone.
#[derive(Clone)]
struct SendContext {
    client: Arc<dyn MessagingClient>,
    limiter: SendLimiter,
    retries: u32,
    backoff: Duration,
    sub_pace_every: usize,
    sub_pace: Duration,
    cancel: CancellationToken,
}

impl SendContext {
    async fn send_with_retry(
        &self,
        endpoint: &EndpointIdentity,
        sub_target: Option<&str>,
        content: &str,
    ) -> SendResult {
        for attempt in 0..=self.retries {
            let Some(permit) = self.limiter.acquire(&self.cancel).await else {
                return SendResult::Abandoned;
            };
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SendResult::Abandoned,
                r = self.client.send(endpoint, sub_target, content) => r,
            };
            drop(permit);

            match result {
                Ok(()) => return SendResult::Delivered,
                Err(e) => {
                    tracing::debug!(
                        "send via {} (sub {:?}) attempt {} failed: {e}",
                        endpoint.id,
                        sub_target,
                        attempt + 1
                    );
                    if attempt < self.retries && !sleep_or_cancel(self.backoff, &self.cancel).await {
                        return SendResult::Abandoned;
                    }
                }
            }
        }
        SendResult::Failed
    }

    /// Main message first, then the paced sub-target fan-out.
    async fn deliver(self, entry: PoolEntry, payload: RoundPayload, jitter: Duration) -> SendTally {
        let mut tally = SendTally::default();

        if !sleep_or_cancel(jitter, &self.cancel).await {
            tally.abandoned += 1;
            return tally;
        }

        let main = self.send_with_retry(&entry.endpoint, None, &payload.content).await;
        tally.add(main);
        if main == SendResult::Abandoned {
            return tally;
        }

        let Some(sub_content) = payload.sub_content.as_deref() else {
            return tally;
        };
        for (i, sub) in entry.sub_targets.iter().enumerate() {
            if i > 0
                && self.sub_pace_every > 0
                && i % self.sub_pace_every == 0
                && !sleep_or_cancel(self.sub_pace, &self.cancel).await
            {
                tally.abandoned += entry.sub_targets.len() - i;
                return tally;
            }
            let r = self.send_with_retry(&entry.endpoint, Some(sub), sub_content).await;
            tally.add(r);
            if r == SendResult::Abandoned {
                tally.abandoned += entry.sub_targets.len() - i - 1;
                return tally;
            }
        }
        tally
    }
}

/// Executes rounds against endpoint pools.
pub struct RoundExecutor {
    client: Arc<dyn MessagingClient>,
    limiter: SendLimiter,
    rng: Arc<dyn RandomSource>,
    tunables: DispatchTunables,
}

impl RoundExecutor {
    pub fn new(
        client: Arc<dyn MessagingClient>,
        limiter: SendLimiter,
        rng: Arc<dyn RandomSource>,
        tunables: DispatchTunables,
    ) -> Self {
        Self {
            client,
            limiter,
            rng,
            tunables,
        }
    }

    /// Spacing between endpoint launches for a throughput of `per_sec`.
    fn launch_spacing(per_sec: u64) -> Duration {
        Duration::from_micros(1_000_000 / per_sec.max(1))
    }

    /// Run one round. `buf` is reused across rounds to avoid reallocating
    /// the endpoint list. Returns once every task finished or `cancel` fired.
    pub async fn execute_round(
        &self,
        pool: &EndpointPool,
        payload: &RoundPayload,
        buf: &mut Vec<PoolEntry>,
        cancel: &CancellationToken,
    ) -> RoundReport {
        let mut report = RoundReport::default();
        pool.fill_entries(buf);
        shuffle(self.rng.as_ref(), buf);

        let t = &self.tunables;
        let throughput = self.rng.range(t.throughput_min, t.throughput_max);
        let spacing = Self::launch_spacing(throughput);

        let ctx = SendContext {
            client: self.client.clone(),
            limiter: self.limiter.clone(),
            retries: t.send_retries,
            backoff: t.retry_backoff(),
            sub_pace_every: t.sub_target_pace_every,
            sub_pace: t.sub_target_pace(),
            cancel: cancel.clone(),
        };

        let mut tasks = JoinSet::new();
        for (i, entry) in buf.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if i > 0 && !sleep_or_cancel(spacing, cancel).await {
                report.cancelled = true;
                break;
            }
            let jitter = Duration::from_millis(
                self.rng.range(t.start_jitter_min_ms, t.start_jitter_max_ms),
            );
            tasks.spawn(ctx.clone().deliver(entry.clone(), payload.clone(), jitter));
            report.launched += 1;
        }

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                joined = tasks.join_next() => Some(joined),
            };
            match joined {
                None => {
                    report.cancelled = true;
                    tasks.shutdown().await;
                    break;
                }
                Some(None) => break,
                Some(Some(Ok(tally))) => report.absorb(tally),
                Some(Some(Err(e))) => {
                    tracing::warn!("⚠️ Send task for {} ended abnormally: {e}", pool.target_id);
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            "🔁 Round for {}: launched={} delivered={} failed={} abandoned={} ({}/s)",
            pool.target_id,
            report.launched,
            report.delivered,
            report.failed,
            report.abandoned,
            throughput
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::ChannelPool;
    use crate::random::ThreadRandom;
    use crate::testkit::FakePlatform;

    fn fast_tunables() -> DispatchTunables {
        DispatchTunables {
            start_jitter_min_ms: 0,
            start_jitter_max_ms: 2,
            throughput_min: 1000,
            throughput_max: 1000,
            retry_backoff_ms: 1,
            sub_target_pace_every: 2,
            sub_target_pace_ms: 1,
            ..DispatchTunables::default()
        }
    }

    fn pool(endpoints: usize, subs: &[&str]) -> EndpointPool {
        EndpointPool::new(
            "t1",
            vec![ChannelPool {
                channel_id: "c1".into(),
                group_id: "g1".into(),
                endpoints: (0..endpoints)
                    .map(|i| EndpointIdentity { id: format!("e{i}"), token: "tok".into() })
                    .collect(),
                sub_targets: Arc::new(subs.iter().map(|s| s.to_string()).collect()),
            }],
        )
    }

    fn executor(platform: &Arc<FakePlatform>, limiter: SendLimiter) -> RoundExecutor {
        RoundExecutor::new(platform.clone(), limiter, Arc::new(ThreadRandom), fast_tunables())
    }

    #[tokio::test]
    async fn test_round_sends_once_per_endpoint() {
        let platform = Arc::new(FakePlatform::new());
        let exec = executor(&platform, SendLimiter::new(4));
        let mut buf = Vec::new();
        let report = exec
            .execute_round(&pool(5, &[]), &RoundPayload::new("ping", None), &mut buf, &CancellationToken::new())
            .await;
        assert_eq!(report.launched, 5);
        assert_eq!(report.delivered, 5);
        assert_eq!(platform.sends().len(), 5);
        assert_eq!(buf.len(), 5);
    }

    #[tokio::test]
    async fn test_main_message_precedes_sub_targets() {
        let platform = Arc::new(FakePlatform::new());
        let exec = executor(&platform, SendLimiter::new(8));
        let mut buf = Vec::new();
        let report = exec
            .execute_round(
                &pool(3, &["s1", "s2", "s3"]),
                &RoundPayload::new("main", Some("sub")),
                &mut buf,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.delivered, 12);

        let sends = platform.sends();
        for endpoint in ["e0", "e1", "e2"] {
            let mine: Vec<_> = sends.iter().filter(|s| s.endpoint_id == endpoint).collect();
            assert_eq!(mine.len(), 4);
            assert!(mine[0].sub_target.is_none());
            assert_eq!(mine[0].content, "main");
            assert!(mine[1..].iter().all(|s| s.sub_target.is_some() && s.content == "sub"));
        }
    }

    #[tokio::test]
    async fn test_failed_send_retried_twice_then_abandoned() {
        let platform = Arc::new(FakePlatform::new());
        platform.fail_sends_via("e0", usize::MAX);
        let exec = executor(&platform, SendLimiter::new(4));
        let mut buf = Vec::new();
        let report = exec
            .execute_round(&pool(2, &[]), &RoundPayload::new("ping", None), &mut buf, &CancellationToken::new())
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(platform.send_attempts_via("e0"), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let platform = Arc::new(FakePlatform::new());
        platform.fail_sends_via("e0", 1);
        let exec = executor(&platform, SendLimiter::new(4));
        let mut buf = Vec::new();
        let report = exec
            .execute_round(&pool(1, &[]), &RoundPayload::new("ping", None), &mut buf, &CancellationToken::new())
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(platform.send_attempts_via("e0"), 2);
    }

    #[tokio::test]
    async fn test_send_limiter_bounds_in_flight() {
        let platform = Arc::new(FakePlatform::new());
        platform.set_send_delay(Duration::from_millis(10));
        let exec = executor(&platform, SendLimiter::new(2));
        let mut buf = Vec::new();
        exec.execute_round(&pool(8, &[]), &RoundPayload::new("ping", None), &mut buf, &CancellationToken::new())
            .await;
        assert_eq!(platform.sends().len(), 8);
        assert!(platform.peak_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_cancel_returns_promptly() {
        let platform = Arc::new(FakePlatform::new());
        platform.set_send_delay(Duration::from_secs(30));
        let exec = executor(&platform, SendLimiter::new(4));
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            });
        }
        let mut buf = Vec::new();
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            exec.execute_round(&pool(3, &[]), &RoundPayload::new("ping", None), &mut buf, &cancel),
        )
        .await
        .expect("round must observe cancellation");
        assert!(report.cancelled);
        assert_eq!(report.delivered, 0);
    }
}
