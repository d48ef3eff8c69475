use std::sync::Arc;

use futures::future::join_all;
use tokio::{
    task::JoinSet,
    time::{
        Instant,
        MissedTickBehavior,
        interval_at,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    instrument,
    warn,
};

use super::{
    NodeTier,
    NodeTierSet,
    Probe,
    ProbeError,
};

/// Keeps the liveness flags of one [`NodeTierSet`] current.
///
/// Each tier is probed by its own loop so a slow or hanging backend only
/// delays its own updates.
#[derive(Clone)]
pub struct HealthChecker {
    tiers: Arc<NodeTierSet>,
    probe: Arc<dyn Probe>,
}

impl HealthChecker {
    pub fn new(tiers: Arc<NodeTierSet>, probe: Arc<dyn Probe>) -> Self {
        Self { tiers, probe }
    }

    pub fn tiers(&self) -> &Arc<NodeTierSet> {
        &self.tiers
    }

    /// Probes every tier once, then spawns the periodic per-tier loops.
    ///
    /// Returns after the first pass so callers never route against unknown
    /// state. The loops stop when `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> JoinSet<()> {
        self.check_all().await;

        let mut tasks = JoinSet::new();
        for tier in NodeTier::PRIORITY {
            let checker = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { checker.run_tier(tier, shutdown).await });
        }
        tasks
    }

    /// Probes all tiers concurrently.
    pub async fn check_all(&self) {
        join_all(NodeTier::PRIORITY.map(|tier| self.check(tier))).await;
    }

    async fn run_tier(self, tier: NodeTier, shutdown: CancellationToken) {
        let period = self.tiers.check_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = self.check(tier) => {}
            }
        }
        debug!(protocol = %self.tiers.protocol(), %tier, "health checker stopped");
    }

    /// Runs one bounded probe against `tier` and records the outcome.
    #[instrument(level = "trace", skip(self), fields(protocol = %self.tiers.protocol()))]
    pub async fn check(&self, tier: NodeTier) -> bool {
        let protocol = self.tiers.protocol();
        let endpoint = self.tiers.endpoint(tier);
        let timeout = self.tiers.timeout();

        let outcome = tokio::time::timeout(timeout, self.probe.probe(endpoint))
            .await
            .unwrap_or(Err(ProbeError::Timeout(timeout)));

        let first = self.tiers.last_checked(tier).is_none();
        let healthy = outcome.is_ok();
        let was_healthy = self.tiers.set_health(tier, healthy);

        metrics::counter!(
            "firewall_health_probe_total",
            "protocol" => protocol.as_str(),
            "tier" => tier.as_str(),
            "outcome" => if healthy { "success" } else { "failure" },
        )
        .increment(1);

        match outcome {
            Ok(()) if !was_healthy => {
                info!(%protocol, %tier, %endpoint, "backend tier is healthy");
            }
            Err(err) if was_healthy || first => {
                warn!(%protocol, %tier, %endpoint, error = %err, "backend tier is unhealthy");
            }
            Err(err) => {
                debug!(%protocol, %tier, %endpoint, error = %err, "backend tier still unhealthy");
            }
            Ok(()) => {}
        }
        healthy
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("tiers", &self.tiers)
            .finish_non_exhaustive()
    }
}
