//! Backend tiers and their liveness.
//!
//! Every protocol family owns one [`NodeTierSet`]: three endpoints tagged
//! light, full and archive, each with a health record written by the
//! [`HealthChecker`] and read on every forwarded request.

pub mod health;
pub mod probe;

pub use health::HealthChecker;
pub use probe::{
    GrpcProbe,
    HttpProbe,
    Probe,
    ProbeError,
};

use std::{
    fmt,
    sync::atomic::{
        AtomicBool,
        AtomicU64,
        Ordering,
    },
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use serde::{
    Deserialize,
    Serialize,
};
use url::Url;

use crate::error::{
    FirewallError,
    Result,
};

/// Client-facing protocol family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    JsonRpc,
    Grpc,
    Rest,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::JsonRpc, Protocol::Grpc, Protocol::Rest];

    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::JsonRpc => "json-rpc",
            Protocol::Grpc => "grpc",
            Protocol::Rest => "rest",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend node category. Tiers differ in what they can serve, so they are
/// tried in a fixed order and never balanced against each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeTier {
    Light,
    Full,
    Archive,
}

impl NodeTier {
    /// Selection order of [`NodeTierSet::current_best`].
    pub const PRIORITY: [NodeTier; 3] = [NodeTier::Light, NodeTier::Full, NodeTier::Archive];

    pub const fn as_str(self) -> &'static str {
        match self {
            NodeTier::Light => "light",
            NodeTier::Full => "full",
            NodeTier::Archive => "archive",
        }
    }

    const fn index(self) -> usize {
        match self {
            NodeTier::Light => 0,
            NodeTier::Full => 1,
            NodeTier::Archive => 2,
        }
    }
}

impl fmt::Display for NodeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierEndpoints {
    pub light: Url,
    pub full: Url,
    pub archive: Url,
}

impl TierEndpoints {
    pub fn get(&self, tier: NodeTier) -> &Url {
        match tier {
            NodeTier::Light => &self.light,
            NodeTier::Full => &self.full,
            NodeTier::Archive => &self.archive,
        }
    }
}

/// The backend a request is forwarded to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendTarget {
    /// `None` for a fixed, untiered upstream.
    pub tier: Option<NodeTier>,
    pub endpoint: Url,
}

#[derive(Debug)]
struct TierHealth {
    endpoint: Url,
    healthy: AtomicBool,
    /// Milliseconds since the unix epoch, 0 until the first probe.
    last_checked_ms: AtomicU64,
}

impl TierHealth {
    fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            healthy: AtomicBool::new(false),
            last_checked_ms: AtomicU64::new(0),
        }
    }
}

/// Liveness state of the three tiers serving one protocol family.
///
/// Single writer (the health checker), any number of readers. Tiers start
/// unhealthy until their first probe succeeds.
#[derive(Debug)]
pub struct NodeTierSet {
    protocol: Protocol,
    tiers: [TierHealth; 3],
    timeout: Duration,
    check_interval: Duration,
}

impl NodeTierSet {
    pub fn new(
        protocol: Protocol,
        endpoints: TierEndpoints,
        timeout: Duration,
        check_interval: Duration,
    ) -> Self {
        let TierEndpoints {
            light,
            full,
            archive,
        } = endpoints;
        Self {
            protocol,
            tiers: [
                TierHealth::new(light),
                TierHealth::new(full),
                TierHealth::new(archive),
            ],
            timeout,
            check_interval,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn endpoint(&self, tier: NodeTier) -> &Url {
        &self.tiers[tier.index()].endpoint
    }

    /// Returns the highest-priority healthy tier.
    pub fn current_best(&self) -> Result<BackendTarget> {
        NodeTier::PRIORITY
            .into_iter()
            .find(|tier| self.is_healthy(*tier))
            .map(|tier| {
                BackendTarget {
                    tier: Some(tier),
                    endpoint: self.endpoint(tier).clone(),
                }
            })
            .ok_or(FirewallError::NoHealthyNode(self.protocol))
    }

    pub fn is_healthy(&self, tier: NodeTier) -> bool {
        self.tiers[tier.index()].healthy.load(Ordering::Acquire)
    }

    /// Time of the last completed probe, `None` before the first one.
    pub fn last_checked(&self, tier: NodeTier) -> Option<SystemTime> {
        match self.tiers[tier.index()].last_checked_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    /// Records a probe outcome and returns the previous liveness flag.
    ///
    /// Written by [`HealthChecker`]; exposed for embedding and tests.
    pub fn set_health(&self, tier: NodeTier, healthy: bool) -> bool {
        let record = &self.tiers[tier.index()];
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(1, |d| d.as_millis().max(1) as u64);
        record.last_checked_ms.store(now_ms, Ordering::Release);
        record.healthy.swap(healthy, Ordering::AcqRel)
    }
}
