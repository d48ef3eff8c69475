use std::{
    collections::HashSet,
    fs,
    net::SocketAddr,
    path::Path,
    time::Duration,
};

use serde::{
    Deserialize,
    Serialize,
};
use url::Url;

use crate::{
    error::{
        FirewallError,
        Result,
    },
    node::{
        NodeTier,
        Protocol,
        TierEndpoints,
    },
    tx::Coin,
};

pub const DEFAULT_JSON_RPC_ADDRESS: &str = "0.0.0.0:26657";
pub const DEFAULT_GRPC_ADDRESS: &str = "0.0.0.0:9090";
pub const DEFAULT_REST_ADDRESS: &str = "0.0.0.0:1317";
pub const DEFAULT_MIN_GAS_LIMIT: u64 = 10_000;
pub const DEFAULT_MAX_MEMO_LENGTH: u64 = 256;
/// Upper bound on request bodies the firewall buffers for inspection (10MB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Runtime configuration for the firewall.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Address the Tendermint JSON-RPC listener binds to.
    pub rpc_address: SocketAddr,
    /// Address the gRPC listener binds to.
    pub grpc_address: SocketAddr,
    /// Address the REST gateway listener binds to.
    pub rest_address: SocketAddr,
    /// Single chain endpoints used for protocols without a tiered redirect.
    pub chain: NodeEndpoints,
    /// Tiered backend topology.
    pub redirect: RedirectConfig,
    /// Admission policy applied to every broadcast transaction.
    pub policy: PolicyConfig,
    /// How long HTTP listeners wait for in-flight requests on shutdown.
    pub shutdown_grace_secs: u64,
    /// Largest request body buffered for policy inspection.
    pub max_body_bytes: usize,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            rpc_address: DEFAULT_JSON_RPC_ADDRESS.parse().expect("static address"),
            grpc_address: DEFAULT_GRPC_ADDRESS.parse().expect("static address"),
            rest_address: DEFAULT_REST_ADDRESS.parse().expect("static address"),
            chain: NodeEndpoints::default(),
            redirect: RedirectConfig::default(),
            policy: PolicyConfig::default(),
            shutdown_grace_secs: 10,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Per-protocol endpoints of one node (or of the fixed chain upstream).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeEndpoints {
    pub json_rpc: Option<Url>,
    pub grpc: Option<Url>,
    pub rest: Option<Url>,
}

impl NodeEndpoints {
    pub fn get(&self, protocol: Protocol) -> Option<&Url> {
        match protocol {
            Protocol::JsonRpc => self.json_rpc.as_ref(),
            Protocol::Grpc => self.grpc.as_ref(),
            Protocol::Rest => self.rest.as_ref(),
        }
    }
}

/// The light/full/archive backend topology.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    pub enable: bool,
    pub light: NodeEndpoints,
    pub full: NodeEndpoints,
    pub archive: NodeEndpoints,
    /// Per-probe and per-request timeout.
    pub timeout_secs: u64,
    /// Interval between two health probes of the same tier.
    pub check_interval_secs: u64,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            enable: false,
            light: NodeEndpoints::default(),
            full: NodeEndpoints::default(),
            archive: NodeEndpoints::default(),
            timeout_secs: 5,
            check_interval_secs: 10,
        }
    }
}

impl RedirectConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    fn node(&self, tier: NodeTier) -> &NodeEndpoints {
        match tier {
            NodeTier::Light => &self.light,
            NodeTier::Full => &self.full,
            NodeTier::Archive => &self.archive,
        }
    }
}

/// Admission rules evaluated against every broadcast transaction.
///
/// Loaded once and shared read-only by every request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub minimum_gas_limit: u64,
    /// Fee the transaction must pay in this denom. `None` disables the check.
    pub minimum_fee: Option<Coin>,
    /// Memo ceiling in bytes.
    pub max_memo_length: u64,
    pub allowed_message_routes: HashSet<String>,
    pub max_extension_options: usize,
    pub max_non_critical_extension_options: usize,
    /// Longest fee granter accepted; 0 requires the field to be empty.
    pub max_granter_length: usize,
    /// Longest fee payer accepted; 0 requires the field to be empty.
    pub max_payer_length: usize,
    pub exact_signer_infos: usize,
    pub minimum_signatures: usize,
    pub allowed_public_key_type_urls: HashSet<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            minimum_gas_limit: DEFAULT_MIN_GAS_LIMIT,
            minimum_fee: None,
            max_memo_length: DEFAULT_MAX_MEMO_LENGTH,
            allowed_message_routes: HashSet::new(),
            max_extension_options: 0,
            max_non_critical_extension_options: 0,
            max_granter_length: 0,
            max_payer_length: 0,
            exact_signer_infos: 1,
            minimum_signatures: 1,
            allowed_public_key_type_urls: HashSet::new(),
        }
    }
}

impl PolicyConfig {
    fn validate(&self) -> Result<()> {
        if self.allowed_message_routes.iter().any(|r| r.trim().is_empty()) {
            return Err(FirewallError::InvalidConfig(
                "allowed_message_routes must not contain empty entries".into(),
            ));
        }
        if self
            .allowed_public_key_type_urls
            .iter()
            .any(|t| t.trim().is_empty())
        {
            return Err(FirewallError::InvalidConfig(
                "allowed_public_key_type_urls must not contain empty entries".into(),
            ));
        }
        Ok(())
    }
}

/// Backends are dialled in plaintext.
fn check_scheme(protocol: Protocol, endpoint: &Url) -> Result<()> {
    if endpoint.scheme() != "http" {
        return Err(FirewallError::InvalidConfig(format!(
            "{protocol} upstream {endpoint} must use the http scheme"
        )));
    }
    Ok(())
}

/// Where one protocol family's traffic goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpstreamSpec {
    Fixed(Url),
    Tiered(TierEndpoints),
}

impl FirewallConfig {
    /// Loads a configuration from a JSON file. Missing fields take defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            FirewallError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            FirewallError::InvalidConfig(format!("failed to parse {}: {e}", path.display()))
        })
    }

    /// Validates a configuration loaded from CLI flags or disk.
    pub fn validate(self) -> Result<Self> {
        self.policy.validate()?;

        for protocol in Protocol::ALL {
            match self.upstream_for(protocol)? {
                UpstreamSpec::Fixed(endpoint) => check_scheme(protocol, &endpoint)?,
                UpstreamSpec::Tiered(tiers) => {
                    for endpoint in [&tiers.light, &tiers.full, &tiers.archive] {
                        check_scheme(protocol, endpoint)?;
                    }
                }
            }
        }

        if self.redirect.enable {
            if self.redirect.timeout_secs == 0 || self.redirect.check_interval_secs == 0 {
                return Err(FirewallError::InvalidConfig(
                    "redirect timeout and check interval must be non-zero".into(),
                ));
            }
            if self.redirect.timeout_secs > self.redirect.check_interval_secs {
                return Err(FirewallError::InvalidConfig(
                    "redirect timeout must not exceed the check interval".into(),
                ));
            }
        }

        let addresses = [self.rpc_address, self.grpc_address, self.rest_address];
        for (i, addr) in addresses.iter().enumerate() {
            if addr.port() != 0 && addresses[i + 1..].contains(addr) {
                return Err(FirewallError::InvalidConfig(format!(
                    "listen address {addr} is used by more than one protocol"
                )));
            }
        }

        if self.max_body_bytes == 0 {
            return Err(FirewallError::InvalidConfig(
                "max_body_bytes must be non-zero".into(),
            ));
        }

        Ok(self)
    }

    /// Resolves the upstream for `protocol`: the tiered set when every tier
    /// names an endpoint for it, otherwise the fixed chain endpoint.
    pub fn upstream_for(&self, protocol: Protocol) -> Result<UpstreamSpec> {
        if self.redirect.enable {
            let tiers = NodeTier::PRIORITY.map(|tier| self.redirect.node(tier).get(protocol));
            match tiers {
                [Some(light), Some(full), Some(archive)] => {
                    return Ok(UpstreamSpec::Tiered(TierEndpoints {
                        light: light.clone(),
                        full: full.clone(),
                        archive: archive.clone(),
                    }));
                }
                [None, None, None] => {}
                _ => {
                    return Err(FirewallError::InvalidConfig(format!(
                        "redirect nodes must define a {protocol} endpoint for every tier or for none"
                    )));
                }
            }
        }

        self.chain
            .get(protocol)
            .cloned()
            .map(UpstreamSpec::Fixed)
            .ok_or_else(|| {
                FirewallError::InvalidConfig(format!("no {protocol} upstream configured"))
            })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn listen_address(&self, protocol: Protocol) -> SocketAddr {
        match protocol {
            Protocol::JsonRpc => self.rpc_address,
            Protocol::Grpc => self.grpc_address,
            Protocol::Rest => self.rest_address,
        }
    }
}
