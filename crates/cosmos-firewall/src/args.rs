//! Command line arguments. Every flag overrides the matching field of the
//! JSON configuration file, or of the defaults when no file is given.
use std::{
    net::SocketAddr,
    path::PathBuf,
};

use clap::Parser;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::{
    config::FirewallConfig,
    error::Result,
    tx::Coin,
};

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Admission-control firewall for Cosmos SDK nodes", long_about = None)]
pub struct Args {
    /// JSON configuration file
    #[arg(long, env = "FIREWALL_CONFIG")]
    pub config: Option<PathBuf>,
    /// Address for the Tendermint JSON-RPC listener
    #[arg(long = "rpc-address", env = "FIREWALL_RPC_ADDRESS")]
    pub rpc_address: Option<SocketAddr>,
    /// Address for the gRPC listener
    #[arg(long = "grpc-address", env = "FIREWALL_GRPC_ADDRESS")]
    pub grpc_address: Option<SocketAddr>,
    /// Address for the REST listener
    #[arg(long = "rest-address", env = "FIREWALL_REST_ADDRESS")]
    pub rest_address: Option<SocketAddr>,
    /// Chain JSON-RPC endpoint used when no tiered redirect is configured
    #[arg(long = "json-rpc", env = "FIREWALL_CHAIN_JSON_RPC")]
    pub json_rpc: Option<Url>,
    /// Chain gRPC endpoint used when no tiered redirect is configured
    #[arg(long = "grpc", env = "FIREWALL_CHAIN_GRPC")]
    pub grpc: Option<Url>,
    /// Chain REST endpoint used when no tiered redirect is configured
    #[arg(long = "rest", env = "FIREWALL_CHAIN_REST")]
    pub rest: Option<Url>,
    /// Minimum gas limit a transaction must declare
    #[arg(long = "minimum-gas-limit", env = "FIREWALL_MINIMUM_GAS_LIMIT")]
    pub minimum_gas_limit: Option<u64>,
    /// Minimum fee, e.g. `500utest`
    #[arg(long = "minimum-fee", env = "FIREWALL_MINIMUM_FEE")]
    pub minimum_fee: Option<Coin>,
    /// Maximum memo length in bytes
    #[arg(long = "max-memo", env = "FIREWALL_MAX_MEMO")]
    pub max_memo: Option<u64>,
    /// Message type URLs allowed in a transaction
    #[arg(long = "white-routers", env = "FIREWALL_WHITE_ROUTERS", value_delimiter = ',')]
    pub white_routers: Option<Vec<String>>,
    /// Maximum number of extension options
    #[arg(long = "extension-options", env = "FIREWALL_EXTENSION_OPTIONS")]
    pub extension_options: Option<usize>,
    /// Maximum number of non-critical extension options
    #[arg(long = "non-critical-extension-options", env = "FIREWALL_NON_CRITICAL_EXTENSION_OPTIONS")]
    pub non_critical_extension_options: Option<usize>,
    /// Maximum fee granter length, 0 forbids a granter
    #[arg(long = "granter", env = "FIREWALL_GRANTER")]
    pub granter: Option<usize>,
    /// Maximum fee payer length, 0 forbids a payer
    #[arg(long = "payer", env = "FIREWALL_PAYER")]
    pub payer: Option<usize>,
    /// Exact number of signer infos a transaction must carry
    #[arg(long = "signer-infos", env = "FIREWALL_SIGNER_INFOS")]
    pub signer_infos: Option<usize>,
    /// Minimum number of signatures
    #[arg(long = "minimum-signatures", env = "FIREWALL_MINIMUM_SIGNATURES")]
    pub minimum_signatures: Option<usize>,
    /// Public key type URLs allowed for signers
    #[arg(long = "public-key-type-url", env = "FIREWALL_PUBLIC_KEY_TYPE_URL", value_delimiter = ',')]
    pub public_key_type_url: Option<Vec<String>>,
    /// Log level
    #[arg(long = "log-level", env = "FIREWALL_LOG_LEVEL", default_value = "info")]
    pub log_level: LevelFilter,
}

impl Args {
    /// Builds the validated configuration: file (or defaults), then flags.
    pub fn load_config(&self) -> Result<FirewallConfig> {
        let mut config = match &self.config {
            Some(path) => FirewallConfig::from_file(path)?,
            None => FirewallConfig::default(),
        };
        self.apply(&mut config);
        config.validate()
    }

    fn apply(&self, config: &mut FirewallConfig) {
        if let Some(addr) = self.rpc_address {
            config.rpc_address = addr;
        }
        if let Some(addr) = self.grpc_address {
            config.grpc_address = addr;
        }
        if let Some(addr) = self.rest_address {
            config.rest_address = addr;
        }
        if let Some(url) = &self.json_rpc {
            config.chain.json_rpc = Some(url.clone());
        }
        if let Some(url) = &self.grpc {
            config.chain.grpc = Some(url.clone());
        }
        if let Some(url) = &self.rest {
            config.chain.rest = Some(url.clone());
        }

        let policy = &mut config.policy;
        if let Some(gas) = self.minimum_gas_limit {
            policy.minimum_gas_limit = gas;
        }
        if let Some(fee) = &self.minimum_fee {
            policy.minimum_fee = Some(fee.clone());
        }
        if let Some(memo) = self.max_memo {
            policy.max_memo_length = memo;
        }
        if let Some(routes) = &self.white_routers {
            policy.allowed_message_routes = non_empty(routes);
        }
        if let Some(max) = self.extension_options {
            policy.max_extension_options = max;
        }
        if let Some(max) = self.non_critical_extension_options {
            policy.max_non_critical_extension_options = max;
        }
        if let Some(max) = self.granter {
            policy.max_granter_length = max;
        }
        if let Some(max) = self.payer {
            policy.max_payer_length = max;
        }
        if let Some(count) = self.signer_infos {
            policy.exact_signer_infos = count;
        }
        if let Some(count) = self.minimum_signatures {
            policy.minimum_signatures = count;
        }
        if let Some(types) = &self.public_key_type_url {
            policy.allowed_public_key_type_urls = non_empty(types);
        }
    }
}

// Repeated flags may carry empty values (`--white-routers ""`); they never
// whitelist anything.
fn non_empty<C: FromIterator<String>>(values: &[String]) -> C {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
