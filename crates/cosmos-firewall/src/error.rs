use std::{
    io,
    net::{
        AddrParseError,
        SocketAddr,
    },
    time::Duration,
};

use thiserror::Error;

use crate::{
    node::Protocol,
    policy::Rejection,
};

pub type Result<T, E = FirewallError> = std::result::Result<T, E>;

/// Top level error type for the firewall.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to bind {protocol} listener on {addr}")]
    Bind {
        protocol: Protocol,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("address parse error: {0}")]
    AddrParse(#[from] AddrParseError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("transaction rejected by admission policy: {0}")]
    Rejected(#[from] Rejection),
    #[error("no healthy {0} node available")]
    NoHealthyNode(Protocol),
    #[error("upstream request error: {0}")]
    Upstream(String),
    #[error("upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),
}

impl FirewallError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FirewallError::InvalidConfig(_) => "invalid_config",
            FirewallError::Bind { .. } => "bind",
            FirewallError::Io(_) => "io",
            FirewallError::AddrParse(_) => "addr_parse",
            FirewallError::Join(_) => "join",
            FirewallError::InvalidTransaction(_) => "invalid_transaction",
            FirewallError::InvalidRequest(_) => "invalid_request",
            FirewallError::BodyTooLarge(_) => "body_too_large",
            FirewallError::Rejected(_) => "rejected",
            FirewallError::NoHealthyNode(_) => "no_healthy_node",
            FirewallError::Upstream(_) => "upstream",
            FirewallError::UpstreamTimeout(_) => "upstream_timeout",
        }
    }
}
