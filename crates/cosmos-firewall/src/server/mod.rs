//! Listeners and the per-protocol transport adapters.

pub mod grpc;
pub mod jsonrpc;
pub mod listener;
pub mod rest;

pub use grpc::GrpcHandler;
pub use jsonrpc::JsonRpcHandler;
pub use listener::{
    RequestHandler,
    ShutdownPolicy,
};
pub use rest::RestHandler;

use std::{
    net::SocketAddr,
    sync::Arc,
};

use bytes::{
    Bytes,
    BytesMut,
};
use http_body_util::BodyExt;
use hyper::StatusCode;
use percent_encoding::percent_decode_str;
use tokio::{
    net::TcpListener,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
};

use crate::{
    config::{
        FirewallConfig,
        UpstreamSpec,
    },
    director::{
        HttpDirector,
        ProxyBody,
        StreamDirector,
        Upstream,
    },
    error::{
        FirewallError,
        Result,
    },
    node::{
        HealthChecker,
        NodeTierSet,
        Protocol,
        probe,
    },
    policy::{
        Validator,
        Verdict,
    },
    tx::Transaction,
};

/// The three bound listeners plus the configuration they serve.
#[derive(Debug)]
pub struct Firewall {
    config: FirewallConfig,
    json_rpc: TcpListener,
    grpc: TcpListener,
    rest: TcpListener,
}

impl Firewall {
    /// Validates `config` and binds every listener. Any bind failure is fatal.
    pub async fn bind(config: FirewallConfig) -> Result<Self> {
        let config = config.validate()?;
        let json_rpc = listener::bind(Protocol::JsonRpc, config.rpc_address).await?;
        let grpc = listener::bind(Protocol::Grpc, config.grpc_address).await?;
        let rest = listener::bind(Protocol::Rest, config.rest_address).await?;
        Ok(Self {
            config,
            json_rpc,
            grpc,
            rest,
        })
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    pub fn local_addr(&self, protocol: Protocol) -> Result<SocketAddr> {
        let listener = match protocol {
            Protocol::JsonRpc => &self.json_rpc,
            Protocol::Grpc => &self.grpc,
            Protocol::Rest => &self.rest,
        };
        Ok(listener.local_addr()?)
    }

    /// Serves all listeners until `shutdown` is cancelled or one of them fails.
    ///
    /// Tiered upstreams get their first health pass before any listener starts
    /// accepting. The first listener error cancels `shutdown` and is returned
    /// once every listener has stopped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            config,
            json_rpc,
            grpc,
            rest,
        } = self;

        let (
            (json_rpc_upstream, json_rpc_health),
            (grpc_upstream, grpc_health),
            (rest_upstream, rest_health),
        ) = tokio::try_join!(
            upstream(&config, Protocol::JsonRpc, &shutdown),
            upstream(&config, Protocol::Grpc, &shutdown),
            upstream(&config, Protocol::Rest, &shutdown),
        )?;

        let validator = Validator::new(config.policy.clone());
        let timeout = config.redirect.timeout();
        let grace = ShutdownPolicy::Drain(config.shutdown_grace());

        let mut listeners = JoinSet::new();
        listeners.spawn(listener::serve(
            Protocol::JsonRpc,
            json_rpc,
            Arc::new(JsonRpcHandler::new(
                validator.clone(),
                HttpDirector::new(Protocol::JsonRpc, json_rpc_upstream, timeout),
                config.max_body_bytes,
            )),
            grace,
            shutdown.clone(),
        ));
        // gRPC connections are never drained.
        listeners.spawn(listener::serve(
            Protocol::Grpc,
            grpc,
            Arc::new(GrpcHandler::new(
                validator.clone(),
                StreamDirector::new(grpc_upstream, timeout),
                config.max_body_bytes,
            )),
            ShutdownPolicy::Abort,
            shutdown.clone(),
        ));
        listeners.spawn(listener::serve(
            Protocol::Rest,
            rest,
            Arc::new(RestHandler::new(
                validator,
                HttpDirector::new(Protocol::Rest, rest_upstream, timeout),
                config.max_body_bytes,
            )),
            grace,
            shutdown.clone(),
        ));

        let mut outcome = Ok(());
        while let Some(joined) = listeners.join_next().await {
            if let Err(err) = joined.map_err(FirewallError::from).and_then(|served| served) {
                error!(error = %err, "listener failed, shutting down");
                shutdown.cancel();
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }

        for health in [json_rpc_health, grpc_health, rest_health]
            .into_iter()
            .flatten()
        {
            health.join_all().await;
        }
        info!("firewall stopped");
        outcome
    }
}

/// Builds the upstream for `protocol`, starting a health checker for tiered
/// sets.
async fn upstream(
    config: &FirewallConfig,
    protocol: Protocol,
    shutdown: &CancellationToken,
) -> Result<(Upstream, Option<JoinSet<()>>)> {
    match config.upstream_for(protocol)? {
        UpstreamSpec::Fixed(endpoint) => {
            info!(%protocol, %endpoint, "forwarding to fixed upstream");
            Ok((Upstream::Fixed(endpoint), None))
        }
        UpstreamSpec::Tiered(endpoints) => {
            let timeout = config.redirect.timeout();
            let tiers = Arc::new(NodeTierSet::new(
                protocol,
                endpoints,
                timeout,
                config.redirect.check_interval(),
            ));
            let probe = probe::for_protocol(protocol, timeout).map_err(|err| {
                FirewallError::InvalidConfig(format!("failed to build {protocol} probe: {err}"))
            })?;
            let checker = HealthChecker::new(tiers.clone(), probe);
            let health = checker.start(shutdown.clone()).await;
            info!(%protocol, "forwarding to tiered upstream");
            Ok((Upstream::Tiered(tiers), Some(health)))
        }
    }
}

/// Decodes and evaluates one broadcast transaction.
pub(crate) fn admit_tx(validator: &Validator, protocol: Protocol, tx_bytes: &[u8]) -> Result<()> {
    let tx = Transaction::from_tx_bytes(tx_bytes).inspect_err(|err| {
        debug!(%protocol, error = %err, "undecodable transaction");
    })?;

    match validator.evaluate(&tx) {
        Verdict::Accepted => {
            debug!(%protocol, gas_limit = tx.gas_limit, "transaction admitted");
            Ok(())
        }
        Verdict::Rejected(rejection) => {
            metrics::counter!(
                "firewall_rejections_total",
                "protocol" => protocol.as_str(),
                "reason" => rejection.reason.code(),
            )
            .increment(1);
            debug!(%protocol, reason = %rejection.reason, detail = %rejection.detail, "transaction rejected");
            Err(rejection.into())
        }
    }
}

/// Buffers a request body of at most `limit` bytes.
pub(crate) async fn read_body(mut body: ProxyBody, limit: usize) -> Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|err| {
            FirewallError::InvalidRequest(format!("failed to read request body: {err}"))
        })?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if buffer.len() + data.len() > limit {
            return Err(FirewallError::BodyTooLarge(limit));
        }
        buffer.extend_from_slice(&data);
    }
    Ok(buffer.freeze())
}

/// Request path as the node's HTTP router matches it: percent-decoded, with
/// empty and dot segments resolved. A trailing slash is dropped.
pub(crate) fn canonical_path(raw: &str) -> String {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

pub(crate) fn record_request(protocol: Protocol) {
    metrics::counter!("firewall_requests_total", "protocol" => protocol.as_str()).increment(1);
}

pub(crate) fn record_forward_error(protocol: Protocol, err: &FirewallError) {
    match err {
        FirewallError::NoHealthyNode(_) => {
            metrics::counter!("firewall_no_healthy_node_total", "protocol" => protocol.as_str())
                .increment(1);
        }
        FirewallError::Rejected(_) => {}
        _ => {
            metrics::counter!(
                "firewall_forward_errors_total",
                "protocol" => protocol.as_str(),
                "kind" => err.kind(),
            )
            .increment(1);
        }
    }
}

/// HTTP status for an error surfaced on the HTTP protocols.
pub(crate) fn http_status(err: &FirewallError) -> StatusCode {
    match err {
        FirewallError::Rejected(_)
        | FirewallError::InvalidTransaction(_)
        | FirewallError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        FirewallError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        FirewallError::NoHealthyNode(_) => StatusCode::SERVICE_UNAVAILABLE,
        FirewallError::Upstream(_) => StatusCode::BAD_GATEWAY,
        FirewallError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
