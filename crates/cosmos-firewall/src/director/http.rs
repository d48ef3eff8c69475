use std::time::Duration;

use hyper::{
    Request,
    Response,
    Version,
    header::{
        self,
        HeaderValue,
    },
};
use hyper_util::{
    client::legacy::{
        Client,
        connect::HttpConnector,
    },
    rt::TokioExecutor,
};
use tracing::{
    debug,
    warn,
};

use super::{
    ProxyBody,
    Upstream,
    authority,
    boxed,
    rewrite_uri,
    strip_hop_by_hop,
};
use crate::{
    error::{
        FirewallError,
        Result,
    },
    node::Protocol,
};

/// Request/response forwarding for the HTTP protocols.
///
/// The wait for the backend's response head is bounded by `timeout`; the
/// body is streamed back as it arrives.
#[derive(Clone, Debug)]
pub struct HttpDirector {
    protocol: Protocol,
    upstream: Upstream,
    client: Client<HttpConnector, ProxyBody>,
    timeout: Duration,
}

impl HttpDirector {
    pub fn new(protocol: Protocol, upstream: Upstream, timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            protocol,
            upstream,
            client,
            timeout,
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub async fn forward(&self, request: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let target = self.upstream.current_best().inspect_err(|_| {
            warn!(protocol = %self.protocol, "no healthy backend, refusing request");
        })?;

        let (mut parts, body) = request.into_parts();
        parts.uri = rewrite_uri(&target.endpoint, &parts.uri)?;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        let host = HeaderValue::from_str(authority(&target.endpoint))
            .map_err(|err| FirewallError::Upstream(format!("invalid backend host: {err}")))?;
        parts.headers.insert(header::HOST, host);

        debug!(
            protocol = %self.protocol,
            tier = ?target.tier,
            method = %parts.method,
            uri = %parts.uri,
            "forwarding request"
        );

        let response = tokio::time::timeout(
            self.timeout,
            self.client.request(Request::from_parts(parts, body)),
        )
        .await
        .map_err(|_| FirewallError::UpstreamTimeout(self.timeout))?
        .map_err(|err| FirewallError::Upstream(format!("{}: {err}", target.endpoint)))
        .inspect_err(|err| {
            warn!(protocol = %self.protocol, tier = ?target.tier, error = %err, "backend request failed");
        })?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, boxed(body)))
    }
}
