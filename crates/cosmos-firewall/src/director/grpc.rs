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

/// Generic gRPC passthrough.
///
/// Calls are relayed as opaque HTTP/2 exchanges keyed only by their
/// `/service/method` path. Request frames stream to the backend as the client
/// sends them and response frames stream back as they arrive, so unary and
/// streaming calls share one path. The backend's trailers, and with them its
/// `grpc-status` and metadata, reach the client untouched.
#[derive(Clone, Debug)]
pub struct StreamDirector {
    upstream: Upstream,
    client: Client<HttpConnector, ProxyBody>,
}

impl StreamDirector {
    /// `connect_timeout` bounds dialing the backend only. Streams have no
    /// overall deadline.
    pub fn new(upstream: Upstream, connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .build(connector);
        Self { upstream, client }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub async fn forward(&self, request: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let target = self.upstream.current_best().inspect_err(|_| {
            warn!(protocol = %Protocol::Grpc, "no healthy backend, refusing call");
        })?;

        let (mut parts, body) = request.into_parts();
        debug!(tier = ?target.tier, method = parts.uri.path(), "relaying grpc call");

        parts.uri = rewrite_uri(&target.endpoint, &parts.uri)?;
        parts.version = Version::HTTP_2;
        let wants_trailers = parts.headers.contains_key(header::TE);
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::HOST);
        if wants_trailers {
            parts
                .headers
                .insert(header::TE, HeaderValue::from_static("trailers"));
        }

        let response = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|err| FirewallError::Upstream(format!("{}: {err}", target.endpoint)))
            .inspect_err(|err| {
                warn!(tier = ?target.tier, error = %err, "grpc backend call failed");
            })?;

        Ok(response.map(boxed))
    }
}
