//! Forwarding of admitted traffic to the selected backend.
//!
//! [`HttpDirector`] serves the request/response protocols (JSON-RPC and
//! REST); [`StreamDirector`] relays arbitrary gRPC calls as opaque HTTP/2
//! streams. Neither re-validates anything nor touches tier state: the
//! target is read once, when the request is dispatched.

pub mod grpc;
pub mod http;

pub use grpc::StreamDirector;
pub use http::HttpDirector;

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{
    BodyExt,
    Empty,
    Full,
    combinators::UnsyncBoxBody,
};
use hyper::{
    HeaderMap,
    Uri,
    body::Body,
    header::{
        self,
        HeaderName,
    },
};
use url::{
    Position,
    Url,
};

use crate::{
    error::{
        FirewallError,
        Result,
    },
    node::{
        BackendTarget,
        NodeTierSet,
    },
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used on both sides of every proxied exchange.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

/// Where one protocol family forwards to.
#[derive(Clone, Debug)]
pub enum Upstream {
    /// A single endpoint, always considered available.
    Fixed(Url),
    /// Light, full and archive tiers tracked by a health checker.
    Tiered(Arc<NodeTierSet>),
}

impl Upstream {
    pub fn current_best(&self) -> Result<BackendTarget> {
        match self {
            Upstream::Fixed(endpoint) => {
                Ok(BackendTarget {
                    tier: None,
                    endpoint: endpoint.clone(),
                })
            }
            Upstream::Tiered(tiers) => tiers.current_best(),
        }
    }
}

/// `host[:port]` of a backend endpoint.
pub fn authority(endpoint: &Url) -> &str {
    &endpoint[Position::BeforeHost..Position::AfterPort]
}

/// Points `original` at `endpoint`, keeping its path and query. A path
/// prefix on the endpoint is prepended.
pub fn rewrite_uri(endpoint: &Url, original: &Uri) -> Result<Uri> {
    let base = endpoint.path().trim_end_matches('/');
    let path_and_query = original
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());

    Uri::builder()
        .scheme(endpoint.scheme())
        .authority(authority(endpoint))
        .path_and_query(format!("{base}{path_and_query}"))
        .build()
        .map_err(|err| FirewallError::Upstream(format!("cannot target {endpoint}: {err}")))
}

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    HeaderName::from_static("keep-alive"),
];

/// Removes connection-scoped headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("proxy-connection");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{
        NodeTier,
        Protocol,
        TierEndpoints,
    };
    use hyper::header::HeaderValue;
    use std::time::Duration;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_rewrite_keeps_path_and_query() {
        let uri: Uri = "/abci_query?path=%22/app/version%22".parse().unwrap();
        let rewritten = rewrite_uri(&url("http://10.0.0.2:26657"), &uri).unwrap();
        assert_eq!(
            rewritten.to_string(),
            "http://10.0.0.2:26657/abci_query?path=%22/app/version%22"
        );
    }

    #[test]
    fn test_rewrite_prepends_endpoint_path() {
        let uri: Uri = "http://firewall:1317/cosmos/bank/v1beta1/balances/x"
            .parse()
            .unwrap();
        let rewritten = rewrite_uri(&url("https://rest.example.com/node-1/"), &uri).unwrap();
        assert_eq!(
            rewritten.to_string(),
            "https://rest.example.com/node-1/cosmos/bank/v1beta1/balances/x"
        );
    }

    #[test]
    fn test_authority_omits_userinfo() {
        assert_eq!(authority(&url("http://user:pw@[::1]:9090/x")), "[::1]:9090");
        assert_eq!(authority(&url("http://node")), "node");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn test_upstream_resolution() {
        let fixed = Upstream::Fixed(url("http://chain:1317"));
        assert_eq!(fixed.current_best().unwrap().tier, None);

        let tiers = Arc::new(NodeTierSet::new(
            Protocol::Rest,
            TierEndpoints {
                light: url("http://light:1317"),
                full: url("http://full:1317"),
                archive: url("http://archive:1317"),
            },
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        let tiered = Upstream::Tiered(tiers.clone());
        assert!(matches!(
            tiered.current_best(),
            Err(FirewallError::NoHealthyNode(Protocol::Rest))
        ));

        tiers.set_health(NodeTier::Archive, true);
        let target = tiered.current_best().unwrap();
        assert_eq!(target.tier, Some(NodeTier::Archive));
        assert_eq!(target.endpoint, url("http://archive:1317"));
    }
}
