//! Liveness probes, one flavour per protocol family.

use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tonic::{
    codec::ProstCodec,
    codegen::http::uri::PathAndQuery,
    transport::Endpoint,
};
use url::Url;

use super::Protocol;
use crate::tx::proto::{
    GetSyncingRequest,
    GetSyncingResponse,
};

/// Tendermint RPC liveness endpoint.
pub const JSON_RPC_HEALTH_PATH: &str = "/health";
/// REST gateway liveness endpoint.
pub const REST_HEALTH_PATH: &str = "/cosmos/base/tendermint/v1beta1/syncing";
/// gRPC liveness method.
pub const GRPC_HEALTH_METHOD: &str = "/cosmos.base.tendermint.v1beta1.Service/GetSyncing";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request to {endpoint} failed")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} answered with status {status}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
    },
    #[error("failed to connect to {endpoint}")]
    Connect {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("{endpoint} returned gRPC status {}", .status.code())]
    Grpc {
        endpoint: String,
        #[source]
        status: tonic::Status,
    },
    #[error("probe did not finish within {0:?}")]
    Timeout(Duration),
    #[error("{endpoint} uses unsupported scheme `{scheme}`")]
    UnsupportedScheme { endpoint: String, scheme: String },
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),
}

fn ensure_plaintext(endpoint: &Url) -> Result<(), ProbeError> {
    if endpoint.scheme() != "http" {
        return Err(ProbeError::UnsupportedScheme {
            endpoint: endpoint.to_string(),
            scheme: endpoint.scheme().to_string(),
        });
    }
    Ok(())
}

/// A single liveness check against one backend endpoint.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, endpoint: &Url) -> Result<(), ProbeError>;
}

/// Picks the probe matching `protocol`.
pub fn for_protocol(protocol: Protocol, timeout: Duration) -> Result<Arc<dyn Probe>, ProbeError> {
    Ok(match protocol {
        Protocol::JsonRpc => Arc::new(HttpProbe::new(JSON_RPC_HEALTH_PATH, timeout)?),
        Protocol::Rest => Arc::new(HttpProbe::new(REST_HEALTH_PATH, timeout)?),
        Protocol::Grpc => Arc::new(GrpcProbe::new(timeout)),
    })
}

/// `GET {endpoint}{path}`; any 2xx answer is healthy.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
    path: &'static str,
}

impl HttpProbe {
    pub fn new(path: &'static str, timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(ProbeError::Client)?;
        Ok(Self { client, path })
    }
}

fn join(endpoint: &Url, path: &str) -> String {
    format!("{}{path}", endpoint.as_str().trim_end_matches('/'))
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, endpoint: &Url) -> Result<(), ProbeError> {
        ensure_plaintext(endpoint)?;
        let target = join(endpoint, self.path);
        let response = self.client.get(&target).send().await.map_err(|source| {
            ProbeError::Request {
                endpoint: target.clone(),
                source,
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status {
                endpoint: target,
                status,
            });
        }
        Ok(())
    }
}

/// Unary `GetSyncing` call over a fresh channel.
#[derive(Clone, Debug)]
pub struct GrpcProbe {
    timeout: Duration,
}

impl GrpcProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Probe for GrpcProbe {
    async fn probe(&self, endpoint: &Url) -> Result<(), ProbeError> {
        ensure_plaintext(endpoint)?;
        let target = endpoint.to_string();
        let connect_err = |source| {
            ProbeError::Connect {
                endpoint: target.clone(),
                source,
            }
        };
        let channel = Endpoint::from_shared(target.clone())
            .map_err(connect_err)?
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect()
            .await
            .map_err(connect_err)?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await.map_err(connect_err)?;
        grpc.unary::<_, GetSyncingResponse, _>(
            tonic::Request::new(GetSyncingRequest {}),
            PathAndQuery::from_static(GRPC_HEALTH_METHOD),
            ProstCodec::default(),
        )
        .await
        .map_err(|status| {
            ProbeError::Grpc {
                endpoint: target.clone(),
                status,
            }
        })?;
        Ok(())
    }
}
