//! REST gateway adapter. Only `POST /cosmos/tx/v1beta1/txs` is inspected.

use async_trait::async_trait;
use base64::{
    Engine,
    engine::general_purpose::STANDARD,
};
use hyper::{
    Method,
    Request,
    Response,
    header::{
        self,
        HeaderValue,
    },
};
use serde::Deserialize;
use serde_json::json;

use super::{
    RequestHandler,
    admit_tx,
    canonical_path,
    grpc::grpc_code,
    http_status,
    read_body,
    record_forward_error,
    record_request,
};
use crate::{
    director::{
        HttpDirector,
        ProxyBody,
        full,
    },
    error::{
        FirewallError,
        Result,
    },
    node::Protocol,
    policy::Validator,
};

pub const BROADCAST_TX_PATH: &str = "/cosmos/tx/v1beta1/txs";

#[derive(Debug, Deserialize)]
struct BroadcastTxBody {
    tx_bytes: String,
}

#[derive(Clone, Debug)]
pub struct RestHandler {
    validator: Validator,
    director: HttpDirector,
    max_body_bytes: usize,
}

impl RestHandler {
    pub fn new(validator: Validator, director: HttpDirector, max_body_bytes: usize) -> Self {
        Self {
            validator,
            director,
            max_body_bytes,
        }
    }

    async fn inspect(&self, request: Request<ProxyBody>) -> Result<Request<ProxyBody>> {
        let (parts, body) = request.into_parts();
        let body = read_body(body, self.max_body_bytes).await?;

        let broadcast: BroadcastTxBody = serde_json::from_slice(&body)
            .map_err(|err| FirewallError::InvalidRequest(format!("invalid broadcast body: {err}")))?;
        let tx_bytes = STANDARD.decode(&broadcast.tx_bytes).map_err(|err| {
            FirewallError::InvalidTransaction(format!("tx_bytes is not base64: {err}"))
        })?;
        admit_tx(&self.validator, Protocol::Rest, &tx_bytes)?;

        Ok(Request::from_parts(parts, full(body)))
    }
}

#[async_trait]
impl RequestHandler for RestHandler {
    async fn handle(&self, request: Request<ProxyBody>) -> Response<ProxyBody> {
        record_request(Protocol::Rest);

        let request = if request.method() == Method::POST
            && canonical_path(request.uri().path()) == BROADCAST_TX_PATH
        {
            match self.inspect(request).await {
                Ok(request) => request,
                Err(err) => return error_response(&err),
            }
        } else {
            request
        };

        match self.director.forward(request).await {
            Ok(response) => response,
            Err(err) => {
                record_forward_error(Protocol::Rest, &err);
                error_response(&err)
            }
        }
    }
}

/// gRPC-gateway style error body.
fn error_response(err: &FirewallError) -> Response<ProxyBody> {
    let payload = json!({
        "code": grpc_code(err) as i32,
        "message": err.to_string(),
        "details": [],
    });
    let mut response = Response::new(full(payload.to_string()));
    *response.status_mut() = http_status(err);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
