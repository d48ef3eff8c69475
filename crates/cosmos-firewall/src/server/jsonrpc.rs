//! Tendermint JSON-RPC adapter.
//!
//! Broadcast calls are inspected in both forms Tendermint accepts: JSON-RPC
//! POST bodies (single call or batch) and the URI form
//! (`GET /broadcast_tx_sync?tx=0x...`). Everything else is forwarded
//! untouched.

use async_trait::async_trait;
use base64::{
    Engine,
    engine::general_purpose::STANDARD,
};
use hyper::{
    Method,
    Request,
    Response,
    StatusCode,
    header::{
        self,
        HeaderValue,
    },
};
use serde_json::{
    Value,
    json,
};
use url::form_urlencoded;

use super::{
    RequestHandler,
    admit_tx,
    canonical_path,
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
    error::FirewallError,
    node::Protocol,
    policy::Validator,
};

/// Methods whose `tx` parameter is evaluated before forwarding.
pub const BROADCAST_METHODS: [&str; 4] = [
    "broadcast_tx_sync",
    "broadcast_tx_async",
    "broadcast_tx_commit",
    "check_tx",
];

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const POLICY_REJECTED: i64 = -32002;
pub const NO_HEALTHY_NODE: i64 = -32003;

/// Id Tendermint uses for responses to URI-form requests.
const URI_REQUEST_ID: i64 = -1;

#[derive(Clone, Debug)]
pub struct JsonRpcHandler {
    validator: Validator,
    director: HttpDirector,
    max_body_bytes: usize,
}

impl JsonRpcHandler {
    pub fn new(validator: Validator, director: HttpDirector, max_body_bytes: usize) -> Self {
        Self {
            validator,
            director,
            max_body_bytes,
        }
    }

    async fn forward(&self, request: Request<ProxyBody>, id: Value) -> Response<ProxyBody> {
        match self.director.forward(request).await {
            Ok(response) => response,
            Err(err) => {
                record_forward_error(Protocol::JsonRpc, &err);
                error_response(id, &err)
            }
        }
    }

    /// Evaluates one call. Non-broadcast calls always pass.
    fn check_call(&self, call: &Value) -> Result<(), FirewallError> {
        let Some(method) = call.get("method").and_then(Value::as_str) else {
            return Ok(());
        };
        if !BROADCAST_METHODS.contains(&method) {
            return Ok(());
        }
        let encoded = match call.get("params") {
            Some(Value::Object(params)) => params.get("tx"),
            Some(Value::Array(params)) => params.first(),
            _ => None,
        }
        .and_then(Value::as_str)
        .ok_or_else(|| FirewallError::InvalidTransaction(format!("{method} requires a tx param")))?;
        let tx_bytes = STANDARD
            .decode(encoded)
            .map_err(|err| FirewallError::InvalidTransaction(format!("tx is not base64: {err}")))?;
        admit_tx(&self.validator, Protocol::JsonRpc, &tx_bytes)
    }

    /// Evaluates a POST body. On failure returns the JSON-RPC error payload to
    /// send back instead of forwarding.
    fn check_body(&self, body: &[u8]) -> Result<(), Value> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|err| error_object(Value::Null, PARSE_ERROR, "parse error", json!(err.to_string())))?;

        match payload {
            Value::Array(calls) if calls.is_empty() => {
                Err(error_object(
                    Value::Null,
                    INVALID_REQUEST,
                    "invalid request",
                    json!("empty batch"),
                ))
            }
            Value::Array(calls) => {
                let outcomes: Vec<_> = calls.iter().map(|call| self.check_call(call)).collect();
                if outcomes.iter().all(Result::is_ok) {
                    return Ok(());
                }
                Err(Value::Array(
                    calls
                        .iter()
                        .zip(outcomes)
                        .map(|(call, outcome)| {
                            let id = call_id(call);
                            match outcome {
                                Err(err) => error_value(id, &err),
                                Ok(()) => {
                                    error_object(
                                        id,
                                        INVALID_REQUEST,
                                        "batch contains a rejected transaction",
                                        Value::Null,
                                    )
                                }
                            }
                        })
                        .collect(),
                ))
            }
            call => self.check_call(&call).map_err(|err| error_value(call_id(&call), &err)),
        }
    }

    /// Evaluates a URI-form broadcast (`?tx=0x<hex>` or `?tx="<base64>"`).
    fn check_uri(&self, query: Option<&str>) -> Result<(), FirewallError> {
        let raw = form_urlencoded::parse(query.unwrap_or_default().as_bytes())
            .find(|(key, _)| key == "tx")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| FirewallError::InvalidTransaction("missing tx query parameter".into()))?;

        let tx_bytes = if let Some(hex) = raw.strip_prefix("0x") {
            hex::decode(hex)
                .map_err(|err| FirewallError::InvalidTransaction(format!("tx is not hex: {err}")))?
        } else {
            // An unescaped `+` arrives as a space after form decoding.
            let encoded = raw.trim_matches('"').replace(' ', "+");
            STANDARD.decode(encoded).map_err(|err| {
                FirewallError::InvalidTransaction(format!("tx is not base64: {err}"))
            })?
        };
        admit_tx(&self.validator, Protocol::JsonRpc, &tx_bytes)
    }
}

#[async_trait]
impl RequestHandler for JsonRpcHandler {
    async fn handle(&self, request: Request<ProxyBody>) -> Response<ProxyBody> {
        record_request(Protocol::JsonRpc);

        let path = canonical_path(request.uri().path());
        if BROADCAST_METHODS.contains(&path.trim_start_matches('/')) {
            let id = json!(URI_REQUEST_ID);
            if let Err(err) = self.check_uri(request.uri().query()) {
                return error_response(id, &err);
            }
            return self.forward(request, id).await;
        }

        if request.method() != Method::POST {
            return self.forward(request, Value::Null).await;
        }

        let (parts, body) = request.into_parts();
        let body = match read_body(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(err) => return error_response(Value::Null, &err),
        };
        if let Err(payload) = self.check_body(&body) {
            return json_response(StatusCode::OK, &payload);
        }
        self.forward(Request::from_parts(parts, full(body)), Value::Null)
            .await
    }
}

fn call_id(call: &Value) -> Value {
    call.get("id").cloned().unwrap_or(Value::Null)
}

fn error_object(id: Value, code: i64, message: &str, data: Value) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if !data.is_null() {
        error["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

fn error_code(err: &FirewallError) -> i64 {
    match err {
        FirewallError::Rejected(_) => POLICY_REJECTED,
        FirewallError::NoHealthyNode(_) => NO_HEALTHY_NODE,
        FirewallError::InvalidTransaction(_) => INVALID_PARAMS,
        FirewallError::InvalidRequest(_) | FirewallError::BodyTooLarge(_) => INVALID_REQUEST,
        _ => INTERNAL_ERROR,
    }
}

/// JSON-RPC error payload for `err`. Rejections carry their reason code in
/// `data`.
pub fn error_value(id: Value, err: &FirewallError) -> Value {
    let data = match err {
        FirewallError::Rejected(rejection) => json!(rejection.reason.code()),
        _ => Value::Null,
    };
    error_object(id, error_code(err), &err.to_string(), data)
}

fn error_response(id: Value, err: &FirewallError) -> Response<ProxyBody> {
    let status = match err {
        FirewallError::NoHealthyNode(_)
        | FirewallError::Upstream(_)
        | FirewallError::UpstreamTimeout(_)
        | FirewallError::BodyTooLarge(_) => super::http_status(err),
        _ => StatusCode::OK,
    };
    json_response(status, &error_value(id, err))
}

fn json_response(status: StatusCode, payload: &Value) -> Response<ProxyBody> {
    let mut response = Response::new(full(payload.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
