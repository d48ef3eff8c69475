//! gRPC adapter.
//!
//! `cosmos.tx.v1beta1.Service/BroadcastTx` is buffered and inspected; every
//! other method is relayed by the [`StreamDirector`] without buffering.

use std::fmt::Write;

use async_trait::async_trait;
use hyper::{
    Request,
    Response,
    header::{
        self,
        HeaderValue,
    },
};
use prost::Message;
use tonic::Code;

use super::{
    RequestHandler,
    admit_tx,
    read_body,
    record_forward_error,
    record_request,
};
use crate::{
    director::{
        ProxyBody,
        StreamDirector,
        empty,
        full,
    },
    error::{
        FirewallError,
        Result,
    },
    node::Protocol,
    policy::Validator,
    tx::proto::BroadcastTxRequest,
};

pub const BROADCAST_TX_METHOD: &str = "/cosmos.tx.v1beta1.Service/BroadcastTx";

/// Length-prefixed message header: compression flag plus big-endian length.
const FRAME_HEADER_LEN: usize = 5;

#[derive(Clone, Debug)]
pub struct GrpcHandler {
    validator: Validator,
    director: StreamDirector,
    max_body_bytes: usize,
}

impl GrpcHandler {
    pub fn new(validator: Validator, director: StreamDirector, max_body_bytes: usize) -> Self {
        Self {
            validator,
            director,
            max_body_bytes,
        }
    }

    async fn inspect(&self, request: Request<ProxyBody>) -> Result<Request<ProxyBody>> {
        let (parts, body) = request.into_parts();
        let body = read_body(body, self.max_body_bytes).await?;

        let broadcast = BroadcastTxRequest::decode(unary_message(&body)?).map_err(|err| {
            FirewallError::InvalidTransaction(format!("failed to decode BroadcastTxRequest: {err}"))
        })?;
        admit_tx(&self.validator, Protocol::Grpc, &broadcast.tx_bytes)?;

        Ok(Request::from_parts(parts, full(body)))
    }
}

#[async_trait]
impl RequestHandler for GrpcHandler {
    async fn handle(&self, request: Request<ProxyBody>) -> Response<ProxyBody> {
        record_request(Protocol::Grpc);

        let request = if request.uri().path() == BROADCAST_TX_METHOD {
            match self.inspect(request).await {
                Ok(request) => request,
                Err(err) => return status_response(grpc_code(&err), &err.to_string()),
            }
        } else {
            request
        };

        match self.director.forward(request).await {
            Ok(response) => response,
            Err(err) => {
                record_forward_error(Protocol::Grpc, &err);
                status_response(grpc_code(&err), &err.to_string())
            }
        }
    }
}

/// Status code surfaced for `err` on gRPC (and in REST error bodies).
pub fn grpc_code(err: &FirewallError) -> Code {
    match err {
        FirewallError::Rejected(_)
        | FirewallError::InvalidTransaction(_)
        | FirewallError::InvalidRequest(_) => Code::InvalidArgument,
        FirewallError::NoHealthyNode(_) | FirewallError::Upstream(_) => Code::Unavailable,
        FirewallError::UpstreamTimeout(_) => Code::DeadlineExceeded,
        FirewallError::BodyTooLarge(_) => Code::ResourceExhausted,
        _ => Code::Internal,
    }
}

/// The payload of a request body holding exactly one uncompressed message.
pub fn unary_message(body: &[u8]) -> Result<&[u8]> {
    let Some((header, message)) = body.split_at_checked(FRAME_HEADER_LEN) else {
        return Err(FirewallError::InvalidRequest("truncated grpc message".into()));
    };
    if header[0] != 0 {
        return Err(FirewallError::InvalidRequest(
            "compressed grpc messages are not accepted".into(),
        ));
    }
    let declared = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if declared != message.len() {
        return Err(FirewallError::InvalidRequest(format!(
            "grpc message declares {declared} bytes but carries {}",
            message.len()
        )));
    }
    Ok(message)
}

/// A trailers-only response carrying `code` and `message`.
pub fn status_response(code: Code, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    headers.insert("grpc-status", HeaderValue::from(code as i32));
    if let Ok(message) = HeaderValue::from_str(&percent_encode(message)) {
        headers.insert("grpc-message", message);
    }
    response
}

/// Percent-encodes everything outside printable ASCII, and `%` itself.
fn percent_encode(message: &str) -> String {
    let mut encoded = String::with_capacity(message.len());
    for byte in message.bytes() {
        if (0x20..=0x7e).contains(&byte) && byte != b'%' {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}
