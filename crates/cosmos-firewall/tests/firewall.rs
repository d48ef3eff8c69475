use std::{
    convert::Infallible,
    net::SocketAddr,
    time::Duration,
};

use base64::{
    Engine,
    engine::general_purpose::STANDARD,
};
use bytes::Bytes;
use cosmos_firewall::{
    Firewall,
    FirewallConfig,
    FirewallError,
    PolicyConfig,
    config::NodeEndpoints,
    node::{
        GrpcProbe,
        Probe,
        Protocol,
        probe::GRPC_HEALTH_METHOD,
    },
    tx::{
        Coin,
        proto,
    },
};
use futures::channel::mpsc;
use http_body_util::{
    BodyExt,
    Full,
    StreamBody,
    combinators::BoxBody,
};
use hyper::{
    HeaderMap,
    Request,
    Response,
    StatusCode,
    body::{
        Frame,
        Incoming,
    },
    service::service_fn,
};
use hyper_util::{
    client::legacy::Client,
    rt::{
        TokioExecutor,
        TokioIo,
    },
};
use prost::Message;
use serde_json::{
    Value,
    json,
};
use tokio::{
    net::TcpListener,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::{
    Mock,
    MockServer,
    ResponseTemplate,
    matchers::{
        body_json,
        method,
        path,
    },
};

const MSG_SEND: &str = "/cosmos.bank.v1beta1.MsgSend";
const PROPOSAL: &str = "/cosmos.gov.v1beta1.MsgSubmitProposal";
const SECP256K1: &str = "/cosmos.crypto.secp256k1.PubKey";
const BROADCAST_TX: &str = "/cosmos.tx.v1beta1.Service/BroadcastTx";

fn policy() -> PolicyConfig {
    PolicyConfig {
        minimum_gas_limit: 10_000,
        minimum_fee: Some(Coin::new(500u64, "utest")),
        allowed_message_routes: [MSG_SEND.to_string()].into(),
        allowed_public_key_type_urls: [SECP256K1.to_string()].into(),
        ..Default::default()
    }
}

fn tx_bytes(message: &str) -> Vec<u8> {
    let any = |type_url: &str| {
        proto::Any {
            type_url: type_url.to_string(),
            value: vec![0x0a, 0x01],
        }
    };
    let body = proto::TxBody {
        messages: vec![any(message)],
        ..Default::default()
    };
    let auth_info = proto::AuthInfo {
        signer_infos: vec![proto::SignerInfo {
            public_key: Some(any(SECP256K1)),
            sequence: 1,
        }],
        fee: Some(proto::Fee {
            amount: vec![proto::Coin {
                denom: "utest".into(),
                amount: "1000".into(),
            }],
            gas_limit: 50_000,
            ..Default::default()
        }),
    };
    proto::TxRaw {
        body_bytes: body.encode_to_vec(),
        auth_info_bytes: auth_info.encode_to_vec(),
        signatures: vec![vec![3u8; 64]],
    }
    .encode_to_vec()
}

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn config(json_rpc: &str, grpc: &str, rest: &str) -> FirewallConfig {
    let any_port: SocketAddr = "127.0.0.1:0".parse().unwrap();
    FirewallConfig {
        rpc_address: any_port,
        grpc_address: any_port,
        rest_address: any_port,
        chain: NodeEndpoints {
            json_rpc: Some(url(json_rpc)),
            grpc: Some(url(grpc)),
            rest: Some(url(rest)),
        },
        policy: policy(),
        shutdown_grace_secs: 1,
        ..Default::default()
    }
}

struct Running {
    rpc: SocketAddr,
    grpc: SocketAddr,
    rest: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<cosmos_firewall::Result<()>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("firewall did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn start(config: FirewallConfig) -> Running {
    let firewall = Firewall::bind(config).await.unwrap();
    let shutdown = CancellationToken::new();
    Running {
        rpc: firewall.local_addr(Protocol::JsonRpc).unwrap(),
        grpc: firewall.local_addr(Protocol::Grpc).unwrap(),
        rest: firewall.local_addr(Protocol::Rest).unwrap(),
        handle: tokio::spawn(firewall.run(shutdown.clone())),
        shutdown,
    }
}

fn broadcast_call(message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "broadcast_tx_sync",
        "params": {"tx": STANDARD.encode(tx_bytes(message))},
    })
}

async fn post_json(addr: SocketAddr, route: &str, body: &Value) -> (StatusCode, Value) {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}{route}"))
        .json(body)
        .send()
        .await
        .unwrap();
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn json_rpc_broadcast_is_forwarded_when_admitted() {
    let backend = MockServer::start().await;
    let call = broadcast_call(MSG_SEND);
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_json(&call))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {"code": 0}})),
        )
        .expect(1)
        .mount(&backend)
        .await;

    let firewall = start(config(&backend.uri(), "http://127.0.0.1:1", &backend.uri())).await;
    let (status, payload) = post_json(firewall.rpc, "/", &call).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["result"]["code"], 0);
    firewall.stop().await;
}

#[tokio::test]
async fn json_rpc_rejection_never_reaches_backend() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&backend)
        .await;

    let firewall = start(config(&backend.uri(), "http://127.0.0.1:1", &backend.uri())).await;
    let (status, payload) = post_json(firewall.rpc, "/", &broadcast_call(PROPOSAL)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["error"]["code"], -32002);
    assert_eq!(payload["error"]["data"], "MESSAGE_ROUTE_NOT_ALLOWED");
    firewall.stop().await;
}

#[tokio::test]
async fn rest_queries_pass_through_and_broadcasts_are_inspected() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cosmos/bank/v1beta1/balances/cosmos1abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"balances": []})))
        .expect(1)
        .mount(&backend)
        .await;
    Mock::given(method("POST"))
        .and(path("/cosmos/tx/v1beta1/txs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tx_response": {}})))
        .expect(1)
        .mount(&backend)
        .await;

    let firewall = start(config(&backend.uri(), "http://127.0.0.1:1", &backend.uri())).await;

    let balances: Value = reqwest::get(format!(
        "http://{}/cosmos/bank/v1beta1/balances/cosmos1abc",
        firewall.rest
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(balances, json!({"balances": []}));

    let accepted = json!({
        "tx_bytes": STANDARD.encode(tx_bytes(MSG_SEND)),
        "mode": "BROADCAST_MODE_SYNC",
    });
    let (status, _) = post_json(firewall.rest, "/cosmos/tx/v1beta1/txs", &accepted).await;
    assert_eq!(status, StatusCode::OK);

    let rejected = json!({
        "tx_bytes": STANDARD.encode(tx_bytes(PROPOSAL)),
        "mode": "BROADCAST_MODE_SYNC",
    });
    let (status, payload) = post_json(firewall.rest, "/cosmos/tx/v1beta1/txs", &rejected).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["code"], 3);

    firewall.stop().await;
}

/// A JSON-RPC node whose `/health` answers with `health_status`.
async fn tier_backend(health_status: u16, name: &str, expected_calls: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(health_status))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": name})),
        )
        .expect(expected_calls)
        .mount(&server)
        .await;
    server
}

fn tiered(
    mut config: FirewallConfig,
    light: &MockServer,
    full: &MockServer,
    archive: &MockServer,
) -> FirewallConfig {
    let node = |server: &MockServer| {
        NodeEndpoints {
            json_rpc: Some(url(&server.uri())),
            ..Default::default()
        }
    };
    config.redirect.enable = true;
    config.redirect.light = node(light);
    config.redirect.full = node(full);
    config.redirect.archive = node(archive);
    config.redirect.timeout_secs = 1;
    config.redirect.check_interval_secs = 1;
    config
}

#[tokio::test]
async fn request_fails_fast_when_no_tier_is_healthy() {
    let light = tier_backend(500, "light", 0).await;
    let full = tier_backend(500, "full", 0).await;
    let archive = tier_backend(503, "archive", 0).await;
    let chain = MockServer::start().await;

    let firewall = start(tiered(
        config(&chain.uri(), "http://127.0.0.1:1", &chain.uri()),
        &light,
        &full,
        &archive,
    ))
    .await;

    let status_call = json!({"jsonrpc": "2.0", "id": 1, "method": "status"});
    let (status, payload) = post_json(firewall.rpc, "/", &status_call).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(payload["error"]["code"], -32003);

    firewall.stop().await;
}

#[tokio::test]
async fn traffic_fails_over_to_the_next_healthy_tier() {
    let light = tier_backend(500, "light", 0).await;
    let full = tier_backend(200, "full", 2).await;
    let archive = tier_backend(200, "archive", 0).await;
    let chain = MockServer::start().await;

    let firewall = start(tiered(
        config(&chain.uri(), "http://127.0.0.1:1", &chain.uri()),
        &light,
        &full,
        &archive,
    ))
    .await;

    let status_call = json!({"jsonrpc": "2.0", "id": 1, "method": "status"});
    for _ in 0..2 {
        let (status, payload) = post_json(firewall.rpc, "/", &status_call).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["result"], "full");
    }

    firewall.stop().await;
}

fn grpc_frame(message: &[u8]) -> Bytes {
    let mut framed = vec![0u8];
    framed.extend_from_slice(&(message.len() as u32).to_be_bytes());
    framed.extend_from_slice(message);
    framed.into()
}

const CHAT_METHOD: &str = "/test.v1.Chat/Stream";

type ChatFrame = Result<Frame<Bytes>, Infallible>;

/// Bidirectional call: greets before reading anything, echoes each request
/// chunk as it arrives and ends with `NOT_FOUND` plus custom metadata.
fn chat(mut body: Incoming) -> Response<BoxBody<Bytes, Infallible>> {
    let (frames, stream) = mpsc::unbounded::<ChatFrame>();
    tokio::spawn(async move {
        let _ = frames.unbounded_send(Ok(Frame::data(grpc_frame(b"ready"))));
        while let Some(Ok(frame)) = body.frame().await {
            if let Ok(data) = frame.into_data() {
                let _ = frames.unbounded_send(Ok(Frame::data(data)));
            }
        }
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", "5".parse().unwrap());
        trailers.insert("grpc-message", "chat%20closed".parse().unwrap());
        trailers.insert("x-chat-id", "42".parse().unwrap());
        let _ = frames.unbounded_send(Ok(Frame::trailers(trailers)));
    });

    Response::builder()
        .header("content-type", "application/grpc")
        .body(StreamBody::new(stream).boxed())
        .unwrap()
}

/// Answers `GetSyncing`, streams `CHAT_METHOD` and echoes every other call,
/// ending each echo with `grpc-status: 0` and an `x-backend-path` trailer.
async fn grpc_backend_call(
    request: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    if request.uri().path() == CHAT_METHOD {
        return Ok(chat(request.into_body()));
    }
    let route = request.uri().path().to_string();
    let body = request
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();
    let payload = if route == GRPC_HEALTH_METHOD {
        grpc_frame(&proto::GetSyncingResponse { syncing: false }.encode_to_vec())
    } else {
        body
    };

    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", "0".parse().unwrap());
    trailers.insert("x-backend-path", route.parse().unwrap());
    let frames = vec![
        Ok::<_, Infallible>(Frame::data(payload)),
        Ok(Frame::trailers(trailers)),
    ];

    Ok(Response::builder()
        .header("content-type", "application/grpc")
        .body(StreamBody::new(futures::stream::iter(frames)).boxed())
        .unwrap())
}

async fn grpc_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service_fn(grpc_backend_call))
                    .await;
            });
        }
    });
    addr
}

async fn grpc_call(addr: SocketAddr, route: &str, message: &[u8]) -> Response<Incoming> {
    let client = Client::builder(TokioExecutor::new())
        .http2_only(true)
        .build_http::<Full<Bytes>>();
    let request = Request::post(format!("http://{addr}{route}"))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(Full::new(grpc_frame(message)))
        .unwrap();
    client.request(request).await.unwrap()
}

#[tokio::test]
async fn grpc_calls_are_relayed_with_trailers() {
    let backend = grpc_backend().await;
    let firewall = start(config(
        "http://127.0.0.1:1",
        &format!("http://{backend}"),
        "http://127.0.0.1:1",
    ))
    .await;

    let response = grpc_call(firewall.grpc, "/cosmos.bank.v1beta1.Query/Balance", b"query").await;
    assert_eq!(response.status(), StatusCode::OK);
    let collected = response.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned().unwrap();
    assert_eq!(collected.to_bytes(), grpc_frame(b"query"));
    assert_eq!(trailers["grpc-status"], "0");
    assert_eq!(trailers["x-backend-path"], "/cosmos.bank.v1beta1.Query/Balance");

    firewall.stop().await;
}

/// Reads response data until at least `len` bytes arrived.
async fn read_data(body: &mut Incoming, len: usize) -> Vec<u8> {
    let mut buffer = Vec::new();
    while buffer.len() < len {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("relay stalled")
            .expect("stream ended early")
            .unwrap();
        if let Ok(data) = frame.into_data() {
            buffer.extend_from_slice(&data);
        }
    }
    buffer
}

#[tokio::test]
async fn grpc_streams_are_relayed_full_duplex() {
    let backend = grpc_backend().await;
    let firewall = start(config(
        "http://127.0.0.1:1",
        &format!("http://{backend}"),
        "http://127.0.0.1:1",
    ))
    .await;

    let client = Client::builder(TokioExecutor::new())
        .http2_only(true)
        .build_http::<BoxBody<Bytes, Infallible>>();
    let (outbound, stream) = mpsc::unbounded::<ChatFrame>();
    outbound
        .unbounded_send(Ok(Frame::data(grpc_frame(b"ping"))))
        .unwrap();
    let request = Request::post(format!("http://{}{CHAT_METHOD}", firewall.grpc))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(StreamBody::new(stream).boxed())
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), client.request(request))
        .await
        .expect("response headers held back until the request ended")
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The request stream is still open here.
    let mut body = response.into_body();
    assert_eq!(
        read_data(&mut body, 19).await,
        [grpc_frame(b"ready"), grpc_frame(b"ping")].concat()
    );
    outbound
        .unbounded_send(Ok(Frame::data(grpc_frame(b"pong"))))
        .unwrap();
    assert_eq!(read_data(&mut body, 9).await, grpc_frame(b"pong").to_vec());

    drop(outbound);
    let rest = tokio::time::timeout(Duration::from_secs(5), body.collect())
        .await
        .expect("trailers never arrived")
        .unwrap();
    let trailers = rest.trailers().cloned().unwrap();
    assert!(rest.to_bytes().is_empty());
    assert_eq!(trailers["grpc-status"], "5");
    assert_eq!(trailers["grpc-message"], "chat%20closed");
    assert_eq!(trailers["x-chat-id"], "42");

    firewall.stop().await;
}

#[tokio::test]
async fn grpc_broadcast_is_inspected() {
    let backend = grpc_backend().await;
    let firewall = start(config(
        "http://127.0.0.1:1",
        &format!("http://{backend}"),
        "http://127.0.0.1:1",
    ))
    .await;

    let accepted = proto::BroadcastTxRequest {
        tx_bytes: tx_bytes(MSG_SEND),
        mode: 2,
    }
    .encode_to_vec();
    let response = grpc_call(firewall.grpc, BROADCAST_TX, &accepted).await;
    let collected = response.into_body().collect().await.unwrap();
    assert_eq!(collected.trailers().unwrap()["grpc-status"], "0");
    assert_eq!(collected.to_bytes(), grpc_frame(&accepted));

    let rejected = proto::BroadcastTxRequest {
        tx_bytes: tx_bytes(PROPOSAL),
        mode: 2,
    }
    .encode_to_vec();
    let response = grpc_call(firewall.grpc, BROADCAST_TX, &rejected).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["grpc-status"], "3");

    firewall.stop().await;
}

#[tokio::test]
async fn grpc_probe_reports_live_backend() {
    let backend = grpc_backend().await;
    let probe = GrpcProbe::new(Duration::from_secs(2));
    probe.probe(&url(&format!("http://{backend}"))).await.unwrap();
}

#[tokio::test]
async fn firewall_refuses_to_start_on_a_taken_port() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = config("http://127.0.0.1:1", "http://127.0.0.1:1", "http://127.0.0.1:1");
    config.rest_address = taken.local_addr().unwrap();

    let err = Firewall::bind(config).await.unwrap_err();
    assert!(matches!(
        err,
        FirewallError::Bind {
            protocol: Protocol::Rest,
            ..
        }
    ));
}
