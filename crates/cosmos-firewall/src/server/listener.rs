use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use hyper::{
    Request,
    Response,
    body::Incoming,
    service::service_fn,
};
use hyper_util::{
    rt::{
        TokioExecutor,
        TokioIo,
    },
    server::conn::auto,
};
use tokio::{
    net::{
        TcpListener,
        TcpStream,
    },
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};

use crate::{
    director::{
        ProxyBody,
        boxed,
    },
    error::{
        FirewallError,
        Result,
    },
    node::Protocol,
};

/// Per-request entry point of a transport adapter. Never fails: every error
/// is rendered into a protocol-appropriate response.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request<ProxyBody>) -> Response<ProxyBody>;
}

/// What happens to open connections once the listener stops accepting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Finish in-flight requests for up to the given period, then abort.
    Drain(Duration),
    /// Tear every connection down at once.
    Abort,
}

pub async fn bind(protocol: Protocol, addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| {
            FirewallError::Bind {
                protocol,
                addr,
                source,
            }
        })
}

/// Accepts connections until `shutdown` is cancelled, then applies `policy`
/// to the connections still open.
pub async fn serve<H: RequestHandler>(
    protocol: Protocol,
    listener: TcpListener,
    handler: Arc<H>,
    policy: ShutdownPolicy,
    shutdown: CancellationToken,
) -> Result<()> {
    let builder = auto::Builder::new(TokioExecutor::new());
    let mut connections = JoinSet::new();
    info!(%protocol, addr = %listener.local_addr()?, "listening");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(serve_connection(
                            builder.clone(),
                            stream,
                            peer,
                            handler.clone(),
                            matches!(policy, ShutdownPolicy::Drain(_)).then(|| shutdown.clone()),
                        ));
                    }
                    Err(err) => warn!(%protocol, error = %err, "failed to accept connection"),
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    info!(%protocol, open = connections.len(), "stopping");

    match policy {
        ShutdownPolicy::Abort => connections.shutdown().await,
        ShutdownPolicy::Drain(grace) => {
            let drained = tokio::time::timeout(grace, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(%protocol, open = connections.len(), "grace period elapsed, aborting connections");
                connections.shutdown().await;
            }
        }
    }
    Ok(())
}

/// Serves one connection. With a `drain` token the connection stops taking
/// new requests once it fires and finishes the ones in flight.
async fn serve_connection<H: RequestHandler>(
    builder: auto::Builder<TokioExecutor>,
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    drain: Option<CancellationToken>,
) {
    let service = service_fn(move |request: Request<Incoming>| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(request.map(boxed)).await) }
    });
    let connection = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let drain = drain.unwrap_or_default();
    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(err) = result {
                    debug!(%peer, error = %err, "connection closed with error");
                }
                break;
            }
            () = drain.cancelled(), if !draining => {
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}
