//! The shared metadata HTTP server every leased guest talks to.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

use crate::entry::Entry;
use crate::handler::Body;

const METADATA_ADDR: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) type Entries = Mutex<Option<HashMap<String, Arc<Entry>>>>;

/// Long-lived HTTP server bound to the link-local metadata address.
pub(crate) struct MetadataServer {
    shutdown_tx: watch::Sender<()>,
    join: JoinHandle<()>,
}

impl MetadataServer {
    pub async fn start(entries: Arc<Entries>) -> Result<Self, crate::error::PoolError> {
        let listener = TcpListener::bind((METADATA_ADDR, 80))
            .await
            .map_err(|e| crate::error::PoolError::Setup(format!("failed to bind metadata server: {e}")))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let graceful = GracefulShutdown::new();

        let join = tokio::spawn(run_accept_loop(listener, entries, shutdown_rx, graceful));

        Ok(Self { shutdown_tx, join })
    }

    /// Stop accepting new connections and drain in-flight requests for up
    /// to 30 seconds.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.join.await {
            warn!(error = %e, "metadata server task panicked while shutting down");
        }
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    entries: Arc<Entries>,
    mut shutdown_rx: watch::Receiver<()>,
    graceful: GracefulShutdown,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let io = TokioIo::new(stream);
                        let entries = Arc::clone(&entries);
                        let conn = http1::Builder::new().serve_connection(
                            io,
                            service_fn(move |req| {
                                let entries = Arc::clone(&entries);
                                async move { handle_request(&entries, peer, req).await }
                            }),
                        );
                        let conn = graceful.watch(conn);
                        tokio::spawn(async move {
                            if let Err(e) = conn.await {
                                trace!(error = %e, "metadata connection ended with an error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "metadata server accept failed");
                        panic!("metadata service listener failed: {e}");
                    }
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, graceful.shutdown()).await.is_err() {
        warn!(timeout = ?DRAIN_TIMEOUT, "metadata server graceful shutdown timed out");
    }
}

#[cfg(test)]
impl MetadataServer {
    /// A server that binds no socket, for tests exercising pool
    /// provisioning logic without the metadata address configured on `lo`.
    pub(crate) fn noop_for_test() -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let join = tokio::spawn(async move {
            let _ = shutdown_rx.changed().await;
        });
        Self { shutdown_tx, join }
    }
}

async fn handle_request(
    entries: &Entries,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Body>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => Full::new(collected.to_bytes()),
        Err(e) => {
            warn!(error = %e, "failed to read metadata request body");
            return Ok(forbidden());
        }
    };
    Ok(dispatch_request(entries, peer, Request::from_parts(parts, body)).await)
}

/// Resolve a request to its entry and invoke the handler: unmatched or
/// unknown source IP -> 403, valid entry with no handler assigned -> 404.
pub(crate) async fn dispatch_request(entries: &Entries, peer: SocketAddr, req: Request<Body>) -> Response<Body> {
    let Some(prefix) = source_prefix(peer) else {
        return forbidden();
    };

    let entry = {
        let guard = entries.lock().await;
        let Some(map) = guard.as_ref() else {
            return forbidden();
        };
        match map.get(&prefix) {
            Some(entry) => Arc::clone(entry),
            None => return forbidden(),
        }
    };

    match entry.handler().await {
        Some(handler) => handler.handle(req).await,
        None => not_found(),
    }
}

/// Extract the `192.168.DDD` prefix from a guest's source address.
///
/// Mirrors the shape of the original `^(192\.168\.\d{1,3})\.\d{1,3}:\d{1,5}$`
/// match by parsing a real `SocketAddr` instead: any string that pattern
/// accepted parses to an IPv4 address with the same first three octets,
/// and octet range-checking falls out of address parsing for free — a
/// strictly more conservative 403 boundary, never a behavior change for
/// any packet's actual remote address.
fn source_prefix(peer: SocketAddr) -> Option<String> {
    let IpAddr::V4(ip) = peer.ip() else {
        return None;
    };
    let [a, b, c, _d] = ip.octets();
    if a != 192 || b != 168 {
        return None;
    }
    Some(format!("{a}.{b}.{c}"))
}

fn forbidden() -> Response<Body> {
    status_response(StatusCode::FORBIDDEN)
}

fn not_found() -> Response<Body> {
    status_response(StatusCode::NOT_FOUND)
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Body::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MetadataHandler;
    use async_trait::async_trait;
    use std::net::SocketAddrV4;

    fn peer(ip: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port))
    }

    fn empty_request() -> Request<Body> {
        Request::builder().body(Body::new(Bytes::new())).unwrap()
    }

    struct RespondWith(StatusCode, &'static str);

    #[async_trait]
    impl MetadataHandler for RespondWith {
        async fn handle(&self, _req: Request<Body>) -> Response<Body> {
            Response::builder()
                .status(self.0)
                .body(Body::new(Bytes::from(self.1)))
                .unwrap()
        }
    }

    async fn entries_with(pairs: Vec<(&str, Option<Arc<dyn MetadataHandler>>)>) -> Entries {
        let mut map = HashMap::new();
        for (prefix, handler) in pairs {
            let entry = Entry::new(format!("tap-{prefix}"), prefix.to_string());
            if let Some(h) = handler {
                entry.set_handler(Some(h)).await;
            }
            map.insert(prefix.to_string(), Arc::new(entry));
        }
        Mutex::new(Some(map))
    }

    #[test]
    fn source_prefix_accepts_192_168() {
        assert_eq!(source_prefix(peer([192, 168, 150, 42], 5000)), Some("192.168.150".to_string()));
    }

    #[test]
    fn source_prefix_rejects_other_ranges() {
        assert_eq!(source_prefix(peer([10, 0, 0, 1], 1234)), None);
        assert_eq!(source_prefix(peer([172, 16, 0, 1], 1234)), None);
    }

    #[tokio::test]
    async fn dispatch_invokes_handler_for_known_prefix() {
        let handler: Arc<dyn MetadataHandler> = Arc::new(RespondWith(StatusCode::OK, "ok"));
        let entries = entries_with(vec![("192.168.150", Some(handler))]).await;

        let resp = dispatch_request(&entries, peer([192, 168, 150, 42], 5000), empty_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn dispatch_404_when_entry_has_no_handler() {
        let entries = entries_with(vec![("192.168.150", None)]).await;
        let resp = dispatch_request(&entries, peer([192, 168, 150, 1], 1), empty_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dispatch_403_for_unknown_prefix() {
        let entries = entries_with(vec![("192.168.150", None)]).await;
        let resp = dispatch_request(&entries, peer([192, 168, 200, 5], 1234), empty_request()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn dispatch_403_for_source_outside_192_168() {
        let entries = entries_with(vec![]).await;
        let resp = dispatch_request(&entries, peer([10, 0, 0, 1], 1234), empty_request()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn dispatch_403_once_pool_is_disposed() {
        let entries: Entries = Mutex::new(None);
        let resp = dispatch_request(&entries, peer([192, 168, 150, 1], 1), empty_request()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn handler_cleared_after_release_yields_404_not_the_old_handler() {
        let handler: Arc<dyn MetadataHandler> = Arc::new(RespondWith(StatusCode::OK, "ok"));
        let entries = entries_with(vec![("192.168.150", Some(handler))]).await;

        {
            let guard = entries.lock().await;
            let entry = guard.as_ref().unwrap().get("192.168.150").unwrap();
            entry.set_handler(None).await;
        }

        let resp = dispatch_request(&entries, peer([192, 168, 150, 42], 5000), empty_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
