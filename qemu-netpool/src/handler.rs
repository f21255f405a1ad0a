//! The handler seam injected by the lessee.
//!
//! The pool owns dispatch (source-IP → entry → handler) but has no opinion
//! on what a guest's metadata requests mean; that's entirely up to whoever
//! calls [`crate::Network::set_handler`].

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};

/// Body type used for both request and response once the server has
/// buffered an incoming request off the wire.
pub type Body = Full<Bytes>;

/// Answers metadata requests for one leased network.
///
/// The dispatcher has already resolved the request's source IP to this
/// handler's entry before invoking it; everything about the guest-tools
/// protocol (paths, methods, bodies) is this trait's business, not the
/// pool's.
#[async_trait]
pub trait MetadataHandler: Send + Sync {
    async fn handle(&self, req: Request<Body>) -> Response<Body>;
}
