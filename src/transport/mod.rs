//! Addressed message sockets over non-blocking TCP.
//!
//! Three abstractions, mirroring the roles the engines need:
//!
//! * [`RequestSocket`]: client request channel to Discovery. One
//!   outstanding request, strict reply ordering, re-targetable when the
//!   Discovery primary changes.
//! * [`RouterSocket`] / [`DealerSocket`]: server-side routed channel.
//!   The router prepends an opaque identity frame to every inbound
//!   message; a reply must carry the same leading frames back and is
//!   routed by popping the first one. Dealers pass frames through
//!   verbatim, which is what lets a DHT ring forward a request hop by
//!   hop and route the response back through the same dealers in
//!   reverse.
//! * [`PubSocket`] / [`SubSocket`]: one-to-many fan-out and
//!   many-to-one fan-in with prefix filters applied on the receiving
//!   side. Fan-out queues are bounded per peer and drop on overflow.
//!
//! All sockets are edge-driven from a mio poll. Connects are idempotent
//! and may precede the peer's bind; a failed dial is retried from
//! `tend()` until the endpoint is disconnected. Disconnecting one
//! endpoint never disturbs the others on the same socket.

mod conn;
mod dealer;
mod framing;
mod pubsub;
mod request;
mod router;
pub mod tokens;

pub use dealer::DealerSocket;
pub use framing::{encode_message, FrameReader, MAX_FRAME_LEN};
pub use pubsub::{PubSocket, SubSocket};
pub use request::RequestSocket;
pub use router::{RoutedMessage, RouterSocket};

use std::time::Duration;

/// Delay before a failed outbound connect is attempted again.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_millis(250);

pub(crate) fn resolve(endpoint: &str) -> std::io::Result<std::net::SocketAddr> {
  use std::net::ToSocketAddrs;
  endpoint.to_socket_addrs()?.next().ok_or_else(|| {
    std::io::Error::new(
      std::io::ErrorKind::AddrNotAvailable,
      format!("endpoint {endpoint} did not resolve"),
    )
  })
}
