//! Topic-based publish/subscribe middleware for loosely coupled
//! distributed processes.
//!
//! Publishers disseminate values tagged by string topics; subscribers
//! receive only the topics they declare interest in. Dissemination is
//! either *direct* (subscriber connects to each relevant publisher) or
//! *brokered* (traffic flows through a [`broker::BrokerEngine`] proxy).
//! Rendezvous, membership and routing metadata come from a Discovery
//! plane ([`discovery::DiscoveryEngine`]) that can run in one of three
//! interchangeable lookup modes: a single centralized instance, a
//! Chord-style DHT overlay, or a coordinator-backed replicated group
//! with leader election over the coordination store ([`coord`]).
//!
//! Every process is a single-threaded cooperative event loop
//! ([`reactor`]): sockets plus one timer, with upcalls into the owning
//! engine's state machine. Coordination-store watches are delivered from
//! the store's notifier thread through a [`poll_channel`] and drained at
//! the head of the loop, never calling back into sockets directly.

pub mod broker;
pub mod clock;
pub mod config;
pub mod coord;
pub mod discovery;
pub mod latency;
pub mod messages;
pub mod poll_channel;
pub mod publisher;
pub mod reactor;
pub mod subscriber;
pub mod transport;

mod error;

pub use error::{Error, Result};
