//! Unaddressed forwarding channel between DHT ring members.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace};
use mio::{Registry, Token};

use crate::Result;

use super::conn::Conn;
use super::framing::encode_message;
use super::RECONNECT_DELAY;

const DEALER_QUEUE_CAP: usize = 4 * 1024 * 1024;

/// One persistent outbound channel to a fixed peer. Frames sent here
/// arrive verbatim at the peer's router, and whatever the peer routes
/// back arrives verbatim here; the identity chain in the frames is
/// never touched by the dealer itself.
pub struct DealerSocket {
  registry: Registry,
  token: Token,
  endpoint: String,
  conn: Option<Conn>,
  retry_at: Option<Instant>,
  pending: VecDeque<Bytes>,
}

impl DealerSocket {
  pub fn connect(registry: Registry, token: Token, endpoint: &str) -> DealerSocket {
    let mut dealer = DealerSocket {
      registry,
      token,
      endpoint: endpoint.to_string(),
      conn: None,
      retry_at: None,
      pending: VecDeque::new(),
    };
    dealer.dial();
    dealer
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  pub fn token(&self) -> Token {
    self.token
  }

  pub fn send(&mut self, frames: &[Vec<u8>]) {
    let message = Bytes::from(encode_message(frames));
    match &mut self.conn {
      Some(conn) => {
        conn.send(message);
        if conn.closed {
          self.mark_down();
        }
      }
      None => {
        self.pending.push_back(message);
        self.schedule_retry();
      }
    }
  }

  /// Messages routed back from the peer, frames untouched.
  pub fn handle_event(&mut self, readable: bool, writable: bool) -> Result<Vec<Vec<Vec<u8>>>> {
    let Some(conn) = &mut self.conn else {
      return Ok(Vec::new());
    };
    let messages = conn.handle_event(readable, writable)?;
    if conn.closed {
      self.mark_down();
    }
    Ok(messages)
  }

  /// Retry a failed dial once its backoff elapses.
  pub fn tend(&mut self) {
    if let Some(at) = self.retry_at {
      if Instant::now() >= at {
        self.retry_at = None;
        self.dial();
      }
    }
  }

  pub fn retry_hint(&self) -> Option<Duration> {
    self
      .retry_at
      .map(|at| at.saturating_duration_since(Instant::now()))
  }

  fn dial(&mut self) {
    match Conn::connect(&self.registry, self.token, &self.endpoint, DEALER_QUEUE_CAP) {
      Ok(mut conn) => {
        trace!("dealer: dialing {}", self.endpoint);
        while let Some(message) = self.pending.pop_front() {
          conn.send(message);
        }
        self.conn = Some(conn);
      }
      Err(e) => {
        debug!("dealer: dial {} failed: {e}", self.endpoint);
        self.schedule_retry();
      }
    }
  }

  fn mark_down(&mut self) {
    if let Some(mut conn) = self.conn.take() {
      conn.deregister(&self.registry);
    }
    debug!("dealer: lost {}", self.endpoint);
    self.schedule_retry();
  }

  fn schedule_retry(&mut self) {
    if self.retry_at.is_none() {
      self.retry_at = Some(Instant::now() + RECONNECT_DELAY);
    }
  }
}
