//! Client request channel to Discovery.

use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use mio::{Registry, Token};

use crate::{Error, Result};

use super::conn::Conn;
use super::framing::encode_message;
use super::RECONNECT_DELAY;

const REQUEST_QUEUE_CAP: usize = 1024 * 1024;

/// One outstanding request, strict reply ordering. The target endpoint
/// can change at any time (the Discovery primary moved); an in-flight
/// request survives the move and is re-sent to the new target, which
/// is how clients ride out a failover without restarting their state
/// machine.
pub struct RequestSocket {
  registry: Registry,
  token: Token,
  endpoint: Option<String>,
  conn: Option<Conn>,
  retry_at: Option<Instant>,
  outstanding: Option<Bytes>,
}

impl RequestSocket {
  pub fn new(registry: Registry, token: Token) -> RequestSocket {
    RequestSocket {
      registry,
      token,
      endpoint: None,
      conn: None,
      retry_at: None,
      outstanding: None,
    }
  }

  pub fn token(&self) -> Token {
    self.token
  }

  pub fn endpoint(&self) -> Option<&str> {
    self.endpoint.as_deref()
  }

  /// Point the channel at an endpoint. Idempotent for the current
  /// target; otherwise drops the old connection and dials the new one.
  pub fn connect(&mut self, endpoint: &str) {
    if self.endpoint.as_deref() == Some(endpoint) && self.conn.is_some() {
      return;
    }
    self.teardown();
    self.endpoint = Some(endpoint.to_string());
    self.dial();
  }

  /// Forget the given endpoint. No-op if the channel points elsewhere.
  pub fn disconnect(&mut self, endpoint: &str) {
    if self.endpoint.as_deref() == Some(endpoint) {
      self.teardown();
      self.endpoint = None;
      self.retry_at = None;
    }
  }

  /// Issue a request. At most one may be outstanding; the reply clears
  /// it. If the channel is currently down the request is parked and
  /// sent as soon as a connection stands.
  pub fn send(&mut self, payload: &[u8]) -> Result<()> {
    if self.outstanding.is_some() {
      return Err(Error::policy(
        "request",
        "a request is already outstanding on this channel",
      ));
    }
    let message = Bytes::from(encode_message(&[payload.to_vec()]));
    self.outstanding = Some(message.clone());
    match &mut self.conn {
      Some(conn) => {
        conn.send(message);
        if conn.closed {
          self.mark_down();
        }
      }
      None => {
        debug!("request: no connection yet, parking request");
        self.schedule_retry();
      }
    }
    Ok(())
  }

  pub fn has_outstanding(&self) -> bool {
    self.outstanding.is_some()
  }

  /// Replies that arrived. Each reply is a single payload frame.
  pub fn handle_event(&mut self, readable: bool, writable: bool) -> Result<Vec<Vec<u8>>> {
    let Some(conn) = &mut self.conn else {
      return Ok(Vec::new());
    };
    let messages = conn.handle_event(readable, writable)?;
    let closed = conn.closed;
    let mut replies = Vec::new();
    for mut frames in messages {
      if frames.len() != 1 {
        return Err(Error::protocol(format!(
          "reply with {} frames on request channel",
          frames.len()
        )));
      }
      self.outstanding = None;
      replies.push(frames.remove(0));
    }
    if closed {
      self.mark_down();
    }
    Ok(replies)
  }

  /// Re-dial when due. Call on every upcall; cheap when idle.
  pub fn tend(&mut self) {
    if let Some(at) = self.retry_at {
      if Instant::now() >= at {
        self.retry_at = None;
        if self.conn.is_none() && self.endpoint.is_some() {
          self.dial();
        }
      }
    }
  }

  pub fn retry_hint(&self) -> Option<Duration> {
    self
      .retry_at
      .map(|at| at.saturating_duration_since(Instant::now()))
  }

  fn dial(&mut self) {
    let Some(endpoint) = self.endpoint.clone() else {
      return;
    };
    match Conn::connect(&self.registry, self.token, &endpoint, REQUEST_QUEUE_CAP) {
      Ok(mut conn) => {
        if let Some(request) = &self.outstanding {
          // the reply never came from the previous incarnation;
          // re-issue against the new one
          conn.send(request.clone());
        }
        self.conn = Some(conn);
      }
      Err(e) => {
        warn!("request: dial {endpoint} failed: {e}");
        self.schedule_retry();
      }
    }
  }

  fn mark_down(&mut self) {
    self.teardown();
    if self.endpoint.is_some() {
      self.schedule_retry();
    }
  }

  fn teardown(&mut self) {
    if let Some(mut conn) = self.conn.take() {
      conn.deregister(&self.registry);
    }
  }

  fn schedule_retry(&mut self) {
    if self.retry_at.is_none() {
      self.retry_at = Some(Instant::now() + RECONNECT_DELAY);
    }
  }
}
