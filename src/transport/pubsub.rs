//! Fan-out / fan-in channels with prefix filtering.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace};
use mio::{net::TcpListener, Interest, Registry, Token};

use crate::Result;

use super::conn::Conn;
use super::framing::encode_message;
use super::tokens;
use super::RECONNECT_DELAY;

/// Per-subscriber outbound budget. A slow subscriber loses messages
/// rather than stalling the publisher or its other subscribers.
const FANOUT_QUEUE_CAP: usize = 256 * 1024;

const FANIN_QUEUE_CAP: usize = 64 * 1024;

/// One-to-many publishing endpoint. Every connected peer receives every
/// published message; filtering happens on the subscriber side.
pub struct PubSocket {
  registry: Registry,
  base: Token,
  listener: TcpListener,
  conns: HashMap<u64, Conn>,
  slots: Vec<Option<u64>>,
  next_id: u64,
}

impl PubSocket {
  pub fn bind(registry: Registry, base: Token, addr: &str) -> Result<PubSocket> {
    let sock_addr = super::resolve(addr)?;
    let listener = TcpListener::bind(sock_addr)?;
    PubSocket::from_listener(registry, base, listener)
  }

  pub fn from_std(registry: Registry, base: Token, listener: std::net::TcpListener) -> Result<PubSocket> {
    listener.set_nonblocking(true)?;
    PubSocket::from_listener(registry, base, TcpListener::from_std(listener))
  }

  fn from_listener(registry: Registry, base: Token, mut listener: TcpListener) -> Result<PubSocket> {
    registry.register(&mut listener, base, Interest::READABLE)?;
    Ok(PubSocket {
      registry,
      base,
      listener,
      conns: HashMap::new(),
      slots: Vec::new(),
      next_id: 1,
    })
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  pub fn owns(&self, token: Token) -> bool {
    tokens::slot(token) == tokens::slot(self.base)
  }

  pub fn peer_count(&self) -> usize {
    self.conns.len()
  }

  /// Ship one payload to every connected peer. Peers whose queue is
  /// full silently lose this message.
  pub fn publish(&mut self, payload: &[u8]) {
    let message = Bytes::from(encode_message(&[payload.to_vec()]));
    let mut dead = Vec::new();
    for (&id, conn) in self.conns.iter_mut() {
      conn.send(message.clone());
      if conn.closed {
        dead.push(id);
      }
    }
    for id in dead {
      self.drop_conn(id);
    }
  }

  pub fn handle_event(&mut self, token: Token, readable: bool, writable: bool) -> Result<()> {
    if token == self.base {
      return self.accept_all();
    }
    let offset = tokens::offset(token);
    let Some(Some(id)) = self.slots.get(offset - 1).copied() else {
      return Ok(());
    };
    let mut closed = false;
    if let Some(conn) = self.conns.get_mut(&id) {
      // subscribers send nothing meaningful upstream; reads only
      // detect disconnects
      let _ = conn.handle_event(readable, writable)?;
      closed = conn.closed;
    }
    if closed {
      self.drop_conn(id);
    }
    Ok(())
  }

  fn accept_all(&mut self) -> Result<()> {
    loop {
      match self.listener.accept() {
        Ok((stream, peer)) => {
          let slot_idx = self.claim_slot();
          let id = self.next_id;
          self.next_id += 1;
          let token = tokens::child(self.base, slot_idx + 1);
          let conn = Conn::accepted(&self.registry, token, stream, FANOUT_QUEUE_CAP)?;
          debug!("fan-out: subscriber {peer} attached as {id}");
          self.slots[slot_idx] = Some(id);
          self.conns.insert(id, conn);
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e.into()),
      }
    }
    Ok(())
  }

  fn claim_slot(&mut self) -> usize {
    match self.slots.iter().position(Option::is_none) {
      Some(idx) => idx,
      None => {
        self.slots.push(None);
        self.slots.len() - 1
      }
    }
  }

  fn drop_conn(&mut self, id: u64) {
    if let Some(mut conn) = self.conns.remove(&id) {
      conn.deregister(&self.registry);
      let offset = tokens::offset(conn.token);
      if let Some(slot) = self.slots.get_mut(offset - 1) {
        *slot = None;
      }
      debug!("fan-out: subscriber {id} detached");
    }
  }
}

// ----------------------------------------------------------------------

struct Feed {
  endpoint: String,
  conn: Option<Conn>,
  retry_at: Option<Instant>,
}

/// Many-to-one subscribing endpoint. Connects out to any number of
/// publishers, keeps dialing until each one answers, and filters
/// inbound payloads against the installed prefixes.
pub struct SubSocket {
  registry: Registry,
  base: Token,
  endpoints: HashMap<String, usize>,
  slots: Vec<Option<Feed>>,
  filters: Vec<Vec<u8>>,
}

impl SubSocket {
  pub fn new(registry: Registry, base: Token) -> SubSocket {
    SubSocket {
      registry,
      base,
      endpoints: HashMap::new(),
      slots: Vec::new(),
      filters: Vec::new(),
    }
  }

  pub fn owns(&self, token: Token) -> bool {
    tokens::slot(token) == tokens::slot(self.base)
  }

  /// Install a prefix filter. A payload is delivered if any installed
  /// filter is a prefix of it; the empty prefix matches everything.
  pub fn subscribe(&mut self, prefix: &str) {
    let prefix = prefix.as_bytes().to_vec();
    if !self.filters.contains(&prefix) {
      self.filters.push(prefix);
    }
  }

  /// Start (or keep) a feed from `endpoint`. Idempotent.
  pub fn connect(&mut self, endpoint: &str) {
    if self.endpoints.contains_key(endpoint) {
      return;
    }
    let slot_idx = self.claim_slot();
    let mut feed = Feed {
      endpoint: endpoint.to_string(),
      conn: None,
      retry_at: None,
    };
    self.dial(&mut feed, slot_idx);
    self.endpoints.insert(endpoint.to_string(), slot_idx);
    self.slots[slot_idx] = Some(feed);
  }

  /// Tear down one feed; every other feed is untouched.
  pub fn disconnect(&mut self, endpoint: &str) {
    if let Some(slot_idx) = self.endpoints.remove(endpoint) {
      if let Some(Some(mut feed)) = self.slots.get_mut(slot_idx).map(Option::take) {
        if let Some(conn) = &mut feed.conn {
          conn.deregister(&self.registry);
        }
        debug!("fan-in: detached from {endpoint}");
      }
    }
  }

  pub fn is_connected_to(&self, endpoint: &str) -> bool {
    self.endpoints.contains_key(endpoint)
  }

  pub fn connected_endpoints(&self) -> Vec<String> {
    self.endpoints.keys().cloned().collect()
  }

  /// Payloads that arrived and passed the filters.
  pub fn handle_event(&mut self, token: Token, readable: bool, writable: bool) -> Result<Vec<Vec<u8>>> {
    let offset = tokens::offset(token);
    let SubSocket {
      registry,
      slots,
      filters,
      ..
    } = self;
    let Some(Some(feed)) = slots.get_mut(offset) else {
      return Ok(Vec::new());
    };
    let mut payloads = Vec::new();
    let mut lost = false;
    if let Some(conn) = &mut feed.conn {
      for frames in conn.handle_event(readable, writable)? {
        for frame in frames {
          if filters.iter().any(|f| frame.starts_with(f)) {
            payloads.push(frame);
          } else {
            trace!("fan-in: filtered a payload from {}", feed.endpoint);
          }
        }
      }
      lost = conn.closed;
    }
    if lost {
      if let Some(mut conn) = feed.conn.take() {
        conn.deregister(registry);
      }
      feed.retry_at = Some(Instant::now() + RECONNECT_DELAY);
      debug!("fan-in: lost {}, will redial", feed.endpoint);
    }
    Ok(payloads)
  }

  /// Redial feeds whose backoff elapsed.
  pub fn tend(&mut self) {
    let due: Vec<usize> = self
      .slots
      .iter()
      .enumerate()
      .filter_map(|(idx, slot)| {
        let feed = slot.as_ref()?;
        (feed.conn.is_none() && feed.retry_at.is_some_and(|at| Instant::now() >= at))
          .then_some(idx)
      })
      .collect();
    for slot_idx in due {
      if let Some(Some(mut feed)) = self.slots.get_mut(slot_idx).map(Option::take) {
        feed.retry_at = None;
        self.dial(&mut feed, slot_idx);
        self.slots[slot_idx] = Some(feed);
      }
    }
  }

  pub fn retry_hint(&self) -> Option<Duration> {
    self
      .slots
      .iter()
      .flatten()
      .filter_map(|feed| feed.retry_at)
      .map(|at| at.saturating_duration_since(Instant::now()))
      .min()
  }

  fn dial(&self, feed: &mut Feed, slot_idx: usize) {
    let token = tokens::child(self.base, slot_idx);
    match Conn::connect(&self.registry, token, &feed.endpoint, FANIN_QUEUE_CAP) {
      Ok(conn) => feed.conn = Some(conn),
      Err(e) => {
        debug!("fan-in: dial {} failed: {e}", feed.endpoint);
        feed.retry_at = Some(Instant::now() + RECONNECT_DELAY);
      }
    }
  }

  fn claim_slot(&mut self) -> usize {
    match self.slots.iter().position(Option::is_none) {
      Some(idx) => idx,
      None => {
        self.slots.push(None);
        self.slots.len() - 1
      }
    }
  }
}
