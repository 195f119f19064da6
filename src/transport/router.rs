//! Server-side routed channel.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use log::{debug, warn};
use mio::{net::TcpListener, Interest, Registry, Token};

use crate::{Error, Result};

use super::conn::Conn;
use super::framing::encode_message;
use super::tokens;

const CONTROL_QUEUE_CAP: usize = 4 * 1024 * 1024;

/// An inbound message with its return path. `frames[0]` is the opaque
/// identity of the connection it arrived on; any frames before the
/// last one are earlier identities accumulated while hopping through
/// dealers. The payload is always the final frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
  pub frames: Vec<Vec<u8>>,
}

impl RoutedMessage {
  pub fn payload(&self) -> &[u8] {
    self.frames.last().map(|f| f.as_slice()).unwrap_or(&[])
  }

  /// Keep the return path, swap the payload. This is how replies and
  /// forwarded requests are built.
  pub fn with_payload(&self, payload: Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = self.frames.clone();
    *frames.last_mut().expect("routed message has frames") = payload;
    frames
  }
}

/// Listening endpoint that tags every inbound message with the
/// connection it came from, so replies can be routed back without the
/// application knowing anything about the peers.
pub struct RouterSocket {
  registry: Registry,
  base: Token,
  listener: TcpListener,
  conns: HashMap<u64, Conn>,
  slots: Vec<Option<u64>>,
  next_id: u64,
}

impl RouterSocket {
  pub fn bind(registry: Registry, base: Token, addr: &str) -> Result<RouterSocket> {
    let sock_addr = super::resolve(addr)?;
    let listener = TcpListener::bind(sock_addr)?;
    RouterSocket::from_listener(registry, base, listener)
  }

  /// Adopt a pre-bound standard listener (useful when the port must be
  /// known before the socket is constructed, e.g. building a ring
  /// roster).
  pub fn from_std(registry: Registry, base: Token, listener: std::net::TcpListener) -> Result<RouterSocket> {
    listener.set_nonblocking(true)?;
    RouterSocket::from_listener(registry, base, TcpListener::from_std(listener))
  }

  fn from_listener(registry: Registry, base: Token, mut listener: TcpListener) -> Result<RouterSocket> {
    registry.register(&mut listener, base, Interest::READABLE)?;
    Ok(RouterSocket {
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

  /// Drive the listener or one of its connections after a poll event.
  pub fn handle_event(&mut self, token: Token, readable: bool, writable: bool) -> Result<Vec<RoutedMessage>> {
    if token == self.base {
      self.accept_all()?;
      return Ok(Vec::new());
    }
    let offset = tokens::offset(token);
    let Some(Some(id)) = self.slots.get(offset - 1).copied() else {
      return Ok(Vec::new()); // event for a connection already gone
    };
    let mut routed = Vec::new();
    let mut closed = false;
    if let Some(conn) = self.conns.get_mut(&id) {
      for frames in conn.handle_event(readable, writable)? {
        let mut with_identity = Vec::with_capacity(frames.len() + 1);
        with_identity.push(id.to_be_bytes().to_vec());
        with_identity.extend(frames);
        routed.push(RoutedMessage {
          frames: with_identity,
        });
      }
      closed = conn.closed;
    }
    if closed {
      self.drop_conn(id, offset - 1);
    }
    Ok(routed)
  }

  /// Send a reply (or a forwarded response). The first frame selects
  /// the connection; the rest go on the wire. A vanished peer is not
  /// an error; it simply no longer wants the reply.
  pub fn send(&mut self, frames: Vec<Vec<u8>>) -> Result<()> {
    if frames.len() < 2 {
      return Err(Error::protocol("routed send needs identity and payload"));
    }
    let id_frame: [u8; 8] = frames[0]
      .as_slice()
      .try_into()
      .map_err(|_| Error::protocol("malformed identity frame"))?;
    let id = u64::from_be_bytes(id_frame);
    match self.conns.get_mut(&id) {
      Some(conn) => {
        conn.send(Bytes::from(encode_message(&frames[1..])));
        Ok(())
      }
      None => {
        warn!("router: peer {id} is gone, dropping reply");
        Ok(())
      }
    }
  }

  fn accept_all(&mut self) -> Result<()> {
    loop {
      match self.listener.accept() {
        Ok((stream, peer)) => {
          let slot_idx = self.claim_slot();
          let id = self.next_id;
          self.next_id += 1;
          let token = tokens::child(self.base, slot_idx + 1);
          let conn = Conn::accepted(&self.registry, token, stream, CONTROL_QUEUE_CAP)?;
          debug!("router: accepted {peer} as peer {id}");
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

  fn drop_conn(&mut self, id: u64, slot_idx: usize) {
    if let Some(mut conn) = self.conns.remove(&id) {
      conn.deregister(&self.registry);
      debug!("router: peer {id} disconnected");
    }
    if let Some(slot) = self.slots.get_mut(slot_idx) {
      *slot = None;
    }
  }
}
