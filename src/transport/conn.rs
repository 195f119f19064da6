//! One TCP connection with framing, a bounded write queue and
//! non-blocking handshake tracking. Shared by every socket type.

use std::io::{self, Read, Write};
use std::collections::VecDeque;

use bytes::Bytes;
use log::trace;
use mio::{net::TcpStream, Interest, Registry, Token};

use crate::Result;

use super::framing::FrameReader;

pub(crate) struct Conn {
  stream: TcpStream,
  pub(crate) token: Token,
  reader: FrameReader,
  writeq: VecDeque<Bytes>,
  write_offset: usize,
  queued_bytes: usize,
  queue_cap: usize,
  dropped: u64,
  pub(crate) connected: bool,
  pub(crate) closed: bool,
}

impl Conn {
  /// Start an outbound dial. Completion is observed on the first
  /// writable event.
  pub(crate) fn connect(
    registry: &Registry,
    token: Token,
    endpoint: &str,
    queue_cap: usize,
  ) -> io::Result<Conn> {
    let addr = super::resolve(endpoint)?;
    let mut stream = TcpStream::connect(addr)?;
    registry.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
    Ok(Conn {
      stream,
      token,
      reader: FrameReader::new(),
      writeq: VecDeque::new(),
      write_offset: 0,
      queued_bytes: 0,
      queue_cap,
      dropped: 0,
      connected: false,
      closed: false,
    })
  }

  /// Wrap a stream handed out by a listener.
  pub(crate) fn accepted(
    registry: &Registry,
    token: Token,
    mut stream: TcpStream,
    queue_cap: usize,
  ) -> io::Result<Conn> {
    registry.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
    Ok(Conn {
      stream,
      token,
      reader: FrameReader::new(),
      writeq: VecDeque::new(),
      write_offset: 0,
      queued_bytes: 0,
      queue_cap,
      dropped: 0,
      connected: true,
      closed: false,
    })
  }

  /// Queue an already-encoded message and try to flush. Returns false
  /// if the bounded queue was full and the message was dropped.
  pub(crate) fn send(&mut self, message: Bytes) -> bool {
    if self.closed {
      return false;
    }
    if self.queued_bytes + message.len() > self.queue_cap {
      self.dropped += 1;
      trace!(
        "conn {:?}: write queue full, dropped message ({} total)",
        self.token,
        self.dropped
      );
      return false;
    }
    self.queued_bytes += message.len();
    self.writeq.push_back(message);
    if self.connected {
      if let Err(e) = self.flush() {
        trace!("conn {:?}: flush failed: {e}", self.token);
        self.closed = true;
      }
    }
    true
  }

  /// Drive the connection after a poll event. Returns the complete
  /// messages that arrived; `self.closed` reports whether the peer is
  /// gone (cleanly or otherwise).
  pub(crate) fn handle_event(&mut self, readable: bool, writable: bool) -> Result<Vec<Vec<Vec<u8>>>> {
    if writable && !self.closed {
      self.on_writable();
    }
    let mut messages = Vec::new();
    if readable && !self.closed {
      self.on_readable(&mut messages)?;
    }
    Ok(messages)
  }

  fn on_writable(&mut self) {
    if !self.connected {
      // a writable event on a dialing stream means the handshake
      // finished, one way or the other
      match self.stream.peer_addr() {
        Ok(_) => self.connected = true,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
        Err(_) => {
          self.closed = true;
          return;
        }
      }
      if let Ok(Some(_)) | Err(_) = self.stream.take_error() {
        self.closed = true;
        return;
      }
    }
    if let Err(e) = self.flush() {
      trace!("conn {:?}: flush failed: {e}", self.token);
      self.closed = true;
    }
  }

  fn on_readable(&mut self, messages: &mut Vec<Vec<Vec<u8>>>) -> Result<()> {
    let mut buf = [0u8; 8192];
    loop {
      match self.stream.read(&mut buf) {
        Ok(0) => {
          self.closed = true;
          break;
        }
        Ok(n) => self.reader.ingest(&buf[..n]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(_) => {
          self.closed = true;
          break;
        }
      }
    }
    while let Some(frames) = self.reader.next_message()? {
      messages.push(frames);
    }
    Ok(())
  }

  fn flush(&mut self) -> io::Result<()> {
    while let Some(front) = self.writeq.front() {
      let chunk = &front[self.write_offset..];
      match self.stream.write(chunk) {
        Ok(n) => {
          self.write_offset += n;
          self.queued_bytes -= n;
          if self.write_offset == front.len() {
            self.writeq.pop_front();
            self.write_offset = 0;
          }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }

  pub(crate) fn deregister(&mut self, registry: &Registry) {
    let _ = registry.deregister(&mut self.stream);
  }
}
