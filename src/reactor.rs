//! The per-process event loop and its upcall contract.
//!
//! Every engine runs one single-threaded loop over its sockets plus a
//! timer. On wakeup the loop classifies the event: an empty poll means
//! the timer expired and the engine's state machine gets an
//! `on_timeout` upcall (its `invoke_operation`); readable sockets get
//! `on_event` upcalls. Every upcall returns the next poll timeout:
//!
//! * `IMMEDIATE` (zero): re-enter `on_timeout` right away; used to
//!   chain state transitions without waiting for I/O.
//! * `None`: park until a socket wakes us.
//! * `Some(d)`: wake in `d` at the latest.
//!
//! Termination is cooperative: `running()` is consulted at the top of
//! every iteration, and engines flip their flag from an upcall.

use std::io;
use std::time::Duration;

use log::trace;
use mio::{Events, Poll, Registry};

use crate::Result;

/// Re-enter the state machine without waiting.
pub const IMMEDIATE: Option<Duration> = Some(Duration::ZERO);

/// The smaller of two optional timeouts, `None` meaning forever.
pub fn min_timeout(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
  match (a, b) {
    (Some(x), Some(y)) => Some(x.min(y)),
    (Some(x), None) => Some(x),
    (None, y) => y,
  }
}

/// Upcall surface of an engine state machine.
pub trait EventHandler {
  /// Timer expiry: act on the current lifecycle state.
  fn on_timeout(&mut self) -> Result<Option<Duration>>;

  /// A socket became ready. The token identifies which one.
  fn on_event(&mut self, token: mio::Token, readable: bool, writable: bool)
    -> Result<Option<Duration>>;

  /// Observed at the top of each iteration; return false to leave the
  /// loop gracefully.
  fn running(&self) -> bool;
}

pub struct EventLoop {
  poll: Poll,
  events: Events,
}

impl EventLoop {
  pub fn new() -> Result<EventLoop> {
    Ok(EventLoop {
      poll: Poll::new()?,
      events: Events::with_capacity(256),
    })
  }

  /// A handle engines use to register their sockets, including from
  /// within upcalls (e.g. connecting to publishers after a lookup).
  pub fn registry(&self) -> Result<Registry> {
    Ok(self.poll.registry().try_clone()?)
  }

  /// Drive the handler until it stops. `first_timeout` follows the
  /// same convention as the upcall returns; engines that want to act
  /// immediately pass [`IMMEDIATE`].
  pub fn run(&mut self, handler: &mut dyn EventHandler, first_timeout: Option<Duration>) -> Result<()> {
    let mut timeout = first_timeout;
    while handler.running() {
      match self.poll.poll(&mut self.events, timeout) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e.into()),
      }
      if self.events.is_empty() {
        trace!("event loop: timer upcall");
        timeout = handler.on_timeout()?;
        continue;
      }
      for event in self.events.iter() {
        timeout = handler.on_event(event.token(), event.is_readable(), event.is_writable())?;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn min_timeout_prefers_the_sooner_deadline() {
    let a = Some(Duration::from_millis(100));
    let b = Some(Duration::from_millis(30));
    assert_eq!(min_timeout(a, b), b);
    assert_eq!(min_timeout(None, b), b);
    assert_eq!(min_timeout(a, None), a);
    assert_eq!(min_timeout(None, None), None);
  }

  struct Countdown {
    remaining: u32,
  }

  impl EventHandler for Countdown {
    fn on_timeout(&mut self) -> Result<Option<Duration>> {
      self.remaining -= 1;
      Ok(IMMEDIATE)
    }

    fn on_event(&mut self, _: mio::Token, _: bool, _: bool) -> Result<Option<Duration>> {
      Ok(IMMEDIATE)
    }

    fn running(&self) -> bool {
      self.remaining > 0
    }
  }

  #[test]
  fn immediate_timeouts_reenter_the_state_machine() {
    let mut lp = EventLoop::new().unwrap();
    let mut handler = Countdown { remaining: 3 };
    lp.run(&mut handler, IMMEDIATE).unwrap();
    assert_eq!(handler.remaining, 0);
  }
}
