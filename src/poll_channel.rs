//! A channel whose receiving end is a poll token.
//!
//! Coordination-store watches fire on the store's notifier thread.
//! They must never touch sockets, so the callback side only pushes a
//! value here and wakes the owning event loop; the loop drains the
//! queue at its head. This breaks the watch/loop ownership cycle.

use std::sync::{
  mpsc::{self, TryRecvError},
  Arc,
};

use log::trace;
use mio::{Registry, Token, Waker};

use crate::Result;

pub fn poll_channel<T: Send>(registry: &Registry, token: Token) -> Result<(PollSender<T>, PollReceiver<T>)> {
  let waker = Arc::new(Waker::new(registry, token)?);
  let (tx, rx) = mpsc::channel();
  Ok((
    PollSender { tx, waker },
    PollReceiver { rx, token },
  ))
}

/// Cloneable sending half, safe to hand to watch callbacks.
pub struct PollSender<T> {
  tx: mpsc::Sender<T>,
  waker: Arc<Waker>,
}

impl<T> Clone for PollSender<T> {
  fn clone(&self) -> Self {
    PollSender {
      tx: self.tx.clone(),
      waker: Arc::clone(&self.waker),
    }
  }
}

impl<T> PollSender<T> {
  /// Best-effort send. A torn-down receiver just means nobody is
  /// interested any more.
  pub fn send(&self, value: T) {
    if self.tx.send(value).is_ok() {
      if let Err(e) = self.waker.wake() {
        trace!("poll channel: wake failed: {e}");
      }
    }
  }
}

/// Receiving half, owned by the event-loop side.
pub struct PollReceiver<T> {
  rx: mpsc::Receiver<T>,
  token: Token,
}

impl<T> PollReceiver<T> {
  pub fn token(&self) -> Token {
    self.token
  }

  /// Everything queued so far. Called from the loop when its token
  /// fires; also safe to call opportunistically.
  pub fn drain(&self) -> Vec<T> {
    let mut out = Vec::new();
    loop {
      match self.rx.try_recv() {
        Ok(v) => out.push(v),
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
      }
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use mio::{Events, Poll};
  use std::time::Duration;

  #[test]
  fn send_wakes_the_poll_and_values_drain_in_order() {
    let poll = Poll::new().unwrap();
    let (tx, rx) = poll_channel::<u32>(poll.registry(), Token(9)).unwrap();

    let handle = std::thread::spawn(move || {
      tx.send(1);
      tx.send(2);
    });
    handle.join().unwrap();

    let mut poll = poll;
    let mut events = Events::with_capacity(4);
    poll
      .poll(&mut events, Some(Duration::from_secs(2)))
      .unwrap();
    let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
    assert!(tokens.contains(&Token(9)));
    assert_eq!(rx.drain(), vec![1, 2]);
  }
}
