//! Coordination store: sessions, ephemeral nodes, children watches.
//!
//! The engines need a small, ZooKeeper-shaped vocabulary: ephemeral
//! nodes that vanish with their creating session, sequential ephemerals
//! whose store-assigned numbers implement ownership strength, and
//! level-triggered children watches that report the full child list on
//! every change. [`CoordStore`] provides that vocabulary over a
//! process-shared state with real session semantics: closing (or
//! dropping) a [`CoordSession`] deletes its ephemerals and fires the
//! affected watches, which is exactly how peer death is detected.
//!
//! Watch callbacks run on the store's notifier thread. They must not
//! perform socket operations; enqueue into a
//! [`poll_channel`](crate::poll_channel) and let the owning event loop
//! act on its next iteration.

mod store;

pub use store::{CoordSession, CoordStore};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
  #[error("node already exists: {0}")]
  AlreadyExists(String),

  #[error("no such node: {0}")]
  NoNode(String),

  #[error("session expired")]
  SessionExpired,
}

/// Store-assigned sequence number of a sequential node name such as
/// `pub-a-0000000007`.
pub fn sequence_of(child_name: &str) -> Option<u64> {
  let (_, seq) = child_name.rsplit_once('-')?;
  seq.parse().ok()
}

/// The lowest live sequence among `children`, i.e. the current
/// ownership-strength leader.
pub fn min_sequence(children: &[String]) -> Option<u64> {
  children.iter().filter_map(|c| sequence_of(c)).min()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sequence_parses_past_dashes_in_the_name() {
    assert_eq!(sequence_of("pub-a-0000000007"), Some(7));
    assert_eq!(sequence_of("nodash"), None);
    assert_eq!(sequence_of("trailing-"), None);
  }

  #[test]
  fn min_sequence_ignores_unparsable_children() {
    let children = vec![
      "pub-a-0000000005".to_string(),
      "garbage".to_string(),
      "pub-b-0000000002".to_string(),
    ];
    assert_eq!(min_sequence(&children), Some(2));
  }
}
