//! Token space layout for the per-process poll.
//!
//! Each socket owned by an engine gets a slot; connections inside a
//! socket use offsets within the slot's span. Offset 0 is the
//! listener (or the primary stream) of the socket itself.

use mio::Token;

/// Number of tokens reserved per socket slot.
pub const SPAN: usize = 4096;

pub const fn base(slot: usize) -> Token {
  Token(slot * SPAN)
}

pub const fn slot(token: Token) -> usize {
  token.0 / SPAN
}

pub const fn offset(token: Token) -> usize {
  token.0 % SPAN
}

pub const fn child(base: Token, offset: usize) -> Token {
  Token(base.0 + offset)
}
