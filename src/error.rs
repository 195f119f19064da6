use thiserror::Error;

use crate::coord::CoordError;

/// Crate-wide error type.
///
/// The variants follow the failure taxonomy of the middleware:
/// protocol errors are fatal to the connection that produced them,
/// naming errors surface as FAILURE responses (or abort a client whose
/// own registration was rejected), transient errors are logged and
/// absorbed by the next membership change, configuration errors are
/// fatal at startup, and policy errors mean a state machine saw an
/// event that is impossible in its current state.
#[derive(Debug, Error)]
pub enum Error {
  #[error("protocol violation: {0}")]
  Protocol(String),

  #[error("naming conflict: {0}")]
  Naming(String),

  #[error("transient failure: {0}")]
  Transient(String),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("state machine violation in state {state}: {detail}")]
  Policy { state: &'static str, detail: String },

  #[error("coordination store: {0}")]
  Coord(#[from] CoordError),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error("codec: {0}")]
  Codec(#[from] speedy::Error),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

impl Error {
  pub fn protocol(detail: impl Into<String>) -> Self {
    Error::Protocol(detail.into())
  }

  pub fn config(detail: impl Into<String>) -> Self {
    Error::Config(detail.into())
  }

  pub fn policy(state: &'static str, detail: impl Into<String>) -> Self {
    Error::Policy {
      state,
      detail: detail.into(),
    }
  }
}

pub type Result<T> = std::result::Result<T, Error>;
