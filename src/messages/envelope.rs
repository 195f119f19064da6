//! Request/reply envelope between clients and Discovery.
//!
//! A single envelope carries a tagged body plus the fields that must
//! survive DHT forwarding unchanged: the sender's timestamp (echoed in
//! every response for latency attribution) and the `do_read_or_write`
//! flag that tells a ring node whether it is the one responsible for
//! the registrant's hash.

use speedy::{Readable, Writable};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
pub enum Role {
  Publisher,
  Subscriber,
  /// A broker registers as both: it subscribes to publishers and
  /// publishes to subscribers.
  Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
pub enum Status {
  Success,
  Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
pub enum Requester {
  Subscriber,
  Broker,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct RegistrantInfo {
  pub id: String,
  pub addr: String,
  pub port: u16,
}

impl RegistrantInfo {
  pub fn endpoint(&self) -> String {
    format!("{}:{}", self.addr, self.port)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct RegisterReq {
  pub role: Role,
  pub info: RegistrantInfo,
  pub topics: Vec<String>,
  /// Broker group, brokers only.
  pub group: Option<String>,
}

/// Accumulator sets carried by an `isready` request hopping around the
/// DHT ring. Each node merges its local registrations in and inserts
/// its own name into `visited_nodes`; a node that finds itself already
/// visited decides readiness from the accumulated sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Readable, Writable)]
pub struct ReadyAccumulator {
  pub visited_nodes: Vec<String>,
  pub registered_pubs: Vec<String>,
  pub registered_subs: Vec<String>,
  pub registered_brokers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Readable, Writable)]
pub struct IsReadyReq {
  /// Present only while traversing the DHT ring.
  pub accumulator: Option<ReadyAccumulator>,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct LookupReq {
  pub topics: Vec<String>,
  /// Return every registered publisher endpoint regardless of topic.
  pub all: bool,
  pub requester: Requester,
  /// DHT traversal state; empty outside the ring.
  pub visited_nodes: Vec<String>,
  pub sockets_to_connect_to: Vec<String>,
}

impl LookupReq {
  pub fn for_topics(topics: Vec<String>, requester: Requester) -> Self {
    LookupReq {
      topics,
      all: false,
      requester,
      visited_nodes: Vec::new(),
      sockets_to_connect_to: Vec::new(),
    }
  }

  pub fn for_all_publishers(requester: Requester) -> Self {
    LookupReq {
      topics: Vec::new(),
      all: true,
      requester,
      visited_nodes: Vec::new(),
      sockets_to_connect_to: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub enum RequestBody {
  Register(RegisterReq),
  IsReady(IsReadyReq),
  Lookup(LookupReq),
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct DiscoveryRequest {
  /// Sender wall clock in unix microseconds; echoed by the response.
  pub timestamp_sent: u64,
  /// DHT only: true once the receiving node has been identified as the
  /// one responsible for the registrant's hash.
  pub do_read_or_write: bool,
  pub body: RequestBody,
}

impl DiscoveryRequest {
  pub fn new(timestamp_sent: u64, body: RequestBody) -> Self {
    DiscoveryRequest {
      timestamp_sent,
      do_read_or_write: false,
      body,
    }
  }

  pub fn encode(&self) -> Result<Vec<u8>> {
    Ok(self.write_to_vec()?)
  }

  pub fn decode(bytes: &[u8]) -> Result<Self> {
    DiscoveryRequest::read_from_buffer(bytes)
      .map_err(|e| Error::protocol(format!("undecodable request: {e}")))
  }
}

// ----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct RegisterResp {
  pub status: Status,
  /// Human-readable rejection reason, empty on success.
  pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
pub struct IsReadyResp {
  pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct LookupResp {
  /// `addr:port` endpoints the requester should connect its fan-in to.
  pub endpoints: Vec<String>,
  pub all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub enum ResponseBody {
  Register(RegisterResp),
  IsReady(IsReadyResp),
  Lookup(LookupResp),
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct DiscoveryResponse {
  /// Echo of the request's `timestamp_sent`.
  pub timestamp_sent: u64,
  pub body: ResponseBody,
}

impl DiscoveryResponse {
  pub fn encode(&self) -> Result<Vec<u8>> {
    Ok(self.write_to_vec()?)
  }

  pub fn decode(bytes: &[u8]) -> Result<Self> {
    DiscoveryResponse::read_from_buffer(bytes)
      .map_err(|e| Error::protocol(format!("undecodable response: {e}")))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn register_request_survives_the_wire() {
    let req = DiscoveryRequest::new(
      1_700_000_000_000_000,
      RequestBody::Register(RegisterReq {
        role: Role::Publisher,
        info: RegistrantInfo {
          id: "pub-a".to_string(),
          addr: "10.0.0.7".to_string(),
          port: 5577,
        },
        topics: vec!["t1".to_string(), "t2".to_string()],
        group: None,
      }),
    );
    let bytes = req.encode().unwrap();
    assert_eq!(DiscoveryRequest::decode(&bytes).unwrap(), req);
  }

  #[test]
  fn response_echoes_request_timestamp() {
    let resp = DiscoveryResponse {
      timestamp_sent: 123_456,
      body: ResponseBody::IsReady(IsReadyResp { ready: false }),
    };
    let bytes = resp.encode().unwrap();
    let back = DiscoveryResponse::decode(&bytes).unwrap();
    assert_eq!(back.timestamp_sent, 123_456);
  }

  #[test]
  fn garbage_is_a_protocol_error() {
    let err = DiscoveryRequest::decode(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
    assert!(matches!(err, crate::Error::Protocol(_)));
  }
}
