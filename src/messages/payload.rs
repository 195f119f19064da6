//! Topic-prefixed frames: the data plane and the Discovery sync channel.
//!
//! Both channels put a UTF-8 routing prefix in front of a JSON payload,
//! `<prefix>:<json>`, so that subscription filtering happens on raw
//! bytes. On the data plane the prefix is the topic itself and the
//! payload is the publisher's current history window (newest record
//! last). On the sync channel the prefix is one of `discovery`, `sub`
//! or `unsub`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One published value with its latency attribution fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
  pub topic: String,
  pub data: String,
  #[serde(rename = "pubid")]
  pub pub_id: String,
  pub sent_timestamp: u64,
  #[serde(rename = "exp_name")]
  pub experiment: String,
}

/// Encode a publication for the fan-out channel: the topic, a `:`
/// delimiter, then the history window as a JSON array.
pub fn encode_publication(topic: &str, history: &[SampleRecord]) -> Result<Vec<u8>> {
  let json = serde_json::to_string(history)?;
  Ok(format!("{topic}:{json}").into_bytes())
}

/// Split a received publication into its topic and records.
pub fn decode_publication(bytes: &[u8]) -> Result<(String, Vec<SampleRecord>)> {
  let text = std::str::from_utf8(bytes)
    .map_err(|_| Error::protocol("publication is not valid UTF-8"))?;
  let (topic, json) = text
    .split_once(':')
    .ok_or_else(|| Error::protocol("publication lacks a topic delimiter"))?;
  if topic.is_empty() {
    return Err(Error::protocol("publication has an empty topic"));
  }
  let records: Vec<SampleRecord> = serde_json::from_str(json)?;
  Ok((topic.to_string(), records))
}

// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipKind {
  Pub,
  Broker,
}

/// `sub` delta: a new endpoint worth connecting to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipDelta {
  pub update_type: MembershipKind,
  pub addr: String,
  pub port: u16,
  #[serde(default)]
  pub topics: Vec<String>,
}

impl MembershipDelta {
  pub fn endpoint(&self) -> String {
    format!("{}:{}", self.addr, self.port)
  }
}

/// `unsub` delta: an endpoint that died or lost its leadership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRef {
  pub addr: String,
  pub port: u16,
}

impl EndpointRef {
  pub fn endpoint(&self) -> String {
    format!("{}:{}", self.addr, self.port)
  }

  /// Parse an `addr:port` string back into its parts.
  pub fn parse(endpoint: &str) -> Result<Self> {
    let (addr, port) = endpoint
      .rsplit_once(':')
      .ok_or_else(|| Error::protocol(format!("malformed endpoint {endpoint}")))?;
    let port = port
      .parse::<u16>()
      .map_err(|_| Error::protocol(format!("malformed port in {endpoint}")))?;
    Ok(EndpointRef {
      addr: addr.to_string(),
      port,
    })
  }
}

/// Full Discovery state, pushed on the `discovery` sync topic after
/// every membership change so that secondaries can replace their state
/// atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
  pub registered_publishers: Vec<String>,
  pub publisher_id_to_endpoint: BTreeMap<String, String>,
  pub topic_to_publishers: BTreeMap<String, Vec<String>>,
  pub registered_subscribers: Vec<String>,
  pub registered_brokers: Vec<String>,
  pub broker_id_to_endpoint: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncFrame {
  Snapshot(DirectorySnapshot),
  Sub(MembershipDelta),
  Unsub(EndpointRef),
}

pub const SYNC_TAG_SNAPSHOT: &str = "discovery";
pub const SYNC_TAG_SUB: &str = "sub";
pub const SYNC_TAG_UNSUB: &str = "unsub";

pub fn encode_sync(frame: &SyncFrame) -> Result<Vec<u8>> {
  let (tag, json) = match frame {
    SyncFrame::Snapshot(s) => (SYNC_TAG_SNAPSHOT, serde_json::to_string(s)?),
    SyncFrame::Sub(d) => (SYNC_TAG_SUB, serde_json::to_string(d)?),
    SyncFrame::Unsub(e) => (SYNC_TAG_UNSUB, serde_json::to_string(e)?),
  };
  Ok(format!("{tag}:{json}").into_bytes())
}

pub fn decode_sync(bytes: &[u8]) -> Result<SyncFrame> {
  let text =
    std::str::from_utf8(bytes).map_err(|_| Error::protocol("sync frame is not valid UTF-8"))?;
  let (tag, json) = text
    .split_once(':')
    .ok_or_else(|| Error::protocol("sync frame lacks a tag delimiter"))?;
  match tag {
    SYNC_TAG_SNAPSHOT => Ok(SyncFrame::Snapshot(serde_json::from_str(json)?)),
    SYNC_TAG_SUB => Ok(SyncFrame::Sub(serde_json::from_str(json)?)),
    SYNC_TAG_UNSUB => Ok(SyncFrame::Unsub(serde_json::from_str(json)?)),
    other => Err(Error::protocol(format!("unknown sync tag {other}"))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(topic: &str, data: &str) -> SampleRecord {
    SampleRecord {
      topic: topic.to_string(),
      data: data.to_string(),
      pub_id: "pub-a".to_string(),
      sent_timestamp: 42,
      experiment: "exp".to_string(),
    }
  }

  #[test]
  fn publication_starts_with_its_topic() {
    let bytes = encode_publication("weather", &[record("weather", "sunny")]).unwrap();
    assert!(bytes.starts_with(b"weather:"));
    let (topic, records) = decode_publication(&bytes).unwrap();
    assert_eq!(topic, "weather");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data, "sunny");
  }

  #[test]
  fn history_window_keeps_record_order() {
    let history = vec![record("t", "1"), record("t", "2"), record("t", "3")];
    let bytes = encode_publication("t", &history).unwrap();
    let (_, records) = decode_publication(&bytes).unwrap();
    let values: Vec<&str> = records.iter().map(|r| r.data.as_str()).collect();
    assert_eq!(values, ["1", "2", "3"]);
  }

  #[test]
  fn sub_delta_round_trips_with_tag() {
    let frame = SyncFrame::Sub(MembershipDelta {
      update_type: MembershipKind::Pub,
      addr: "10.0.0.9".to_string(),
      port: 6000,
      topics: vec!["t1".to_string()],
    });
    let bytes = encode_sync(&frame).unwrap();
    assert!(bytes.starts_with(b"sub:"));
    assert_eq!(decode_sync(&bytes).unwrap(), frame);
  }

  #[test]
  fn unsub_delta_round_trips_with_tag() {
    let frame = SyncFrame::Unsub(EndpointRef {
      addr: "10.0.0.9".to_string(),
      port: 6000,
    });
    let bytes = encode_sync(&frame).unwrap();
    assert!(bytes.starts_with(b"unsub:"));
    assert_eq!(decode_sync(&bytes).unwrap(), frame);
  }

  #[test]
  fn endpoint_parse_rejects_garbage() {
    assert!(EndpointRef::parse("nocolon").is_err());
    assert!(EndpointRef::parse("host:notaport").is_err());
    let ep = EndpointRef::parse("10.0.0.1:5555").unwrap();
    assert_eq!(ep.addr, "10.0.0.1");
    assert_eq!(ep.port, 5555);
  }
}
