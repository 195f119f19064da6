//! Deployment configuration and the DHT ring roster.
//!
//! A single JSON configuration file is shared by every process in a
//! deployment. It selects the Discovery lookup strategy and the
//! dissemination strategy, fixes the topic catalog, and (for brokered
//! dissemination) maps broker groups to the topics they carry.

use std::{collections::BTreeMap, fs, path::Path};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How Discovery is looked up and replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupStrategy {
  /// A single well-known Discovery instance.
  Centralized,
  /// A ring of Discovery nodes with Chord-style finger routing.
  Dht,
  /// Replicated Discovery instances electing a primary through the
  /// coordination store.
  Coordinator,
}

/// How topic data reaches subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dissemination {
  /// Subscribers connect to each relevant publisher.
  Direct,
  /// All traffic flows through a broker proxy.
  Brokered,
}

fn default_idle_timeout_ms() -> u64 {
  30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
  pub discovery: LookupStrategy,
  pub dissemination: Dissemination,
  /// Fixed topic catalog. Registrations naming a topic outside this
  /// list are rejected by Discovery.
  pub topics: Vec<String>,
  pub expected_publishers: usize,
  pub expected_subscribers: usize,
  /// Broker group to carried topics, brokered dissemination only.
  #[serde(default)]
  pub groups: BTreeMap<String, Vec<String>>,
  /// Idle window: a Discovery node with no inbound request for this
  /// long shuts down; a subscriber with no data for this long
  /// terminates cleanly.
  #[serde(default = "default_idle_timeout_ms")]
  pub idle_timeout_ms: u64,
}

impl Config {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
      .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
    let cfg: Config = serde_json::from_str(&raw)
      .map_err(|e| Error::config(format!("malformed config {}: {e}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
  }

  pub fn validate(&self) -> Result<()> {
    if self.topics.is_empty() {
      return Err(Error::config("topic catalog is empty"));
    }
    if self.topics.iter().any(|t| t.is_empty()) {
      return Err(Error::config("topic catalog contains an empty topic"));
    }
    if self.dissemination == Dissemination::Brokered && self.groups.is_empty() {
      return Err(Error::config(
        "brokered dissemination requires a group-to-topics map",
      ));
    }
    for (group, topics) in &self.groups {
      for t in topics {
        if !self.is_known_topic(t) {
          return Err(Error::config(format!(
            "group {group} names unknown topic {t}"
          )));
        }
      }
    }
    Ok(())
  }

  pub fn is_known_topic(&self, topic: &str) -> bool {
    self.topics.iter().any(|t| t == topic)
  }

  pub fn topics_for_group(&self, group: &str) -> Option<&[String]> {
    self.groups.get(group).map(|v| v.as_slice())
  }
}

// ----------------------------------------------------------------------

/// One member of the DHT ring, as listed in the roster file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingNode {
  pub id: String,
  /// 48-bit ring identifier. Normally `ring_hash(id)`, but the roster
  /// is authoritative so rings with hand-assigned positions load too.
  pub hash: u64,
  #[serde(rename = "IP")]
  pub ip: String,
  pub port: u16,
  pub host: String,
}

impl RingNode {
  pub fn endpoint(&self) -> String {
    format!("{}:{}", self.ip, self.port)
  }
}

/// Roster file of the form `{"dht": [{"id", "hash", "IP", "port", "host"}, ...]}`,
/// loaded by every DHT-mode Discovery node at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtRoster {
  pub dht: Vec<RingNode>,
}

impl DhtRoster {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
      .map_err(|e| Error::config(format!("cannot read roster {}: {e}", path.display())))?;
    let roster: DhtRoster = serde_json::from_str(&raw)
      .map_err(|e| Error::config(format!("malformed roster {}: {e}", path.display())))?;
    roster.validate()?;
    Ok(roster)
  }

  pub fn validate(&self) -> Result<()> {
    if self.dht.is_empty() {
      return Err(Error::config("DHT roster is empty"));
    }
    Ok(())
  }

  pub fn find(&self, id: &str) -> Option<&RingNode> {
    self.dht.iter().find(|n| n.id == id)
  }

  /// Any entry point into the ring is as good as any other; clients
  /// pick one at random.
  pub fn random_entry(&self) -> &RingNode {
    let idx = rand::rng().random_range(0..self.dht.len());
    &self.dht[idx]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn catalog() -> Vec<String> {
    vec!["t1".to_string(), "t2".to_string()]
  }

  #[test]
  fn brokered_without_groups_is_rejected() {
    let cfg = Config {
      discovery: LookupStrategy::Centralized,
      dissemination: Dissemination::Brokered,
      topics: catalog(),
      expected_publishers: 1,
      expected_subscribers: 1,
      groups: BTreeMap::new(),
      idle_timeout_ms: 1000,
    };
    assert!(cfg.validate().is_err());
  }

  #[test]
  fn group_with_unknown_topic_is_rejected() {
    let mut groups = BTreeMap::new();
    groups.insert("group1".to_string(), vec!["nope".to_string()]);
    let cfg = Config {
      discovery: LookupStrategy::Coordinator,
      dissemination: Dissemination::Brokered,
      topics: catalog(),
      expected_publishers: 1,
      expected_subscribers: 1,
      groups,
      idle_timeout_ms: 1000,
    };
    assert!(cfg.validate().is_err());
  }

  #[test]
  fn roster_round_trips_through_json() {
    let json = r#"{"dht":[{"id":"disc1","hash":42,"IP":"10.0.0.1","port":5555,"host":"h1"}]}"#;
    let roster: DhtRoster = serde_json::from_str(json).unwrap();
    assert_eq!(roster.dht[0].id, "disc1");
    assert_eq!(roster.dht[0].endpoint(), "10.0.0.1:5555");
    let back = serde_json::to_string(&roster).unwrap();
    assert!(back.contains("\"IP\":\"10.0.0.1\""));
  }
}
