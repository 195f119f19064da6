//! The registrant directory: who is here and who publishes what.

use std::collections::{BTreeMap, BTreeSet};

use crate::messages::DirectorySnapshot;

/// Discovery's registration tables. Uniqueness is per role set: two
/// publishers may not share an id, but a publisher and a subscriber
/// may. The topic index is derived from publisher registrations and
/// kept consistent with them.
#[derive(Debug, Default, Clone)]
pub struct Directory {
  publishers: BTreeMap<String, String>,
  topic_index: BTreeMap<String, Vec<String>>,
  subscribers: BTreeSet<String>,
  brokers: BTreeMap<String, String>,
}

impl Directory {
  pub fn new() -> Directory {
    Directory::default()
  }

  /// Register a publisher. Errors with a human-readable reason on a
  /// duplicate id; the caller turns that into a FAILURE response.
  pub fn register_publisher(
    &mut self,
    id: &str,
    endpoint: &str,
    topics: &[String],
  ) -> Result<(), String> {
    if self.publishers.contains_key(id) {
      return Err(format!("publisher with id {id} already registered"));
    }
    self.publishers.insert(id.to_string(), endpoint.to_string());
    for topic in topics {
      self
        .topic_index
        .entry(topic.clone())
        .or_default()
        .push(id.to_string());
    }
    Ok(())
  }

  pub fn register_subscriber(&mut self, id: &str) -> Result<(), String> {
    if !self.subscribers.insert(id.to_string()) {
      return Err(format!("subscriber with id {id} already registered"));
    }
    Ok(())
  }

  pub fn register_broker(&mut self, id: &str, endpoint: &str) -> Result<(), String> {
    if self.brokers.contains_key(id) {
      return Err(format!("broker with id {id} already registered"));
    }
    self.brokers.insert(id.to_string(), endpoint.to_string());
    Ok(())
  }

  /// Remove a dead publisher everywhere; returns its endpoint if it
  /// was known.
  pub fn remove_publisher(&mut self, id: &str) -> Option<String> {
    let endpoint = self.publishers.remove(id)?;
    for pubs in self.topic_index.values_mut() {
      pubs.retain(|p| p != id);
    }
    self.topic_index.retain(|_, pubs| !pubs.is_empty());
    Some(endpoint)
  }

  pub fn remove_broker(&mut self, id: &str) -> Option<String> {
    self.brokers.remove(id)
  }

  pub fn publisher_count(&self) -> usize {
    self.publishers.len()
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscribers.len()
  }

  pub fn broker_count(&self) -> usize {
    self.brokers.len()
  }

  pub fn publisher_ids(&self) -> impl Iterator<Item = &String> {
    self.publishers.keys()
  }

  pub fn subscriber_ids(&self) -> impl Iterator<Item = &String> {
    self.subscribers.iter()
  }

  pub fn broker_ids(&self) -> impl Iterator<Item = &String> {
    self.brokers.keys()
  }

  pub fn publisher_endpoint(&self, id: &str) -> Option<&String> {
    self.publishers.get(id)
  }

  /// Endpoints of every publisher whose topic set intersects `topics`.
  pub fn endpoints_for_topics(&self, topics: &[String]) -> BTreeSet<String> {
    let mut endpoints = BTreeSet::new();
    for topic in topics {
      if let Some(pubs) = self.topic_index.get(topic) {
        for id in pubs {
          if let Some(ep) = self.publishers.get(id) {
            endpoints.insert(ep.clone());
          }
        }
      }
    }
    endpoints
  }

  pub fn all_publisher_endpoints(&self) -> BTreeSet<String> {
    self.publishers.values().cloned().collect()
  }

  /// Every registered broker endpoint. Under coordinator mode only
  /// live group leaders are registered, so this is the broker set a
  /// subscriber should connect to.
  pub fn broker_endpoints(&self) -> BTreeSet<String> {
    self.brokers.values().cloned().collect()
  }

  pub fn snapshot(&self) -> DirectorySnapshot {
    DirectorySnapshot {
      registered_publishers: self.publishers.keys().cloned().collect(),
      publisher_id_to_endpoint: self.publishers.clone(),
      topic_to_publishers: self.topic_index.clone(),
      registered_subscribers: self.subscribers.iter().cloned().collect(),
      registered_brokers: self.brokers.keys().cloned().collect(),
      broker_id_to_endpoint: self.brokers.clone(),
    }
  }

  /// Replace the whole directory in one step, as secondaries must when
  /// a snapshot arrives, so no reader ever sees a torn state.
  pub fn restore(&mut self, snap: DirectorySnapshot) {
    *self = Directory {
      publishers: snap.publisher_id_to_endpoint,
      topic_index: snap.topic_to_publishers,
      subscribers: snap.registered_subscribers.into_iter().collect(),
      brokers: snap.broker_id_to_endpoint,
    };
  }
}
