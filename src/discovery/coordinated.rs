//! Coordinator-backed replication: election records, broker-leader
//! tracking and the membership deltas they produce.

use serde::{Deserialize, Serialize};

use crate::coord::{CoordError, CoordSession};
use crate::messages::{EndpointRef, MembershipDelta, MembershipKind, SyncFrame};
use crate::{Error, Result};

pub const DISCOVERY_PARENT: &str = "/discovery";
pub const DISCOVERY_LEADER: &str = "/discovery/leader";
pub const PUBS_PARENT: &str = "/pubs";
pub const BROKERS_PARENT: &str = "/brokers";
pub const TOPIC_PARENT: &str = "/topic";

/// Value of `/discovery/leader`: where to reach the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
  pub addr: String,
  pub port: u16,
  pub sub_port: u16,
  pub name: String,
}

impl LeaderRecord {
  pub fn request_endpoint(&self) -> String {
    format!("{}:{}", self.addr, self.port)
  }

  pub fn sync_endpoint(&self) -> String {
    format!("{}:{}", self.addr, self.sub_port)
  }
}

/// Value of `/brokers/<group>`: the group's current leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerLeader {
  pub addr: String,
  pub port: u16,
  pub name: String,
}

impl BrokerLeader {
  pub fn endpoint(&self) -> String {
    format!("{}:{}", self.addr, self.port)
  }
}

/// Value of `/pubs/<name>`: a publisher's presence marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
  pub addr: String,
  pub port: u16,
  pub name: String,
}

/// Race to become the primary by creating the ephemeral leader node.
/// Exactly one contender wins; the rest read the winner's record.
pub fn elect_primary(session: &CoordSession, record: &LeaderRecord) -> Result<bool> {
  let value = serde_json::to_vec(record)?;
  match session.create_ephemeral(DISCOVERY_LEADER, &value) {
    Ok(()) => Ok(true),
    Err(CoordError::AlreadyExists(_)) => Ok(false),
    Err(e) => Err(e.into()),
  }
}

pub fn read_leader(session: &CoordSession) -> Result<Option<LeaderRecord>> {
  match session.get_data(DISCOVERY_LEADER) {
    Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
    Err(CoordError::NoNode(_)) => Ok(None),
    Err(e) => Err(e.into()),
  }
}

pub fn read_broker_leader(session: &CoordSession, group: &str) -> Result<Option<BrokerLeader>> {
  match session.get_data(&format!("{BROKERS_PARENT}/{group}")) {
    Ok(bytes) if bytes.is_empty() => Ok(None),
    Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
      Error::protocol(format!("malformed broker record for {group}: {e}"))
    })?)),
    Err(CoordError::NoNode(_)) => Ok(None),
    Err(e) => Err(e.into()),
  }
}

/// Deltas to emit when a group's leader cache is refreshed:
/// {none → leader} yields `sub`, {leader → none} yields `unsub`,
/// {leader → different leader} yields `unsub` then `sub`, and no
/// change yields nothing.
pub fn diff_group_leader(
  old: &Option<BrokerLeader>,
  new: &Option<BrokerLeader>,
  group_topics: &[String],
) -> Vec<SyncFrame> {
  let sub_for = |leader: &BrokerLeader| {
    SyncFrame::Sub(MembershipDelta {
      update_type: MembershipKind::Broker,
      addr: leader.addr.clone(),
      port: leader.port,
      topics: group_topics.to_vec(),
    })
  };
  let unsub_for = |leader: &BrokerLeader| {
    SyncFrame::Unsub(EndpointRef {
      addr: leader.addr.clone(),
      port: leader.port,
    })
  };
  match (old, new) {
    (None, None) => Vec::new(),
    (None, Some(n)) => vec![sub_for(n)],
    (Some(o), None) => vec![unsub_for(o)],
    (Some(o), Some(n)) if o.name == n.name => Vec::new(),
    (Some(o), Some(n)) => vec![unsub_for(o), sub_for(n)],
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::coord::CoordStore;

  fn leader(name: &str, port: u16) -> BrokerLeader {
    BrokerLeader {
      addr: "10.0.0.4".to_string(),
      port,
      name: name.to_string(),
    }
  }

  #[test]
  fn exactly_one_contender_wins_the_election() {
    let store = CoordStore::new();
    let s1 = store.session();
    let s2 = store.session();
    let rec = |name: &str| LeaderRecord {
      addr: "10.0.0.1".to_string(),
      port: 5555,
      sub_port: 5556,
      name: name.to_string(),
    };
    let first = elect_primary(&s1, &rec("disc1")).unwrap();
    let second = elect_primary(&s2, &rec("disc2")).unwrap();
    assert!(first);
    assert!(!second);
    // the loser reads the winner's record
    let seen = read_leader(&s2).unwrap().unwrap();
    assert_eq!(seen.name, "disc1");

    // winner dies; the path is free for the next round
    s1.close();
    assert!(elect_primary(&s2, &rec("disc2")).unwrap());
  }

  #[test]
  fn group_leader_diff_covers_all_transitions() {
    let topics = vec!["t1".to_string()];
    assert!(diff_group_leader(&None, &None, &topics).is_empty());

    let up = diff_group_leader(&None, &Some(leader("b1", 6000)), &topics);
    assert!(matches!(&up[..], [SyncFrame::Sub(d)] if d.port == 6000 && d.topics == topics));

    let down = diff_group_leader(&Some(leader("b1", 6000)), &None, &topics);
    assert!(matches!(&down[..], [SyncFrame::Unsub(e)] if e.port == 6000));

    let swap = diff_group_leader(
      &Some(leader("b1", 6000)),
      &Some(leader("b2", 6001)),
      &topics,
    );
    assert!(
      matches!(&swap[..], [SyncFrame::Unsub(e), SyncFrame::Sub(d)] if e.port == 6000 && d.port == 6001)
    );

    let same = diff_group_leader(
      &Some(leader("b1", 6000)),
      &Some(leader("b1", 6000)),
      &topics,
    );
    assert!(same.is_empty());
  }
}
