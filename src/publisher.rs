//! The publisher engine: register, wait for readiness, disseminate.
//!
//! Each owned topic carries a bounded history FIFO whose depth is drawn
//! once at startup from `[1, 5]`; every transmission replays the whole
//! window so late subscribers catch up on recent values from their
//! first delivery. Under coordinator-backed discovery the publisher
//! additionally contends for per-topic ownership strength: the store
//! assigns a sequence number per topic, and only the publisher holding
//! the lowest live number disseminates that topic.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio::{Registry, Token};
use rand::Rng;

use crate::clock::{latency_secs, unix_micros};
use crate::config::{Config, DhtRoster, LookupStrategy};
use crate::coord::{min_sequence, CoordSession, CoordStore};
use crate::discovery::coordinated::{
  read_leader, LeaderRecord, PresenceRecord, DISCOVERY_PARENT, PUBS_PARENT, TOPIC_PARENT,
};
use crate::latency::{ControlSample, LatencySink};
use crate::messages::{
  encode_publication, DiscoveryRequest, DiscoveryResponse, IsReadyReq, RegisterReq,
  RegistrantInfo, RequestBody, ResponseBody, Role, SampleRecord, Status,
};
use crate::poll_channel::{poll_channel, PollReceiver, PollSender};
use crate::reactor::{min_timeout, EventHandler, IMMEDIATE};
use crate::transport::{tokens, PubSocket, RequestSocket};
use crate::{Error, Result};

const REQ_SLOT: usize = 0;
const DATA_SLOT: usize = 1;
const WATCH_SLOT: usize = 7;

/// Default backoff after a readiness check came back false. Returned
/// as the next poll timeout, never slept in-loop.
pub const READY_RETRY: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
  Initialize,
  Configure,
  Register,
  IsReady,
  Disseminate,
  Completed,
}

/// Supplies topic values. Value generation proper is a collaborator
/// outside the middleware; engines only need something to send.
pub trait ValueSource: Send {
  fn next_value(&mut self, topic: &str) -> String;
}

/// Default source: a per-engine monotonically increasing counter.
#[derive(Default)]
pub struct CounterValues {
  counter: u64,
}

impl ValueSource for CounterValues {
  fn next_value(&mut self, topic: &str) -> String {
    self.counter += 1;
    format!("{topic}#{}", self.counter)
  }
}

/// Bounded per-topic FIFO of the most recent records.
#[derive(Debug)]
pub struct HistoryBuffer {
  depth: usize,
  queue: VecDeque<SampleRecord>,
}

impl HistoryBuffer {
  pub fn new(depth: usize) -> HistoryBuffer {
    HistoryBuffer {
      depth,
      queue: VecDeque::new(),
    }
  }

  pub fn depth(&self) -> usize {
    self.depth
  }

  /// Trim to depth-1, then append, so the buffer never exceeds its
  /// configured depth.
  pub fn push(&mut self, record: SampleRecord) {
    while self.queue.len() > self.depth.saturating_sub(1) {
      self.queue.pop_front();
    }
    self.queue.push_back(record);
  }

  pub fn len(&self) -> usize {
    self.queue.len()
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  /// Oldest-first window, the wire order.
  pub fn window(&self) -> Vec<SampleRecord> {
    self.queue.iter().cloned().collect()
  }
}

#[derive(Debug)]
pub struct PublisherOptions {
  pub name: String,
  pub addr: String,
  pub bind_addr: String,
  /// Fan-out port; 0 binds an ephemeral port.
  pub port: u16,
  pub topics: Vec<String>,
  pub iters: u32,
  /// Dissemination sweeps per second.
  pub frequency: f64,
  /// Backoff between readiness checks while the system assembles.
  pub ready_retry: Duration,
  pub experiment: String,
  /// Discovery endpoint, centralized mode.
  pub discovery_endpoint: Option<String>,
  /// Ring roster, DHT mode; an entry node is picked at random.
  pub roster: Option<DhtRoster>,
}

impl PublisherOptions {
  pub fn named(name: &str, topics: &[&str]) -> PublisherOptions {
    PublisherOptions {
      name: name.to_string(),
      addr: "127.0.0.1".to_string(),
      bind_addr: "127.0.0.1".to_string(),
      port: 0,
      topics: topics.iter().map(|t| t.to_string()).collect(),
      iters: 10,
      frequency: 1.0,
      ready_retry: READY_RETRY,
      experiment: "exp".to_string(),
      discovery_endpoint: None,
      roster: None,
    }
  }
}

enum PubWatch {
  Discovery(Vec<String>),
  Topic { topic: String, children: Vec<String> },
}

pub struct PublisherEngine {
  state: PublisherState,
  cfg: Config,
  name: String,
  addr: String,
  topics: Vec<String>,
  req: RequestSocket,
  data_pub: PubSocket,
  history: BTreeMap<String, HistoryBuffer>,
  own_seq: BTreeMap<String, u64>,
  is_leader: BTreeMap<String, bool>,
  iters: u32,
  iter_done: u32,
  period: Duration,
  ready_retry: Duration,
  frequency: f64,
  next_sweep_at: Option<Instant>,
  experiment: String,
  values: Box<dyn ValueSource>,
  sink: Box<dyn LatencySink>,
  session: Option<CoordSession>,
  watch_rx: Option<PollReceiver<PubWatch>>,
  leader: Option<LeaderRecord>,
  isready_started: u64,
  running: bool,
}

impl PublisherEngine {
  pub fn new(
    cfg: Config,
    opts: PublisherOptions,
    registry: Registry,
    coord: Option<&CoordStore>,
    values: Box<dyn ValueSource>,
    sink: Box<dyn LatencySink>,
  ) -> Result<PublisherEngine> {
    let mut state = PublisherState::Initialize;
    debug!("publisher {}: state {state:?}", opts.name);
    state = PublisherState::Configure;
    debug!("publisher {}: state {state:?}", opts.name);

    let data_pub = PubSocket::bind(
      registry.try_clone()?,
      tokens::base(DATA_SLOT),
      &format!("{}:{}", opts.bind_addr, opts.port),
    )?;
    let advertised_port = data_pub.local_addr()?.port();

    let mut req = RequestSocket::new(registry.try_clone()?, tokens::base(REQ_SLOT));

    let mut rng = rand::rng();
    let mut history = BTreeMap::new();
    let mut is_leader = BTreeMap::new();
    for topic in &opts.topics {
      let depth = rng.random_range(1..=5);
      history.insert(topic.clone(), HistoryBuffer::new(depth));
      // without ownership strength every publisher disseminates
      is_leader.insert(topic.clone(), cfg.discovery != LookupStrategy::Coordinator);
    }
    debug!(
      "publisher {}: history depths {:?}",
      opts.name,
      history
        .iter()
        .map(|(t, h)| (t.clone(), h.depth()))
        .collect::<BTreeMap<_, _>>()
    );

    let mut own_seq = BTreeMap::new();
    let mut session = None;
    let mut watch_rx = None;
    match cfg.discovery {
      LookupStrategy::Centralized => {
        let endpoint = opts
          .discovery_endpoint
          .as_deref()
          .ok_or_else(|| Error::config("centralized mode needs a discovery endpoint"))?;
        req.connect(endpoint);
      }
      LookupStrategy::Dht => {
        let roster = opts
          .roster
          .as_ref()
          .ok_or_else(|| Error::config("DHT mode needs a ring roster"))?;
        req.connect(&roster.random_entry().endpoint());
      }
      LookupStrategy::Coordinator => {
        let store =
          coord.ok_or_else(|| Error::config("coordinator mode needs a coordination store"))?;
        let sess = store.session();
        let presence = PresenceRecord {
          addr: opts.addr.clone(),
          port: advertised_port,
          name: opts.name.clone(),
        };
        sess.create_ephemeral(
          &format!("{PUBS_PARENT}/{}", opts.name),
          &serde_json::to_vec(&presence)?,
        )?;

        let (tx, rx) = poll_channel(&registry, tokens::base(WATCH_SLOT))?;
        for topic in &opts.topics {
          let parent = format!("{TOPIC_PARENT}/{topic}");
          sess.ensure_path(&parent)?;
          let child = sess.create_sequential_ephemeral(
            &parent,
            &format!("{}-", opts.name),
            topic.as_bytes(),
          )?;
          let seq = crate::coord::sequence_of(&child)
            .ok_or_else(|| Error::protocol(format!("unparsable sequential name {child}")))?;
          info!(
            "publisher {}: ownership strength for {topic} is {seq}",
            opts.name
          );
          own_seq.insert(topic.clone(), seq);
          install_topic_watch(&sess, &parent, topic, &tx)?;
        }

        let watch_tx = tx.clone();
        sess.watch_children(DISCOVERY_PARENT, move |children| {
          watch_tx.send(PubWatch::Discovery(children));
        })?;

        session = Some(sess);
        watch_rx = Some(rx);
      }
    }

    state = PublisherState::Register;
    info!(
      "publisher {}: fan-out bound at {}:{advertised_port}",
      opts.name, opts.addr
    );
    Ok(PublisherEngine {
      state,
      cfg,
      name: opts.name,
      addr: opts.addr,
      topics: opts.topics,
      req,
      data_pub,
      history,
      own_seq,
      is_leader,
      iters: opts.iters,
      iter_done: 0,
      period: Duration::from_secs_f64(1.0 / opts.frequency),
      ready_retry: opts.ready_retry,
      frequency: opts.frequency,
      next_sweep_at: None,
      experiment: opts.experiment,
      values,
      sink,
      session,
      watch_rx,
      leader: None,
      isready_started: 0,
      running: true,
    })
  }

  pub fn state(&self) -> PublisherState {
    self.state
  }

  pub fn data_endpoint(&self) -> Result<String> {
    Ok(format!(
      "{}:{}",
      self.addr,
      self.data_pub.local_addr()?.port()
    ))
  }

  pub fn is_leader_for(&self, topic: &str) -> bool {
    self.is_leader.get(topic).copied().unwrap_or(false)
  }

  pub fn ownership_strength(&self, topic: &str) -> Option<u64> {
    self.own_seq.get(topic).copied()
  }

  pub fn history_depth(&self, topic: &str) -> Option<usize> {
    self.history.get(topic).map(|h| h.depth())
  }

  pub fn start_timeout(&self) -> Option<Duration> {
    IMMEDIATE
  }

  // ------------------------------------------------------------------

  fn invoke_operation(&mut self) -> Result<Option<Duration>> {
    match self.state {
      PublisherState::Register => {
        if self.req.has_outstanding() {
          return Ok(self.pending_timeout());
        }
        debug!("publisher {}: registering", self.name);
        let port = self.data_pub.local_addr()?.port();
        let req = DiscoveryRequest::new(
          unix_micros(),
          RequestBody::Register(RegisterReq {
            role: Role::Publisher,
            info: RegistrantInfo {
              id: self.name.clone(),
              addr: self.addr.clone(),
              port,
            },
            topics: self.topics.clone(),
            group: None,
          }),
        );
        self.req.send(&req.encode()?)?;
        Ok(self.pending_timeout())
      }
      PublisherState::IsReady => {
        if self.req.has_outstanding() {
          return Ok(self.pending_timeout());
        }
        debug!("publisher {}: checking readiness", self.name);
        let req = DiscoveryRequest::new(
          self.isready_started,
          RequestBody::IsReady(IsReadyReq::default()),
        );
        self.req.send(&req.encode()?)?;
        Ok(self.pending_timeout())
      }
      PublisherState::Disseminate => {
        if let Some(at) = self.next_sweep_at {
          let now = Instant::now();
          if now < at {
            // woken early (reconnect bookkeeping); the sweep is not due
            return Ok(min_timeout(Some(at - now), self.req.retry_hint()));
          }
        }
        if self.iter_done >= self.iters {
          debug!("publisher {}: dissemination complete", self.name);
          self.state = PublisherState::Completed;
          return Ok(IMMEDIATE);
        }
        self.sweep()?;
        self.iter_done += 1;
        self.next_sweep_at = Some(Instant::now() + self.period);
        Ok(Some(self.period))
      }
      PublisherState::Completed => {
        if let Err(e) = self.sink.flush() {
          warn!("publisher {}: latency sink unreachable: {e}", self.name);
        }
        if let Some(session) = &self.session {
          session.close();
        }
        info!("publisher {}: done after {} sweeps", self.name, self.iter_done);
        self.running = false;
        Ok(None)
      }
      PublisherState::Initialize | PublisherState::Configure => Err(Error::policy(
        "publisher",
        "event loop entered before configuration finished",
      )),
    }
  }

  fn sweep(&mut self) -> Result<()> {
    let mut sent = Vec::new();
    for topic in self.topics.clone() {
      if !self.is_leader_for(&topic) {
        continue;
      }
      let value = self.values.next_value(&topic);
      let record = SampleRecord {
        topic: topic.clone(),
        data: value,
        pub_id: self.name.clone(),
        sent_timestamp: unix_micros(),
        experiment: self.experiment.clone(),
      };
      let buffer = self
        .history
        .get_mut(&topic)
        .ok_or_else(|| Error::policy("publisher", format!("no history for topic {topic}")))?;
      buffer.push(record);
      let payload = encode_publication(&topic, &buffer.window())?;
      self.data_pub.publish(&payload);
      sent.push(topic);
    }
    debug!("publisher {}: swept topics {sent:?}", self.name);
    Ok(())
  }

  fn handle_reply(&mut self, payload: &[u8]) -> Result<Option<Duration>> {
    let resp = DiscoveryResponse::decode(payload)?;
    match resp.body {
      ResponseBody::Register(reg) => match reg.status {
        Status::Success => {
          debug!("publisher {}: registration accepted", self.name);
          self.record_control("REGISTER", resp.timestamp_sent);
          self.state = PublisherState::IsReady;
          self.isready_started = unix_micros();
          Ok(IMMEDIATE)
        }
        Status::Failure => Err(Error::Naming(format!(
          "registration of publisher {} rejected: {}",
          self.name, reg.reason
        ))),
      },
      ResponseBody::IsReady(ready) => {
        if ready.ready {
          self.record_control("ISREADY", resp.timestamp_sent);
          info!("publisher {}: system ready, disseminating", self.name);
          self.state = PublisherState::Disseminate;
          Ok(IMMEDIATE)
        } else {
          debug!("publisher {}: not ready yet, retrying", self.name);
          Ok(Some(self.ready_retry))
        }
      }
      ResponseBody::Lookup(_) => Err(Error::protocol(
        "publisher received a lookup response it never asked for",
      )),
    }
  }

  fn record_control(&mut self, operation: &str, timestamp_sent: u64) {
    self.sink.record_control(&ControlSample {
      operation: operation.to_string(),
      latency_secs: latency_secs(timestamp_sent),
      lookup: self.cfg.discovery,
      pub_count: self.cfg.expected_publishers,
      sub_count: self.cfg.expected_subscribers,
      entity: self.name.clone(),
      captured_at: Utc::now(),
    });
  }

  fn handle_watch(&mut self, watch: PubWatch) -> Result<()> {
    match watch {
      PubWatch::Topic { topic, children } => {
        if children.is_empty() {
          return Ok(());
        }
        let Some(own) = self.own_seq.get(&topic).copied() else {
          return Ok(());
        };
        let leads = min_sequence(&children) == Some(own);
        let was = self.is_leader_for(&topic);
        if leads != was {
          info!(
            "publisher {}: leadership for {topic} is now {leads}",
            self.name
          );
        }
        self.is_leader.insert(topic, leads);
      }
      PubWatch::Discovery(children) => {
        if children.is_empty() {
          if let Some(old) = self.leader.take() {
            debug!("publisher {}: discovery primary lost", self.name);
            self.req.disconnect(&old.request_endpoint());
          }
          return Ok(());
        }
        let Some(session) = &self.session else {
          return Ok(());
        };
        if let Some(leader) = read_leader(session)? {
          let endpoint = leader.request_endpoint();
          if self.leader.as_ref().map(|l| l.request_endpoint()) != Some(endpoint.clone()) {
            if let Some(old) = self.leader.take() {
              self.req.disconnect(&old.request_endpoint());
            }
            info!(
              "publisher {}: targeting discovery primary {} at {endpoint}",
              self.name, leader.name
            );
            self.req.connect(&endpoint);
            self.leader = Some(leader);
          }
        }
      }
    }
    Ok(())
  }

  /// Timeout while a reply is pending: park, clamped by reconnects.
  fn pending_timeout(&self) -> Option<Duration> {
    min_timeout(None, self.req.retry_hint())
  }

  fn state_timeout(&self) -> Option<Duration> {
    match self.state {
      PublisherState::Disseminate => {
        let left = self
          .next_sweep_at
          .map(|at| at.saturating_duration_since(Instant::now()));
        min_timeout(left.or(IMMEDIATE), self.req.retry_hint())
      }
      PublisherState::Completed => IMMEDIATE,
      _ => self.pending_timeout(),
    }
  }
}

impl EventHandler for PublisherEngine {
  fn on_timeout(&mut self) -> Result<Option<Duration>> {
    self.req.tend();
    self.invoke_operation()
  }

  fn on_event(&mut self, token: Token, readable: bool, writable: bool) -> Result<Option<Duration>> {
    self.req.tend();
    match tokens::slot(token) {
      REQ_SLOT => {
        let replies = self.req.handle_event(readable, writable)?;
        let mut timeout = self.state_timeout();
        for payload in replies {
          timeout = self.handle_reply(&payload)?;
        }
        Ok(timeout)
      }
      DATA_SLOT => {
        self.data_pub.handle_event(token, readable, writable)?;
        Ok(self.state_timeout())
      }
      WATCH_SLOT => {
        let queued: Vec<PubWatch> = self
          .watch_rx
          .as_ref()
          .map(|rx| rx.drain())
          .unwrap_or_default();
        for watch in queued {
          self.handle_watch(watch)?;
        }
        Ok(self.state_timeout())
      }
      other => Err(Error::policy(
        "publisher",
        format!("event on unknown token slot {other}"),
      )),
    }
  }

  fn running(&self) -> bool {
    self.running
  }
}

fn install_topic_watch(
  session: &CoordSession,
  parent: &str,
  topic: &str,
  tx: &PollSender<PubWatch>,
) -> Result<()> {
  let tx = tx.clone();
  let topic = topic.to_string();
  session.watch_children(parent, move |children| {
    tx.send(PubWatch::Topic {
      topic: topic.clone(),
      children,
    });
  })?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(data: &str) -> SampleRecord {
    SampleRecord {
      topic: "t".to_string(),
      data: data.to_string(),
      pub_id: "pub-a".to_string(),
      sent_timestamp: 0,
      experiment: "exp".to_string(),
    }
  }

  #[test]
  fn history_never_exceeds_its_depth() {
    let mut buffer = HistoryBuffer::new(3);
    for i in 0..10 {
      buffer.push(record(&i.to_string()));
      assert!(buffer.len() <= 3);
    }
  }

  #[test]
  fn fifth_window_holds_the_three_most_recent_values() {
    let mut buffer = HistoryBuffer::new(3);
    for i in 1..=5 {
      buffer.push(record(&i.to_string()));
    }
    let window: Vec<String> = buffer.window().into_iter().map(|r| r.data).collect();
    assert_eq!(window, ["3", "4", "5"]);
  }

  #[test]
  fn depth_one_keeps_only_the_newest() {
    let mut buffer = HistoryBuffer::new(1);
    buffer.push(record("a"));
    buffer.push(record("b"));
    let window = buffer.window();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].data, "b");
  }
}
