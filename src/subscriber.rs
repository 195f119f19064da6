//! The subscriber engine: register, wait, look up, receive.
//!
//! After a successful lookup the subscriber connects its fan-in to
//! each returned endpoint and installs its topic prefixes as filters.
//! Under coordinator-backed discovery it also follows the primary's
//! sync channel: `sub` deltas grow the connection set without a new
//! lookup, `unsub` deltas shrink it. Quiescence (no data for the idle
//! window) ends the engine cleanly and flushes the captured latency
//! samples to the external sink.

use std::time::{Duration, Instant};

use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio::{Registry, Token};

use crate::clock::{latency_secs, unix_micros};
use crate::config::{Config, DhtRoster, Dissemination, LookupStrategy};
use crate::coord::{CoordSession, CoordStore};
use crate::discovery::coordinated::{read_leader, LeaderRecord, DISCOVERY_PARENT};
use crate::latency::{DeliverySample, LatencySink};
use crate::messages::payload::{SYNC_TAG_SUB, SYNC_TAG_UNSUB};
use crate::messages::{
  decode_publication, decode_sync, DiscoveryRequest, DiscoveryResponse, IsReadyReq, LookupReq,
  MembershipKind, RegisterReq, RegistrantInfo, RequestBody, Requester, ResponseBody, Role,
  Status, SyncFrame,
};
use crate::poll_channel::{poll_channel, PollReceiver};
use crate::reactor::{min_timeout, EventHandler, IMMEDIATE};
use crate::transport::{tokens, RequestSocket, SubSocket};
use crate::{Error, Result};

const REQ_SLOT: usize = 0;
const DATA_SLOT: usize = 1;
const CTRL_SLOT: usize = 2;
const WATCH_SLOT: usize = 7;

/// Default backoff between readiness checks.
pub const READY_RETRY: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
  Initialize,
  Configure,
  Register,
  IsReady,
  LookupPublishers,
  ReceiveData,
  Completed,
}

#[derive(Debug)]
pub struct SubscriberOptions {
  pub name: String,
  pub topics: Vec<String>,
  /// Quiescence window: terminate after this long without data.
  pub idle_timeout: Duration,
  /// Backoff between readiness checks while the system assembles.
  pub ready_retry: Duration,
  /// Experiment dissemination rate, recorded with each sample.
  pub frequency: f64,
  pub discovery_endpoint: Option<String>,
  pub roster: Option<DhtRoster>,
}

impl SubscriberOptions {
  pub fn named(name: &str, topics: &[&str]) -> SubscriberOptions {
    SubscriberOptions {
      name: name.to_string(),
      topics: topics.iter().map(|t| t.to_string()).collect(),
      idle_timeout: Duration::from_secs(30),
      ready_retry: READY_RETRY,
      frequency: 1.0,
      discovery_endpoint: None,
      roster: None,
    }
  }
}

enum SubWatch {
  Discovery(Vec<String>),
}

pub struct SubscriberEngine {
  state: SubscriberState,
  cfg: Config,
  name: String,
  topics: Vec<String>,
  req: RequestSocket,
  data_sub: SubSocket,
  ctrl_sub: Option<SubSocket>,
  idle: Duration,
  last_data: Instant,
  ready_retry: Duration,
  frequency: f64,
  sink: Box<dyn LatencySink>,
  delivered: usize,
  session: Option<CoordSession>,
  watch_rx: Option<PollReceiver<SubWatch>>,
  leader: Option<LeaderRecord>,
  running: bool,
}

impl SubscriberEngine {
  pub fn new(
    cfg: Config,
    opts: SubscriberOptions,
    registry: Registry,
    coord: Option<&CoordStore>,
    sink: Box<dyn LatencySink>,
  ) -> Result<SubscriberEngine> {
    let mut state = SubscriberState::Initialize;
    debug!("subscriber {}: state {state:?}", opts.name);
    state = SubscriberState::Configure;
    debug!("subscriber {}: state {state:?}", opts.name);

    let mut req = RequestSocket::new(registry.try_clone()?, tokens::base(REQ_SLOT));
    let mut data_sub = SubSocket::new(registry.try_clone()?, tokens::base(DATA_SLOT));
    for topic in &opts.topics {
      data_sub.subscribe(topic);
    }

    let mut ctrl_sub = None;
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
        let mut ctrl = SubSocket::new(registry.try_clone()?, tokens::base(CTRL_SLOT));
        ctrl.subscribe(SYNC_TAG_SUB);
        ctrl.subscribe(SYNC_TAG_UNSUB);

        let (tx, rx) = poll_channel(&registry, tokens::base(WATCH_SLOT))?;
        sess.watch_children(DISCOVERY_PARENT, move |children| {
          tx.send(SubWatch::Discovery(children));
        })?;

        ctrl_sub = Some(ctrl);
        session = Some(sess);
        watch_rx = Some(rx);
      }
    }

    state = SubscriberState::Register;
    Ok(SubscriberEngine {
      state,
      cfg,
      name: opts.name,
      topics: opts.topics,
      req,
      data_sub,
      ctrl_sub,
      idle: opts.idle_timeout,
      last_data: Instant::now(),
      ready_retry: opts.ready_retry,
      frequency: opts.frequency,
      sink,
      delivered: 0,
      session,
      watch_rx,
      leader: None,
      running: true,
    })
  }

  pub fn state(&self) -> SubscriberState {
    self.state
  }

  pub fn delivered(&self) -> usize {
    self.delivered
  }

  pub fn connected_endpoints(&self) -> Vec<String> {
    self.data_sub.connected_endpoints()
  }

  pub fn start_timeout(&self) -> Option<Duration> {
    IMMEDIATE
  }

  // ------------------------------------------------------------------

  fn invoke_operation(&mut self) -> Result<Option<Duration>> {
    match self.state {
      SubscriberState::Register => {
        if self.req.has_outstanding() {
          return Ok(self.pending_timeout());
        }
        debug!("subscriber {}: registering", self.name);
        let req = DiscoveryRequest::new(
          unix_micros(),
          RequestBody::Register(RegisterReq {
            role: Role::Subscriber,
            info: RegistrantInfo {
              id: self.name.clone(),
              addr: String::new(),
              port: 0,
            },
            topics: self.topics.clone(),
            group: None,
          }),
        );
        self.req.send(&req.encode()?)?;
        Ok(self.pending_timeout())
      }
      SubscriberState::IsReady => {
        if self.req.has_outstanding() {
          return Ok(self.pending_timeout());
        }
        debug!("subscriber {}: checking readiness", self.name);
        let req =
          DiscoveryRequest::new(unix_micros(), RequestBody::IsReady(IsReadyReq::default()));
        self.req.send(&req.encode()?)?;
        Ok(self.pending_timeout())
      }
      SubscriberState::LookupPublishers => {
        if self.req.has_outstanding() {
          return Ok(self.pending_timeout());
        }
        debug!("subscriber {}: looking up peers", self.name);
        let req = DiscoveryRequest::new(
          unix_micros(),
          RequestBody::Lookup(LookupReq::for_topics(
            self.topics.clone(),
            Requester::Subscriber,
          )),
        );
        self.req.send(&req.encode()?)?;
        Ok(self.pending_timeout())
      }
      SubscriberState::ReceiveData => {
        // woken by reconnect bookkeeping before the window expired?
        if self.last_data.elapsed() < self.idle {
          return Ok(self.receive_timeout());
        }
        // the idle window expired without data: publishers are done
        info!(
          "subscriber {}: quiescent after {} deliveries",
          self.name, self.delivered
        );
        self.state = SubscriberState::Completed;
        Ok(IMMEDIATE)
      }
      SubscriberState::Completed => {
        if let Err(e) = self.sink.flush() {
          warn!("subscriber {}: latency sink unreachable: {e}", self.name);
        }
        if let Some(session) = &self.session {
          session.close();
        }
        self.running = false;
        Ok(None)
      }
      SubscriberState::Initialize | SubscriberState::Configure => Err(Error::policy(
        "subscriber",
        "event loop entered before configuration finished",
      )),
    }
  }

  fn handle_reply(&mut self, payload: &[u8]) -> Result<Option<Duration>> {
    let resp = DiscoveryResponse::decode(payload)?;
    match resp.body {
      ResponseBody::Register(reg) => match reg.status {
        Status::Success => {
          debug!("subscriber {}: registration accepted", self.name);
          self.state = SubscriberState::IsReady;
          Ok(IMMEDIATE)
        }
        Status::Failure => Err(Error::Naming(format!(
          "registration of subscriber {} rejected: {}",
          self.name, reg.reason
        ))),
      },
      ResponseBody::IsReady(ready) => {
        if ready.ready {
          self.state = SubscriberState::LookupPublishers;
          Ok(IMMEDIATE)
        } else {
          debug!("subscriber {}: not ready yet, retrying", self.name);
          Ok(Some(self.ready_retry))
        }
      }
      ResponseBody::Lookup(lookup) => {
        info!(
          "subscriber {}: connecting to {} endpoint(s)",
          self.name,
          lookup.endpoints.len()
        );
        for endpoint in &lookup.endpoints {
          self.data_sub.connect(endpoint);
        }
        self.state = SubscriberState::ReceiveData;
        self.last_data = Instant::now();
        Ok(self.receive_timeout())
      }
    }
  }

  fn handle_delivery(&mut self, payload: &[u8]) -> Result<()> {
    self.last_data = Instant::now();
    let (topic, records) = decode_publication(payload)?;
    // replayed history rides along with every transmission; only the
    // newest record is a fresh delivery worth a latency sample
    let Some(newest) = records.last() else {
      return Ok(());
    };
    trace!(
      "subscriber {}: {topic} <- {} ({} record window)",
      self.name,
      newest.data,
      records.len()
    );
    self.delivered += 1;
    self.sink.record_delivery(&DeliverySample {
      latency_secs: latency_secs(newest.sent_timestamp),
      frequency: self.frequency,
      topic_count: self.topics.len(),
      pub_count: self.cfg.expected_publishers,
      sub_count: self.cfg.expected_subscribers,
      dissemination: self.cfg.dissemination,
      pub_id: newest.pub_id.clone(),
      sub_id: self.name.clone(),
      experiment: newest.experiment.clone(),
      captured_at: Utc::now(),
    });
    Ok(())
  }

  fn handle_sync(&mut self, payload: &[u8]) -> Result<()> {
    match decode_sync(payload)? {
      SyncFrame::Sub(delta) => {
        let endpoint = delta.endpoint();
        match delta.update_type {
          MembershipKind::Broker if self.cfg.dissemination == Dissemination::Brokered => {
            info!("subscriber {}: new broker at {endpoint}", self.name);
            self.data_sub.connect(&endpoint);
          }
          MembershipKind::Pub if self.cfg.dissemination == Dissemination::Direct => {
            if delta.topics.iter().any(|t| self.topics.contains(t)) {
              info!("subscriber {}: new publisher at {endpoint}", self.name);
              self.data_sub.connect(&endpoint);
            }
          }
          _ => {}
        }
      }
      SyncFrame::Unsub(gone) => {
        let endpoint = gone.endpoint();
        if self.data_sub.is_connected_to(&endpoint) {
          info!("subscriber {}: disconnecting from {endpoint}", self.name);
          self.data_sub.disconnect(&endpoint);
        }
      }
      SyncFrame::Snapshot(_) => {}
    }
    Ok(())
  }

  fn handle_watch(&mut self, watch: SubWatch) -> Result<()> {
    let SubWatch::Discovery(children) = watch;
    if children.is_empty() {
      if let Some(old) = self.leader.take() {
        debug!("subscriber {}: discovery primary lost", self.name);
        self.req.disconnect(&old.request_endpoint());
        if let Some(ctrl) = &mut self.ctrl_sub {
          ctrl.disconnect(&old.sync_endpoint());
        }
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
          if let Some(ctrl) = &mut self.ctrl_sub {
            ctrl.disconnect(&old.sync_endpoint());
          }
        }
        info!(
          "subscriber {}: targeting discovery primary {} at {endpoint}",
          self.name, leader.name
        );
        self.req.connect(&endpoint);
        if let Some(ctrl) = &mut self.ctrl_sub {
          ctrl.connect(&leader.sync_endpoint());
        }
        self.leader = Some(leader);
      }
    }
    Ok(())
  }

  fn pending_timeout(&self) -> Option<Duration> {
    min_timeout(None, self.retry_hints())
  }

  fn receive_timeout(&self) -> Option<Duration> {
    let left = self.idle.saturating_sub(self.last_data.elapsed());
    min_timeout(Some(left), self.retry_hints())
  }

  fn retry_hints(&self) -> Option<Duration> {
    let ctrl = self.ctrl_sub.as_ref().and_then(|c| c.retry_hint());
    min_timeout(
      self.req.retry_hint(),
      min_timeout(self.data_sub.retry_hint(), ctrl),
    )
  }

  fn state_timeout(&self) -> Option<Duration> {
    match self.state {
      SubscriberState::ReceiveData => self.receive_timeout(),
      SubscriberState::Completed => IMMEDIATE,
      _ => self.pending_timeout(),
    }
  }

  fn tend(&mut self) {
    self.req.tend();
    self.data_sub.tend();
    if let Some(ctrl) = &mut self.ctrl_sub {
      ctrl.tend();
    }
  }
}

impl EventHandler for SubscriberEngine {
  fn on_timeout(&mut self) -> Result<Option<Duration>> {
    self.tend();
    self.invoke_operation()
  }

  fn on_event(&mut self, token: Token, readable: bool, writable: bool) -> Result<Option<Duration>> {
    self.tend();
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
        let payloads = self.data_sub.handle_event(token, readable, writable)?;
        for payload in payloads {
          self.handle_delivery(&payload)?;
        }
        Ok(self.state_timeout())
      }
      CTRL_SLOT => {
        let payloads = match &mut self.ctrl_sub {
          Some(ctrl) => ctrl.handle_event(token, readable, writable)?,
          None => Vec::new(),
        };
        for payload in payloads {
          self.handle_sync(&payload)?;
        }
        Ok(self.state_timeout())
      }
      WATCH_SLOT => {
        let queued: Vec<SubWatch> = self
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
        "subscriber",
        format!("event on unknown token slot {other}"),
      )),
    }
  }

  fn running(&self) -> bool {
    self.running
  }
}
