//! The broker engine: fan-in from every publisher, fan-out to the
//! subscribers, forwarding frames verbatim.
//!
//! The broker is both subscriber and publisher. Its fan-in carries the
//! empty prefix, so every topic passes; each received frame is shipped
//! unchanged on the fan-out, with no re-encoding and no filtering,
//! which preserves topic prefixes and the producers'
//! timestamps for end-to-end latency measurement. Under
//! coordinator-backed discovery brokers contend for their group's
//! leadership; non-leaders park until the store says the seat is free.

use std::time::{Duration, Instant};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio::{Registry, Token};

use crate::clock::unix_micros;
use crate::config::{Config, DhtRoster, LookupStrategy};
use crate::coord::{CoordError, CoordSession, CoordStore};
use crate::discovery::coordinated::{
  read_leader, BrokerLeader, LeaderRecord, BROKERS_PARENT, DISCOVERY_PARENT,
};
use crate::messages::payload::{SYNC_TAG_SUB, SYNC_TAG_UNSUB};
use crate::messages::{
  decode_sync, DiscoveryRequest, DiscoveryResponse, IsReadyReq, LookupReq, MembershipKind,
  RegisterReq, RegistrantInfo, RequestBody, Requester, ResponseBody, Role, Status, SyncFrame,
};
use crate::poll_channel::{poll_channel, PollReceiver};
use crate::reactor::{min_timeout, EventHandler, IMMEDIATE};
use crate::transport::{tokens, PubSocket, RequestSocket, SubSocket};
use crate::{Error, Result};

const REQ_SLOT: usize = 0;
const FANIN_SLOT: usize = 1;
const FANOUT_SLOT: usize = 2;
const CTRL_SLOT: usize = 3;
const WATCH_SLOT: usize = 7;

/// Default backoff between readiness checks.
pub const READY_RETRY: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
  Initialize,
  Configure,
  /// Coordinator mode, not the group leader: parked until the store
  /// reports the seat free.
  AwaitLeadership,
  Register,
  IsReady,
  LookupPublishers,
  ReceiveAndDisseminate,
  Completed,
}

#[derive(Debug)]
pub struct BrokerOptions {
  pub name: String,
  pub addr: String,
  pub bind_addr: String,
  /// Fan-out port; 0 binds an ephemeral port.
  pub port: u16,
  /// Broker group, coordinator-backed brokered mode.
  pub group: Option<String>,
  pub idle_timeout: Duration,
  /// Backoff between readiness checks while the system assembles.
  pub ready_retry: Duration,
  pub discovery_endpoint: Option<String>,
  pub roster: Option<DhtRoster>,
}

impl BrokerOptions {
  pub fn named(name: &str) -> BrokerOptions {
    BrokerOptions {
      name: name.to_string(),
      addr: "127.0.0.1".to_string(),
      bind_addr: "127.0.0.1".to_string(),
      port: 0,
      group: None,
      idle_timeout: Duration::from_secs(30),
      ready_retry: READY_RETRY,
      discovery_endpoint: None,
      roster: None,
    }
  }
}

enum BrokerWatch {
  Discovery(Vec<String>),
  Brokers(Vec<String>),
}

pub struct BrokerEngine {
  state: BrokerState,
  cfg: Config,
  name: String,
  addr: String,
  group: Option<String>,
  carried_topics: Vec<String>,
  req: RequestSocket,
  fan_in: SubSocket,
  fan_out: PubSocket,
  ctrl_sub: Option<SubSocket>,
  idle: Duration,
  last_data: Instant,
  ready_retry: Duration,
  forwarded: u64,
  is_leader: bool,
  session: Option<CoordSession>,
  watch_rx: Option<PollReceiver<BrokerWatch>>,
  leader: Option<LeaderRecord>,
  running: bool,
}

impl BrokerEngine {
  pub fn new(
    cfg: Config,
    opts: BrokerOptions,
    registry: Registry,
    coord: Option<&CoordStore>,
  ) -> Result<BrokerEngine> {
    let mut state = BrokerState::Initialize;
    debug!("broker {}: state {state:?}", opts.name);
    state = BrokerState::Configure;
    debug!("broker {}: state {state:?}", opts.name);

    let fan_out = PubSocket::bind(
      registry.try_clone()?,
      tokens::base(FANOUT_SLOT),
      &format!("{}:{}", opts.bind_addr, opts.port),
    )?;
    let advertised_port = fan_out.local_addr()?.port();

    let mut fan_in = SubSocket::new(registry.try_clone()?, tokens::base(FANIN_SLOT));
    fan_in.subscribe(""); // all topics

    let mut req = RequestSocket::new(registry.try_clone()?, tokens::base(REQ_SLOT));

    let carried_topics = match &opts.group {
      Some(group) => cfg
        .topics_for_group(group)
        .ok_or_else(|| Error::config(format!("broker group {group} is not configured")))?
        .to_vec(),
      None => cfg.topics.clone(),
    };

    let mut is_leader = true;
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
        let group = opts
          .group
          .as_deref()
          .ok_or_else(|| Error::config("coordinator-backed brokers need a group"))?;
        let sess = store.session();
        is_leader = contend_for_group(&sess, group, &opts.addr, advertised_port, &opts.name)?;
        if is_leader {
          info!("broker {}: leading group {group}", opts.name);
        } else {
          info!("broker {}: group {group} already led, waiting", opts.name);
        }

        let mut ctrl = SubSocket::new(registry.try_clone()?, tokens::base(CTRL_SLOT));
        ctrl.subscribe(SYNC_TAG_SUB);
        ctrl.subscribe(SYNC_TAG_UNSUB);

        let (tx, rx) = poll_channel(&registry, tokens::base(WATCH_SLOT))?;
        let brokers_tx = tx.clone();
        sess.watch_children(BROKERS_PARENT, move |children| {
          brokers_tx.send(BrokerWatch::Brokers(children));
        })?;
        let discovery_tx = tx;
        sess.watch_children(DISCOVERY_PARENT, move |children| {
          discovery_tx.send(BrokerWatch::Discovery(children));
        })?;

        ctrl_sub = Some(ctrl);
        session = Some(sess);
        watch_rx = Some(rx);
      }
    }

    state = if is_leader {
      BrokerState::Register
    } else {
      BrokerState::AwaitLeadership
    };
    info!(
      "broker {}: fan-out bound at {}:{advertised_port}",
      opts.name, opts.addr
    );
    Ok(BrokerEngine {
      state,
      cfg,
      name: opts.name,
      addr: opts.addr,
      group: opts.group,
      carried_topics,
      req,
      fan_in,
      fan_out,
      ctrl_sub,
      idle: opts.idle_timeout,
      last_data: Instant::now(),
      ready_retry: opts.ready_retry,
      forwarded: 0,
      is_leader,
      session,
      watch_rx,
      leader: None,
      running: true,
    })
  }

  pub fn state(&self) -> BrokerState {
    self.state
  }

  pub fn is_leader(&self) -> bool {
    self.is_leader
  }

  pub fn forwarded(&self) -> u64 {
    self.forwarded
  }

  pub fn fan_out_endpoint(&self) -> Result<String> {
    Ok(format!(
      "{}:{}",
      self.addr,
      self.fan_out.local_addr()?.port()
    ))
  }

  pub fn start_timeout(&self) -> Option<Duration> {
    if self.state == BrokerState::AwaitLeadership {
      None
    } else {
      IMMEDIATE
    }
  }

  // ------------------------------------------------------------------

  fn invoke_operation(&mut self) -> Result<Option<Duration>> {
    match self.state {
      BrokerState::AwaitLeadership => Ok(self.pending_timeout()),
      BrokerState::Register => {
        if self.req.has_outstanding() {
          return Ok(self.pending_timeout());
        }
        debug!("broker {}: registering", self.name);
        let port = self.fan_out.local_addr()?.port();
        let req = DiscoveryRequest::new(
          unix_micros(),
          RequestBody::Register(RegisterReq {
            role: Role::Both,
            info: RegistrantInfo {
              id: self.name.clone(),
              addr: self.addr.clone(),
              port,
            },
            // empty: the broker subscribes to everything that exists
            topics: Vec::new(),
            group: self.group.clone(),
          }),
        );
        self.req.send(&req.encode()?)?;
        Ok(self.pending_timeout())
      }
      BrokerState::IsReady => {
        if self.req.has_outstanding() {
          return Ok(self.pending_timeout());
        }
        debug!("broker {}: checking readiness", self.name);
        let req =
          DiscoveryRequest::new(unix_micros(), RequestBody::IsReady(IsReadyReq::default()));
        self.req.send(&req.encode()?)?;
        Ok(self.pending_timeout())
      }
      BrokerState::LookupPublishers => {
        if self.req.has_outstanding() {
          return Ok(self.pending_timeout());
        }
        let lookup = if self.cfg.discovery == LookupStrategy::Coordinator {
          // the coordinator tracks membership, so ask only for this
          // group's feeds
          LookupReq::for_topics(self.carried_topics.clone(), Requester::Broker)
        } else {
          LookupReq::for_all_publishers(Requester::Broker)
        };
        debug!("broker {}: looking up publishers", self.name);
        let req = DiscoveryRequest::new(unix_micros(), RequestBody::Lookup(lookup));
        self.req.send(&req.encode()?)?;
        Ok(self.pending_timeout())
      }
      BrokerState::ReceiveAndDisseminate => {
        if self.last_data.elapsed() < self.idle {
          return Ok(self.receive_timeout());
        }
        info!(
          "broker {}: quiescent after forwarding {} frames",
          self.name, self.forwarded
        );
        self.state = BrokerState::Completed;
        Ok(IMMEDIATE)
      }
      BrokerState::Completed => {
        if let Some(session) = &self.session {
          session.close();
        }
        self.running = false;
        Ok(None)
      }
      BrokerState::Initialize | BrokerState::Configure => Err(Error::policy(
        "broker",
        "event loop entered before configuration finished",
      )),
    }
  }

  fn handle_reply(&mut self, payload: &[u8]) -> Result<Option<Duration>> {
    let resp = DiscoveryResponse::decode(payload)?;
    match resp.body {
      ResponseBody::Register(reg) => match reg.status {
        Status::Success => {
          debug!("broker {}: registration accepted", self.name);
          self.state = BrokerState::IsReady;
          Ok(IMMEDIATE)
        }
        Status::Failure => Err(Error::Naming(format!(
          "registration of broker {} rejected: {}",
          self.name, reg.reason
        ))),
      },
      ResponseBody::IsReady(ready) => {
        if ready.ready {
          self.state = BrokerState::LookupPublishers;
          Ok(IMMEDIATE)
        } else {
          debug!("broker {}: not ready yet, retrying", self.name);
          Ok(Some(self.ready_retry))
        }
      }
      ResponseBody::Lookup(lookup) => {
        info!(
          "broker {}: tapping {} publisher feed(s)",
          self.name,
          lookup.endpoints.len()
        );
        for endpoint in &lookup.endpoints {
          self.fan_in.connect(endpoint);
        }
        self.state = BrokerState::ReceiveAndDisseminate;
        self.last_data = Instant::now();
        Ok(self.receive_timeout())
      }
    }
  }

  fn handle_sync(&mut self, payload: &[u8]) -> Result<()> {
    match decode_sync(payload)? {
      SyncFrame::Sub(delta) => {
        // brokers only care about new publishers; broker deltas are
        // for the subscribers
        if delta.update_type == MembershipKind::Pub
          && delta.topics.iter().any(|t| self.carried_topics.contains(t))
        {
          let endpoint = delta.endpoint();
          info!("broker {}: tapping new publisher at {endpoint}", self.name);
          self.fan_in.connect(&endpoint);
        }
      }
      SyncFrame::Unsub(gone) => {
        let endpoint = gone.endpoint();
        if self.fan_in.is_connected_to(&endpoint) {
          info!("broker {}: dropping feed {endpoint}", self.name);
          self.fan_in.disconnect(&endpoint);
        }
      }
      SyncFrame::Snapshot(_) => {}
    }
    Ok(())
  }

  /// Returns true when the state machine must be re-entered right away.
  fn handle_watch(&mut self, watch: BrokerWatch) -> Result<bool> {
    match watch {
      BrokerWatch::Brokers(children) => {
        if self.is_leader {
          return Ok(false);
        }
        let Some(group) = self.group.clone() else {
          return Ok(false);
        };
        if children.contains(&group) {
          return Ok(false);
        }
        // the seat is free; race for it
        let port = self.fan_out.local_addr()?.port();
        let Some(session) = &self.session else {
          return Ok(false);
        };
        if contend_for_group(session, &group, &self.addr, port, &self.name)? {
          info!("broker {}: promoted to leader of group {group}", self.name);
          self.is_leader = true;
          if self.state == BrokerState::AwaitLeadership {
            self.state = BrokerState::Register;
            return Ok(true);
          }
        }
        Ok(false)
      }
      BrokerWatch::Discovery(children) => {
        if children.is_empty() {
          if let Some(old) = self.leader.take() {
            debug!("broker {}: discovery primary lost, pausing", self.name);
            self.req.disconnect(&old.request_endpoint());
            if let Some(ctrl) = &mut self.ctrl_sub {
              ctrl.disconnect(&old.sync_endpoint());
            }
          }
          return Ok(false);
        }
        let Some(session) = &self.session else {
          return Ok(false);
        };
        let Some(leader) = read_leader(session)? else {
          return Ok(false);
        };
        let endpoint = leader.request_endpoint();
        if self.leader.as_ref().map(|l| l.request_endpoint()) == Some(endpoint.clone()) {
          return Ok(false);
        }
        if let Some(old) = self.leader.take() {
          self.req.disconnect(&old.request_endpoint());
          if let Some(ctrl) = &mut self.ctrl_sub {
            ctrl.disconnect(&old.sync_endpoint());
          }
        }
        info!(
          "broker {}: targeting discovery primary {} at {endpoint}",
          self.name, leader.name
        );
        self.req.connect(&endpoint);
        if let Some(ctrl) = &mut self.ctrl_sub {
          ctrl.connect(&leader.sync_endpoint());
        }
        self.leader = Some(leader);
        // a new primary may know publishers the old one never told us
        // about; refresh the feed set
        if self.is_leader && self.state == BrokerState::ReceiveAndDisseminate {
          self.state = BrokerState::LookupPublishers;
          return Ok(true);
        }
        Ok(false)
      }
    }
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
      min_timeout(self.fan_in.retry_hint(), ctrl),
    )
  }

  fn state_timeout(&self) -> Option<Duration> {
    match self.state {
      BrokerState::ReceiveAndDisseminate => self.receive_timeout(),
      BrokerState::Completed => IMMEDIATE,
      _ => self.pending_timeout(),
    }
  }

  fn tend(&mut self) {
    self.req.tend();
    self.fan_in.tend();
    if let Some(ctrl) = &mut self.ctrl_sub {
      ctrl.tend();
    }
  }
}

impl EventHandler for BrokerEngine {
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
      FANIN_SLOT => {
        let payloads = self.fan_in.handle_event(token, readable, writable)?;
        if !payloads.is_empty() {
          self.last_data = Instant::now();
        }
        for payload in payloads {
          // the forwarding contract: bytes in, the same bytes out
          self.fan_out.publish(&payload);
          self.forwarded += 1;
        }
        Ok(self.state_timeout())
      }
      FANOUT_SLOT => {
        self.fan_out.handle_event(token, readable, writable)?;
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
        let queued: Vec<BrokerWatch> = self
          .watch_rx
          .as_ref()
          .map(|rx| rx.drain())
          .unwrap_or_default();
        let mut reenter = false;
        for watch in queued {
          reenter |= self.handle_watch(watch)?;
        }
        if reenter {
          Ok(IMMEDIATE)
        } else {
          Ok(self.state_timeout())
        }
      }
      other => Err(Error::policy(
        "broker",
        format!("event on unknown token slot {other}"),
      )),
    }
  }

  fn running(&self) -> bool {
    self.running
  }
}

fn contend_for_group(
  session: &CoordSession,
  group: &str,
  addr: &str,
  port: u16,
  name: &str,
) -> Result<bool> {
  let record = BrokerLeader {
    addr: addr.to_string(),
    port,
    name: name.to_string(),
  };
  match session.create_ephemeral(
    &format!("{BROKERS_PARENT}/{group}"),
    &serde_json::to_vec(&record)?,
  ) {
    Ok(()) => Ok(true),
    Err(CoordError::AlreadyExists(_)) => Ok(false),
    Err(e) => Err(e.into()),
  }
}
