//! The Discovery plane: registration, readiness and lookup, in one of
//! three interchangeable lookup modes.
//!
//! A Discovery node is a server behind a [`RouterSocket`]. Register /
//! isready / lookup requests arrive with an opaque return path; the
//! node answers directly (centralized), hops the request around a
//! Chord-style ring ([`dht`]), or answers from replicated state kept
//! consistent by an elected primary pushing deltas and snapshots on a
//! sync channel ([`coordinated`]).

pub mod coordinated;
pub mod dht;
pub mod registry;

pub use registry::Directory;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio::{Registry, Token};

use crate::config::{Config, DhtRoster, Dissemination, LookupStrategy};
use crate::coord::{CoordSession, CoordStore};
use crate::messages::{
  decode_sync, encode_sync, DiscoveryRequest, DiscoveryResponse, EndpointRef, IsReadyReq,
  IsReadyResp, LookupReq, LookupResp, MembershipDelta, MembershipKind, RegisterReq, RegisterResp,
  RequestBody, Requester, ResponseBody, Role, Status, SyncFrame,
};
use crate::poll_channel::{poll_channel, PollReceiver, PollSender};
use crate::reactor::{min_timeout, EventHandler};
use crate::transport::{tokens, PubSocket, RoutedMessage, RouterSocket, SubSocket};
use crate::{Error, Result};

use coordinated::{
  diff_group_leader, elect_primary, read_broker_leader, read_leader, BrokerLeader, LeaderRecord,
  BROKERS_PARENT, DISCOVERY_PARENT, PUBS_PARENT,
};
use dht::{registrant_hash, FingerTable};

const ROUTER_SLOT: usize = 0;
const DEALER_SLOT: usize = 1;
const SYNC_PUB_SLOT: usize = 2;
const SYNC_SUB_SLOT: usize = 3;
const WATCH_SLOT: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
  Initialize,
  Configure,
  WaitingForRegistrations,
  SystemReady,
  Completed,
}

#[derive(Debug)]
pub struct DiscoveryOptions {
  pub name: String,
  /// Address advertised to peers.
  pub addr: String,
  /// Address to bind listeners on.
  pub bind_addr: String,
  /// Router port; 0 binds an ephemeral port.
  pub port: u16,
  /// Sync fan-out port, coordinator mode; 0 binds an ephemeral port.
  pub sub_port: u16,
  /// Pre-bound router listener, for deployments that must know the
  /// port before construction (e.g. assembling a ring roster).
  pub listener: Option<std::net::TcpListener>,
  /// Ring roster, DHT mode.
  pub roster: Option<DhtRoster>,
}

impl DiscoveryOptions {
  pub fn named(name: &str) -> DiscoveryOptions {
    DiscoveryOptions {
      name: name.to_string(),
      addr: "127.0.0.1".to_string(),
      bind_addr: "127.0.0.1".to_string(),
      port: 0,
      sub_port: 0,
      listener: None,
      roster: None,
    }
  }
}

enum CoordWatch {
  Discovery(Vec<String>),
  Pubs(Vec<String>),
  Brokers(Vec<String>),
}

struct CoordinatorState {
  session: CoordSession,
  is_primary: bool,
  sync_pub: PubSocket,
  sync_sub: SubSocket,
  following: Option<String>,
  broker_leaders: BTreeMap<String, Option<BrokerLeader>>,
  watch_rx: PollReceiver<CoordWatch>,
}

enum Mode {
  Centralized,
  Dht(FingerTable),
  Coordinator(Box<CoordinatorState>),
}

pub struct DiscoveryEngine {
  state: DiscoveryState,
  cfg: Config,
  name: String,
  addr: String,
  dir: Directory,
  router: RouterSocket,
  mode: Mode,
  idle: Duration,
  last_request: Instant,
  running: bool,
}

impl DiscoveryEngine {
  pub fn new(
    cfg: Config,
    opts: DiscoveryOptions,
    registry: Registry,
    coord: Option<&CoordStore>,
  ) -> Result<DiscoveryEngine> {
    let mut state = DiscoveryState::Initialize;
    debug!("discovery {}: state {state:?}", opts.name);
    state = DiscoveryState::Configure;
    debug!("discovery {}: state {state:?}", opts.name);

    let router = match opts.listener {
      Some(listener) => RouterSocket::from_std(registry.try_clone()?, tokens::base(ROUTER_SLOT), listener)?,
      None => RouterSocket::bind(
        registry.try_clone()?,
        tokens::base(ROUTER_SLOT),
        &format!("{}:{}", opts.bind_addr, opts.port),
      )?,
    };
    let advertised_port = router.local_addr()?.port();

    let mode = match cfg.discovery {
      LookupStrategy::Centralized => Mode::Centralized,
      LookupStrategy::Dht => {
        let roster = opts
          .roster
          .as_ref()
          .ok_or_else(|| Error::config("DHT mode needs a ring roster"))?;
        Mode::Dht(FingerTable::build(
          roster,
          &opts.name,
          &registry,
          tokens::base(DEALER_SLOT),
        )?)
      }
      LookupStrategy::Coordinator => {
        let store = coord
          .ok_or_else(|| Error::config("coordinator mode needs a coordination store"))?;
        let session = store.session();
        let sync_pub = PubSocket::bind(
          registry.try_clone()?,
          tokens::base(SYNC_PUB_SLOT),
          &format!("{}:{}", opts.bind_addr, opts.sub_port),
        )?;
        let mut sync_sub = SubSocket::new(registry.try_clone()?, tokens::base(SYNC_SUB_SLOT));
        sync_sub.subscribe(crate::messages::payload::SYNC_TAG_SNAPSHOT);

        let (watch_tx, watch_rx) = poll_channel(&registry, tokens::base(WATCH_SLOT))?;

        let record = LeaderRecord {
          addr: opts.addr.clone(),
          port: advertised_port,
          sub_port: sync_pub.local_addr()?.port(),
          name: opts.name.clone(),
        };
        let is_primary = elect_primary(&session, &record)?;
        let mut following = None;
        if is_primary {
          info!("discovery {}: won the election, acting as primary", opts.name);
        } else if let Some(leader) = read_leader(&session)? {
          info!(
            "discovery {}: following primary {} at {}",
            opts.name,
            leader.name,
            leader.sync_endpoint()
          );
          sync_sub.connect(&leader.sync_endpoint());
          following = Some(leader.sync_endpoint());
        }

        install_watches(&session, &cfg, &watch_tx)?;

        let broker_leaders = cfg.groups.keys().map(|g| (g.clone(), None)).collect();
        Mode::Coordinator(Box::new(CoordinatorState {
          session,
          is_primary,
          sync_pub,
          sync_sub,
          following,
          broker_leaders,
          watch_rx,
        }))
      }
    };

    state = DiscoveryState::WaitingForRegistrations;
    info!(
      "discovery {}: listening on {}:{advertised_port} ({:?}/{:?})",
      opts.name, opts.addr, cfg.discovery, cfg.dissemination
    );
    Ok(DiscoveryEngine {
      state,
      idle: Duration::from_millis(cfg.idle_timeout_ms),
      cfg,
      name: opts.name,
      addr: opts.addr,
      dir: Directory::new(),
      router,
      mode,
      last_request: Instant::now(),
      running: true,
    })
  }

  /// Request endpoint to hand to clients.
  pub fn endpoint(&self) -> Result<String> {
    Ok(format!("{}:{}", self.addr, self.router.local_addr()?.port()))
  }

  pub fn state(&self) -> DiscoveryState {
    self.state
  }

  pub fn is_primary(&self) -> bool {
    matches!(&self.mode, Mode::Coordinator(c) if c.is_primary)
  }

  pub fn directory(&self) -> &Directory {
    &self.dir
  }

  /// Initial poll timeout: the idle shutdown window.
  pub fn start_timeout(&self) -> Option<Duration> {
    Some(self.idle)
  }

  // ------------------------------------------------------------------

  fn next_timeout(&self) -> Option<Duration> {
    let idle_left = self.idle.saturating_sub(self.last_request.elapsed());
    let retry = match &self.mode {
      Mode::Centralized => None,
      Mode::Dht(table) => table.retry_hint(),
      Mode::Coordinator(c) => c.sync_sub.retry_hint(),
    };
    min_timeout(Some(idle_left), retry)
  }

  fn tend(&mut self) {
    match &mut self.mode {
      Mode::Centralized => {}
      Mode::Dht(table) => table.tend(),
      Mode::Coordinator(c) => c.sync_sub.tend(),
    }
  }

  fn handle_request(&mut self, routed: RoutedMessage) -> Result<()> {
    self.last_request = Instant::now();
    let req = DiscoveryRequest::decode(routed.payload())?;
    trace!("discovery {}: request {:?}", self.name, req.body);
    match req.body.clone() {
      RequestBody::Register(r) => self.handle_register(&req, r, &routed),
      RequestBody::IsReady(r) => self.handle_isready(&req, r, &routed),
      RequestBody::Lookup(r) => self.handle_lookup(&req, r, &routed),
    }
  }

  fn handle_register(
    &mut self,
    req: &DiscoveryRequest,
    r: RegisterReq,
    routed: &RoutedMessage,
  ) -> Result<()> {
    // a ring node that has not been identified as responsible first
    // routes the record towards its hash
    if let Mode::Dht(table) = &mut self.mode {
      if !req.do_read_or_write {
        let hash = registrant_hash(&r);
        let (idx, responsible) = table.route(hash)?;
        let mut fwd = req.clone();
        fwd.do_read_or_write = responsible;
        let frames = routed.with_payload(fwd.encode()?);
        let entry = table.entry_mut(idx);
        debug!(
          "discovery {}: forwarding register of {} (hash {hash:#x}) to {}",
          self.name, r.info.id, entry.node.id
        );
        entry.dealer.send(&frames);
        return Ok(());
      }
    }

    if let Some(bad) = r.topics.iter().find(|t| !self.cfg.is_known_topic(t)) {
      let reason = format!("topic {bad} is not in the catalog");
      info!("discovery {}: rejecting {}: {reason}", self.name, r.info.id);
      return respond(
        &mut self.router,
        routed,
        req.timestamp_sent,
        ResponseBody::Register(RegisterResp {
          status: Status::Failure,
          reason,
        }),
      );
    }

    let endpoint = r.info.endpoint();
    let outcome = match r.role {
      Role::Publisher => self
        .dir
        .register_publisher(&r.info.id, &endpoint, &r.topics),
      Role::Subscriber => self.dir.register_subscriber(&r.info.id),
      Role::Both => self.dir.register_broker(&r.info.id, &endpoint),
    };

    match outcome {
      Ok(()) => {
        info!(
          "discovery {}: registered {:?} {} at {endpoint}",
          self.name, r.role, r.info.id
        );
        respond(
          &mut self.router,
          routed,
          req.timestamp_sent,
          ResponseBody::Register(RegisterResp {
            status: Status::Success,
            reason: String::new(),
          }),
        )?;
        if let Mode::Coordinator(c) = &mut self.mode {
          if c.is_primary {
            if r.role == Role::Publisher {
              publish_sync(
                c,
                &SyncFrame::Sub(MembershipDelta {
                  update_type: MembershipKind::Pub,
                  addr: r.info.addr.clone(),
                  port: r.info.port,
                  topics: r.topics.clone(),
                }),
              )?;
            }
            publish_sync(c, &SyncFrame::Snapshot(self.dir.snapshot()))?;
          }
        }
        self.note_membership();
      }
      Err(reason) => {
        info!("discovery {}: rejecting {}: {reason}", self.name, r.info.id);
        respond(
          &mut self.router,
          routed,
          req.timestamp_sent,
          ResponseBody::Register(RegisterResp {
            status: Status::Failure,
            reason,
          }),
        )?;
      }
    }
    Ok(())
  }

  fn handle_isready(
    &mut self,
    req: &DiscoveryRequest,
    r: IsReadyReq,
    routed: &RoutedMessage,
  ) -> Result<()> {
    match &mut self.mode {
      // the coordinator supplies membership directly, so clients never
      // have to wait for a head count
      Mode::Coordinator(_) => respond(
        &mut self.router,
        routed,
        req.timestamp_sent,
        ResponseBody::IsReady(IsReadyResp { ready: true }),
      ),
      Mode::Dht(table) => {
        let mut acc = r.accumulator.unwrap_or_default();
        if acc.visited_nodes.contains(&self.name) {
          let ready = headcount_ready(
            &self.cfg,
            acc.registered_pubs.len(),
            acc.registered_subs.len(),
            acc.registered_brokers.len(),
          );
          debug!(
            "discovery {}: ring isready complete, pubs={} subs={} brokers={} -> {ready}",
            self.name,
            acc.registered_pubs.len(),
            acc.registered_subs.len(),
            acc.registered_brokers.len()
          );
          respond(
            &mut self.router,
            routed,
            req.timestamp_sent,
            ResponseBody::IsReady(IsReadyResp { ready }),
          )
        } else {
          acc.visited_nodes.push(self.name.clone());
          merge_into(&mut acc.registered_pubs, self.dir.publisher_ids());
          merge_into(&mut acc.registered_subs, self.dir.subscriber_ids());
          merge_into(&mut acc.registered_brokers, self.dir.broker_ids());
          let fwd = DiscoveryRequest {
            timestamp_sent: req.timestamp_sent,
            do_read_or_write: req.do_read_or_write,
            body: RequestBody::IsReady(IsReadyReq {
              accumulator: Some(acc),
            }),
          };
          let frames = routed.with_payload(fwd.encode()?);
          table.successor().dealer.send(&frames);
          Ok(())
        }
      }
      Mode::Centralized => {
        let ready = headcount_ready(
          &self.cfg,
          self.dir.publisher_count(),
          self.dir.subscriber_count(),
          self.dir.broker_count(),
        );
        respond(
          &mut self.router,
          routed,
          req.timestamp_sent,
          ResponseBody::IsReady(IsReadyResp { ready }),
        )
      }
    }
  }

  fn handle_lookup(
    &mut self,
    req: &DiscoveryRequest,
    r: LookupReq,
    routed: &RoutedMessage,
  ) -> Result<()> {
    // what this node can contribute from its own tables
    let local = if self.cfg.dissemination == Dissemination::Brokered && !r.all {
      match r.requester {
        // the broker needs the raw feeds for its group's topics
        Requester::Broker => self.dir.endpoints_for_topics(&r.topics),
        // subscribers get the live broker leaders
        Requester::Subscriber => self.dir.broker_endpoints(),
      }
    } else if r.all {
      self.dir.all_publisher_endpoints()
    } else {
      self.dir.endpoints_for_topics(&r.topics)
    };

    match &mut self.mode {
      Mode::Centralized | Mode::Coordinator(_) => respond(
        &mut self.router,
        routed,
        req.timestamp_sent,
        ResponseBody::Lookup(LookupResp {
          endpoints: local.into_iter().collect(),
          all: r.all,
        }),
      ),
      Mode::Dht(table) => {
        let mut sockets = r.sockets_to_connect_to.clone();
        for ep in local {
          if !sockets.contains(&ep) {
            sockets.push(ep);
          }
        }
        if r.visited_nodes.contains(&self.name) {
          respond(
            &mut self.router,
            routed,
            req.timestamp_sent,
            ResponseBody::Lookup(LookupResp {
              endpoints: sockets,
              all: r.all,
            }),
          )
        } else {
          let mut visited = r.visited_nodes.clone();
          visited.push(self.name.clone());
          let fwd = DiscoveryRequest {
            timestamp_sent: req.timestamp_sent,
            do_read_or_write: req.do_read_or_write,
            body: RequestBody::Lookup(LookupReq {
              topics: r.topics.clone(),
              all: r.all,
              requester: r.requester,
              visited_nodes: visited,
              sockets_to_connect_to: sockets,
            }),
          };
          let frames = routed.with_payload(fwd.encode()?);
          table.successor().dealer.send(&frames);
          Ok(())
        }
      }
    }
  }

  /// Lifecycle bookkeeping once membership grew.
  fn note_membership(&mut self) {
    if self.state == DiscoveryState::WaitingForRegistrations
      && self.dir.publisher_count() >= self.cfg.expected_publishers
      && self.dir.subscriber_count() >= self.cfg.expected_subscribers
    {
      debug!("discovery {}: expected parties present", self.name);
      self.state = DiscoveryState::SystemReady;
    }
  }

  // ------------------------------------------------------------------
  // coordinator-mode watch processing (queued by the notifier thread,
  // drained here on the event loop)

  fn handle_watch(&mut self, watch: CoordWatch) -> Result<()> {
    match watch {
      CoordWatch::Discovery(children) => self.on_discovery_children(children),
      CoordWatch::Pubs(children) => self.on_pubs_children(children),
      CoordWatch::Brokers(children) => self.on_brokers_children(children),
    }
  }

  fn on_discovery_children(&mut self, children: Vec<String>) -> Result<()> {
    let Mode::Coordinator(c) = &mut self.mode else {
      return Ok(());
    };
    if c.is_primary {
      return Ok(());
    }
    if children.is_empty() {
      // the primary died; race for its seat
      let record = LeaderRecord {
        addr: self.addr.clone(),
        port: self.router.local_addr()?.port(),
        sub_port: c.sync_pub.local_addr()?.port(),
        name: self.name.clone(),
      };
      if elect_primary(&c.session, &record)? {
        info!("discovery {}: promoted to primary", self.name);
        c.is_primary = true;
        if let Some(old) = c.following.take() {
          c.sync_sub.disconnect(&old);
        }
        return Ok(());
      }
    }
    // still a secondary; make sure we follow whoever leads now
    if let Some(leader) = read_leader(&c.session)? {
      let endpoint = leader.sync_endpoint();
      if c.following.as_deref() != Some(endpoint.as_str()) {
        if let Some(old) = c.following.take() {
          c.sync_sub.disconnect(&old);
        }
        info!("discovery {}: now following {}", self.name, leader.name);
        c.sync_sub.connect(&endpoint);
        c.following = Some(endpoint);
      }
    }
    Ok(())
  }

  fn on_pubs_children(&mut self, children: Vec<String>) -> Result<()> {
    let Mode::Coordinator(c) = &mut self.mode else {
      return Ok(());
    };
    if !c.is_primary {
      return Ok(());
    }
    // registrants whose presence marker vanished are dead; markers we
    // never saw register are simply not ours to announce yet
    let died: Vec<String> = self
      .dir
      .publisher_ids()
      .filter(|id| !children.contains(id))
      .cloned()
      .collect();
    if died.is_empty() {
      return Ok(());
    }
    info!("discovery {}: publishers died: {died:?}", self.name);
    for id in died {
      if let Some(endpoint) = self.dir.remove_publisher(&id) {
        let ep = EndpointRef::parse(&endpoint)?;
        publish_sync(c, &SyncFrame::Unsub(ep))?;
      }
    }
    publish_sync(c, &SyncFrame::Snapshot(self.dir.snapshot()))?;
    Ok(())
  }

  fn on_brokers_children(&mut self, children: Vec<String>) -> Result<()> {
    let Mode::Coordinator(c) = &mut self.mode else {
      return Ok(());
    };
    if !c.is_primary {
      return Ok(());
    }
    for (group, topics) in self.cfg.groups.clone() {
      let new = if children.contains(&group) {
        read_broker_leader(&c.session, &group)?
      } else {
        None
      };
      let old = c.broker_leaders.get(&group).cloned().flatten();
      for frame in diff_group_leader(&old, &new, &topics) {
        if let SyncFrame::Unsub(_) = &frame {
          if let Some(old_leader) = &old {
            self.dir.remove_broker(&old_leader.name);
          }
        }
        publish_sync(c, &frame)?;
      }
      c.broker_leaders.insert(group, new);
    }
    Ok(())
  }

  fn handle_snapshot(&mut self, payload: &[u8]) -> Result<()> {
    match decode_sync(payload)? {
      SyncFrame::Snapshot(snap) => {
        trace!("discovery {}: applying state snapshot", self.name);
        self.dir.restore(snap);
      }
      other => trace!("discovery {}: ignoring sync frame {other:?}", self.name),
    }
    Ok(())
  }
}

impl EventHandler for DiscoveryEngine {
  fn on_timeout(&mut self) -> Result<Option<Duration>> {
    self.tend();
    if self.last_request.elapsed() >= self.idle {
      info!(
        "discovery {}: no request for {:?}, shutting down",
        self.name, self.idle
      );
      if let Mode::Coordinator(c) = &self.mode {
        c.session.close();
      }
      self.state = DiscoveryState::Completed;
      self.running = false;
      return Ok(None);
    }
    Ok(self.next_timeout())
  }

  fn on_event(&mut self, token: Token, readable: bool, writable: bool) -> Result<Option<Duration>> {
    self.tend();
    match tokens::slot(token) {
      ROUTER_SLOT => {
        let inbound = self.router.handle_event(token, readable, writable)?;
        for routed in inbound {
          self.handle_request(routed)?;
        }
      }
      DEALER_SLOT => {
        // a message on a finger dealer is a response riding back along
        // the forwarding chain; pass it to the router verbatim
        if let Mode::Dht(table) = &mut self.mode {
          if let Some(entry) = table.entry_for_token(token) {
            for frames in entry.dealer.handle_event(readable, writable)? {
              self.router.send(frames)?;
            }
          }
        }
      }
      SYNC_PUB_SLOT => {
        if let Mode::Coordinator(c) = &mut self.mode {
          c.sync_pub.handle_event(token, readable, writable)?;
        }
      }
      SYNC_SUB_SLOT => {
        let payloads = match &mut self.mode {
          Mode::Coordinator(c) => c.sync_sub.handle_event(token, readable, writable)?,
          _ => Vec::new(),
        };
        for payload in payloads {
          self.handle_snapshot(&payload)?;
        }
      }
      WATCH_SLOT => {
        let queued = match &mut self.mode {
          Mode::Coordinator(c) => c.watch_rx.drain(),
          _ => Vec::new(),
        };
        for watch in queued {
          self.handle_watch(watch)?;
        }
      }
      other => {
        return Err(Error::policy(
          "discovery",
          format!("event on unknown token slot {other}"),
        ));
      }
    }
    Ok(self.next_timeout())
  }

  fn running(&self) -> bool {
    self.running
  }
}

// ----------------------------------------------------------------------

fn respond(
  router: &mut RouterSocket,
  routed: &RoutedMessage,
  timestamp_sent: u64,
  body: ResponseBody,
) -> Result<()> {
  let resp = DiscoveryResponse {
    timestamp_sent,
    body,
  };
  router.send(routed.with_payload(resp.encode()?))
}

fn publish_sync(c: &mut CoordinatorState, frame: &SyncFrame) -> Result<()> {
  c.sync_pub.publish(&encode_sync(frame)?);
  Ok(())
}

fn merge_into<'a>(acc: &mut Vec<String>, locals: impl Iterator<Item = &'a String>) {
  for item in locals {
    if !acc.contains(item) {
      acc.push(item.clone());
    }
  }
}

/// The assembly check: everyone the configuration expects has
/// registered, and brokered deployments have at least one broker.
fn headcount_ready(cfg: &Config, pubs: usize, subs: usize, brokers: usize) -> bool {
  pubs == cfg.expected_publishers
    && subs == cfg.expected_subscribers
    && (cfg.dissemination != Dissemination::Brokered || brokers >= 1)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  fn cfg(dissemination: Dissemination, pubs: usize, subs: usize) -> Config {
    Config {
      discovery: LookupStrategy::Centralized,
      dissemination,
      topics: vec!["t1".to_string()],
      expected_publishers: pubs,
      expected_subscribers: subs,
      groups: BTreeMap::new(),
      idle_timeout_ms: 1000,
    }
  }

  #[test]
  fn readiness_needs_the_full_headcount() {
    let c = cfg(Dissemination::Direct, 2, 1);
    assert!(!headcount_ready(&c, 1, 1, 0));
    assert!(!headcount_ready(&c, 2, 0, 0));
    assert!(headcount_ready(&c, 2, 1, 0));
    // stays true while membership holds steady, flips when it shrinks
    assert!(headcount_ready(&c, 2, 1, 0));
    assert!(!headcount_ready(&c, 1, 1, 0));
  }

  #[test]
  fn brokered_readiness_also_needs_a_broker() {
    let c = cfg(Dissemination::Brokered, 1, 1);
    assert!(!headcount_ready(&c, 1, 1, 0));
    assert!(headcount_ready(&c, 1, 1, 1));
    assert!(headcount_ready(&c, 1, 1, 3));
  }
}

fn install_watches(
  session: &CoordSession,
  cfg: &Config,
  watch_tx: &PollSender<CoordWatch>,
) -> Result<()> {
  let tx = watch_tx.clone();
  session.watch_children(DISCOVERY_PARENT, move |children| {
    tx.send(CoordWatch::Discovery(children));
  })?;

  session.ensure_path(PUBS_PARENT)?;
  let tx = watch_tx.clone();
  session.watch_children(PUBS_PARENT, move |children| {
    tx.send(CoordWatch::Pubs(children));
  })?;

  if cfg.dissemination == Dissemination::Brokered {
    session.ensure_path(BROKERS_PARENT)?;
    let tx = watch_tx.clone();
    session.watch_children(BROKERS_PARENT, move |children| {
      tx.send(CoordWatch::Brokers(children));
    })?;
  }
  Ok(())
}
