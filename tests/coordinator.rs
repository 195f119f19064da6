//! Coordinator-backed scenarios: ownership strength, dynamic
//! membership, primary failover and broker leadership handoff.

mod common;

use std::time::Duration;

use common::{config, spawn_engine, wait_until, SharedSink};
use topicbus::broker::{BrokerEngine, BrokerOptions, BrokerState};
use topicbus::config::{Dissemination, LookupStrategy};
use topicbus::coord::CoordStore;
use topicbus::discovery::coordinated::read_leader;
use topicbus::discovery::{DiscoveryEngine, DiscoveryOptions};
use topicbus::publisher::{CounterValues, PublisherEngine, PublisherOptions};
use topicbus::reactor::EventLoop;
use topicbus::subscriber::{SubscriberEngine, SubscriberOptions, SubscriberState};

fn spawn_discovery(
  cfg: &topicbus::config::Config,
  name: &str,
  store: &CoordStore,
) -> std::thread::JoinHandle<(DiscoveryEngine, topicbus::Result<()>)> {
  let lp = EventLoop::new().unwrap();
  let engine = DiscoveryEngine::new(
    cfg.clone(),
    DiscoveryOptions::named(name),
    lp.registry().unwrap(),
    Some(store),
  )
  .unwrap();
  let first = engine.start_timeout();
  spawn_engine(lp, engine, first)
}

fn spawn_publisher(
  cfg: &topicbus::config::Config,
  store: &CoordStore,
  name: &str,
  topics: &[&str],
  iters: u32,
) -> std::thread::JoinHandle<(PublisherEngine, topicbus::Result<()>)> {
  let lp = EventLoop::new().unwrap();
  let mut opts = PublisherOptions::named(name, topics);
  opts.iters = iters;
  opts.frequency = 10.0;
  opts.ready_retry = Duration::from_millis(200);
  let engine = PublisherEngine::new(
    cfg.clone(),
    opts,
    lp.registry().unwrap(),
    Some(store),
    Box::new(CounterValues::default()),
    Box::new(SharedSink::new()),
  )
  .unwrap();
  let first = engine.start_timeout();
  spawn_engine(lp, engine, first)
}

fn spawn_subscriber(
  cfg: &topicbus::config::Config,
  store: &CoordStore,
  name: &str,
  topics: &[&str],
  sink: SharedSink,
) -> std::thread::JoinHandle<(SubscriberEngine, topicbus::Result<()>)> {
  let lp = EventLoop::new().unwrap();
  let mut opts = SubscriberOptions::named(name, topics);
  opts.idle_timeout = Duration::from_millis(1_500);
  opts.ready_retry = Duration::from_millis(200);
  let engine = SubscriberEngine::new(
    cfg.clone(),
    opts,
    lp.registry().unwrap(),
    Some(store),
    Box::new(sink),
  )
  .unwrap();
  let first = engine.start_timeout();
  spawn_engine(lp, engine, first)
}

#[test_log::test]
fn only_the_strongest_live_publisher_disseminates() {
  let cfg = config(
    LookupStrategy::Coordinator,
    Dissemination::Direct,
    &["t1"],
    3,
    1,
    8_000,
    &[],
  );
  let store = CoordStore::new();
  let disc_handle = spawn_discovery(&cfg, "disc1", &store);

  // construction order fixes the store-assigned ranks: pub-1 gets the
  // lowest sequence and starts as leader
  let p1 = spawn_publisher(&cfg, &store, "pub-1", &["t1"], 8);
  let p2 = spawn_publisher(&cfg, &store, "pub-2", &["t1"], 40);
  let p3 = spawn_publisher(&cfg, &store, "pub-3", &["t1"], 20);

  let sink = SharedSink::new();
  let sub_handle = spawn_subscriber(&cfg, &store, "sub-1", &["t1"], sink.clone());

  let (pub1, outcome) = p1.join().unwrap();
  outcome.unwrap();
  assert_eq!(pub1.ownership_strength("t1"), Some(0));

  let (pub3, outcome) = p3.join().unwrap();
  outcome.unwrap();
  // pub-2 outlives pub-3, so pub-3 never gets the lowest live rank
  assert_eq!(pub3.ownership_strength("t1"), Some(2));
  assert!(!pub3.is_leader_for("t1"));

  let (pub2, outcome) = p2.join().unwrap();
  outcome.unwrap();
  assert_eq!(pub2.ownership_strength("t1"), Some(1));
  // promoted within one watch fire of pub-1's death
  assert!(pub2.is_leader_for("t1"));

  let (subscriber, outcome) = sub_handle.join().unwrap();
  outcome.unwrap();
  assert_eq!(subscriber.state(), SubscriberState::Completed);
  let heard: Vec<String> = sink.pub_ids().into_iter().collect();
  assert_eq!(heard, ["pub-1", "pub-2"]);

  drop(disc_handle);
}

#[test_log::test]
fn late_publisher_reaches_subscribers_without_a_new_lookup() {
  let cfg = config(
    LookupStrategy::Coordinator,
    Dissemination::Direct,
    &["t1", "t2"],
    2,
    1,
    8_000,
    &[],
  );
  let store = CoordStore::new();
  let disc_handle = spawn_discovery(&cfg, "disc1", &store);

  let p1 = spawn_publisher(&cfg, &store, "pub-a", &["t1"], 30);
  let sink = SharedSink::new();
  let sub_handle = spawn_subscriber(&cfg, &store, "sub-1", &["t1", "t2"], sink.clone());

  // let the subscriber finish its lookup before the newcomer appears
  assert!(wait_until(Duration::from_secs(3), || {
    sink.delivery_count() >= 1
  }));

  let p2 = spawn_publisher(&cfg, &store, "pub-b", &["t2"], 15);

  let (_, outcome) = p1.join().unwrap();
  outcome.unwrap();
  let (_, outcome) = p2.join().unwrap();
  outcome.unwrap();

  let (subscriber, outcome) = sub_handle.join().unwrap();
  outcome.unwrap();
  // the membership delta grew the connection set mid-flight
  assert_eq!(subscriber.connected_endpoints().len(), 2);
  assert!(sink.pub_ids().contains("pub-b"));

  drop(disc_handle);
}

#[test_log::test]
fn a_secondary_takes_over_when_the_primary_dies() {
  let mut cfg = config(
    LookupStrategy::Coordinator,
    Dissemination::Direct,
    &["t1"],
    0,
    0,
    1_200,
    &[],
  );
  let store = CoordStore::new();
  let a_handle = spawn_discovery(&cfg, "disc-a", &store);

  let probe = store.session();
  assert!(wait_until(Duration::from_secs(2), || {
    matches!(read_leader(&probe), Ok(Some(l)) if l.name == "disc-a")
  }));

  cfg.idle_timeout_ms = 6_000;
  let b_handle = spawn_discovery(&cfg, "disc-b", &store);
  std::thread::sleep(Duration::from_millis(200));

  // disc-a idles out; dropping the returned engine expires its session
  let (engine_a, outcome) = a_handle.join().unwrap();
  outcome.unwrap();
  assert!(engine_a.is_primary());
  drop(engine_a);

  // within one watch round the secondary holds the leader node
  assert!(wait_until(Duration::from_secs(3), || {
    matches!(read_leader(&probe), Ok(Some(l)) if l.name == "disc-b")
  }));

  let (engine_b, outcome) = b_handle.join().unwrap();
  outcome.unwrap();
  assert!(engine_b.is_primary());
}

#[test_log::test]
fn broker_leadership_passes_to_the_waiting_contender() {
  let cfg = config(
    LookupStrategy::Coordinator,
    Dissemination::Brokered,
    &["t1"],
    1,
    1,
    8_000,
    &[("group1", &["t1"])],
  );
  let store = CoordStore::new();
  let disc_handle = spawn_discovery(&cfg, "disc1", &store);

  let mut broker_handles = Vec::new();
  for (name, idle_ms) in [("broker-1", 1_200u64), ("broker-2", 1_500u64)] {
    let lp = EventLoop::new().unwrap();
    let mut opts = BrokerOptions::named(name);
    opts.group = Some("group1".to_string());
    opts.idle_timeout = Duration::from_millis(idle_ms);
    opts.ready_retry = Duration::from_millis(200);
    let engine = BrokerEngine::new(cfg.clone(), opts, lp.registry().unwrap(), Some(&store)).unwrap();
    let first = engine.start_timeout();
    broker_handles.push(spawn_engine(lp, engine, first));
    // make broker-1 win the first race
    std::thread::sleep(Duration::from_millis(200));
  }

  let p1 = spawn_publisher(&cfg, &store, "pub-a", &["t1"], 10);
  let sink = SharedSink::new();
  let sub_handle = spawn_subscriber(&cfg, &store, "sub-1", &["t1"], sink.clone());

  let (_, outcome) = p1.join().unwrap();
  outcome.unwrap();
  let (subscriber, outcome) = sub_handle.join().unwrap();
  outcome.unwrap();
  assert!(subscriber.delivered() >= 1);
  assert!(sink.pub_ids().contains("pub-a"));

  // broker-1 quiesces once the data stops; dropping it frees the seat
  let (broker1, outcome) = broker_handles.remove(0).join().unwrap();
  outcome.unwrap();
  assert!(broker1.is_leader());
  assert!(broker1.forwarded() >= 1);
  drop(broker1);

  // the parked contender wakes, takes the seat, then idles out too
  let (broker2, outcome) = broker_handles.remove(0).join().unwrap();
  outcome.unwrap();
  assert!(broker2.is_leader());
  assert_eq!(broker2.state(), BrokerState::Completed);

  drop(disc_handle);
}
