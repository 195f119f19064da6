//! A three-node Discovery ring: registrations hop to the responsible
//! node, readiness and lookup traverse the full circle and come back
//! to the requester through the same dealers.

mod common;

use std::time::Duration;

use common::{config, spawn_engine, SharedSink};
use topicbus::config::{DhtRoster, Dissemination, LookupStrategy, RingNode};
use topicbus::discovery::dht::ring_hash;
use topicbus::discovery::{DiscoveryEngine, DiscoveryOptions};
use topicbus::publisher::{CounterValues, PublisherEngine, PublisherOptions, PublisherState};
use topicbus::reactor::EventLoop;
use topicbus::subscriber::{SubscriberEngine, SubscriberOptions, SubscriberState};

#[test_log::test]
fn ring_of_three_serves_registration_readiness_and_lookup() {
  let cfg = config(
    LookupStrategy::Dht,
    Dissemination::Direct,
    &["t1"],
    1,
    1,
    3_000,
    &[],
  );

  // the roster needs real ports before the engines exist, so the
  // listeners are bound first and adopted by the routers
  let ids = ["disc1", "disc2", "disc3"];
  let mut listeners = Vec::new();
  let mut roster = DhtRoster { dht: Vec::new() };
  for id in ids {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    roster.dht.push(RingNode {
      id: id.to_string(),
      hash: ring_hash(id),
      ip: "127.0.0.1".to_string(),
      port,
      host: "localhost".to_string(),
    });
    listeners.push(listener);
  }

  let mut disc_handles = Vec::new();
  for (id, listener) in ids.into_iter().zip(listeners) {
    let lp = EventLoop::new().unwrap();
    let mut opts = DiscoveryOptions::named(id);
    opts.listener = Some(listener);
    opts.roster = Some(roster.clone());
    let engine = DiscoveryEngine::new(cfg.clone(), opts, lp.registry().unwrap(), None).unwrap();
    let first = engine.start_timeout();
    disc_handles.push(spawn_engine(lp, engine, first));
  }

  let pub_lp = EventLoop::new().unwrap();
  let mut pub_opts = PublisherOptions::named("pub-a", &["t1"]);
  pub_opts.iters = 5;
  pub_opts.frequency = 10.0;
  pub_opts.ready_retry = Duration::from_millis(200);
  pub_opts.roster = Some(roster.clone());
  let publisher = PublisherEngine::new(
    cfg.clone(),
    pub_opts,
    pub_lp.registry().unwrap(),
    None,
    Box::new(CounterValues::default()),
    Box::new(SharedSink::new()),
  )
  .unwrap();
  let pub_first = publisher.start_timeout();
  let pub_handle = spawn_engine(pub_lp, publisher, pub_first);

  let sink = SharedSink::new();
  let sub_lp = EventLoop::new().unwrap();
  let mut sub_opts = SubscriberOptions::named("sub-1", &["t1"]);
  sub_opts.idle_timeout = Duration::from_millis(1_500);
  sub_opts.ready_retry = Duration::from_millis(200);
  sub_opts.roster = Some(roster);
  let subscriber = SubscriberEngine::new(
    cfg.clone(),
    sub_opts,
    sub_lp.registry().unwrap(),
    None,
    Box::new(sink.clone()),
  )
  .unwrap();
  let sub_first = subscriber.start_timeout();
  let sub_handle = spawn_engine(sub_lp, subscriber, sub_first);

  let (publisher, outcome) = pub_handle.join().unwrap();
  outcome.unwrap();
  assert_eq!(publisher.state(), PublisherState::Completed);

  let (subscriber, outcome) = sub_handle.join().unwrap();
  outcome.unwrap();
  assert_eq!(subscriber.state(), SubscriberState::Completed);
  assert!(subscriber.delivered() >= 1);
  assert!(sink.pub_ids().contains("pub-a"));

  // exactly one ring node owns each record, wherever the request
  // entered the ring
  let mut pub_records = 0;
  let mut sub_records = 0;
  for handle in disc_handles {
    let (node, outcome) = handle.join().unwrap();
    outcome.unwrap();
    pub_records += node.directory().publisher_count();
    sub_records += node.directory().subscriber_count();
  }
  assert_eq!(pub_records, 1);
  assert_eq!(sub_records, 1);
}
