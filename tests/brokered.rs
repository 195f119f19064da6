//! Brokered dissemination: all traffic flows through the proxy, and
//! what comes out is byte-identical to what went in.

mod common;

use std::time::Duration;

use common::{config, spawn_engine, SharedSink};
use topicbus::broker::{BrokerEngine, BrokerOptions, BrokerState};
use topicbus::config::{Dissemination, LookupStrategy};
use topicbus::discovery::{DiscoveryEngine, DiscoveryOptions};
use topicbus::publisher::{CounterValues, PublisherEngine, PublisherOptions};
use topicbus::reactor::EventLoop;
use topicbus::subscriber::{SubscriberEngine, SubscriberOptions, SubscriberState};

#[test_log::test]
fn every_subscriber_hears_every_publisher_through_the_broker() {
  let cfg = config(
    LookupStrategy::Centralized,
    Dissemination::Brokered,
    &["t1"],
    2,
    2,
    4_000,
    &[("group1", &["t1"])],
  );

  let disc_lp = EventLoop::new().unwrap();
  let disc = DiscoveryEngine::new(
    cfg.clone(),
    DiscoveryOptions::named("disc1"),
    disc_lp.registry().unwrap(),
    None,
  )
  .unwrap();
  let disc_endpoint = disc.endpoint().unwrap();
  let disc_first = disc.start_timeout();
  let disc_handle = spawn_engine(disc_lp, disc, disc_first);

  let broker_lp = EventLoop::new().unwrap();
  let mut broker_opts = BrokerOptions::named("broker-1");
  broker_opts.idle_timeout = Duration::from_millis(2_000);
  broker_opts.ready_retry = Duration::from_millis(200);
  broker_opts.discovery_endpoint = Some(disc_endpoint.clone());
  let broker = BrokerEngine::new(
    cfg.clone(),
    broker_opts,
    broker_lp.registry().unwrap(),
    None,
  )
  .unwrap();
  let broker_first = broker.start_timeout();
  let broker_handle = spawn_engine(broker_lp, broker, broker_first);

  let mut pub_handles = Vec::new();
  for name in ["pub-a", "pub-b"] {
    let lp = EventLoop::new().unwrap();
    let mut opts = PublisherOptions::named(name, &["t1"]);
    opts.iters = 6;
    opts.frequency = 10.0;
    opts.ready_retry = Duration::from_millis(200);
    opts.discovery_endpoint = Some(disc_endpoint.clone());
    let engine = PublisherEngine::new(
      cfg.clone(),
      opts,
      lp.registry().unwrap(),
      None,
      Box::new(CounterValues::default()),
      Box::new(SharedSink::new()),
    )
    .unwrap();
    let first = engine.start_timeout();
    pub_handles.push(spawn_engine(lp, engine, first));
  }

  let mut sinks = Vec::new();
  let mut sub_handles = Vec::new();
  for name in ["sub-1", "sub-2"] {
    let sink = SharedSink::new();
    let lp = EventLoop::new().unwrap();
    let mut opts = SubscriberOptions::named(name, &["t1"]);
    opts.idle_timeout = Duration::from_millis(1_500);
    opts.ready_retry = Duration::from_millis(200);
    opts.discovery_endpoint = Some(disc_endpoint.clone());
    let engine = SubscriberEngine::new(
      cfg.clone(),
      opts,
      lp.registry().unwrap(),
      None,
      Box::new(sink.clone()),
    )
    .unwrap();
    let first = engine.start_timeout();
    sinks.push(sink);
    sub_handles.push(spawn_engine(lp, engine, first));
  }

  for handle in pub_handles {
    let (_, outcome) = handle.join().unwrap();
    outcome.unwrap();
  }
  for (sink, handle) in sinks.iter().zip(sub_handles) {
    let (subscriber, outcome) = handle.join().unwrap();
    outcome.unwrap();
    assert_eq!(subscriber.state(), SubscriberState::Completed);
    // the subscriber talks to the broker, not the publishers
    assert_eq!(subscriber.connected_endpoints().len(), 1);
    // payloads from both producers made it through the proxy intact
    let heard: Vec<String> = sink.pub_ids().into_iter().collect();
    assert_eq!(heard, ["pub-a", "pub-b"]);
  }

  let (broker, outcome) = broker_handle.join().unwrap();
  outcome.unwrap();
  assert_eq!(broker.state(), BrokerState::Completed);
  // 2 publishers x 6 sweeps
  assert!(broker.forwarded() >= 6);

  let (_, outcome) = disc_handle.join().unwrap();
  outcome.unwrap();
}
