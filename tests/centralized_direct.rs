//! End to end over loopback: one centralized Discovery, two publishers
//! on distinct topics, one subscriber interested in both, direct
//! dissemination.

mod common;

use std::time::Duration;

use common::{config, spawn_engine, SharedSink};
use topicbus::config::{Dissemination, LookupStrategy};
use topicbus::discovery::{DiscoveryEngine, DiscoveryOptions, DiscoveryState};
use topicbus::publisher::{CounterValues, PublisherEngine, PublisherOptions, PublisherState};
use topicbus::reactor::EventLoop;
use topicbus::subscriber::{SubscriberEngine, SubscriberOptions, SubscriberState};

#[test_log::test]
fn subscriber_receives_from_every_relevant_publisher() {
  let cfg = config(
    LookupStrategy::Centralized,
    Dissemination::Direct,
    &["t1", "t2"],
    2,
    1,
    3_000,
    &[],
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

  let mut pubs = Vec::new();
  for (name, topic) in [("pub-a", "t1"), ("pub-b", "t2")] {
    let lp = EventLoop::new().unwrap();
    let mut opts = PublisherOptions::named(name, &[topic]);
    opts.iters = 5;
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
    pubs.push(spawn_engine(lp, engine, first));
  }

  let sink = SharedSink::new();
  let sub_lp = EventLoop::new().unwrap();
  let mut sub_opts = SubscriberOptions::named("sub-1", &["t1", "t2"]);
  sub_opts.idle_timeout = Duration::from_millis(1_500);
  sub_opts.ready_retry = Duration::from_millis(200);
  sub_opts.discovery_endpoint = Some(disc_endpoint.clone());
  let sub = SubscriberEngine::new(
    cfg,
    sub_opts,
    sub_lp.registry().unwrap(),
    None,
    Box::new(sink.clone()),
  )
  .unwrap();
  let sub_first = sub.start_timeout();
  let sub_handle = spawn_engine(sub_lp, sub, sub_first);

  for handle in pubs {
    let (publisher, outcome) = handle.join().unwrap();
    outcome.unwrap();
    assert_eq!(publisher.state(), PublisherState::Completed);
  }

  let (subscriber, outcome) = sub_handle.join().unwrap();
  outcome.unwrap();
  assert_eq!(subscriber.state(), SubscriberState::Completed);
  // connected to both publishers, heard from both
  assert_eq!(subscriber.connected_endpoints().len(), 2);
  assert!(subscriber.delivered() >= 2);
  let heard: Vec<String> = sink.pub_ids().into_iter().collect();
  assert_eq!(heard, ["pub-a", "pub-b"]);
  // every sample carries a sane latency
  for sample in sink.deliveries.lock().unwrap().iter() {
    assert!(sample.latency_secs >= 0.0);
    assert!(sample.latency_secs < 5.0);
  }

  let (discovery, outcome) = disc_handle.join().unwrap();
  outcome.unwrap();
  assert_eq!(discovery.state(), DiscoveryState::Completed);
  assert_eq!(discovery.directory().publisher_count(), 2);
  assert_eq!(discovery.directory().subscriber_count(), 1);
}

#[test_log::test]
fn duplicate_publisher_id_aborts_the_second_registrant() {
  // one expected publisher: the first registrant is complete on its
  // own, the second collides on the id
  let cfg = config(
    LookupStrategy::Centralized,
    Dissemination::Direct,
    &["t1"],
    1,
    0,
    2_000,
    &[],
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

  let mut handles = Vec::new();
  for _ in 0..2 {
    let lp = EventLoop::new().unwrap();
    let mut opts = PublisherOptions::named("same-id", &["t1"]);
    opts.iters = 1;
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
    handles.push(spawn_engine(lp, engine, first));
    // deterministic ordering of the two registrations
    std::thread::sleep(Duration::from_millis(300));
  }

  let (_first_engine, first_outcome) = handles.remove(0).join().unwrap();
  let (_second_engine, second_outcome) = handles.remove(0).join().unwrap();
  // the loser of the name gets a FAILURE response and aborts
  let errors = [first_outcome.is_err(), second_outcome.is_err()];
  assert_eq!(errors.iter().filter(|e| **e).count(), 1);

  let (discovery, _) = disc_handle.join().unwrap();
  assert_eq!(discovery.directory().publisher_count(), 1);
}
