#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use topicbus::config::{Config, Dissemination, LookupStrategy};
use topicbus::latency::{ControlSample, DeliverySample, LatencySink};
use topicbus::reactor::{EventHandler, EventLoop};

/// Sink whose buffers the test keeps a handle to.
#[derive(Clone, Default)]
pub struct SharedSink {
  pub deliveries: Arc<Mutex<Vec<DeliverySample>>>,
  pub controls: Arc<Mutex<Vec<ControlSample>>>,
}

impl SharedSink {
  pub fn new() -> SharedSink {
    SharedSink::default()
  }

  pub fn delivery_count(&self) -> usize {
    self.deliveries.lock().unwrap().len()
  }

  pub fn pub_ids(&self) -> BTreeSet<String> {
    self
      .deliveries
      .lock()
      .unwrap()
      .iter()
      .map(|s| s.pub_id.clone())
      .collect()
  }
}

impl LatencySink for SharedSink {
  fn record_delivery(&mut self, sample: &DeliverySample) {
    self.deliveries.lock().unwrap().push(sample.clone());
  }

  fn record_control(&mut self, sample: &ControlSample) {
    self.controls.lock().unwrap().push(sample.clone());
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

/// Run an engine on its own loop in a thread; join to get the engine
/// back for assertions.
pub fn spawn_engine<E>(
  lp: EventLoop,
  engine: E,
  first: Option<Duration>,
) -> thread::JoinHandle<(E, topicbus::Result<()>)>
where
  E: EventHandler + Send + 'static,
{
  thread::spawn(move || {
    let mut lp = lp;
    let mut engine = engine;
    let outcome = lp.run(&mut engine, first);
    (engine, outcome)
  })
}

pub fn config(
  lookup: LookupStrategy,
  dissemination: Dissemination,
  topics: &[&str],
  pubs: usize,
  subs: usize,
  idle_ms: u64,
  groups: &[(&str, &[&str])],
) -> Config {
  let groups: BTreeMap<String, Vec<String>> = groups
    .iter()
    .map(|(g, ts)| {
      (
        g.to_string(),
        ts.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
      )
    })
    .collect();
  let cfg = Config {
    discovery: lookup,
    dissemination,
    topics: topics.iter().map(|t| t.to_string()).collect(),
    expected_publishers: pubs,
    expected_subscribers: subs,
    groups,
    idle_timeout_ms: idle_ms,
  };
  cfg.validate().expect("test config is valid");
  cfg
}

/// Poll a predicate until it holds or the deadline passes.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if pred() {
      return true;
    }
    thread::sleep(Duration::from_millis(25));
  }
  pred()
}
