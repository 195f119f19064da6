//! Latency capture and the external analytics sink.
//!
//! Subscribers record one sample per fresh delivery; publishers record
//! control-plane round trips (register, isready). Samples are buffered
//! in memory and handed to a [`LatencySink`] at quiescence. The sink
//! stands in for the external analytics store: a failure to reach it
//! must never abort the engine, so callers log sink errors and move on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

use crate::config::{Dissemination, LookupStrategy};

/// One end-to-end delivery measurement.
#[derive(Debug, Clone, Serialize)]
pub struct DeliverySample {
  pub latency_secs: f64,
  pub frequency: f64,
  pub topic_count: usize,
  pub pub_count: usize,
  pub sub_count: usize,
  pub dissemination: Dissemination,
  pub pub_id: String,
  pub sub_id: String,
  pub experiment: String,
  pub captured_at: DateTime<Utc>,
}

/// One control-plane round-trip measurement.
#[derive(Debug, Clone, Serialize)]
pub struct ControlSample {
  pub operation: String,
  pub latency_secs: f64,
  pub lookup: LookupStrategy,
  pub pub_count: usize,
  pub sub_count: usize,
  pub entity: String,
  pub captured_at: DateTime<Utc>,
}

pub trait LatencySink: Send {
  fn record_delivery(&mut self, sample: &DeliverySample);
  fn record_control(&mut self, sample: &ControlSample);
  /// Push everything recorded so far to the backing store.
  fn flush(&mut self) -> std::io::Result<()>;
}

/// Appends samples as JSON lines to a file.
pub struct JsonlSink {
  path: PathBuf,
  pending: Vec<String>,
}

impl JsonlSink {
  pub fn new(path: impl Into<PathBuf>) -> JsonlSink {
    JsonlSink {
      path: path.into(),
      pending: Vec::new(),
    }
  }

  fn push(&mut self, kind: &str, json: serde_json::Result<String>) {
    match json {
      Ok(line) => self.pending.push(format!("{{\"kind\":\"{kind}\",\"sample\":{line}}}")),
      Err(e) => log::warn!("latency sink: unserializable sample: {e}"),
    }
  }
}

impl LatencySink for JsonlSink {
  fn record_delivery(&mut self, sample: &DeliverySample) {
    self.push("delivery", serde_json::to_string(sample));
  }

  fn record_control(&mut self, sample: &ControlSample) {
    self.push("control", serde_json::to_string(sample));
  }

  fn flush(&mut self) -> std::io::Result<()> {
    if self.pending.is_empty() {
      return Ok(());
    }
    let mut file = std::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)?;
    for line in &self.pending {
      writeln!(file, "{line}")?;
    }
    self.pending.clear();
    Ok(())
  }
}

/// Discards everything; for deployments without an analytics store.
#[derive(Default)]
pub struct NullSink;

impl LatencySink for NullSink {
  fn record_delivery(&mut self, _: &DeliverySample) {}
  fn record_control(&mut self, _: &ControlSample) {}
  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn jsonl_sink_writes_one_line_per_sample() {
    let dir = std::env::temp_dir().join(format!("topicbus-sink-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("latency.jsonl");
    let _ = std::fs::remove_file(&path);

    let mut sink = JsonlSink::new(&path);
    sink.record_delivery(&DeliverySample {
      latency_secs: 0.004,
      frequency: 1.0,
      topic_count: 2,
      pub_count: 2,
      sub_count: 1,
      dissemination: Dissemination::Direct,
      pub_id: "pub-a".to_string(),
      sub_id: "sub-1".to_string(),
      experiment: "exp".to_string(),
      captured_at: Utc::now(),
    });
    sink.record_control(&ControlSample {
      operation: "REGISTER".to_string(),
      latency_secs: 0.001,
      lookup: LookupStrategy::Centralized,
      pub_count: 2,
      sub_count: 1,
      entity: "pub-a".to_string(),
      captured_at: Utc::now(),
    });
    sink.flush().unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"kind\":\"delivery\""));
    assert!(lines[1].contains("\"kind\":\"control\""));
    // flushing again adds nothing
    sink.flush().unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
  }
}
