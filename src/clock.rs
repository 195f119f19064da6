//! Wall-clock helpers for latency attribution.
//!
//! Publications and request envelopes carry the sender's wall clock in
//! microseconds since the Unix epoch; the receiving side subtracts to
//! obtain an end-to-end latency sample. This assumes reasonably
//! synchronized clocks across hosts, which is what the measurement
//! harness provides.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock as microseconds since the Unix epoch.
pub fn unix_micros() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_micros() as u64)
    .unwrap_or(0)
}

/// Seconds elapsed since `sent_micros`, clamped at zero for skewed clocks.
pub fn latency_secs(sent_micros: u64) -> f64 {
  let now = unix_micros();
  now.saturating_sub(sent_micros) as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn latency_is_non_negative_under_skew() {
    // a timestamp from the future must not underflow
    let future = unix_micros() + 5_000_000;
    assert_eq!(latency_secs(future), 0.0);
  }
}
