//! Bandwidth aggregation.
//!
//! Reduces a set of matched samples to a send-side and a receive-side
//! bandwidth estimate. The estimate is the mean inter-packet interval
//! over adjacent pairs in send order (N samples yield N-1 intervals; the
//! first sample never contributes one), converted to megabits per
//! second. Fewer than two usable samples yields an explicit
//! insufficient result, never a division by zero or an infinity.

use crate::session::Sample;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Mean interval in nanoseconds between adjacent values of `times`,
/// taken in the order given; the adjacent differences telescope to
/// `(last - first) / (n - 1)`. `None` when fewer than two values
/// exist or the mean is not positive.
pub fn mean_interval_ns(times: &[i64]) -> Option<i64> {
    if times.len() < 2 {
        return None;
    }
    let mut sum: i64 = 0;
    for pair in times.windows(2) {
        sum += pair[1] - pair[0];
    }
    // Integer division loses at most a few nanoseconds.
    let mean = sum / (times.len() as i64 - 1);
    if mean > 0 {
        Some(mean)
    } else {
        None
    }
}

/// Converts a mean inter-packet interval to megabits per second:
/// `bytes * 8 bits / interval ns`, scaled so nanoseconds and bytes
/// yield Mbps. `interval_ns` must be positive.
pub fn bandwidth_mbps(packet_size: usize, interval_ns: i64) -> f64 {
    (packet_size as f64 * 8.0 * 1e3) / interval_ns as f64
}

/// Final two-sided result of one probe session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    /// Rate at which the train left the sender, in Mbps.
    pub bandwidth_sent_mbps: f64,
    /// Bottleneck estimate from receive-side spacing, in Mbps.
    pub bandwidth_received_mbps: f64,
    /// Probes transmitted in the burst.
    pub probes_sent: u64,
    /// Probes whose arrival was observed (echo mode only).
    pub probes_matched: u64,
    /// Mean send-to-receive delay from echoed timestamps, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt: Option<Duration>,
    /// One-way latency estimate (`rtt / 2`), when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<Duration>,
    /// True when either side had fewer than two usable data points; the
    /// corresponding bandwidth field is zero, not NaN or infinity.
    pub insufficient: bool,
}

/// Reduces one session's samples to a [`ProbeReport`].
///
/// The send side uses every sample's `sent_at`. The receive side
/// prefers the peer-reported mean interval and falls back to matched
/// samples' `received_at`, taken in `sent_at` order.
pub fn aggregate(
    samples: &[Sample],
    packet_size: usize,
    peer_interval_ns: Option<i64>,
) -> ProbeReport {
    let mut ordered: Vec<Sample> = samples.to_vec();
    ordered.sort_unstable_by_key(|s| s.sent_at);

    let sent_times: Vec<i64> = ordered.iter().map(|s| s.sent_at).collect();
    let sent_interval = mean_interval_ns(&sent_times);

    let matched: Vec<&Sample> = ordered.iter().filter(|s| s.received_at.is_some()).collect();
    let recv_times: Vec<i64> = matched.iter().filter_map(|s| s.received_at).collect();
    let recv_interval = peer_interval_ns
        .filter(|&ns| ns > 0)
        .or_else(|| mean_interval_ns(&recv_times));

    // Echoed peer timestamps give a crude delay estimate; meaningless
    // when clocks are far apart, so negative means are dropped.
    let rtt = if matched.is_empty() {
        None
    } else {
        let sum: i64 = matched
            .iter()
            .map(|s| s.received_at.unwrap_or(s.sent_at) - s.sent_at)
            .sum();
        let mean = sum / matched.len() as i64;
        (mean > 0).then(|| Duration::from_nanos(mean as u64))
    };

    ProbeReport {
        bandwidth_sent_mbps: sent_interval
            .map(|ns| bandwidth_mbps(packet_size, ns))
            .unwrap_or(0.0),
        bandwidth_received_mbps: recv_interval
            .map(|ns| bandwidth_mbps(packet_size, ns))
            .unwrap_or(0.0),
        probes_sent: samples.len() as u64,
        probes_matched: matched.len() as u64,
        rtt,
        latency: rtt.map(|d| d / 2),
        insufficient: sent_interval.is_none() || recv_interval.is_none(),
    }
}

impl ProbeReport {
    /// True when the session produced a receive-side estimate. The
    /// send rate alone is not one: it is computed locally and says
    /// nothing about the path.
    pub fn has_data(&self) -> bool {
        self.bandwidth_received_mbps > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sent_at: i64, received_at: Option<i64>) -> Sample {
        Sample {
            sent_at,
            received_at,
        }
    }

    #[test]
    fn test_mean_interval_uniform_series() {
        // Uniform 1 ms spacing: mean must equal (last - first) / (n - 1).
        let times: Vec<i64> = (0..10).map(|i| i * 1_000_000).collect();
        assert_eq!(mean_interval_ns(&times), Some(1_000_000));
    }

    #[test]
    fn test_mean_interval_uses_the_given_order() {
        // Interior reordering telescopes away: (last - first) / (n - 1).
        assert_eq!(mean_interval_ns(&[1_000, 3_000, 2_000, 4_000]), Some(1_000));
        // A net-backwards sequence carries no usable signal.
        assert_eq!(mean_interval_ns(&[3_000, 1_000, 2_000]), None);
    }

    #[test]
    fn test_mean_interval_fewer_than_two() {
        assert_eq!(mean_interval_ns(&[]), None);
        assert_eq!(mean_interval_ns(&[42]), None);
    }

    #[test]
    fn test_mean_interval_zero_spread() {
        // Identical timestamps must not produce a zero divisor later.
        assert_eq!(mean_interval_ns(&[5, 5, 5]), None);
    }

    #[test]
    fn test_bandwidth_formula() {
        // 4000-byte packets at 1 ms spacing: 4000*8*1e3/1e6 = 32 Mbps.
        let mbps = bandwidth_mbps(4000, 1_000_000);
        assert!((mbps - 32.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_uniform_train() {
        // 10 packets, 1 ms send spacing, 1.2 ms receive spacing.
        let samples: Vec<Sample> = (0..10)
            .map(|i| sample(i * 1_000_000, Some(5_000_000 + i * 1_200_000)))
            .collect();
        let report = aggregate(&samples, 4000, None);
        assert!(!report.insufficient);
        assert!((report.bandwidth_sent_mbps - 32.0).abs() < 1e-9);
        assert!((report.bandwidth_received_mbps - 32.0 / 1.2).abs() < 1e-6);
        assert_eq!(report.probes_sent, 10);
        assert_eq!(report.probes_matched, 10);
        assert_eq!(report.rtt, Some(Duration::from_nanos(5_000_000 + 900_000)));
    }

    #[test]
    fn test_aggregate_prefers_peer_interval() {
        let samples: Vec<Sample> = (0..10).map(|i| sample(i * 1_000_000, None)).collect();
        let report = aggregate(&samples, 4000, Some(2_000_000));
        assert!((report.bandwidth_received_mbps - 16.0).abs() < 1e-9);
        assert_eq!(report.probes_matched, 0);
        assert!(!report.insufficient);
    }

    #[test]
    fn test_aggregate_peer_zero_interval_is_insufficient() {
        // Interval 0 is the on-wire insufficient signal from the responder.
        let samples: Vec<Sample> = (0..10).map(|i| sample(i * 1_000_000, None)).collect();
        let report = aggregate(&samples, 4000, Some(0));
        assert_eq!(report.bandwidth_received_mbps, 0.0);
        assert!(report.insufficient);
        assert!(report.bandwidth_received_mbps.is_finite());
    }

    #[test]
    fn test_aggregate_partial_collection() {
        // Only 4 of 10 probes echoed; the 4 still yield an estimate.
        let samples: Vec<Sample> = (0..10)
            .map(|i| {
                let received = (i < 4).then(|| 9_000_000 + i * 1_500_000);
                sample(i * 1_000_000, received)
            })
            .collect();
        let report = aggregate(&samples, 4000, None);
        assert_eq!(report.probes_matched, 4);
        assert!((report.bandwidth_received_mbps - 32.0 / 1.5).abs() < 1e-6);
        assert!(!report.insufficient);
    }

    #[test]
    fn test_aggregate_one_match_is_insufficient_not_a_panic() {
        let samples = vec![sample(0, Some(100)), sample(1_000, None)];
        let report = aggregate(&samples, 4000, None);
        assert!(report.insufficient);
        assert_eq!(report.bandwidth_received_mbps, 0.0);
        assert!(report.bandwidth_received_mbps.is_finite());
    }

    #[test]
    fn test_aggregate_empty() {
        let report = aggregate(&[], 4000, None);
        assert!(report.insufficient);
        assert_eq!(report.bandwidth_sent_mbps, 0.0);
        assert_eq!(report.probes_sent, 0);
        assert!(report.rtt.is_none());
    }

    #[test]
    fn test_aggregate_receive_intervals_follow_send_order() {
        // Two probes swapped in flight: the receive-side mean is taken
        // over send order, so the swap telescopes to
        // (last - first) / (n - 1) instead of spreading min-to-max.
        let samples = vec![
            sample(0, Some(5_000_000)),
            sample(1_000_000, Some(7_000_000)),
            sample(2_000_000, Some(6_000_000)),
        ];
        let report = aggregate(&samples, 4000, None);
        assert!((report.bandwidth_received_mbps - bandwidth_mbps(4000, 500_000)).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_out_of_order_arrivals() {
        // Arrival updates may land in any order; sorting by sent_at
        // keeps the interval computation stable.
        let samples = vec![
            sample(2_000_000, Some(8_000_000)),
            sample(0, Some(5_000_000)),
            sample(1_000_000, Some(6_500_000)),
        ];
        let report = aggregate(&samples, 400, None);
        assert!((report.bandwidth_sent_mbps - bandwidth_mbps(400, 1_000_000)).abs() < 1e-9);
        assert!((report.bandwidth_received_mbps - bandwidth_mbps(400, 1_500_000)).abs() < 1e-9);
    }
}
