//! Session state shared between the burst transmitter and the arrival
//! collector.
//!
//! A [`Session`] identifies one probe attempt; its [`SampleSet`] maps
//! packet ids to send/receive timestamp pairs. The transmitter inserts
//! samples, the collector fills in arrival times, and both go through a
//! single mutex with O(1) hold times so neither side stalls the other.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Nanoseconds since the UNIX epoch, the timestamp unit used on the wire.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_nanos() as i64
}

/// One probe attempt, identified by a random 64-bit id. Ids are never
/// reused across attempts.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub expected_count: u64,
    pub created_at: Instant,
}

impl Session {
    pub fn new(expected_count: u64) -> Self {
        Self {
            id: rand::random(),
            expected_count,
            created_at: Instant::now(),
        }
    }
}

/// One probe packet's timestamp pair.
///
/// `received_at` is set at most once. On the responder side the send
/// time is unknowable, so the arrival time fills both fields and
/// sorting by `sent_at` still orders samples by observation time.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub sent_at: i64,
    pub received_at: Option<i64>,
}

#[derive(Default)]
struct SampleSetInner {
    samples: HashMap<u64, Sample>,
    matched: u64,
}

/// Thread-safe mapping from packet id to [`Sample`], owned by exactly
/// one session.
#[derive(Clone)]
pub struct SampleSet {
    inner: Arc<Mutex<SampleSetInner>>,
    expected_count: u64,
}

impl SampleSet {
    /// Pre-sized growth beyond this comes from the map itself; the
    /// expected count must never drive an up-front allocation, since
    /// the responder takes it off the wire.
    const INITIAL_CAPACITY_CAP: u64 = 1024;

    pub fn new(expected_count: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SampleSetInner {
                samples: HashMap::with_capacity(
                    expected_count.min(Self::INITIAL_CAPACITY_CAP) as usize,
                ),
                matched: 0,
            })),
            expected_count,
        }
    }

    pub fn expected_count(&self) -> u64 {
        self.expected_count
    }

    /// Records a locally transmitted probe. Must be called before the
    /// packet is placed on the wire so a matching arrival always finds
    /// its sample.
    pub fn record_sent(&self, packet_id: u64, sent_at: i64) {
        let mut inner = self.inner.lock();
        inner.samples.insert(
            packet_id,
            Sample {
                sent_at,
                received_at: None,
            },
        );
    }

    /// Records the arrival of a previously sent probe. Returns `true`
    /// only when the id is known, unmatched, and the completion target
    /// has not been reached; duplicates and foreign ids are ignored.
    pub fn record_arrival(&self, packet_id: u64, received_at: i64) -> bool {
        let mut inner = self.inner.lock();
        if inner.matched >= self.expected_count {
            return false;
        }
        match inner.samples.get_mut(&packet_id) {
            Some(sample) if sample.received_at.is_none() => {
                sample.received_at = Some(received_at);
                inner.matched += 1;
                true
            }
            _ => false,
        }
    }

    /// Records an arrival on the responder side, where the probe id was
    /// not known in advance. First sighting of an id creates a fully
    /// matched sample stamped with the arrival time.
    pub fn record_remote_arrival(&self, packet_id: u64, received_at: i64) -> bool {
        let mut inner = self.inner.lock();
        if inner.matched >= self.expected_count || inner.samples.contains_key(&packet_id) {
            return false;
        }
        inner.samples.insert(
            packet_id,
            Sample {
                sent_at: received_at,
                received_at: Some(received_at),
            },
        );
        inner.matched += 1;
        true
    }

    /// Number of samples with a recorded arrival.
    pub fn matched(&self) -> u64 {
        self.inner.lock().matched
    }

    /// Total number of samples, matched or not.
    pub fn len(&self) -> usize {
        self.inner.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_complete(&self) -> bool {
        self.matched() >= self.expected_count
    }

    /// Drops all samples, e.g. before a retried burst.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.samples.clear();
        inner.matched = 0;
    }

    /// Copies out all samples for aggregation.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.inner.lock().samples.values().copied().collect()
    }
}
