//! Prober: client-side session orchestration.
//!
//! One probe attempt is: handshake, then a burst of probe packets sent
//! from the calling task while a spawned collector task records
//! arrivals, then aggregation of whatever matched. The two tasks share
//! only the session's [`SampleSet`] and the collector's join handle,
//! which doubles as the completion signal.
//!
//! Collection policy (prober side): partial results are kept. A read
//! deadline aborts collection and whatever was gathered is aggregated;
//! only an attempt with no usable data at all is retried, with the
//! burst size doubling per consecutive failure up to the configured
//! cap.

use crate::config::{Config, Mode, ResponderMode};
use crate::estimate::{aggregate, ProbeReport};
use crate::handshake;
use crate::session::{unix_nanos, SampleSet, Session};
use crate::wire;
use crate::{Error, Result};
use log::{debug, info, warn};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Why the arrival collector stopped.
#[derive(Debug)]
enum CollectorOutcome {
    /// The responder's final report arrived; payload is its mean
    /// receive interval in nanoseconds.
    Report(i64),
    /// Every expected probe was matched (echo-mode responder).
    Complete,
    /// The read deadline elapsed.
    Deadline,
    /// The probe was cancelled externally.
    Cancelled,
}

/// Bandwidth probe client.
///
/// Connects to a responder, runs probe sessions, and produces a
/// two-sided [`ProbeReport`].
///
/// # Examples
///
/// ```no_run
/// use bwprobe::{Config, Prober};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::prober("192.168.1.100".to_string(), 42002);
/// let prober = Prober::new(config)?;
/// let report = prober.run().await?;
/// println!("bottleneck: {:.3} Mbps", report.bandwidth_received_mbps);
/// # Ok(())
/// # }
/// ```
pub struct Prober {
    config: Config,
    cancellation_token: CancellationToken,
}

impl Prober {
    /// Creates a new prober.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the responder address is
    /// missing, the packet count is zero, or the packet size cannot
    /// hold a packet id.
    pub fn new(config: Config) -> Result<Self> {
        if config.mode != Mode::Prober || config.server_addr.is_none() {
            return Err(Error::Config(
                "responder address is required for prober mode".to_string(),
            ));
        }
        if config.packet_count == 0 {
            return Err(Error::Config("packet count must be at least 1".to_string()));
        }
        if config.packet_size < wire::MAX_VARINT_LEN {
            return Err(Error::Config(format!(
                "packet size must be at least {} bytes",
                wire::MAX_VARINT_LEN
            )));
        }
        // The responder rejects counts beyond the protocol bound, so a
        // burst grown to the backoff cap must stay under it too.
        let max_burst = config
            .packet_count
            .checked_mul(config.retry_policy.max_multiplier);
        if max_burst.map_or(true, |n| n > wire::MAX_EXPECTED_COUNT) {
            return Err(Error::Config(format!(
                "packet count times the backoff cap must not exceed {}",
                wire::MAX_EXPECTED_COUNT
            )));
        }
        Ok(Self {
            config,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Token for cancelling a running probe from another task.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Runs probe sessions until one yields data or the retry policy
    /// is exhausted.
    ///
    /// Handshake exhaustion is fatal. A session that collects partial
    /// data returns a degraded (possibly `insufficient`) report rather
    /// than an error, because partial bandwidth information is still
    /// informative.
    pub async fn run(&self) -> Result<ProbeReport> {
        let addr = self.resolve().await?;
        let socket = Arc::new(UdpSocket::bind(local_bind_addr(&addr)).await?);
        socket.connect(addr).await?;
        info!("probing {} with {}-byte packets", addr, self.config.packet_size);

        let policy = self.config.retry_policy;
        let mut multiplier: u64 = 1;
        let mut last_report = None;

        for attempt in 1..=policy.max_attempts {
            let burst = self.config.packet_count * multiplier;
            // An echo-mode responder keeps no session state and cannot
            // ack, so the session exists only on this side.
            let session = if self.config.responder_mode == ResponderMode::Echo {
                Session::new(burst)
            } else {
                handshake::establish(&socket, &self.config, burst).await?
            };
            debug!("session {:#x} established, burst {}", session.id, burst);

            let report = self.run_session(&socket, &session).await?;
            if report.has_data() {
                if report.insufficient {
                    warn!(
                        "session {:#x} degraded: {}/{} probes matched",
                        session.id, report.probes_matched, report.probes_sent
                    );
                }
                return Ok(report);
            }

            warn!(
                "attempt {}/{} collected no usable data",
                attempt, policy.max_attempts
            );
            last_report = Some(report);
            multiplier = (multiplier * 2).min(policy.max_multiplier);
        }

        // Exhausted: surface the explicit insufficient result, never a
        // fabricated number.
        Ok(last_report.unwrap_or_else(|| aggregate(&[], self.config.packet_size, None)))
    }

    /// One established session: burst out probes while the collector
    /// task records arrivals, then aggregate.
    async fn run_session(&self, socket: &Arc<UdpSocket>, session: &Session) -> Result<ProbeReport> {
        let samples = SampleSet::new(session.expected_count);

        let collector = tokio::spawn(collect_arrivals(
            socket.clone(),
            session.id,
            samples.clone(),
            self.collector_deadline(),
            self.cancellation_token.clone(),
        ));

        self.send_burst(socket, &samples).await?;

        let (outcome, peer_interval) = match collector.await {
            Ok(Ok(CollectorOutcome::Report(ns))) => (CollectorOutcome::Report(ns), Some(ns)),
            Ok(Ok(outcome)) => (outcome, None),
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(Error::Io(std::io::Error::other(e))),
        };
        debug!(
            "collection finished: {:?}, {}/{} matched",
            outcome,
            samples.matched(),
            session.expected_count
        );

        Ok(aggregate(
            &samples.snapshot(),
            self.config.packet_size,
            peer_interval,
        ))
    }

    /// Emits the probe train. Each sample is inserted into the shared
    /// set strictly before its datagram hits the wire, so a matching
    /// arrival always finds it.
    async fn send_burst(&self, socket: &UdpSocket, samples: &SampleSet) -> Result<()> {
        let mut buf = vec![0u8; self.config.probe_datagram_len()];
        for _ in 0..samples.expected_count() {
            if self.cancellation_token.is_cancelled() {
                info!("probe cancelled during burst");
                break;
            }
            let packet_id: u64 = rand::random();
            let len = wire::encode_probe(&mut buf, packet_id, self.config.packet_size);
            samples.record_sent(packet_id, unix_nanos());
            socket.send(&buf[..len]).await?;
            if !self.config.send_spacing.is_zero() {
                time::sleep(self.config.send_spacing).await;
            }
        }
        Ok(())
    }

    /// The collector must outwait a responder that stalls to its own
    /// per-session budget before sending a partial report.
    fn collector_deadline(&self) -> Duration {
        self.config.read_timeout + self.config.session_timeout
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let host = self
            .config
            .server_addr
            .as_ref()
            .ok_or_else(|| Error::Config("responder address not set".to_string()))?;
        let target = format!("{}:{}", host, self.config.port);
        // The lookup iterator borrows `target`; take the first address
        // out of it before the tail expression.
        let addr = lookup_host(&target)
            .await
            .map_err(|e| Error::AddrResolution(format!("{target}: {e}")))?
            .next();
        addr.ok_or_else(|| Error::AddrResolution(format!("{target}: no addresses")))
    }
}

/// Wildcard bind address in the peer's address family, so `connect`
/// never crosses families when resolution yields an IPv6 address.
fn local_bind_addr(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

/// Arrival collector loop. Reads datagrams with a deadline and matches
/// them against the session's pending samples:
///
/// - leading id equal to the session id: the responder's final report,
///   carrying its mean receive interval
/// - leading id present in the sample set: a probe echo; the embedded
///   peer timestamp (or the local clock when absent) becomes the
///   sample's arrival time
/// - anything else: a foreign session's packet, ignored
async fn collect_arrivals(
    socket: Arc<UdpSocket>,
    session_id: u64,
    samples: SampleSet,
    deadline: Duration,
    cancel: CancellationToken,
) -> Result<CollectorOutcome> {
    let mut buf = vec![0u8; 65536];
    loop {
        let received = tokio::select! {
            r = time::timeout(deadline, socket.recv(&mut buf)) => r,
            _ = cancel.cancelled() => return Ok(CollectorOutcome::Cancelled),
        };
        let n = match received {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(CollectorOutcome::Deadline),
        };

        let (id, consumed) = match wire::decode_packet_id(&buf[..n]) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("discarding malformed packet: {}", e);
                continue;
            }
        };

        if id == session_id {
            match wire::varint(&buf[consumed..n]) {
                Ok((interval_ns, _)) => return Ok(CollectorOutcome::Report(interval_ns)),
                Err(e) => {
                    debug!("discarding malformed report: {}", e);
                    continue;
                }
            }
        }

        // Echoes carry the peer's receive timestamp after the id.
        let received_at = match wire::varint(&buf[consumed..n]) {
            Ok((ns, _)) if ns > 0 => ns,
            _ => unix_nanos(),
        };
        if !samples.record_arrival(id, received_at) {
            debug!("ignoring packet for unknown id {:#x}", id);
            continue;
        }
        if samples.is_complete() {
            return Ok(CollectorOutcome::Complete);
        }
    }
}
