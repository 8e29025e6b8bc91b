//! Responder: server-side session orchestration.
//!
//! In report mode the responder accepts one handshake at a time,
//! collects arrival timestamps for that session's probes, replies with
//! the mean receive interval, and goes back to accepting. No per-client
//! state survives a session. In echo mode it is completely stateless
//! and stamps every datagram back to its sender immediately.
//!
//! Collection policy (responder side): abort-and-report-partial. When
//! the read deadline or the per-session budget elapses, the mean over
//! whatever arrived is reported; fewer than two arrivals puts interval
//! zero on the wire, which the prober reads as the insufficient signal.

use crate::config::{Config, ResponderMode};
use crate::estimate::mean_interval_ns;
use crate::session::{unix_nanos, SampleSet};
use crate::wire;
use crate::Result;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Bandwidth probe responder.
///
/// # Examples
///
/// ```no_run
/// use bwprobe::{Config, Responder};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::responder(42002);
/// let responder = Responder::new(config);
/// responder.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Responder {
    config: Config,
    cancellation_token: CancellationToken,
}

impl Responder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Token for shutting the responder down from another task.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Binds the socket and serves sessions until cancelled.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.config
                .bind_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            self.config.port
        );
        let socket = UdpSocket::bind(&bind_addr).await?;
        self.run_on(socket).await
    }

    /// Serves sessions on an already-bound socket.
    pub async fn run_on(&self, socket: UdpSocket) -> Result<()> {
        info!(
            "responder listening on {} ({:?} mode)",
            socket.local_addr()?,
            self.config.responder_mode
        );

        match self.config.responder_mode {
            ResponderMode::Report => self.run_report(socket).await,
            ResponderMode::Echo => self.run_echo(socket).await,
        }
    }

    /// Accept loop: one handshake, one collection, one report.
    async fn run_report(&self, socket: UdpSocket) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, client) = tokio::select! {
                r = socket.recv_from(&mut buf) => r?,
                _ = self.cancellation_token.cancelled() => return Ok(()),
            };

            let hs = match wire::decode_handshake(&buf[..n]) {
                Ok(hs) => hs,
                Err(e) => {
                    debug!("ignoring non-handshake datagram from {}: {}", client, e);
                    continue;
                }
            };
            let Some(expected_count) = hs
                .expected_count
                .filter(|&c| c <= wire::MAX_EXPECTED_COUNT)
            else {
                debug!("handshake from {} lacks a valid packet count", client);
                continue;
            };

            let ack_len = wire::encode_handshake_ack(&mut buf, hs.session_id);
            socket.send_to(&buf[..ack_len], client).await?;
            info!(
                "session {:#x}: measuring {} probes from {}",
                hs.session_id, expected_count, client
            );

            let samples = SampleSet::new(expected_count);
            self.collect_session(&socket, &mut buf, client, hs.session_id, &samples)
                .await?;

            let mut times: Vec<i64> = samples
                .snapshot()
                .iter()
                .filter_map(|s| s.received_at)
                .collect();
            // Snapshot order is arbitrary; the interval is over
            // arrival order.
            times.sort_unstable();
            // Interval zero on the wire means "insufficient data".
            let interval = mean_interval_ns(&times).unwrap_or(0);
            if interval == 0 {
                warn!(
                    "session {:#x}: only {} arrivals, reporting insufficient",
                    hs.session_id,
                    times.len()
                );
            }

            let report_len = wire::encode_id_time(&mut buf, hs.session_id, interval);
            socket.send_to(&buf[..report_len], client).await?;
            info!(
                "session {:#x}: finished, {}/{} probes, interval {} ns",
                hs.session_id,
                samples.matched(),
                expected_count,
                interval
            );
        }
    }

    /// Records arrivals for one session. Only datagrams from the
    /// handshaking client count; everything else is cross-session
    /// interference and is dropped.
    async fn collect_session(
        &self,
        socket: &UdpSocket,
        buf: &mut [u8],
        client: SocketAddr,
        session_id: u64,
        samples: &SampleSet,
    ) -> Result<()> {
        let started = Instant::now();
        while !samples.is_complete() {
            let remaining = match self.config.session_timeout.checked_sub(started.elapsed()) {
                Some(d) if !d.is_zero() => d.min(self.config.read_timeout),
                _ => break,
            };
            let (n, from) = match time::timeout(remaining, socket.recv_from(buf)).await {
                Ok(r) => r?,
                Err(_) => break,
            };
            let received_at = unix_nanos();

            if from != client {
                debug!("ignoring datagram from foreign sender {}", from);
                continue;
            }

            // A repeated handshake for this session means our ack was
            // lost; re-ack without counting it as an arrival.
            if let Ok(hs) = wire::decode_handshake(&buf[..n]) {
                if hs.session_id == session_id && hs.expected_count.is_some() {
                    let ack_len = wire::encode_handshake_ack(buf, session_id);
                    socket.send_to(&buf[..ack_len], client).await?;
                    continue;
                }
            }

            match wire::decode_packet_id(&buf[..n]) {
                Ok((packet_id, _)) => {
                    samples.record_remote_arrival(packet_id, received_at);
                }
                Err(e) => debug!("discarding malformed probe: {}", e),
            }
        }
        Ok(())
    }

    /// Stateless echo loop: `[packet_id][received_at_ns][0]` straight
    /// back to the sender.
    async fn run_echo(&self, socket: UdpSocket) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        let mut reply = [0u8; 2 * wire::MAX_VARINT_LEN + 1];
        loop {
            let (n, client) = tokio::select! {
                r = socket.recv_from(&mut buf) => r?,
                _ = self.cancellation_token.cancelled() => return Ok(()),
            };
            let received_at = unix_nanos();

            match wire::decode_packet_id(&buf[..n]) {
                Ok((packet_id, _)) => {
                    let len = wire::encode_id_time(&mut reply, packet_id, received_at);
                    socket.send_to(&reply[..len], client).await?;
                }
                Err(e) => debug!("discarding malformed datagram from {}: {}", client, e),
            }
        }
    }
}
