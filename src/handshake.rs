//! Session handshake.
//!
//! Before any probe traffic is sent, the prober and responder must
//! agree on a session id and an expected packet count. The exchange is
//! a request/ack pair with a fixed ack deadline and a bounded number of
//! attempts, so total initialization delay is bounded too.
//!
//! The state machine itself is synchronous and network-free; an async
//! driver ([`establish`]) performs the socket I/O.

use crate::config::Config;
use crate::session::Session;
use crate::wire;
use crate::{Error, Result};
use log::{debug, warn};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::time;

/// Coordinator states. A fresh attempt always carries a fresh session
/// id, so a stale ack from an earlier attempt can never establish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    AwaitAck,
    Established,
    Retry,
    Failed,
}

/// Pure handshake state machine driven by the prober.
#[derive(Debug)]
pub struct HandshakeMachine {
    state: HandshakeState,
    attempts: u32,
    max_attempts: u32,
    session_id: u64,
    expected_count: u64,
}

impl HandshakeMachine {
    pub fn new(expected_count: u64, max_attempts: u32) -> Self {
        Self {
            state: HandshakeState::Init,
            attempts: 0,
            max_attempts,
            session_id: 0,
            expected_count,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Session id of the current attempt; valid once [`begin`] ran.
    ///
    /// [`begin`]: HandshakeMachine::begin
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Starts a new attempt: draws a fresh random session id, encodes
    /// the request into `buf`, and moves to `AwaitAck`. Returns the
    /// request length.
    pub fn begin(&mut self, buf: &mut [u8]) -> usize {
        debug_assert!(matches!(
            self.state,
            HandshakeState::Init | HandshakeState::Retry
        ));
        self.session_id = rand::random();
        self.state = HandshakeState::AwaitAck;
        wire::encode_handshake_request(buf, self.session_id, self.expected_count)
    }

    /// Feeds a received datagram to the machine while awaiting an ack.
    /// A malformed packet or an id mismatch counts as a failed attempt.
    pub fn on_ack(&mut self, buf: &[u8]) -> HandshakeState {
        match wire::decode_handshake(buf) {
            Ok(ack) if ack.session_id == self.session_id => {
                self.state = HandshakeState::Established;
            }
            Ok(ack) => {
                debug!(
                    "handshake ack id {:#x} does not match {:#x}",
                    ack.session_id, self.session_id
                );
                self.note_failure();
            }
            Err(e) => {
                debug!("discarding malformed handshake ack: {}", e);
                self.note_failure();
            }
        }
        self.state
    }

    /// Records an ack deadline expiry.
    pub fn on_timeout(&mut self) -> HandshakeState {
        self.note_failure();
        self.state
    }

    fn note_failure(&mut self) {
        self.attempts += 1;
        self.state = if self.attempts >= self.max_attempts {
            HandshakeState::Failed
        } else {
            HandshakeState::Retry
        };
    }
}

/// Drives the handshake over a connected socket until it is
/// established or attempts are exhausted.
pub async fn establish(
    socket: &UdpSocket,
    config: &Config,
    expected_count: u64,
) -> Result<Session> {
    let mut machine = HandshakeMachine::new(expected_count, config.retries);
    let mut send_buf = [0u8; 3 * wire::MAX_VARINT_LEN + 1];
    let mut recv_buf = [0u8; 3 * wire::MAX_VARINT_LEN + 1];

    loop {
        let len = machine.begin(&mut send_buf);
        socket.send(&send_buf[..len]).await?;
        debug!(
            "handshake attempt {}: session {:#x}, {} probes",
            machine.attempts() + 1,
            machine.session_id(),
            expected_count
        );

        let state = match time::timeout(config.handshake_timeout, socket.recv(&mut recv_buf)).await
        {
            Ok(Ok(n)) => machine.on_ack(&recv_buf[..n]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!("handshake ack deadline elapsed");
                machine.on_timeout()
            }
        };

        match state {
            HandshakeState::Established => {
                return Ok(Session {
                    id: machine.session_id(),
                    expected_count,
                    created_at: Instant::now(),
                });
            }
            HandshakeState::Retry => continue,
            HandshakeState::Failed => {
                return Err(Error::HandshakeFailed {
                    attempts: machine.attempts(),
                });
            }
            // begin()/on_ack() never leave the machine in these.
            HandshakeState::Init | HandshakeState::AwaitAck => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_ack_establishes() {
        let mut machine = HandshakeMachine::new(10, 3);
        let mut buf = [0u8; 64];
        machine.begin(&mut buf);

        let mut ack = [0u8; 64];
        let n = wire::encode_handshake_ack(&mut ack, machine.session_id());
        assert_eq!(machine.on_ack(&ack[..n]), HandshakeState::Established);
        assert_eq!(machine.attempts(), 0);
    }

    #[test]
    fn test_mismatched_ack_does_not_establish() {
        let mut machine = HandshakeMachine::new(10, 3);
        let mut buf = [0u8; 64];
        machine.begin(&mut buf);

        let mut ack = [0u8; 64];
        let n = wire::encode_handshake_ack(&mut ack, machine.session_id().wrapping_add(1));
        assert_eq!(machine.on_ack(&ack[..n]), HandshakeState::Retry);
        assert_eq!(machine.attempts(), 1);
    }

    #[test]
    fn test_malformed_ack_counts_as_attempt() {
        let mut machine = HandshakeMachine::new(10, 3);
        let mut buf = [0u8; 64];
        machine.begin(&mut buf);
        assert_eq!(machine.on_ack(&[]), HandshakeState::Retry);
        assert_eq!(machine.attempts(), 1);
    }

    #[test]
    fn test_fails_after_exactly_max_attempts() {
        let mut machine = HandshakeMachine::new(10, 3);
        let mut buf = [0u8; 64];
        for expected in [HandshakeState::Retry, HandshakeState::Retry, HandshakeState::Failed] {
            machine.begin(&mut buf);
            assert_eq!(machine.on_timeout(), expected);
        }
        assert_eq!(machine.attempts(), 3);
    }

    #[test]
    fn test_each_attempt_uses_a_fresh_id() {
        let mut machine = HandshakeMachine::new(10, 3);
        let mut buf = [0u8; 64];
        machine.begin(&mut buf);
        let first = machine.session_id();
        machine.on_timeout();
        machine.begin(&mut buf);
        assert_ne!(machine.session_id(), first);
    }

    #[test]
    fn test_stale_ack_for_previous_attempt_is_rejected() {
        let mut machine = HandshakeMachine::new(10, 5);
        let mut buf = [0u8; 64];
        machine.begin(&mut buf);
        let stale = machine.session_id();
        machine.on_timeout();
        machine.begin(&mut buf);

        let mut ack = [0u8; 64];
        let n = wire::encode_handshake_ack(&mut ack, stale);
        assert_eq!(machine.on_ack(&ack[..n]), HandshakeState::Retry);
    }

    #[tokio::test]
    async fn test_establish_times_out_against_silent_peer() {
        use std::time::Duration;

        // A bound-but-silent socket: every attempt must time out and
        // the driver must fail after exactly `retries` attempts.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(silent.local_addr().unwrap()).await.unwrap();

        let config = Config::prober("127.0.0.1".to_string(), 0)
            .with_retries(2)
            .with_handshake_timeout(Duration::from_millis(50));

        match establish(&socket, &config, 10).await {
            Err(Error::HandshakeFailed { attempts }) => assert_eq!(attempts, 2),
            other => panic!("expected HandshakeFailed, got {other:?}"),
        }
    }
}
