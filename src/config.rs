use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Role of this process in a probe exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Initiates sessions and sends probe trains.
    Prober,
    /// Listens for sessions and measures arrivals.
    Responder,
}

/// How the responder reports arrival timing back to the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponderMode {
    /// Handshake per session, then one averaged-interval report.
    Report,
    /// Stateless: echo every datagram back with its arrival timestamp.
    /// No handshake; enables client-side latency estimation.
    Echo,
}

/// Bounded backoff applied by the orchestrator when a whole probe
/// attempt yields no usable data. The burst multiplier doubles on each
/// consecutive failure, capped at `max_multiplier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Probe attempts before giving up with whatever was collected.
    pub max_attempts: u32,
    /// Ceiling for the burst-size multiplier.
    pub max_multiplier: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_multiplier: 8,
        }
    }
}

/// Configuration for bandwidth probe sessions.
///
/// Use the builder-style methods to customize a prober or responder.
///
/// # Examples
///
/// ```
/// use bwprobe::Config;
/// use std::time::Duration;
///
/// let config = Config::prober("192.168.1.100".to_string(), 42002)
///     .with_packet_size(4000)
///     .with_packet_count(10)
///     .with_read_timeout(Duration::from_secs(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Prober or responder role
    pub mode: Mode,

    /// Port number to use
    pub port: u16,

    /// Responder address (for prober mode)
    pub server_addr: Option<String>,

    /// Bind address (for responder mode)
    pub bind_addr: Option<IpAddr>,

    /// Bytes of payload per probe packet
    pub packet_size: usize,

    /// Probe packets per session
    pub packet_count: u64,

    /// Maximum handshake attempts before a fatal failure
    pub retries: u32,

    /// Deadline for a handshake ack
    pub handshake_timeout: Duration,

    /// Collector read deadline
    pub read_timeout: Duration,

    /// Responder's overall per-session budget
    pub session_timeout: Duration,

    /// Minimal delay between probe sends (zero allowed)
    pub send_spacing: Duration,

    /// Report or echo responder behavior
    pub responder_mode: ResponderMode,

    /// Orchestrator backoff policy for empty probe attempts
    pub retry_policy: RetryPolicy,

    /// Output results in JSON format
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Prober,
            port: 42002,
            server_addr: None,
            bind_addr: None,
            packet_size: 4000,
            packet_count: 10,
            retries: 3,
            handshake_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(3),
            session_timeout: Duration::from_secs(4),
            send_spacing: Duration::from_micros(1),
            responder_mode: ResponderMode::Report,
            retry_policy: RetryPolicy::default(),
            json: false,
        }
    }
}

impl Config {
    /// Creates a prober configuration targeting `server_addr:port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use bwprobe::Config;
    ///
    /// let config = Config::prober("127.0.0.1".to_string(), 42002);
    /// assert_eq!(config.packet_count, 10);
    /// ```
    pub fn prober(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Prober,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    /// Creates a responder configuration listening on `port`.
    pub fn responder(port: u16) -> Self {
        Self {
            mode: Mode::Responder,
            port,
            ..Default::default()
        }
    }

    /// Sets the probe packet payload size in bytes.
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Sets the number of probe packets per session.
    pub fn with_packet_count(mut self, count: u64) -> Self {
        self.packet_count = count;
        self
    }

    /// Sets the maximum number of handshake attempts.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the handshake ack deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the arrival collector's read deadline.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the responder's overall per-session budget.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets the minimal inter-send delay for the probe train.
    pub fn with_send_spacing(mut self, spacing: Duration) -> Self {
        self.send_spacing = spacing;
        self
    }

    /// Selects report or echo behavior for the responder.
    pub fn with_responder_mode(mut self, mode: ResponderMode) -> Self {
        self.responder_mode = mode;
        self
    }

    /// Replaces the orchestrator's retry/backoff policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Enables or disables JSON output.
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Size in bytes of a probe datagram, including the terminator.
    pub fn probe_datagram_len(&self) -> usize {
        self.packet_size + 1
    }
}
