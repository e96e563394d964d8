//! Websocket session lifecycle: connection state and reconnect backoff.

use std::time::Duration;

use crate::config::FeedConfig;

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial state before any connection attempt
    Init,
    /// TCP + TLS + WebSocket upgrade in progress
    Connecting,
    /// Actively receiving market data
    Streaming,
    /// Connection lost, waiting for backoff timer
    Reconnecting,
    /// Graceful shutdown requested
    Shutdown,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Streaming => write!(f, "STREAMING"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Reconnect delay schedule: `base * multiplier^failures`, capped at `max`,
/// then spread by `±jitter` so parallel connections do not retry in lockstep.
#[derive(Debug)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    failures: u32,
    seed: u64,
}

impl ReconnectBackoff {
    pub fn new(config: &FeedConfig) -> Self {
        let base = Duration::from_millis(config.backoff_base_ms.max(1));
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or_default();
        Self {
            base,
            max: Duration::from_millis(config.backoff_max_ms).max(base),
            multiplier: config.backoff_multiplier.max(1.0),
            jitter: config.jitter_factor.clamp(0.0, 1.0),
            failures: 0,
            seed,
        }
    }

    /// Un-jittered delay after `failures` consecutive failed attempts.
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        let factor = self.multiplier.powi(failures.min(32) as i32);
        self.base.mul_f64(factor).min(self.max)
    }

    /// Delay before the next attempt; counts one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal_delay(self.failures);
        self.failures = self.failures.saturating_add(1);

        let spread = 1.0 + self.jitter * (2.0 * self.unit_random() - 1.0);
        nominal.mul_f64(spread).max(self.base)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// splitmix64 step mapped onto `[0, 1)`.
    fn unit_random(&mut self) -> f64 {
        self.seed = self.seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.seed;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        (z >> 11) as f64 / (1u64 << 53) as f64
    }
}
