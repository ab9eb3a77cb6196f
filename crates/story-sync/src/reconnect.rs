//! Reconnection backoff for the push channel.

use std::time::Duration;

use rand::Rng;

/// Exponent ceiling; past this every factor >= 2 is already beyond any sane `max_delay`.
const MAX_EXPONENT: u32 = 32;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Relative spread applied to each delay, 0.0 to 1.0
    pub jitter: f64,
    /// Attempts before giving up (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.1,
            max_attempts: Some(10),
        }
    }
}

/// Un-jittered delay before reconnect `attempt` (1-based), capped at
/// `max_delay`. A factor below 1 is treated as 1.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT) as i32;
    let factor = config.backoff_factor.max(1.0).powi(exponent);
    let max = config.max_delay.as_secs_f64();

    Duration::from_secs_f64((config.initial_delay.as_secs_f64() * factor).min(max))
}

/// Spread `delay` by up to `±jitter` of itself, never past `max_delay`.
fn apply_jitter(delay: Duration, config: &ReconnectConfig) -> Duration {
    let jitter = config.jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || delay.is_zero() {
        return delay;
    }
    let scale = rand::rng().random_range(1.0 - jitter..=1.0 + jitter);
    Duration::from_secs_f64((delay.as_secs_f64() * scale).min(config.max_delay.as_secs_f64()))
}

/// Attempt counter for one channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconnectState {
    /// Attempts made since the last successful open
    pub attempts: u32,
    /// Delay chosen for the most recent attempt
    pub current_delay: Duration,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count another attempt and return how long to wait before making it,
    /// or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self, config: &ReconnectConfig) -> Option<Duration> {
        if self.exceeded_max_attempts(config) {
            return None;
        }
        self.attempts += 1;
        self.current_delay = apply_jitter(calculate_backoff(self.attempts, config), config);
        Some(self.current_delay)
    }

    /// Reset state after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = Duration::ZERO;
    }

    /// Whether the attempt budget is spent.
    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
    }
}
