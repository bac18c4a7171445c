//! Reconnect backoff policy for the WhatsApp-Web socket.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter and a bounded attempt count. After the
/// last attempt the provider surfaces a fatal error to its supervisor.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Jitter fraction in `0.0..=1.0`; each delay is multiplied by a random
    /// factor in `[1-jitter, 1+jitter]`.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.2,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// The deterministic delay for a zero-based attempt index, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = scaled.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// The delay for an attempt with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    }

    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(800),
            factor: 2.0,
            jitter: 0.0,
            max_attempts: 4,
        }
    }

    #[test]
    fn test_backoff_sequence_doubles_to_cap() {
        let p = policy();
        let delays: Vec<u64> = (0..4).map(|a| p.base_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let p = policy();
        assert_eq!(p.base_delay(10), Duration::from_millis(800));
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let p = policy();
        assert_eq!(p.delay(1), Duration::from_millis(200));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let p = ReconnectPolicy {
            jitter: 0.25,
            ..policy()
        };
        for _ in 0..50 {
            let d = p.delay(2).as_millis() as f64;
            assert!((300.0..=500.0).contains(&d), "delay {d} out of band");
        }
    }

    #[test]
    fn test_attempts_exhausted() {
        let p = policy();
        assert!(!p.attempts_exhausted(3));
        assert!(p.attempts_exhausted(4));
        assert!(p.attempts_exhausted(5));
    }
}
