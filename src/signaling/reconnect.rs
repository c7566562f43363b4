use std::time::Duration;

use rand::Rng;

/// Delay schedule between signaling reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay randomly added or removed (0.0 - 1.0).
    pub jitter: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Fixed-interval, never give up. Suited to unattended kiosk clients.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: None,
        }
    }

    /// Delay before reconnect number `attempt` (0-based), or `None` once the
    /// attempt budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return Some(base);
        }

        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        Some(base.mul_f64(factor.max(0.0)))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let growth = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let scaled = self.initial_delay.as_secs_f64() * growth;
        let capped = scaled.min(self.max_delay.as_secs_f64().max(self.initial_delay.as_secs_f64()));
        Duration::from_secs_f64(capped)
    }
}
