use rand::Rng;
use std::time::Duration;

/// Exponential backoff applied after failed receives
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of each delay that may be randomly shaved off, in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Backoff {
    settings: BackoffSettings,
    attempt: u32,
}

impl Backoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self { settings, attempt: 0 }
    }

    /// Delay before the next retry; grows until `max`
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.settings.multiplier.max(1.0).powi(self.attempt.min(32) as i32);
        // Saturates at `max` instead of overflowing `Duration`
        let base = Duration::try_from_secs_f64(self.settings.initial.as_secs_f64() * factor)
            .map_or(self.settings.max, |delay| delay.min(self.settings.max));
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.settings.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let shave = rand::rng().random_range(0.0..=jitter);
        base.mul_f64(1.0 - shave)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
