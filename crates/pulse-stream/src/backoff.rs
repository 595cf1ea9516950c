use std::time::Duration;

use pulse_core::settings::ReconnectSettings;
use rand::Rng;

/// How the stream client spaces out reconnect attempts.
///
/// Delay for the n-th consecutive failure is
/// `initial_delay * multiplier^n`, capped at `max_delay`, then spread by
/// `± jitter_factor`.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
    /// `None`: keep trying while the session stays subscribed.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: settings.initial_delay(),
            max_delay: settings.max_delay(),
            multiplier: settings.multiplier,
            jitter_factor: settings.jitter_factor,
            max_attempts: settings.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }

    /// Backoff without jitter.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exp = self.initial_delay.as_millis() as f64
            * self.multiplier.max(1.0).powi(failures.min(i32::MAX as u32) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let base = self.base_delay(failures).as_millis() as f64;
        let spread = base * self.jitter_factor.clamp(0.0, 1.0);
        if spread < 1.0 {
            return Duration::from_millis(base as u64);
        }
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((base + jitter).max(0.0) as u64)
    }
}
