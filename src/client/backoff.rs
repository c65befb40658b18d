use std::time::Duration;

/// Exponential retry delay with jitter
///
/// The nominal delay doubles from `base` up to `max`. Jitter adds up to
/// `jitter * nominal` on top, and the result is clamped so a delay is never
/// shorter than the one before it and never above `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
    previous: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
            previous: Duration::ZERO,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        let nominal = self.base.saturating_mul(factor).min(self.max);
        let jittered = nominal.mul_f64(1.0 + self.jitter * unit_jitter());
        let delay = jittered.max(self.previous).min(self.max);

        self.attempt = self.attempt.saturating_add(1);
        self.previous = delay;
        delay
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.previous = Duration::ZERO;
    }
}

/// Pseudo-random value in `[0, 1)` taken from the clock's sub-second nanos
fn unit_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos) / 1_000_000_000.0
}
