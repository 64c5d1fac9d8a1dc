//! Delivery retry policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How often, and how far apart, a request is redelivered to a client the
/// transport cannot reach
///
/// The first delivery happens immediately. The k-th redelivery waits
/// `base_delay * multiplier^(k - 1)`, never more than `max_delay`, and is
/// spread by up to `jitter` (a fraction of the delay) in either direction.
///
/// # Example
///
/// ```
/// use fleetflow_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_base_delay(Duration::from_millis(200))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
/// assert!(!policy.has_attempts_remaining(4));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delivery attempts in total, the first one included
    pub max_attempts: u32,

    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub base_delay: Duration,

    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,

    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// 5 attempts starting at 500ms, doubling up to 30s, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Same delay before every redelivery, no jitter
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Give up after the first failed delivery
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Wait before delivery attempt `attempt`, counted from 1
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(redelivery) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };

        // Deserialized policies are unchecked: clamp to [0, max_delay]
        let max = self.max_delay.as_secs_f64();
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(0.0)
        } else {
            1.0
        };
        let delay = (self.base_delay.as_secs_f64() * multiplier.powi(redelivery as i32)).min(max);
        let delay = if delay.is_finite() { delay.max(0.0) } else { max };

        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 || delay == 0.0 {
            return Duration::from_secs_f64(delay);
        }

        let spread = delay * jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay + offset).max(0.0))
    }

    /// Whether a failed attempt number `attempts_made` may be followed by another
    pub fn has_attempts_remaining(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// `Duration` as integer milliseconds
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as integer milliseconds or null
pub(crate) mod option_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
