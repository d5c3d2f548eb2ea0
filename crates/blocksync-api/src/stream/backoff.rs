use std::time::Duration;

/// Exponential backoff configuration for stream reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum consecutive failed attempts before the connection reports
    /// persistent failure. `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    /// `true` once `attempt` consecutive failures have used up the budget.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries.is_some_and(|max| attempt >= max)
    }
}

/// Delay before reconnect attempt `attempt + 1`.
///
/// `delay = min(initial * 2^attempt, max)`
pub fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    // 2^31 already overflows any sane initial delay; clamp the shift.
    let factor = 1_u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    config
        .initial_delay
        .checked_mul(factor)
        .map_or(config.max_delay, |d| d.min(config.max_delay))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.max_retries.is_none());
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let config = ReconnectConfig::default();
        let delays: Vec<u64> = (0..8)
            .map(|k| backoff_delay(k, &config).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn backoff_matches_formula_for_every_attempt() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            max_retries: None,
        };
        for k in 0..20_u32 {
            let expected = Duration::from_millis(250)
                .checked_mul(2_u32.saturating_pow(k))
                .map_or(config.max_delay, |d| d.min(config.max_delay));
            assert_eq!(backoff_delay(k, &config), expected, "attempt {k}");
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let config = ReconnectConfig::default();
        assert_eq!(backoff_delay(u32::MAX, &config), config.max_delay);
    }

    #[test]
    fn exhaustion_respects_budget() {
        let config = ReconnectConfig {
            max_retries: Some(3),
            ..ReconnectConfig::default()
        };
        assert!(!config.exhausted(2));
        assert!(config.exhausted(3));
        assert!(!ReconnectConfig::default().exhausted(10_000));
    }
}
