use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Mutex};

/// Per-rule rate limiting: at most `max_alerts` firings inside any sliding
/// window of `time_window_secs`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct ThrottleConfig {
    pub max_alerts: usize,
    pub time_window_secs: u64,
}

/// Tracks recent firing timestamps per rule id. The window map is shared
/// state guarded by one mutex; pruning happens inline on each check so
/// stale timestamps never accumulate.
#[derive(Debug, Default)]
pub struct Throttler {
    windows: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl Throttler {
    pub fn new() -> Throttler {
        Throttler::default()
    }

    /// Returns true when the rule has exhausted its window and the firing
    /// must be suppressed. Otherwise records the firing and returns false.
    pub fn should_throttle(&self, rule_id: &str, config: &ThrottleConfig) -> bool {
        self.should_throttle_at(rule_id, config, Utc::now())
    }

    fn should_throttle_at(
        &self,
        rule_id: &str,
        config: &ThrottleConfig,
        now: DateTime<Utc>,
    ) -> bool {
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(rule_id.to_owned()).or_insert_with(Vec::new);

        let cutoff = now - Duration::seconds(config.time_window_secs as i64);
        window.retain(|fired_at| *fired_at > cutoff);

        if window.len() >= config.max_alerts {
            return true;
        }
        window.push(now);
        false
    }

    /// Drops all recorded state for a rule, e.g. when it is removed.
    pub fn forget(&self, rule_id: &str) {
        self.windows.lock().unwrap().remove(rule_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: ThrottleConfig = ThrottleConfig {
        max_alerts: 3,
        time_window_secs: 300,
    };

    #[test]
    fn first_n_pass_then_throttled() {
        let throttler = Throttler::new();
        assert!(!throttler.should_throttle("r1", &CONFIG));
        assert!(!throttler.should_throttle("r1", &CONFIG));
        assert!(!throttler.should_throttle("r1", &CONFIG));
        assert!(throttler.should_throttle("r1", &CONFIG));
    }

    #[test]
    fn rules_throttle_independently() {
        let throttler = Throttler::new();
        for _ in 0..3 {
            assert!(!throttler.should_throttle("r1", &CONFIG));
        }
        assert!(throttler.should_throttle("r1", &CONFIG));
        assert!(!throttler.should_throttle("r2", &CONFIG));
    }

    #[test]
    fn window_expiry_frees_capacity() {
        let throttler = Throttler::new();
        let start = Utc::now();
        for i in 0..3 {
            assert!(!throttler.should_throttle_at(
                "r1",
                &CONFIG,
                start + Duration::seconds(i)
            ));
        }
        assert!(throttler.should_throttle_at("r1", &CONFIG, start + Duration::seconds(10)));

        // Six minutes later the window has slid past the earlier firings.
        assert!(!throttler.should_throttle_at(
            "r1",
            &CONFIG,
            start + Duration::seconds(360)
        ));
    }

    #[test]
    fn forget_clears_rule_state() {
        let throttler = Throttler::new();
        for _ in 0..3 {
            throttler.should_throttle("r1", &CONFIG);
        }
        assert!(throttler.should_throttle("r1", &CONFIG));
        throttler.forget("r1");
        assert!(!throttler.should_throttle("r1", &CONFIG));
    }
}
