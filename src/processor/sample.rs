use crate::{
    entry::{LogEntry, LogLevel},
    processor::Processor,
};
use chrono::Utc;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct SampleConfig {
    /// Probability of keeping an entry below warn level. Clamped to [0, 1].
    #[serde(default = "SampleConfig::default_rate")]
    pub rate: f64,
}

impl SampleConfig {
    fn default_rate() -> f64 {
        1.0
    }
}

impl Default for SampleConfig {
    fn default() -> Self {
        SampleConfig { rate: 1.0 }
    }
}

/// Probabilistic sampler. Entries at warn or error always pass; the rest
/// are kept with the configured probability. The RNG is private to the
/// processor and seeded from the wall clock at construction.
#[derive(Debug)]
pub struct SampleProcessor {
    rate: f64,
    rng: StdRng,
}

impl SampleProcessor {
    pub fn new(config: SampleConfig) -> SampleProcessor {
        SampleProcessor {
            rate: config.rate.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(Utc::now().timestamp_nanos() as u64),
        }
    }
}

impl Processor for SampleProcessor {
    fn kind(&self) -> &'static str {
        "sample"
    }

    fn process(&mut self, entry: LogEntry) -> Option<LogEntry> {
        if entry.level >= LogLevel::Warn {
            return Some(entry);
        }
        if self.rng.gen::<f64>() < self.rate {
            Some(entry)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_and_errors_always_pass() {
        let mut processor = SampleProcessor::new(SampleConfig { rate: 0.0 });
        for _ in 0..100 {
            assert!(processor
                .process(LogEntry::new(LogLevel::Warn, "w", "app"))
                .is_some());
            assert!(processor
                .process(LogEntry::new(LogLevel::Error, "e", "app"))
                .is_some());
        }
    }

    #[test]
    fn zero_rate_drops_info() {
        let mut processor = SampleProcessor::new(SampleConfig { rate: 0.0 });
        for _ in 0..100 {
            assert!(processor
                .process(LogEntry::new(LogLevel::Info, "i", "app"))
                .is_none());
        }
    }

    #[test]
    fn full_rate_keeps_everything() {
        let mut processor = SampleProcessor::new(SampleConfig { rate: 1.0 });
        for _ in 0..100 {
            assert!(processor
                .process(LogEntry::new(LogLevel::Debug, "d", "app"))
                .is_some());
        }
    }

    #[test]
    fn rate_is_clamped() {
        let processor = SampleProcessor::new(SampleConfig { rate: 7.5 });
        assert_eq!(processor.rate, 1.0);
        let processor = SampleProcessor::new(SampleConfig { rate: -1.0 });
        assert_eq!(processor.rate, 0.0);
    }
}
