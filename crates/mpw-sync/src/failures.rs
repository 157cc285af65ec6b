use std::collections::HashMap;

use tracing::warn;

/// Per-item consecutive failure counts, warning once a threshold is crossed.
#[derive(Debug, Clone)]
pub struct FailureCounter {
    threshold: u32,
    counts: HashMap<String, u32>,
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            counts: HashMap::new(),
        }
    }

    /// Seed from persisted history so restarts keep the streak.
    pub fn seed(&mut self, item_key: &str, failures: u32) {
        self.counts.insert(item_key.to_string(), failures);
    }

    pub fn record(&mut self, item_key: &str, success: bool) -> u32 {
        if success {
            self.counts.remove(item_key);
            return 0;
        }
        let count = self.counts.entry(item_key.to_string()).or_insert(0);
        *count += 1;
        if self.threshold > 0 && *count == self.threshold {
            warn!(item_key, failures = *count, "item keeps failing");
        }
        *count
    }

    pub fn count(&self, item_key: &str) -> u32 {
        self.counts.get(item_key).copied().unwrap_or(0)
    }

    pub fn over_threshold(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .counts
            .iter()
            .filter(|(_, count)| self.threshold > 0 && **count >= self.threshold)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_resets_the_streak() {
        let mut counter = FailureCounter::new(3);
        counter.seed("a", 2);
        assert_eq!(counter.record("a", false), 3);
        assert_eq!(counter.over_threshold(), vec!["a".to_string()]);
        assert_eq!(counter.record("a", true), 0);
        assert!(counter.over_threshold().is_empty());
        assert_eq!(counter.count("a"), 0);
    }

    #[test]
    fn zero_threshold_never_flags() {
        let mut counter = FailureCounter::new(0);
        counter.record("a", false);
        assert!(counter.over_threshold().is_empty());
    }
}
