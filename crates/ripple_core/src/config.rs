//! Engine configuration.

use std::time::Duration;

/// Configuration for creating an engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of commit events the engine journal retains for polling.
    pub journal_history: usize,

    /// Whether every trigger of a new object is scheduled after the commit
    /// that created it.
    pub auto_start_triggers: bool,

    /// Cache evaluations slower than this log a warning.
    pub slow_evaluation_threshold: Duration,

    /// Upper bound on trigger runs per drain cycle.
    pub max_trigger_cascade: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            journal_history: 10_000,
            auto_start_triggers: true,
            slow_evaluation_threshold: Duration::from_millis(10),
            max_trigger_cascade: 1_000,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the journal history length.
    #[must_use]
    pub const fn journal_history(mut self, len: usize) -> Self {
        self.journal_history = len;
        self
    }

    /// Sets whether triggers start automatically on object creation.
    #[must_use]
    pub const fn auto_start_triggers(mut self, value: bool) -> Self {
        self.auto_start_triggers = value;
        self
    }

    /// Sets the slow evaluation warning threshold.
    #[must_use]
    pub const fn slow_evaluation_threshold(mut self, threshold: Duration) -> Self {
        self.slow_evaluation_threshold = threshold;
        self
    }

    /// Sets the maximum number of trigger runs per drain cycle.
    #[must_use]
    pub const fn max_trigger_cascade(mut self, limit: usize) -> Self {
        self.max_trigger_cascade = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.journal_history, 10_000);
        assert!(config.auto_start_triggers);
        assert_eq!(config.slow_evaluation_threshold, Duration::from_millis(10));
        assert_eq!(config.max_trigger_cascade, 1_000);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .auto_start_triggers(false)
            .journal_history(16)
            .max_trigger_cascade(8);

        assert!(!config.auto_start_triggers);
        assert_eq!(config.journal_history, 16);
        assert_eq!(config.max_trigger_cascade, 8);
    }
}
