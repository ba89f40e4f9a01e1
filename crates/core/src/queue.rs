//! Queue configuration.

use serde::{Deserialize, Serialize};

use crate::error::{JobError, JobForgeResult};

/// Whether a queue is eligible for dispatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    #[default]
    Active,
    Paused,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Active => "active",
            QueueState::Paused => "paused",
        }
    }
}

impl core::str::FromStr for QueueState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(QueueState::Active),
            "paused" => Ok(QueueState::Paused),
            other => Err(JobError::validation(format!("unknown queue state: {other}"))),
        }
    }
}

/// Fallback values for queues that have no stored or declared configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefaults {
    pub concurrency: u32,
    pub priority: i32,
    pub state: QueueState,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            concurrency: 10,
            priority: 0,
            state: QueueState::Active,
        }
    }
}

/// Effective configuration of a named queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Maximum jobs of this queue running at once in one worker; `0` means unlimited.
    pub concurrency: u32,
    /// Higher runs first.
    pub priority: i32,
    pub state: QueueState,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_defaults(name, &QueueDefaults::default())
    }

    pub fn from_defaults(name: impl Into<String>, defaults: &QueueDefaults) -> Self {
        Self {
            name: name.into(),
            concurrency: defaults.concurrency,
            priority: defaults.priority,
            state: defaults.state,
        }
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_state(mut self, state: QueueState) -> Self {
        self.state = state;
        self
    }

    pub fn is_paused(&self) -> bool {
        self.state == QueueState::Paused
    }

    pub fn is_unlimited(&self) -> bool {
        self.concurrency == 0
    }

    pub fn validate(&self) -> JobForgeResult<()> {
        if self.name.trim().is_empty() {
            return Err(JobError::validation("queue name must not be empty"));
        }
        // Stored as a signed integer by the relational backend.
        if i32::try_from(self.concurrency).is_err() {
            return Err(JobError::validation(format!(
                "queue {} concurrency {} is out of range",
                self.name, self.concurrency
            )));
        }
        Ok(())
    }
}

/// Validate a signed concurrency value coming from an administrative surface.
pub fn concurrency_from_i64(value: i64) -> JobForgeResult<u32> {
    if value < 0 {
        return Err(JobError::validation(format!(
            "queue concurrency must not be negative (got {value})"
        )));
    }
    u32::try_from(value)
        .ok()
        .filter(|v| i32::try_from(*v).is_ok())
        .ok_or_else(|| JobError::validation(format!("queue concurrency {value} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_ten_slots_priority_zero_active() {
        let config = QueueConfig::new("mail");
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.priority, 0);
        assert_eq!(config.state, QueueState::Active);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_means_unlimited() {
        assert!(QueueConfig::new("bulk").with_concurrency(0).is_unlimited());
    }

    #[test]
    fn validation_rejects_empty_names_and_huge_concurrency() {
        assert!(QueueConfig::new("").validate().is_err());
        assert!(QueueConfig::new("q").with_concurrency(u32::MAX).validate().is_err());
    }

    #[test]
    fn signed_concurrency_is_checked() {
        assert!(matches!(concurrency_from_i64(-1), Err(JobError::Validation(_))));
        assert_eq!(concurrency_from_i64(0).unwrap(), 0);
        assert_eq!(concurrency_from_i64(25).unwrap(), 25);
        assert!(concurrency_from_i64(i64::MAX).is_err());
    }

    #[test]
    fn queue_state_parses() {
        assert_eq!("paused".parse::<QueueState>().unwrap(), QueueState::Paused);
        assert!("stopped".parse::<QueueState>().is_err());
    }
}
