use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Tunables for the identification task manager. All fields have sensible
/// defaults; deployments override them selectively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifySettings {
    pub permits: PermitSettings,
    pub refresh: RefreshSettings,
    pub persist: PersistSettings,
    /// Capacity of the identification result queue.
    pub queue_capacity: usize,
}

impl Default for IdentifySettings {
    fn default() -> Self {
        IdentifySettings {
            permits: PermitSettings::default(),
            refresh: RefreshSettings::default(),
            persist: PersistSettings::default(),
            queue_capacity: 256,
        }
    }
}

/// Bounded-concurrency permit counts. Tasks are unbounded in number but
/// bounded in active work through these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermitSettings {
    /// Concurrent provider queries across all tasks.
    pub identification: usize,
    /// Extra gate for refresh queries from tasks that already hold an
    /// identification, so first-time identifications are never starved.
    pub low_priority: usize,
    /// Concurrent store operations.
    pub database: usize,
}

impl Default for PermitSettings {
    fn default() -> Self {
        PermitSettings {
            identification: 6,
            low_priority: 3,
            database: 2,
        }
    }
}

/// Refresh scheduling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// Seconds between successful refreshes. Default 14 days.
    pub standard_secs: u64,
    /// Seconds to back off after a provider failure. Default 2 hours.
    pub error_secs: u64,
    pub growth: RefreshGrowth,
}

impl RefreshSettings {
    pub fn standard(&self) -> Duration {
        Duration::seconds(self.standard_secs as i64)
    }

    pub fn error(&self) -> Duration {
        Duration::seconds(self.error_secs as i64)
    }
}

impl Default for RefreshSettings {
    fn default() -> Self {
        RefreshSettings {
            standard_secs: 14 * 24 * 60 * 60,
            error_secs: 2 * 60 * 60,
            growth: RefreshGrowth::default(),
        }
    }
}

/// Optional multiplicative refresh growth. When enabled, each successful
/// refresh multiplies the interval by a random factor in
/// `[min_factor, max_factor]`, clamped to `[floor_secs, ceiling_secs]`.
/// Policy only; persisted schedules do not depend on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshGrowth {
    pub enabled: bool,
    pub min_factor: f64,
    pub max_factor: f64,
    /// Default 6 hours.
    pub floor_secs: u64,
    /// Default 90 days.
    pub ceiling_secs: u64,
}

impl RefreshGrowth {
    /// Next refresh interval after a successful cycle. Identity when the
    /// policy is disabled.
    pub fn next_interval(&self, current: Duration) -> Duration {
        if !self.enabled {
            return current;
        }
        let factor = if self.max_factor > self.min_factor {
            rand::rng().random_range(self.min_factor..=self.max_factor)
        } else {
            self.min_factor
        };
        let grown = (current.num_seconds() as f64 * factor).round() as i64;
        let clamped = grown.clamp(self.floor_secs as i64, self.ceiling_secs as i64);
        Duration::seconds(clamped)
    }
}

impl Default for RefreshGrowth {
    fn default() -> Self {
        RefreshGrowth {
            enabled: false,
            min_factor: 1.5,
            max_factor: 2.5,
            floor_secs: 6 * 60 * 60,
            ceiling_secs: 90 * 24 * 60 * 60,
        }
    }
}

/// Store persistence retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistSettings {
    /// Retried attempts before the final unconditional one.
    pub retries: u32,
    /// Fixed backoff between retried attempts, in seconds.
    pub backoff_secs: u64,
}

impl Default for PersistSettings {
    fn default() -> Self {
        PersistSettings {
            retries: 5,
            backoff_secs: 60,
        }
    }
}
