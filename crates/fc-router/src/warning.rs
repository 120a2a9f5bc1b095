//! In-memory warning sink.
//!
//! Components raise structured warnings here; the (out-of-scope) HTTP layer
//! reads them back. Retention is bounded by count and age, and stale entries
//! are auto-acknowledged by the periodic cleanup.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use fc_common::{Warning, WarningCategory, WarningSeverity};

#[derive(Debug, Clone)]
pub struct WarningSinkConfig {
    pub max_warnings: usize,
    /// Warnings older than this are removed by cleanup.
    pub max_warning_age_hours: i64,
    /// Unacknowledged warnings older than this are auto-acknowledged.
    pub auto_acknowledge_hours: i64,
    /// Minimum spacing between repeated warnings sharing a throttle key.
    pub throttle_window: Duration,
}

impl Default for WarningSinkConfig {
    fn default() -> Self {
        Self {
            max_warnings: 1000,
            max_warning_age_hours: 24,
            auto_acknowledge_hours: 8,
            throttle_window: Duration::from_secs(60),
        }
    }
}

pub struct WarningSink {
    warnings: RwLock<HashMap<String, Warning>>,
    last_throttled: Mutex<HashMap<String, Instant>>,
    config: WarningSinkConfig,
}

impl WarningSink {
    pub fn new(config: WarningSinkConfig) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            last_throttled: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn raise(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> String {
        let warning = Warning::new(category, severity, message.into(), source.into());
        let id = warning.id.clone();

        let mut warnings = self.warnings.write();
        if warnings.len() >= self.config.max_warnings {
            Self::evict_oldest(&mut warnings);
        }

        debug!(
            id = %id,
            category = ?category,
            severity = ?severity,
            message = %warning.message,
            "Warning raised"
        );
        warnings.insert(id.clone(), warning);
        id
    }

    /// Raise at most once per throttle window for the given key. Used for
    /// high-frequency conditions such as per-pool rate limiting.
    pub fn raise_throttled(
        &self,
        throttle_key: &str,
        category: WarningCategory,
        severity: WarningSeverity,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Option<String> {
        {
            let mut last = self.last_throttled.lock();
            let now = Instant::now();
            if let Some(previous) = last.get(throttle_key) {
                if now.duration_since(*previous) < self.config.throttle_window {
                    return None;
                }
            }
            last.insert(throttle_key.to_string(), now);
        }
        Some(self.raise(category, severity, message, source))
    }

    pub fn all(&self) -> Vec<Warning> {
        self.warnings.read().values().cloned().collect()
    }

    pub fn by_category(&self, category: WarningCategory) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.category == category)
            .cloned()
            .collect()
    }

    pub fn unacknowledged(&self) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .cloned()
            .collect()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let mut warnings = self.warnings.write();
        match warnings.get_mut(id) {
            Some(warning) => {
                warning.acknowledged = true;
                warning.acknowledged_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.warnings.read().len()
    }

    pub fn has_critical(&self) -> bool {
        self.warnings
            .read()
            .values()
            .any(|w| w.severity == WarningSeverity::Critical && !w.acknowledged)
    }

    /// Periodic maintenance: auto-acknowledge stale entries, drop old ones.
    pub fn cleanup(&self) {
        let mut warnings = self.warnings.write();
        let auto_ack_minutes = self.config.auto_acknowledge_hours * 60;
        let max_age_minutes = self.config.max_warning_age_hours * 60;
        let now = Utc::now();

        for warning in warnings.values_mut() {
            if !warning.acknowledged && warning.age_minutes() > auto_ack_minutes {
                warning.acknowledged = true;
                warning.acknowledged_at = Some(now);
            }
        }

        let before = warnings.len();
        warnings.retain(|_, w| w.age_minutes() <= max_age_minutes);
        let removed = before - warnings.len();
        if removed > 0 {
            info!(removed = removed, "Expired old warnings");
        }
    }

    fn evict_oldest(warnings: &mut HashMap<String, Warning>) {
        let to_remove = (warnings.len() / 10).max(1);
        let mut by_age: Vec<_> = warnings
            .iter()
            .map(|(id, w)| (id.clone(), w.created_at))
            .collect();
        by_age.sort_by_key(|(_, created)| *created);
        for (id, _) in by_age.into_iter().take(to_remove) {
            warnings.remove(&id);
        }
    }
}

impl Default for WarningSink {
    fn default() -> Self {
        Self::new(WarningSinkConfig::default())
    }
}
