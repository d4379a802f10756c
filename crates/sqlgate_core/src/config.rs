use std::time::Duration;

use serde::Deserialize;

use crate::error::DbError;
use crate::metrics::MetricsOptions;
use crate::modes::{DbMode, ReadWriteMode};

fn default_pool_acquire_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_mode_lock_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

fn default_true() -> bool {
    true
}

/// Everything a context needs to come up.
///
/// Deserializable so hosts can bind it straight from their configuration
/// tree; `validated()` applies the documented coercions and rejects
/// contradictory settings before any connection is opened.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseContextConfiguration {
    /// Primary connection string. Required.
    pub connection_string: String,

    /// Driver key used to pick the adapter and the detection probe.
    pub provider_name: String,

    /// Optional replica/read endpoint; reads route here when present.
    pub read_only_connection_string: Option<String>,

    pub db_mode: DbMode,

    pub read_write_mode: ReadWriteMode,

    /// Prepare statements even when the dialect would skip them.
    pub force_manual_prepare: bool,

    /// Never prepare. Takes precedence over `force_manual_prepare`.
    pub disable_prepare: bool,

    pub enable_metrics: bool,

    #[serde(skip)]
    pub metrics_options: MetricsOptions,

    /// Governor bounds; `None` leaves the side unbounded.
    pub max_concurrent_reads: Option<usize>,
    pub max_concurrent_writes: Option<usize>,

    #[serde(with = "duration_secs", default = "default_pool_acquire_timeout")]
    pub pool_acquire_timeout: Duration,

    /// `None` waits forever on the mode lock.
    #[serde(with = "opt_duration_secs", default = "default_mode_lock_timeout")]
    pub mode_lock_timeout: Option<Duration>,

    #[serde(default = "default_true")]
    pub enable_pool_governor: bool,

    #[serde(default = "default_true")]
    pub enable_writer_preference: bool,

    /// Forwarded into the connection string where the provider supports it.
    pub application_name: Option<String>,
}

impl Default for DatabaseContextConfiguration {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            provider_name: String::new(),
            read_only_connection_string: None,
            db_mode: DbMode::Best,
            read_write_mode: ReadWriteMode::ReadWrite,
            force_manual_prepare: false,
            disable_prepare: false,
            enable_metrics: false,
            metrics_options: MetricsOptions::default(),
            max_concurrent_reads: None,
            max_concurrent_writes: None,
            pool_acquire_timeout: default_pool_acquire_timeout(),
            mode_lock_timeout: default_mode_lock_timeout(),
            enable_pool_governor: true,
            enable_writer_preference: true,
            application_name: None,
        }
    }
}

impl DatabaseContextConfiguration {
    pub fn new(connection_string: impl Into<String>, provider_name: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            provider_name: provider_name.into(),
            ..Self::default()
        }
    }

    /// Apply coercions and reject invalid combinations.
    pub fn validated(mut self) -> Result<Self, DbError> {
        if self.connection_string.trim().is_empty() {
            return Err(DbError::configuration("connection_string is required"));
        }
        if self.provider_name.trim().is_empty() {
            return Err(DbError::configuration("provider_name is required"));
        }
        self.metrics_options.validate().map_err(DbError::Configuration)?;

        self.read_write_mode = self.read_write_mode.normalized();

        if self.pool_acquire_timeout.is_zero() {
            return Err(DbError::configuration(
                "pool_acquire_timeout must be positive",
            ));
        }

        Ok(self)
    }

    /// Whether statement preparation is active: `disable_prepare` always
    /// wins over `force_manual_prepare`.
    pub fn prepare_enabled(&self, dialect_prepares: bool) -> bool {
        if self.disable_prepare {
            return false;
        }
        dialect_prepares || self.force_manual_prepare
    }

    /// The connection string with the application name folded in, for
    /// providers whose connection strings carry one.
    pub fn effective_connection_string(&self) -> String {
        match &self.application_name {
            Some(app) if !self.connection_string.to_ascii_lowercase().contains("application name")
                && !self.connection_string.to_ascii_lowercase().contains("application_name") =>
            {
                let mut s = self.connection_string.clone();
                if !s.is_empty() && !s.ends_with(';') {
                    s.push(';');
                }
                s.push_str(&format!("Application Name={app}"));
                s
            }
            _ => self.connection_string.clone(),
        }
    }
}

mod duration_secs {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod opt_duration_secs {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
