use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use log::{debug, warn};

use crate::dialect::{Dialect, PreamblePlan};
use crate::driver::{DriverAdapter, DriverConnection, Statement};
use crate::error::{ConnectionPhase, DbError};
use crate::locker::AsyncLocker;
use crate::metrics::ConnectionMetrics;
use crate::modes::ExecutionType;
use crate::value::Value;

/// Observable lifecycle of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unopened,
    Open,
    Closed,
    Broken,
    Disposed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Unopened,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closed,
            3 => ConnectionState::Broken,
            _ => ConnectionState::Disposed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Unopened => 0,
            ConnectionState::Open => 1,
            ConnectionState::Closed => 2,
            ConnectionState::Broken => 3,
            ConnectionState::Disposed => 4,
        }
    }
}

/// Role a connection plays inside a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Fresh driver-pooled connection, closed on release.
    Pooled,
    /// The persistent writer of a `SingleWriter` strategy.
    Writer,
    /// The single shared connection of a `SingleConnection` strategy.
    Shared,
    /// The idle keep-alive sentinel; never handed out for execution.
    Sentinel,
}

/// A provider connection wrapped with lifecycle accounting.
///
/// Counts opens/closes into the context metrics, applies the dialect's
/// session preamble exactly once on the first successful open of this
/// physical connection, and carries the mode lock when the connection is
/// shared between tasks.
pub struct TrackedConnection {
    raw: Arc<dyn DriverConnection>,
    state: AtomicU8,
    role: ConnectionRole,
    locker: Option<Arc<AsyncLocker>>,
    metrics: Arc<ConnectionMetrics>,
}

impl TrackedConnection {
    /// Open a physical connection and apply the session preamble.
    ///
    /// The preamble flag lives on this wrapper, not on the context: a
    /// connection retired mid-lifetime is replaced by a new wrapper whose
    /// preamble runs again on its own first open.
    pub async fn open(
        adapter: &dyn DriverAdapter,
        connection_string: &str,
        dialect: &dyn Dialect,
        role: ConnectionRole,
        execution: ExecutionType,
        read_only: bool,
        metrics: Arc<ConnectionMetrics>,
    ) -> Result<Arc<Self>, DbError> {
        let raw = adapter
            .open(connection_string)
            .await
            .map_err(|e| match e {
                DbError::Driver(source) => DbError::ConnectionFailed {
                    phase: ConnectionPhase::Open,
                    role: execution,
                    source,
                },
                other => other,
            })?;

        metrics.record_open();

        let locker = match role {
            ConnectionRole::Writer => Some(AsyncLocker::new("writer")),
            ConnectionRole::Shared => Some(AsyncLocker::new("connection")),
            ConnectionRole::Pooled | ConnectionRole::Sentinel => None,
        };

        let tracked = Arc::new(Self {
            raw,
            state: AtomicU8::new(ConnectionState::Open.as_u8()),
            role,
            locker,
            metrics,
        });

        // Unopened -> Open happened above; the preamble belongs to that
        // transition and must not run again for this physical connection.
        if role != ConnectionRole::Sentinel {
            tracked
                .apply_preamble(dialect, read_only)
                .await
                .map_err(|e| {
                    tracked.mark_broken();
                    match e {
                        DbError::Driver(source) => DbError::ConnectionFailed {
                            phase: ConnectionPhase::Preamble,
                            role: execution,
                            source,
                        },
                        other => other,
                    }
                })?;
        }

        Ok(tracked)
    }

    async fn apply_preamble(&self, dialect: &dyn Dialect, read_only: bool) -> Result<(), DbError> {
        match dialect.session_preamble_plan(read_only) {
            PreamblePlan::None => Ok(()),
            PreamblePlan::Static(sql) => {
                debug!("applying session preamble for {}", dialect.product().display_name());
                self.raw.execute(&Statement::new(sql)).await.map(|_| ())
            }
            PreamblePlan::DivergenceProbe { probe, required } => {
                let observed = self.read_session_options(probe).await?;
                let mut sql = String::new();
                for (name, value) in required {
                    let diverges = observed
                        .iter()
                        .find(|(n, _)| n.eq_ignore_ascii_case(name))
                        .map(|(_, v)| !v.eq_ignore_ascii_case(value))
                        // Options the probe does not report are OFF.
                        .unwrap_or(value.eq_ignore_ascii_case("ON"));
                    if diverges {
                        sql.push_str(&format!("SET {name} {value};\n"));
                    }
                }
                if sql.is_empty() {
                    return Ok(());
                }
                debug!("session options diverged; applying:\n{sql}");
                self.raw.execute(&Statement::new(sql)).await.map(|_| ())
            }
        }
    }

    async fn read_session_options(&self, probe: &str) -> Result<Vec<(String, String)>, DbError> {
        let mut rows = self.raw.query(&Statement::new(probe)).await?;
        let mut observed = Vec::new();
        while let Some(row) = rows.next_row().await? {
            let mut iter = row.into_iter();
            let (Some(name), Some(value)) = (iter.next(), iter.next()) else {
                continue;
            };
            if let (Value::Text(name), Value::Text(value)) = (name, value) {
                observed.push((name, value));
            }
        }
        Ok(observed)
    }

    pub fn state(&self) -> ConnectionState {
        if self.raw.is_broken() && self.current_state() == ConnectionState::Open {
            return ConnectionState::Broken;
        }
        self.current_state()
    }

    fn current_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn is_write_capable(&self) -> bool {
        !matches!(self.role, ConnectionRole::Sentinel)
    }

    /// The mode lock, present only on shared connections.
    pub fn locker(&self) -> Option<&Arc<AsyncLocker>> {
        self.locker.as_ref()
    }

    pub fn raw(&self) -> &Arc<dyn DriverConnection> {
        &self.raw
    }

    fn mark_broken(&self) {
        self.state
            .store(ConnectionState::Broken.as_u8(), Ordering::SeqCst);
    }

    /// Close the physical connection, keeping the wrapper alive.
    /// Idempotent: only the transition out of Open/Broken releases the
    /// driver resource and counts the close.
    pub async fn close(&self) -> Result<(), DbError> {
        let prior = self
            .state
            .swap(ConnectionState::Closed.as_u8(), Ordering::SeqCst);
        match ConnectionState::from_u8(prior) {
            ConnectionState::Open | ConnectionState::Broken => {
                self.metrics.record_close();
                self.raw.close().await
            }
            ConnectionState::Disposed => {
                // Do not resurrect a disposed wrapper.
                self.state
                    .store(ConnectionState::Disposed.as_u8(), Ordering::SeqCst);
                Ok(())
            }
            ConnectionState::Unopened | ConnectionState::Closed => Ok(()),
        }
    }

    /// Terminal disposal. Both this and the synchronous drop path reach
    /// `Disposed` and release the driver resource exactly once.
    pub async fn dispose(&self) -> Result<(), DbError> {
        let result = self.close().await;
        self.state
            .store(ConnectionState::Disposed.as_u8(), Ordering::SeqCst);
        result
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        // Synchronous disposal path: account for the close; the raw
        // connection's own drop releases the driver resource.
        let prior = self
            .state
            .swap(ConnectionState::Disposed.as_u8(), Ordering::SeqCst);
        match ConnectionState::from_u8(prior) {
            ConnectionState::Open | ConnectionState::Broken => {
                self.metrics.record_close();
                warn!("tracked connection dropped without dispose()");
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for TrackedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedConnection")
            .field("state", &self.current_state())
            .field("role", &self.role)
            .finish()
    }
}
