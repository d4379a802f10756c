use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::coercion::FromValue;
use crate::driver::{ColumnMeta, DriverRows};
use crate::error::DbError;
use crate::strategy::{ConnectionLease, ConnectionStrategy};
use crate::value::Value;

/// Row iterator over a result set, holding its connection lease until
/// disposed.
///
/// Callers advance with `read()` and must `dispose()` the reader before
/// the surrounding scope exits, including on cancellation and error paths;
/// the lease (and the mode-lock permit inside it, in shared modes) is not
/// released until then. A reader created inside a transaction borrows the
/// pinned connection instead and owns no lease.
pub struct TrackedReader {
    rows: Box<dyn DriverRows>,
    lease: Option<ConnectionLease>,
    strategy: Option<Arc<dyn ConnectionStrategy>>,
    current: Option<Vec<Value>>,
    by_name: HashMap<String, usize>,
    exhausted: bool,
}

impl TrackedReader {
    pub(crate) fn leased(
        rows: Box<dyn DriverRows>,
        lease: ConnectionLease,
        strategy: Arc<dyn ConnectionStrategy>,
    ) -> Self {
        let by_name = index_columns(rows.columns());
        Self {
            rows,
            lease: Some(lease),
            strategy: Some(strategy),
            current: None,
            by_name,
            exhausted: false,
        }
    }

    pub(crate) fn pinned(rows: Box<dyn DriverRows>) -> Self {
        let by_name = index_columns(rows.columns());
        Self {
            rows,
            lease: None,
            strategy: None,
            current: None,
            by_name,
            exhausted: false,
        }
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        self.rows.columns()
    }

    /// Advance to the next row; `false` once the set is exhausted.
    pub async fn read(&mut self) -> Result<bool, DbError> {
        if self.exhausted {
            return Ok(false);
        }
        match self.rows.next_row().await? {
            Some(row) => {
                self.current = Some(row);
                Ok(true)
            }
            None => {
                self.exhausted = true;
                self.current = None;
                Ok(false)
            }
        }
    }

    fn current_row(&self) -> Result<&Vec<Value>, DbError> {
        self.current
            .as_ref()
            .ok_or_else(|| DbError::driver("no current row; call read() first"))
    }

    pub fn get(&self, ordinal: usize) -> Result<&Value, DbError> {
        let row = self.current_row()?;
        row.get(ordinal)
            .ok_or_else(|| DbError::driver(format!("column ordinal {ordinal} out of range")))
    }

    pub fn get_named(&self, name: &str) -> Result<&Value, DbError> {
        let ordinal = *self
            .by_name
            .get(name)
            .ok_or_else(|| DbError::driver(format!("no column named {name:?}")))?;
        self.get(ordinal)
    }

    pub fn get_as<T: FromValue>(&self, ordinal: usize) -> Result<T, DbError> {
        T::from_value(self.get(ordinal)?.clone())
    }

    pub fn get_named_as<T: FromValue>(&self, name: &str) -> Result<T, DbError> {
        T::from_value(self.get_named(name)?.clone())
    }

    /// Take the whole current row, leaving the reader positioned on it.
    pub fn row(&self) -> Result<Vec<Value>, DbError> {
        self.current_row().cloned()
    }

    /// Release the result set and the connection lease.
    pub async fn dispose(mut self) -> Result<(), DbError> {
        // Drop the cursor before releasing the connection under it.
        drop(std::mem::replace(&mut self.rows, Box::new(EmptyRows)));
        if let (Some(lease), Some(strategy)) = (self.lease.take(), self.strategy.take()) {
            strategy.release(lease).await?;
        }
        Ok(())
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        if self.lease.is_some() {
            // The lock permit inside the lease is released by this drop;
            // the connection itself is surrendered to the driver's own
            // cleanup instead of a tracked close.
            warn!("tracked reader dropped without dispose()");
        }
    }
}

fn index_columns(columns: &[ColumnMeta]) -> HashMap<String, usize> {
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.clone(), i))
        .collect()
}

struct EmptyRows;

#[async_trait::async_trait]
impl DriverRows for EmptyRows {
    fn columns(&self) -> &[ColumnMeta] {
        &[]
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        Ok(None)
    }
}
