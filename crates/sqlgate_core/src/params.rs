use crossbeam_channel::{Receiver, Sender, bounded};

use crate::value::{DbType, Value};

/// Parameter direction; output/return directions exist for procedure
/// wrapping even though plain statements only bind inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

/// A provider parameter object.
///
/// Poolable: `reset` returns every field to its neutral state so a rented
/// instance can never leak a previous call's name or value.
#[derive(Debug, Clone, Default)]
pub struct Parameter {
    pub name: String,
    pub db_type: DbType,
    pub value: Value,
    pub direction: ParameterDirection,
    pub size: usize,
    pub precision: u8,
    pub scale: u8,
}

impl Parameter {
    pub fn new(name: impl Into<String>, db_type: DbType, value: Value) -> Self {
        let mut p = Self {
            name: name.into(),
            db_type,
            ..Self::default()
        };
        p.assign(value);
        p
    }

    /// Set the value, deriving an explicit size for string/binary payloads.
    pub fn assign(&mut self, value: Value) {
        if self.db_type.wants_explicit_size() {
            self.size = value.declared_size().max(1);
        }
        self.value = value;
    }

    /// Return to the neutral state required by the pool contract.
    pub fn reset(&mut self) {
        self.name.clear();
        self.db_type = DbType::default();
        self.value = Value::Null;
        self.direction = ParameterDirection::Input;
        self.size = 0;
        self.precision = 0;
        self.scale = 0;
    }
}

/// Bounded thread-safe reuse ring of [`Parameter`] objects.
///
/// Backed by a bounded MPMC channel: rent and return never block, and a
/// return that would exceed the cap simply drops the excess instances.
/// One pool per context; drained on context disposal.
pub struct ParameterPool {
    tx: Sender<Parameter>,
    rx: Receiver<Parameter>,
    cap: usize,
}

pub const DEFAULT_PARAMETER_POOL_CAP: usize = 100;

impl ParameterPool {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        let (tx, rx) = bounded(cap);
        Self { tx, rx, cap }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Number of pooled instances currently available.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Rent `count` parameters, each reset to the neutral state.
    ///
    /// Instances come from the ring when available and are freshly
    /// allocated otherwise.
    pub fn rent(&self, count: usize) -> Vec<Parameter> {
        let count = count.max(1);
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let mut p = self.rx.try_recv().unwrap_or_default();
            p.reset();
            out.push(p);
        }
        out
    }

    /// Clear and return parameters to the ring, dropping overflow.
    pub fn give_back(&self, params: impl IntoIterator<Item = Parameter>) {
        for mut p in params {
            p.reset();
            // Full ring: drop the instance rather than block.
            let _ = self.tx.try_send(p);
        }
    }

    /// Discard every pooled instance.
    pub fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Default for ParameterPool {
    fn default() -> Self {
        Self::new(DEFAULT_PARAMETER_POOL_CAP)
    }
}
