#![allow(clippy::result_large_err)]

//! A SQL-first, strongly-typed data-access engine.
//!
//! The engine generates provider-correct SQL and manages connection
//! lifecycles uniformly across heterogeneous relational databases. It
//! never spawns worker threads: all concurrency derives from the caller's
//! task runtime, and cancellation follows the runtime's native discipline
//! of dropping futures.

mod audit;
mod coercion;
mod config;
mod container;
mod context;
mod data_source;
mod driver;
mod entity;
mod error;
mod gateway;
mod governor;
mod locker;
mod metrics;
mod modes;
mod params;
mod product;
mod reader;
mod strategy;
mod tracked;
mod transaction;
mod value;

pub mod dialect;

pub use audit::{AuditValueResolver, AuditValues, SystemAuditResolver};
pub use coercion::{FromValue, coerce};
pub use config::DatabaseContextConfiguration;
pub use container::SqlContainer;
pub use context::{DatabaseContext, DbContext};
pub use data_source::DataSourceInfo;
pub use dialect::{
    Dialect, DialectCapabilities, DialectFeatures, FallbackDialect, PreamblePlan, SqlFeatureTier,
    dialect_for,
};
pub use driver::{ColumnMeta, DriverAdapter, DriverConnection, DriverRows, Statement, query_scalar};
pub use entity::{
    AuditRole, ColumnBuilder, ColumnSchema, Entity, EnumRepr, MAX_MAPPED_COLUMNS, TableSchema,
    TableSchemaBuilder, TypeMapRegistry,
};
pub use error::{ConnectionPhase, DbError, DriverError, PoolSnapshot};
pub use gateway::TableGateway;
pub use governor::{GovernorPermit, PoolGovernor};
pub use locker::{AsyncLocker, LockPermit};
pub use metrics::{ConnectionMetrics, MetricsOptions};
pub use modes::{
    DbMode, ExecutionType, GeneratedKeyPlan, IsolationLevel, IsolationProfile, ProcWrappingStyle,
    ReadWriteMode, UpsertShape,
};
pub use params::{DEFAULT_PARAMETER_POOL_CAP, Parameter, ParameterDirection, ParameterPool};
pub use product::{ProductInfo, ProductVersion, SupportedDatabase};
pub use reader::TrackedReader;
pub use strategy::{
    ConnectionFactory, ConnectionLease, ConnectionStrategy, KeepAliveStrategy,
    SingleConnectionStrategy, SingleWriterStrategy, StandardStrategy, create_strategy,
    resolve_mode,
};
pub use tracked::{ConnectionRole, ConnectionState, TrackedConnection};
pub use transaction::{TransactionContext, TransactionOptions};
pub use value::{DbType, Value};

pub use chrono;
pub use uuid;
