#![allow(clippy::result_large_err)]

pub mod fake_adapter;
pub mod fixtures;

pub use fake_adapter::{FakeAdapter, FakeOutcome, FakeStats, RecordedStatement};
