//! Fixture builders

mod fixtures;

pub use fixtures::{SessionSpec, TestDataFactory};
