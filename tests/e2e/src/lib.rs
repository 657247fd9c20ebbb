//! End-to-end test support for the AIDD engine
//!
//! - `harness`: isolated temporary databases
//! - `mocks`: fixture builders for sessions, memory and candidates

pub mod harness;
pub mod mocks;

pub use harness::TestDatabaseManager;
pub use mocks::TestDataFactory;
