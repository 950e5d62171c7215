//! Query Executor
//!
//! Sends a normalized query to the analytical backend and turns the response
//! into an `ExecutionResult` or a typed failure. No retries happen here.

pub mod engine;
pub mod result;
pub mod tinybird_engine;

pub use engine::QueryEngine;
pub use result::{ExecutionResult, QueryStatistics};
pub use tinybird_engine::TinybirdEngine;
