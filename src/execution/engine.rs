//! Query Engine Trait - contract for analytical backends

use crate::error::ExecutionError;
use crate::execution::result::ExecutionResult;
use crate::normalizer::NormalizedQuery;
use async_trait::async_trait;

#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Engine name (e.g., "tinybird")
    fn name(&self) -> &'static str;

    /// Run exactly the normalized text as a single query.
    async fn execute(&self, query: &NormalizedQuery) -> Result<ExecutionResult, ExecutionError>;

    /// Check if the backend is reachable and accepts the credential
    async fn health_check(&self) -> bool;
}
