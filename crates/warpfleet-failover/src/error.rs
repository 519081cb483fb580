//! Failover error types.

use std::time::Duration;

use thiserror::Error;

use warpfleet_placement::Infeasible;
use warpfleet_state::StateError;

/// Errors that can occur during a reconciliation pass.
#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("placement policy not found: {0}")]
    PolicyNotFound(String),

    #[error("{0}")]
    Infeasible(#[from] Infeasible),

    #[error("failed to delete {workload} from cluster {cluster}: {message}")]
    Delete {
        workload: String,
        cluster: String,
        message: String,
    },

    #[error("reconciliation pass timed out after {0:?}")]
    Timeout(Duration),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}

impl FailoverError {
    /// Whether this is an optimistic-concurrency conflict worth a re-read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, FailoverError::State(e) if e.is_conflict())
    }
}

pub type FailoverResult<T> = Result<T, FailoverError>;
