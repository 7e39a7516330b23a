//! Error types for metadata cache operations

use crate::catalog::ColumnType;
use thiserror::Error;

/// Typed failures of the cache layer.
///
/// Loader failures travel as `anyhow::Error` with context; these variants are
/// the conditions callers branch on (via `downcast_ref`).
#[derive(Debug, Error)]
pub enum MetaCacheError {
    /// The table variant or source does not implement the requested metadata
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Every worker is busy and the pool's queue is full
    #[error("executor pool {pool} is saturated")]
    ExecutorSaturated { pool: String },

    /// The pool was shut down with the manager
    #[error("executor pool {pool} is shut down")]
    ExecutorShutdown { pool: String },

    /// A partition name is not of the form `k1=v1/k2=v2`
    #[error("invalid partition name: {0}")]
    InvalidPartitionName(String),

    /// A partition value does not parse as its column type
    #[error("invalid {column_type:?} partition value '{value}'")]
    InvalidPartitionValue {
        value: String,
        column_type: ColumnType,
    },
}

impl MetaCacheError {
    /// True when the failure comes from executor backpressure rather than the source.
    pub fn is_saturation(&self) -> bool {
        matches!(
            self,
            Self::ExecutorSaturated { .. } | Self::ExecutorShutdown { .. }
        )
    }
}
