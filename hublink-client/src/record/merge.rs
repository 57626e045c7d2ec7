//! Record conflict resolution.
//!
//! When the hub reports a version conflict the record asks its merge
//! strategy for the authoritative value. The built-in strategies pick a
//! side wholesale; applications install [`RecordMergeStrategy`]
//! implementations for anything smarter. A failing strategy leaves the
//! record divergent and surfaces `VERSION_EXISTS` through the runtime
//! error sink.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("merge failed: {0}")]
pub struct MergeError(pub String);

/// Application-defined conflict resolution.
pub trait RecordMergeStrategy: Send + Sync {
    fn merge(
        &self,
        local_data: &Value,
        local_version: i64,
        remote_data: &Value,
        remote_version: i64,
    ) -> Result<Value, MergeError>;
}

#[derive(Clone)]
pub enum MergeStrategy {
    /// Adopt the remote value.
    RemoteWins,
    /// Re-assert the local value as a new version.
    LocalWins,
    Custom(Arc<dyn RecordMergeStrategy>),
}

impl MergeStrategy {
    pub(crate) fn resolve(
        &self,
        local_data: &Value,
        local_version: i64,
        remote_data: &Value,
        remote_version: i64,
    ) -> Result<Value, MergeError> {
        match self {
            MergeStrategy::RemoteWins => Ok(remote_data.clone()),
            MergeStrategy::LocalWins => Ok(local_data.clone()),
            MergeStrategy::Custom(strategy) => {
                strategy.merge(local_data, local_version, remote_data, remote_version)
            }
        }
    }
}

impl fmt::Debug for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::RemoteWins => f.write_str("RemoteWins"),
            MergeStrategy::LocalWins => f.write_str("LocalWins"),
            MergeStrategy::Custom(_) => f.write_str("Custom"),
        }
    }
}
