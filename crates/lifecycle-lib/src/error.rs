//! Error taxonomy for the lifecycle manager

use crate::models::{DetectorId, NodeId};
use thiserror::Error;

/// Errors surfaced by lifecycle operations
///
/// Per-detector failures never affect other detectors; only `Config`
/// errors at startup are fatal to the process.
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    /// Model not trained yet; retry later
    #[error("model for detector {0} is not ready")]
    NotReady(DetectorId),

    /// Detector is in error cooldown
    #[error("detector {detector_id} is unhealthy: {reason}")]
    Unhealthy {
        detector_id: DetectorId,
        reason: String,
    },

    /// No ring owner can be resolved
    #[error("cluster unavailable: no nodes in membership")]
    ClusterUnavailable,

    /// Detector is owned by another node
    #[error("detector {detector_id} is owned by node {owner}")]
    NotOwner {
        detector_id: DetectorId,
        owner: NodeId,
    },

    /// Checkpoint blob could not be decoded
    #[error("checkpoint for detector {detector_id} is corrupt: {reason}")]
    CheckpointCorrupt {
        detector_id: DetectorId,
        reason: String,
    },

    /// Cold start could not produce a model
    #[error("training failed for detector {detector_id}: {reason}")]
    TrainingFailed {
        detector_id: DetectorId,
        reason: String,
    },

    /// Checkpoint I/O failed
    #[error("checkpoint store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("detector {0} not found")]
    DetectorNotFound(DetectorId),

    #[error("invalid feature vector: {0}")]
    InvalidFeatures(String),

    #[error("stat \"{0}\" does not exist")]
    UnknownStat(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LifecycleError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::NotReady(_)
                | LifecycleError::Unhealthy { .. }
                | LifecycleError::ClusterUnavailable
                | LifecycleError::StoreUnavailable(_)
        )
    }

    /// Short machine-readable kind, used in logs and HTTP bodies
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::NotReady(_) => "not_ready",
            LifecycleError::Unhealthy { .. } => "unhealthy",
            LifecycleError::ClusterUnavailable => "cluster_unavailable",
            LifecycleError::NotOwner { .. } => "not_owner",
            LifecycleError::CheckpointCorrupt { .. } => "checkpoint_corrupt",
            LifecycleError::TrainingFailed { .. } => "training_failed",
            LifecycleError::StoreUnavailable(_) => "store_unavailable",
            LifecycleError::DetectorNotFound(_) => "detector_not_found",
            LifecycleError::InvalidFeatures(_) => "invalid_features",
            LifecycleError::UnknownStat(_) => "unknown_stat",
            LifecycleError::Config(_) => "config",
        }
    }
}

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;
