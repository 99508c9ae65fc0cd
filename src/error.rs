use std::path::PathBuf;
use thiserror::Error;

use crate::config::ParamGroup;

/// Errors raised by the fine-tuning library itself.
///
/// I/O failures are wrapped with `anyhow` context at the call sites instead.
#[derive(Debug, Error)]
pub enum FinetuneError {
    #[error("unsupported model: {0} (expected resnet18, resnet34, resnet50 or resnet101)")]
    UnsupportedModel(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("phase {phase} drops parameter group `{group}` trained by an earlier phase")]
    ShrinkingPhase { phase: String, group: ParamGroup },

    #[error("{path:?}:{line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("class id {id} declared twice in {path:?}")]
    DuplicateClassId { id: i64, path: PathBuf },

    #[error("dataset `{0}` has no samples")]
    EmptyDataset(String),

    #[error("model has {model} classes but the label map has {labels}")]
    ClassCountMismatch { model: usize, labels: usize },
}

pub type Result<T> = std::result::Result<T, FinetuneError>;
