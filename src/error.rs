use thiserror::Error;

/// Errors raised while building, validating or persisting a blueprint.
#[derive(Debug, Error)]
pub enum BlueprintError {
    /// The input mesh is not flagged as readable.
    #[error("input mesh is not readable")]
    UnreadableMesh,

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("particle array `{array}` has {len} entries, expected {expected}")]
    InconsistentParticleArrays {
        array: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("{what} index {index} is out of bounds (len {len})")]
    IndexOutOfBounds {
        what: &'static str,
        index: usize,
        len: usize,
    },

    /// A job was asked for its output before it ran to completion.
    #[error("build job has not completed")]
    Incomplete,

    #[error("unsupported blueprint asset version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("blueprint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gpu buffer layout failed: {0}")]
    GpuLayout(String),
}

impl BlueprintError {
    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BlueprintError>;
