//! Pipeline Error Taxonomy
//!
//! Errors that cross pipe boundaries. Protocol drift (non-monotonic
//! timestamps, missing durations) is repaired in place and never surfaces
//! here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The environment cannot offer a required primitive. Reported at
    /// pipeline build; the builder moves on to the next candidate chain.
    #[error("environment does not support {0}")]
    Unsupported(&'static str),

    /// Setup could not negotiate a decoder or source buffer. Latches the
    /// pipe into errored state; subsequent submissions are dropped.
    #[error("configuration failed: {0}")]
    Configuration(String),

    /// A keyframe arrived without parameter sets and no description is
    /// cached, or the bitstream could not be rewritten.
    #[error("bitstream error: {0}")]
    Bitstream(String),

    /// A decoder, source buffer, or native call failed at runtime.
    #[error("resource failure: {0}")]
    Resource(String),

    /// Submission after cleanup where state mutation is refused.
    #[error("pipe is cleaned up")]
    CleanedUp,

    /// No candidate chain survived capability and codec filtering.
    #[error("no viable pipeline for the requested codecs")]
    NoPipeline,
}
