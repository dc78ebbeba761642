//! Crate-level error taxonomy.
//!
//! Subsystems with OS-level failure modes carry their own error enums (see
//! [`crate::shm::ShmError`]); everything a companion can observe over the
//! control channel funnels into [`HostError`] so sessions map failures to a
//! single wire status byte.

use thiserror::Error;

/// Failures surfaced to companions and host-side callers.
#[derive(Debug, Error)]
pub enum HostError {
    /// An index or byte range fell outside the addressed block.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Revision strings disagree; the operation is refused.
    #[error("version mismatch: host has `{host}`, companion expects `{expected}`")]
    VersionMismatch { host: String, expected: String },

    /// The task does not implement the requested operation.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// The ring buffer overflowed; data was lost and the consumer must
    /// explicitly reset before reads resume.
    #[error("snapshot ring overflowed")]
    Overflow,

    /// The task aborted; the latched reason is reported verbatim.
    #[error("task aborted: {0}")]
    Aborted(String),

    /// An exclusive resource is already held.
    #[error("busy: {0}")]
    Busy(&'static str),
}

impl HostError {
    pub(crate) fn out_of_range(what: impl Into<String>) -> Self {
        HostError::OutOfRange(what.into())
    }
}
