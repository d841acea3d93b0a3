//! Error kinds per the four-way split in the error-handling design: resource
//! exhaustion and invalid-argument surface as ordinary `Result`/`Option`
//! values; range/unsupported surfaces as a standalone [`StatusCode`] for the
//! crypto-shaped collaborator boundary; corruption never surfaces at all —
//! it aborts the process (see [`crate::header::fatal_corruption`]).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TtakError {
    #[error("resource exhaustion: {0}")]
    OutOfMemory(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("range or unsupported: {0:?}")]
    Unsupported(StatusCode),
}

pub type TtakResult<T> = Result<T, TtakError>;

/// Status enum distinguishing `invalid_argument` from `range`, used at the
/// crypto-collaborator boundary (unsupported block sizes, wrong key
/// lengths) where the caller wants to branch on the *kind* of rejection
/// rather than just get `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    Range,
}

impl StatusCode {
    pub fn is_ok(self) -> bool {
        matches!(self, StatusCode::Ok)
    }
}
