//! Error codes.
//!
//! `Res` covers the "expected, recoverable" failure class only. Contract
//! violations are plain `assert!`/`debug_assert!` rather than a checked
//! `Result`.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Res {
    #[error("generic failure")]
    Fail,
    #[error("resource temporarily unavailable (e.g. no free trace slot)")]
    Resource,
    #[error("out of memory")]
    Memory,
    #[error("a configured limit was reached")]
    Limit,
    #[error("operation not implemented")]
    Unimpl,
    #[error("I/O error")]
    Io,
    #[error("commit limit exceeded")]
    CommitLimit,
    #[error("invalid parameter")]
    Param,
}

pub type Result<T> = std::result::Result<T, Res>;
