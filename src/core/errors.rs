// src/core/errors.rs

//! Defines the primary error type for the crate.
//!
//! Per-command failures are not Rust errors: they travel through [`Reply`]
//! status codes so that retry and redirection logic can inspect them on the
//! reply path. `CrimsonError` covers API misuse, configuration problems and
//! protocol-level failures.
//!
//! [`Reply`]: crate::core::reply::Reply

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all failures surfaced through `Result`.
#[derive(Error, Debug)]
pub enum CrimsonError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Syntax error")]
    SyntaxError,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    #[error("Client is stopped")]
    Stopped,

    #[error("Timed out waiting for connected state ({0})")]
    WaitConnectedTimeout(String),

    #[error("Keys belong to different shards")]
    CrossShard,

    #[error("Failed to generate key for shard {0}")]
    KeyGeneration(usize),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for CrimsonError {
    fn clone(&self) -> Self {
        match self {
            CrimsonError::Io(e) => CrimsonError::Io(Arc::clone(e)),
            CrimsonError::IncompleteData => CrimsonError::IncompleteData,
            CrimsonError::ProtocolError(s) => CrimsonError::ProtocolError(s.clone()),
            CrimsonError::SyntaxError => CrimsonError::SyntaxError,
            CrimsonError::InvalidConfig(s) => CrimsonError::InvalidConfig(s.clone()),
            CrimsonError::InvalidAddress(s) => CrimsonError::InvalidAddress(s.clone()),
            CrimsonError::Stopped => CrimsonError::Stopped,
            CrimsonError::WaitConnectedTimeout(s) => CrimsonError::WaitConnectedTimeout(s.clone()),
            CrimsonError::CrossShard => CrimsonError::CrossShard,
            CrimsonError::KeyGeneration(i) => CrimsonError::KeyGeneration(*i),
            CrimsonError::Internal(s) => CrimsonError::Internal(s.clone()),
        }
    }
}

impl From<std::io::Error> for CrimsonError {
    fn from(e: std::io::Error) -> Self {
        CrimsonError::Io(Arc::new(e))
    }
}

impl From<std::num::ParseIntError> for CrimsonError {
    fn from(_: std::num::ParseIntError) -> Self {
        CrimsonError::SyntaxError
    }
}
