//! DistError: unified error type for dist-assembly public APIs.
//!
//! Argument-validation errors (`IndexOutOfRange`, `SizeMismatch`,
//! `InvalidGhost`, ...) leave the container untouched and can be retried with
//! corrected input. Communication errors are fatal for the container that
//! raised them.

use crate::data::combine::CombineMode;
use thiserror::Error;

/// Unified error type for dist-assembly operations.
#[derive(Debug, Error)]
pub enum DistError {
    /// A global index lies outside `[0, size)`.
    #[error("index {index} out of range [0, {size})")]
    IndexOutOfRange { index: usize, size: usize },

    /// Two lengths that must agree do not.
    #[error("size mismatch in {context}: expected {expected}, got {got}")]
    SizeMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },

    /// Protocol misuse: End without Begin, mutation during Begin, double Begin.
    #[error("invalid state for `{operation}`: {detail}")]
    StateError {
        operation: &'static str,
        detail: String,
    },

    /// INSERT and ADD interleaved within one assembly cycle.
    #[error(
        "combine mode conflict: {requested:?} requested while {existing:?} is pending{}",
        peer_suffix(.peer)
    )]
    CombineModeConflict {
        existing: CombineMode,
        requested: CombineMode,
        peer: Option<usize>,
    },

    /// Transport-level failure talking to `neighbor`.
    #[error("communication with rank {neighbor} failed: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A received message did not have the negotiated byte length.
    #[error("buffer size mismatch from rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },

    /// A value does not fit its fixed-width wire field.
    #[error("{field} {value} does not fit its wire field")]
    WireOverflow { field: &'static str, value: usize },

    /// Every communication tag is leased to a live container or plan.
    #[error("communication tags exhausted: {requested} requested, {available} left")]
    TagsExhausted { requested: u16, available: u16 },

    /// A partition could not be built from the given sizes or owners.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// Ghost index list is malformed (duplicate, locally owned, out of range).
    #[error("invalid ghost index {index}: {reason}")]
    InvalidGhost { index: usize, reason: &'static str },

    /// No constructor registered under this type tag.
    #[error("unknown type tag `{0}`")]
    UnknownType(String),

    /// Binary stream does not follow the persistence format.
    #[error("format error: {0}")]
    Format(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn peer_suffix(peer: &Option<usize>) -> String {
    peer.map(|p| format!(" (from rank {p})")).unwrap_or_default()
}

impl DistError {
    pub(crate) fn state(operation: &'static str, detail: impl Into<String>) -> Self {
        DistError::StateError {
            operation,
            detail: detail.into(),
        }
    }

    pub(crate) fn comm(neighbor: usize, msg: impl Into<String>) -> Self {
        DistError::CommError {
            neighbor,
            source: msg.into().into(),
        }
    }

    /// True for errors after which the caller may retry with corrected input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DistError::IndexOutOfRange { .. }
                | DistError::SizeMismatch { .. }
                | DistError::InvalidGhost { .. }
                | DistError::UnknownType(_)
                | DistError::InvalidLayout(_)
        )
    }
}
