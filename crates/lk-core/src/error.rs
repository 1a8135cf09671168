//! Error types for the storage core.

use std::io;

use thiserror::Error;

/// Errors produced while parsing an absolute URI.
///
/// These never travel past the domain utilities: callers treat a failed
/// parse as an empty host and continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UriError {
    #[error("invalid URI scheme")]
    MissingScheme,
    #[error("unexpected URI structure")]
    UnexpectedStructure,
    #[error("empty URI host")]
    EmptyHost,
}

/// Errors produced by filter store persistence.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read filter store: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write filter store: {0}")]
    Write(#[source] io::Error),
}
