//! Crate-wide error types.
//!
//! Mirrors the error kinds named in the design: a resolve failure, a
//! transpile failure, a cache I/O failure, a bundle-time failure and a
//! watcher-backend failure. `parseFile` swallows `ResolveError` by installing
//! a fake module instead of propagating it (see `packet::Packet::parse_file`);
//! every other kind surfaces to the caller.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("failed to read source for matching: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("cannot resolve '{specifier}' from '{from}'")]
    NotFound { specifier: String, from: String },

    #[error("no packet named '{name}' reachable from '{from}'")]
    PacketNotFound { name: String, from: String },
}

#[derive(Error, Debug)]
pub enum TranspileError {
    #[error("{file}: {message}")]
    Diagnostic { file: PathBuf, message: String },
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Transpile(#[from] TranspileError),
}

impl CacheError {
    pub fn from_transpile(err: TranspileError) -> Self {
        CacheError::Transpile(err)
    }
}

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("entry '{0}' is absent from the owning packet's files")]
    MissingEntry(String),
}

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("watcher backend failed: {0}")]
    Backend(String),
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::Backend(e.to_string())
    }
}

/// Top-level error surfaced by `App`; an HTTP layer maps this to a `500`.
#[derive(Error, Debug)]
pub enum PorterError {
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Transpile(#[from] TranspileError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PorterError>;
