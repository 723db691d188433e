//! Error types for the loader and the projection extractor.

use std::convert::Infallible;

use thiserror::Error;

/// A raw key could not be normalized into the backend's identifier type.
///
/// This only ever affects the caller that supplied the key; it never reaches
/// the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed key {raw:?}: {reason}")]
pub struct MalformedKey {
    pub raw: String,
    pub reason: &'static str,
}

impl MalformedKey {
    pub fn new(raw: impl Into<String>, reason: &'static str) -> Self {
        Self {
            raw: raw.into(),
            reason,
        }
    }
}

// Lets infallible key conversions (`&str` -> `String`) go through `try_load`.
impl From<Infallible> for MalformedKey {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

/// A fetch function returned records that can't be matched to the keys it was
/// asked for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    /// The record at `position` doesn't declare a key.
    #[error("record at position {position} has no key")]
    MissingKey { position: usize },

    /// A record was returned for a key that wasn't part of the batch.
    #[error("record returned for unrequested key {key}")]
    UnexpectedKey { key: String },

    /// More than one record was returned for the same key.
    #[error("more than one record returned for key {key}")]
    DuplicateKey { key: String },
}

/// The outcome of a failed [`load`](crate::Loader::load). Not finding a record
/// is not an error; that resolves as `Ok(None)`.
///
/// Batch-level variants are cloned out to every member of the failed batch,
/// which is why the fetch function's error type must be `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    #[error(transparent)]
    MalformedKey(MalformedKey),

    /// The fetch function itself failed.
    #[error("batch fetch failed: {0}")]
    FetchFailed(E),

    #[error("fetch function broke the batch contract: {0}")]
    AdapterContractViolation(ContractViolation),
}

impl<E> LoadError<E> {
    /// True for errors shared by an entire batch, as opposed to a single
    /// caller.
    pub fn is_batch_error(&self) -> bool {
        !matches!(self, LoadError::MalformedKey(..))
    }
}

impl<E> From<MalformedKey> for LoadError<E> {
    fn from(err: MalformedKey) -> Self {
        LoadError::MalformedKey(err)
    }
}

impl<E> From<ContractViolation> for LoadError<E> {
    fn from(err: ContractViolation) -> Self {
        LoadError::AdapterContractViolation(err)
    }
}

/// Errors from turning a selection tree into a [`FieldSet`](crate::FieldSet).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    /// The selection tree can't produce a usable projection. An empty
    /// projection would strip every field from the backend's answer, so this
    /// is always reported rather than papered over.
    #[error("malformed selection at {path}: {reason}")]
    MalformedSelection { path: String, reason: String },

    #[error("no shape registered for entity {name}")]
    UnknownEntity { name: String },
}

impl SelectionError {
    pub(crate) fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        SelectionError::MalformedSelection {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from reading a [`Config`](crate::Config).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid entity shapes: {0}")]
    Shapes(#[from] SelectionError),
}
