//! Error taxonomy. Each class maps to the narrowest scope it can affect:
//! a resource, a kind fetch, a cluster, or the whole cycle.

use thiserror::Error;

use crate::ErrorClass;

/// Bad cluster or kind configuration. The affected definition is skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cluster definition #{index} has no name")]
    MissingName { index: usize },
    #[error("cluster {name:?}: missing apiBaseUrl")]
    MissingBaseUrl { name: String },
    #[error("cluster {name:?}: invalid apiBaseUrl {url:?}: {reason}")]
    InvalidBaseUrl { name: String, url: String, reason: String },
    #[error("duplicate cluster name {0:?}")]
    DuplicateCluster(String),
    #[error("cluster {name:?}: credentials: {reason}")]
    Credentials { name: String, reason: String },
    #[error("kind selector #{index}: {reason}")]
    InvalidSelector { index: usize, reason: String },
    #[error("loading config {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Listing a kind failed. Results for that kind are discarded for the cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("{selector}: timed out after {after_ms}ms")]
    Timeout { selector: String, after_ms: u64 },
    #[error("{selector}: api error: {reason}")]
    Api { selector: String, reason: String },
    #[error("{selector}: kind is not served by the cluster")]
    NotServed { selector: String },
    #[error("client setup failed: {reason}")]
    Client { reason: String },
    #[error("{selector}: continuation token {token:?} repeated")]
    PagingLoop { selector: String, token: String },
    #[error("{selector}: exceeded {pages} pages")]
    TooManyPages { selector: String, pages: usize },
}

/// A single malformed resource. Only that resource is dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{kind} {name:?}: namespaced kind without namespace")]
    MissingNamespace { kind: String, name: String },
    #[error("{kind} (uid {uid}): missing name")]
    MissingName { kind: String, uid: String },
    #[error("{kind} {name:?}: missing uid")]
    MissingUid { kind: String, name: String },
}

/// Conditions that would corrupt a whole cycle's output; the tick is skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CycleFatalError {
    #[error("cluster locator unavailable: {0}")]
    LocatorUnavailable(String),
    #[error("cluster {0:?} is no longer resolvable")]
    ClusterVanished(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    CycleFatal(#[from] CycleFatalError),
    /// The downstream sink rejected a delta; it is re-sent next cycle.
    #[error("sink rejected delta: {0}")]
    Sink(String),
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::Config(_) => ErrorClass::Config,
            IngestError::Fetch(_) => ErrorClass::Fetch,
            IngestError::Validation(_) => ErrorClass::Validation,
            IngestError::CycleFatal(_) => ErrorClass::CycleFatal,
            IngestError::Sink(_) => ErrorClass::Sink,
        }
    }
}
