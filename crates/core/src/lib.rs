//! kgraph core types: clusters, raw resources, normalized entities and deltas.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

pub mod config;
pub mod error;

pub use error::{ConfigError, CycleFatalError, FetchError, IngestError, ValidationError};

/// Default annotation namespace for synthesized entity annotations.
pub const DEFAULT_ANNOTATION_PREFIX: &str = "terasky.backstage.io";

/// Namespace segment used in entity ids for cluster-scoped kinds.
pub const CLUSTER_SCOPED: &str = "cluster-scoped";

/// How the fetcher authenticates against a cluster.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Credentials {
    /// Static bearer token.
    Token { token: String },
    /// Bearer token read from a file on every locator pass (rotation).
    #[serde(rename_all = "camelCase")]
    TokenFile { path: PathBuf },
    /// Kubeconfig file (default location when `path` is empty) and optional context.
    Kubeconfig {
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        context: Option<String>,
    },
    /// Pod service account.
    InCluster,
    /// No authentication.
    Anonymous,
}

impl Default for Credentials {
    fn default() -> Self { Credentials::Anonymous }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Token { .. } => f.write_str("Token(<redacted>)"),
            Credentials::TokenFile { path } => f.debug_struct("TokenFile").field("path", path).finish(),
            Credentials::Kubeconfig { path, context } => {
                f.debug_struct("Kubeconfig").field("path", path).field("context", context).finish()
            }
            Credentials::InCluster => f.write_str("InCluster"),
            Credentials::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// A cluster resolved for one scheduler tick.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRef {
    pub name: String,
    pub api_base_url: String,
    #[serde(skip_serializing)]
    pub credentials: Credentials,
}

impl ClusterRef {
    pub fn new(name: impl Into<String>, api_base_url: impl Into<String>) -> Self {
        Self { name: name.into(), api_base_url: api_base_url.into(), credentials: Credentials::Anonymous }
    }

    /// Fingerprint of connection details; changes when the URL or credentials rotate.
    pub fn fingerprint(&self) -> u64 {
        let creds = serde_json::to_vec(&self.credentials).unwrap_or_default();
        let mut h = Fnv64::new();
        h.write(self.name.as_bytes());
        h.write(&[0]);
        h.write(self.api_base_url.as_bytes());
        h.write(&[0]);
        h.write(&creds);
        h.finish()
    }
}

/// Which resources to list: group/version/kind plus optional namespace filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct KindSelector {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Overrides structural classification of entities from this selector.
    #[serde(default)]
    pub role: Option<EntityKind>,
}

impl KindSelector {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string(), namespace: None, role: None }
    }

    pub fn with_role(mut self, role: EntityKind) -> Self {
        self.role = Some(role);
        self
    }

    pub fn in_namespace(mut self, ns: &str) -> Self {
        self.namespace = Some(ns.to_string());
        self
    }

    /// `v1/Kind` or `group/v1/Kind`, with `@namespace` when filtered.
    pub fn key(&self) -> String {
        let gvk = if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        };
        match &self.namespace {
            Some(ns) => format!("{}@{}", gvk, ns),
            None => gvk,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

/// Owner reference as found in `metadata.ownerReferences`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub uid: String,
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub controller: bool,
}

impl OwnerRef {
    pub fn new(uid: &str, kind: &str) -> Self {
        Self { uid: uid.to_string(), kind: kind.to_string(), name: String::new(), controller: false }
    }
}

/// One object as returned by a cluster list call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawResource {
    pub cluster: String,
    pub api_group: String,
    pub api_version: String,
    pub kind: String,
    /// Whether the kind is namespace-scoped on the serving cluster.
    pub namespaced: bool,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
    pub resource_version: String,
    pub owner_refs: SmallVec<[OwnerRef; 2]>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub spec: serde_json::Value,
    pub status: serde_json::Value,
    /// Key of the selector that produced this object.
    pub selector: String,
}

impl RawResource {
    /// `group/version` or bare `version` for the core group.
    pub fn full_api_version(&self) -> String {
        if self.api_group.is_empty() { self.api_version.clone() } else { format!("{}/{}", self.api_group, self.api_version) }
    }
}

/// Catalog classification of a normalized entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Root,
    Managed,
    Composition,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum RelationType {
    OwnedBy,
    Owns,
    DependsOn,
    DependencyOf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    #[serde(rename = "type")]
    pub relation_type: RelationType,
    pub target_id: String,
}

/// Catalog-ready record derived from one cluster resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEntity {
    pub id: String,
    pub kind: EntityKind,
    pub cluster: String,
    pub namespace: Option<String>,
    pub name: String,
    pub source_api_version: String,
    pub source_kind: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub relations: Vec<Relation>,
    pub spec: serde_json::Value,
    pub status: serde_json::Value,
}

impl NormalizedEntity {
    /// Stable hash of the serialized entity, used to detect updates between cycles.
    pub fn content_hash(&self) -> u64 {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut h = Fnv64::new();
        h.write(&bytes);
        h.finish()
    }
}

/// Changes between two consecutive cycles of one cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EntityDelta {
    pub added: Vec<NormalizedEntity>,
    pub updated: Vec<NormalizedEntity>,
    pub removed: Vec<String>,
}

impl EntityDelta {
    pub fn is_empty(&self) -> bool { self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty() }
    pub fn len(&self) -> usize { self.added.len() + self.updated.len() + self.removed.len() }
}

/// Narrowest unit an error applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "level", rename_all = "camelCase")]
pub enum ErrorScope {
    Cycle,
    Cluster { cluster: String },
    Kind { cluster: String, selector: String },
    Resource { cluster: String, resource: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    Config,
    Fetch,
    Validation,
    CycleFatal,
    Sink,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleError {
    pub scope: ErrorScope,
    pub class: ErrorClass,
    pub cause: String,
}

impl CycleError {
    pub fn new(scope: ErrorScope, err: &IngestError) -> Self {
        Self { scope, class: err.class(), cause: err.to_string() }
    }
}

/// Output of one scheduler tick for one cluster.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionCycleResult {
    pub cycle_id: Uuid,
    pub cluster: ClusterRef,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: Vec<NormalizedEntity>,
    pub errors: Vec<CycleError>,
    /// Selector keys whose fetch failed this cycle.
    pub failed_selectors: BTreeSet<String>,
}

/// 64-bit FNV-1a.
#[derive(Debug, Clone, Copy)]
pub struct Fnv64(u64);

impl Fnv64 {
    pub fn new() -> Self { Self(0xcbf29ce484222325) }

    pub fn write(&mut self, bytes: &[u8]) {
        for b in bytes { self.0 ^= *b as u64; self.0 = self.0.wrapping_mul(0x100000001b3); }
    }

    pub fn finish(&self) -> u64 { self.0 }
}

impl Default for Fnv64 {
    fn default() -> Self { Self::new() }
}

pub mod prelude {
    pub use super::{
        ClusterRef, Credentials, CycleError, EntityDelta, EntityKind, ErrorClass, ErrorScope, IngestionCycleResult,
        KindSelector, NormalizedEntity, OwnerRef, RawResource, Relation, RelationType,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_keys() {
        assert_eq!(KindSelector::new("", "v1", "ConfigMap").key(), "v1/ConfigMap");
        let s = KindSelector::new("example.org", "v1alpha1", "XBucket").in_namespace("team-a");
        assert_eq!(s.key(), "example.org/v1alpha1/XBucket@team-a");
        assert_eq!(s.api_version(), "example.org/v1alpha1");
    }

    #[test]
    fn credentials_debug_redacts_token() {
        let c = Credentials::Token { token: "s3cr3t".into() };
        assert!(!format!("{:?}", c).contains("s3cr3t"));
        let mut cluster = ClusterRef::new("c1", "https://c1");
        cluster.credentials = c;
        let json = serde_json::to_string(&cluster).unwrap();
        assert!(!json.contains("s3cr3t"));
    }

    #[test]
    fn fingerprint_tracks_credential_rotation() {
        let mut a = ClusterRef::new("c1", "https://c1");
        a.credentials = Credentials::Token { token: "one".into() };
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.credentials = Credentials::Token { token: "two".into() };
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn delta_len_and_empty() {
        let d = EntityDelta::default();
        assert!(d.is_empty());
        let d = EntityDelta { removed: vec!["c/x/ns/a".into()], ..Default::default() };
        assert_eq!(d.len(), 1);
    }
}
