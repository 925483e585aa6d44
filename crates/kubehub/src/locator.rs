use std::collections::HashSet;
use std::sync::Arc;

use kgraph_core::config::ClusterDefinition;
use kgraph_core::{ClusterRef, ConfigError, Credentials, CycleFatalError};
use tracing::{debug, warn};

/// Source of dynamically discovered clusters (e.g. a fleet registry).
#[async_trait::async_trait]
pub trait ClusterDiscovery: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<ClusterDefinition>>;
}

/// Discovery backed by a fixed list; handy for tests and embedding.
pub struct StaticDiscovery(pub Vec<ClusterDefinition>);

#[async_trait::async_trait]
impl ClusterDiscovery for StaticDiscovery {
    async fn discover(&self) -> anyhow::Result<Vec<ClusterDefinition>> { Ok(self.0.clone()) }
}

/// A named cluster whose definition failed to resolve this tick. It is
/// still configured; only its cycle is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedCluster {
    pub name: String,
    pub error: ConfigError,
}

/// Clusters usable for this tick plus the definitions that were skipped.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub clusters: Vec<ClusterRef>,
    pub skipped: Vec<SkippedCluster>,
    /// Every definition error, including unnamed and duplicate definitions.
    pub errors: Vec<ConfigError>,
}

/// Resolves the set of clusters and their credentials. Called on every
/// scheduler tick so that rotated tokens and added clusters are picked up.
pub struct ClusterLocator {
    statics: Vec<ClusterDefinition>,
    discovery: Option<Arc<dyn ClusterDiscovery>>,
}

impl ClusterLocator {
    pub fn new(statics: Vec<ClusterDefinition>) -> Self { Self { statics, discovery: None } }

    pub fn with_discovery(mut self, discovery: Arc<dyn ClusterDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Static definitions first, then discovered ones. A static definition
    /// shadows a discovered cluster of the same name, even when the static
    /// one fails to resolve.
    pub async fn resolve_clusters(&self) -> Result<Resolution, CycleFatalError> {
        let mut defs: Vec<(ClusterDefinition, bool)> = self.statics.iter().cloned().map(|d| (d, true)).collect();
        if let Some(discovery) = &self.discovery {
            let found = discovery
                .discover()
                .await
                .map_err(|e| CycleFatalError::LocatorUnavailable(format!("{:#}", e)))?;
            debug!(count = found.len(), "locator: discovered clusters");
            defs.extend(found.into_iter().map(|d| (d, false)));
        }

        let mut out = Resolution::default();
        let mut seen: HashSet<String> = HashSet::new();
        for (index, (def, is_static)) in defs.iter().enumerate() {
            let name = def.name.trim();
            if !is_static && seen.contains(name) {
                debug!(cluster = %name, "locator: discovered cluster shadowed by static definition");
                continue;
            }
            match resolve_one(index, def) {
                Ok(cluster) => {
                    if !seen.insert(cluster.name.clone()) {
                        let err = ConfigError::DuplicateCluster(cluster.name.clone());
                        warn!(error = %err, "locator: skipping cluster");
                        out.errors.push(err);
                        continue;
                    }
                    out.clusters.push(cluster);
                }
                Err(err) => {
                    warn!(error = %err, "locator: skipping cluster");
                    if !name.is_empty() && seen.insert(name.to_string()) {
                        out.skipped.push(SkippedCluster { name: name.to_string(), error: err.clone() });
                    }
                    out.errors.push(err);
                }
            }
        }
        Ok(out)
    }
}

fn resolve_one(index: usize, def: &ClusterDefinition) -> Result<ClusterRef, ConfigError> {
    let name = def.name.trim();
    if name.is_empty() {
        return Err(ConfigError::MissingName { index });
    }
    let url = def
        .api_base_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ConfigError::MissingBaseUrl { name: name.to_string() })?;
    validate_base_url(url)
        .map_err(|reason| ConfigError::InvalidBaseUrl { name: name.to_string(), url: url.to_string(), reason })?;
    let credentials = resolve_credentials(name, &def.credentials)?;
    Ok(ClusterRef { name: name.to_string(), api_base_url: url.trim_end_matches('/').to_string(), credentials })
}

fn validate_base_url(url: &str) -> Result<(), String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| "expected http:// or https:// scheme".to_string())?;
    let host = rest.split('/').next().unwrap_or("");
    if host.is_empty() || host.starts_with(':') {
        return Err("missing host".into());
    }
    if host.chars().any(char::is_whitespace) {
        return Err("whitespace in host".into());
    }
    Ok(())
}

/// Token files are read here, so every tick sees the current token.
fn resolve_credentials(name: &str, creds: &Credentials) -> Result<Credentials, ConfigError> {
    match creds {
        Credentials::Token { token } if token.trim().is_empty() => {
            Err(ConfigError::Credentials { name: name.to_string(), reason: "empty token".into() })
        }
        Credentials::TokenFile { path } => {
            let token = std::fs::read_to_string(path).map_err(|e| ConfigError::Credentials {
                name: name.to_string(),
                reason: format!("reading {}: {}", path.display(), e),
            })?;
            let token = token.trim();
            if token.is_empty() {
                return Err(ConfigError::Credentials { name: name.to_string(), reason: format!("{} is empty", path.display()) });
            }
            Ok(Credentials::Token { token: token.to_string() })
        }
        other => Ok(other.clone()),
    }
}
