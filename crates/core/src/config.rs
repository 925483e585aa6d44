//! Ingestion configuration: YAML file plus `KGRAPH_*` environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Credentials, EntityKind, KindSelector, DEFAULT_ANNOTATION_PREFIX};

/// One statically configured cluster. Fields are optional so that malformed
/// entries can be reported per cluster instead of failing the whole file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchConfig {
    pub page_size: u32,
    pub timeout_secs: u64,
    pub max_pages: usize,
}

impl Default for FetchConfig {
    fn default() -> Self { Self { page_size: 500, timeout_secs: 30, max_pages: 1000 } }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs.max(1)) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self { Self { base_secs: 5, max_secs: 300 } }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestConfig {
    pub clusters: Vec<ClusterDefinition>,
    pub annotation_prefix: String,
    pub interval_secs: u64,
    pub kinds: Vec<KindSelector>,
    pub fetch: FetchConfig,
    pub backoff: BackoffConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            annotation_prefix: DEFAULT_ANNOTATION_PREFIX.to_string(),
            interval_secs: 600,
            kinds: Vec::new(),
            fetch: FetchConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(s).map_err(|e| ConfigError::Load { path: "<inline>".into(), reason: e.to_string() })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load { path: path.display().to_string(), reason: e.to_string() })?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Load { path: path.display().to_string(), reason: e.to_string() })
    }

    /// Apply `KGRAPH_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|k| std::env::var(k).ok());
    }

    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("KGRAPH_INTERVAL_SECS").and_then(|s| s.parse().ok()) { self.interval_secs = v; }
        if let Some(v) = get("KGRAPH_ANNOTATION_PREFIX").filter(|s| !s.is_empty()) { self.annotation_prefix = v; }
        if let Some(v) = get("KGRAPH_PAGE_SIZE").and_then(|s| s.parse().ok()) { self.fetch.page_size = v; }
        if let Some(v) = get("KGRAPH_FETCH_TIMEOUT_SECS").and_then(|s| s.parse().ok()) { self.fetch.timeout_secs = v; }
    }

    pub fn interval(&self) -> Duration { Duration::from_secs(self.interval_secs.max(1)) }

    /// Configured selectors that pass validation, or the Crossplane/KRO defaults
    /// when none are configured. Invalid selectors are reported and skipped.
    pub fn effective_kinds(&self) -> (Vec<KindSelector>, Vec<ConfigError>) {
        if self.kinds.is_empty() {
            return (default_kinds(), Vec::new());
        }
        let mut ok = Vec::with_capacity(self.kinds.len());
        let mut errs = Vec::new();
        for (index, k) in self.kinds.iter().enumerate() {
            if k.kind.trim().is_empty() {
                errs.push(ConfigError::InvalidSelector { index, reason: "empty kind".into() });
            } else if k.version.trim().is_empty() {
                errs.push(ConfigError::InvalidSelector { index, reason: format!("{}: empty version", k.kind) });
            } else if ok.iter().any(|o: &KindSelector| o.key() == k.key()) {
                errs.push(ConfigError::InvalidSelector { index, reason: format!("duplicate selector {}", k.key()) });
            } else {
                ok.push(k.clone());
            }
        }
        (ok, errs)
    }
}

/// Crossplane compositions and KRO resource graph definitions.
pub fn default_kinds() -> Vec<KindSelector> {
    vec![
        KindSelector::new("apiextensions.crossplane.io", "v1", "Composition").with_role(EntityKind::Composition),
        KindSelector::new("kro.run", "v1alpha1", "ResourceGraphDefinition").with_role(EntityKind::Composition),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
annotationPrefix: example.io
intervalSecs: 120
clusters:
  - name: cluster-1
    apiBaseUrl: https://c1.example:6443
    credentials:
      type: token
      token: abc
  - name: cluster-2
    apiBaseUrl: https://c2.example:6443
    credentials:
      type: tokenFile
      path: /var/run/secrets/c2
kinds:
  - group: example.org
    version: v1alpha1
    kind: XDatabase
    role: root
  - group: rds.aws.upbound.io
    version: v1beta1
    kind: Instance
    namespace: infra
fetch:
  pageSize: 100
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let cfg = IngestConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.annotation_prefix, "example.io");
        assert_eq!(cfg.interval(), Duration::from_secs(120));
        assert_eq!(cfg.clusters.len(), 2);
        assert_eq!(cfg.clusters[0].credentials, Credentials::Token { token: "abc".into() });
        assert!(matches!(cfg.clusters[1].credentials, Credentials::TokenFile { .. }));
        assert_eq!(cfg.kinds[0].role, Some(EntityKind::Root));
        assert_eq!(cfg.kinds[1].namespace.as_deref(), Some("infra"));
        assert_eq!(cfg.fetch.page_size, 100);
        assert_eq!(cfg.fetch.timeout_secs, 30);
        assert_eq!(cfg.backoff, BackoffConfig::default());
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = IngestConfig::from_yaml_str("{}").unwrap();
        assert_eq!(cfg.annotation_prefix, DEFAULT_ANNOTATION_PREFIX);
        let (kinds, errs) = cfg.effective_kinds();
        assert!(errs.is_empty());
        assert_eq!(kinds, default_kinds());
    }

    #[test]
    fn invalid_selectors_are_skipped() {
        let mut cfg = IngestConfig::default();
        cfg.kinds = vec![
            KindSelector::new("a.io", "v1", "A"),
            KindSelector::new("a.io", "", "B"),
            KindSelector::new("a.io", "v1", "A"),
        ];
        let (kinds, errs) = cfg.effective_kinds();
        assert_eq!(kinds.len(), 1);
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn env_overrides() {
        let mut cfg = IngestConfig::default();
        cfg.apply_overrides(|k| match k {
            "KGRAPH_INTERVAL_SECS" => Some("42".into()),
            "KGRAPH_ANNOTATION_PREFIX" => Some("acme.io".into()),
            "KGRAPH_PAGE_SIZE" => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(cfg.interval_secs, 42);
        assert_eq!(cfg.annotation_prefix, "acme.io");
        assert_eq!(cfg.fetch.page_size, 500);
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let err = IngestConfig::from_yaml_str("clusters: [").unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
    }
}
