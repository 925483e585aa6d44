use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use kgraph_core::config::FetchConfig;
use kgraph_core::{ClusterRef, FetchError, KindSelector, OwnerRef, RawResource, ValidationError};
use metrics::{counter, histogram};
use smallvec::SmallVec;
use tracing::{debug, warn};

/// One page of a list call: raw objects plus the continuation token, if any.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<serde_json::Value>,
    pub continue_token: Option<String>,
    /// Whether the listed kind is namespace-scoped.
    pub namespaced: bool,
}

/// Read-only, paginated list access to a cluster.
#[async_trait::async_trait]
pub trait ResourceLister: Send + Sync {
    async fn list_page(
        &self,
        cluster: &ClusterRef,
        selector: &KindSelector,
        continue_token: Option<&str>,
        limit: u32,
    ) -> Result<ListPage, FetchError>;
}

/// Objects of one kind, plus the ones that could not be converted.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub resources: Vec<RawResource>,
    pub invalid: Vec<ValidationError>,
}

pub struct Fetcher {
    lister: Arc<dyn ResourceLister>,
    cfg: FetchConfig,
}

impl Fetcher {
    pub fn new(lister: Arc<dyn ResourceLister>, cfg: FetchConfig) -> Self { Self { lister, cfg } }

    /// List every object matching `selector`, following continuation tokens.
    /// Any failure (including the per-kind timeout) discards the pages read so far.
    pub async fn fetch(&self, cluster: &ClusterRef, selector: &KindSelector) -> Result<FetchOutcome, FetchError> {
        let t0 = Instant::now();
        let timeout = self.cfg.timeout();
        let res = match tokio::time::timeout(timeout, self.fetch_pages(cluster, selector)).await {
            Ok(res) => res,
            Err(_) => Err(FetchError::Timeout { selector: selector.key(), after_ms: timeout.as_millis() as u64 }),
        };
        histogram!("kgraph_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(out) => {
                debug!(cluster = %cluster.name, selector = %selector.key(), items = out.resources.len(), invalid = out.invalid.len(), took_ms = %t0.elapsed().as_millis(), "fetch: ok");
            }
            Err(e) => {
                counter!("kgraph_fetch_errors_total", 1u64, "cluster" => cluster.name.clone());
                warn!(cluster = %cluster.name, error = %e, "fetch: kind skipped for this cycle");
            }
        }
        res
    }

    async fn fetch_pages(&self, cluster: &ClusterRef, selector: &KindSelector) -> Result<FetchOutcome, FetchError> {
        let mut out = FetchOutcome::default();
        let mut token: Option<String> = None;
        let mut seen_tokens: HashSet<String> = HashSet::new();
        let mut pages = 0usize;
        loop {
            if pages >= self.cfg.max_pages {
                return Err(FetchError::TooManyPages { selector: selector.key(), pages });
            }
            let page = self.lister.list_page(cluster, selector, token.as_deref(), self.cfg.page_size).await?;
            pages += 1;
            for item in &page.items {
                match raw_from_value(&cluster.name, selector, page.namespaced, item) {
                    Ok(r) => out.resources.push(r),
                    Err(e) => out.invalid.push(e),
                }
            }
            match page.continue_token.filter(|t| !t.is_empty()) {
                Some(next) => {
                    if !seen_tokens.insert(next.clone()) {
                        return Err(FetchError::PagingLoop { selector: selector.key(), token: next });
                    }
                    token = Some(next);
                }
                None => break,
            }
        }
        Ok(out)
    }
}

fn str_at<'a>(v: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|x| x.as_str())
}

fn string_map(v: Option<&serde_json::Value>) -> BTreeMap<String, String> {
    v.and_then(|m| m.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

/// Convert a listed object into a `RawResource`. `apiVersion`/`kind` fall back
/// to the selector when the list response omits them on items.
pub fn raw_from_value(
    cluster: &str,
    selector: &KindSelector,
    namespaced: bool,
    v: &serde_json::Value,
) -> Result<RawResource, ValidationError> {
    let meta = v.get("metadata").cloned().unwrap_or(serde_json::Value::Null);
    let kind = str_at(v, "kind").filter(|k| !k.is_empty()).unwrap_or(&selector.kind).to_string();
    let (api_group, api_version) = match str_at(v, "apiVersion").filter(|s| !s.is_empty()) {
        Some(av) => match av.split_once('/') {
            Some((g, ver)) => (g.to_string(), ver.to_string()),
            None => (String::new(), av.to_string()),
        },
        None => (selector.group.clone(), selector.version.clone()),
    };
    let name = str_at(&meta, "name").unwrap_or("").to_string();
    let uid = str_at(&meta, "uid").unwrap_or("").to_string();
    if uid.is_empty() {
        return Err(ValidationError::MissingUid { kind, name });
    }
    if name.is_empty() {
        return Err(ValidationError::MissingName { kind, uid });
    }
    let owner_refs: SmallVec<[OwnerRef; 2]> = meta
        .get("ownerReferences")
        .and_then(|x| x.as_array())
        .map(|owners| {
            owners
                .iter()
                .filter_map(|o| {
                    let uid = str_at(o, "uid")?.to_string();
                    Some(OwnerRef {
                        uid,
                        kind: str_at(o, "kind").unwrap_or("").to_string(),
                        name: str_at(o, "name").unwrap_or("").to_string(),
                        controller: o.get("controller").and_then(|c| c.as_bool()).unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(RawResource {
        cluster: cluster.to_string(),
        api_group,
        api_version,
        kind,
        namespaced,
        namespace: str_at(&meta, "namespace").filter(|s| !s.is_empty()).map(|s| s.to_string()),
        name,
        uid,
        resource_version: str_at(&meta, "resourceVersion").unwrap_or("").to_string(),
        owner_refs,
        labels: string_map(meta.get("labels")),
        annotations: string_map(meta.get("annotations")),
        spec: v.get("spec").cloned().unwrap_or(serde_json::Value::Null),
        status: v.get("status").cloned().unwrap_or(serde_json::Value::Null),
        selector: selector.key(),
    })
}
