use std::future::Future;
use std::time::Instant;

use kgraph_core::{ClusterRef, Credentials, FetchError, KindSelector};
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Discovery, Scope},
    Client, Config,
};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::fetch::{ListPage, ResourceLister};

/// A served resource kind on one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

struct CachedClient<C> {
    fingerprint: u64,
    client: C,
    /// gvk key -> (resource, namespaced)
    resources: FxHashMap<String, (ApiResource, bool)>,
}

/// Clients per cluster name, keyed by connection fingerprint. Builds run
/// outside the lock so one slow cluster never holds up another.
struct ClientCache<C> {
    entries: Mutex<FxHashMap<String, CachedClient<C>>>,
}

impl<C> Default for ClientCache<C> {
    fn default() -> Self { Self { entries: Mutex::new(FxHashMap::default()) } }
}

impl<C: Clone> ClientCache<C> {
    async fn get_or_build<F, Fut>(&self, name: &str, fingerprint: u64, build: F) -> Result<C, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, FetchError>>,
    {
        if let Some(c) = self.entries.lock().await.get(name) {
            if c.fingerprint == fingerprint {
                return Ok(c.client.clone());
            }
            debug!(cluster = %name, "kube: connection details changed; rebuilding client");
        }
        let client = build().await?;
        let mut entries = self.entries.lock().await;
        match entries.get(name) {
            // built concurrently by another fetch
            Some(c) if c.fingerprint == fingerprint => Ok(c.client.clone()),
            _ => {
                entries.insert(
                    name.to_string(),
                    CachedClient { fingerprint, client: client.clone(), resources: FxHashMap::default() },
                );
                Ok(client)
            }
        }
    }

    async fn resource(&self, name: &str, key: &str) -> Option<(ApiResource, bool)> {
        self.entries.lock().await.get(name).and_then(|c| c.resources.get(key)).cloned()
    }

    async fn remember_resource(&self, name: &str, key: String, found: (ApiResource, bool)) {
        if let Some(c) = self.entries.lock().await.get_mut(name) {
            c.resources.insert(key, found);
        }
    }
}

/// `ResourceLister` backed by kube-rs. Clients are cached per cluster and
/// rebuilt when the cluster's URL or credentials change.
#[derive(Default)]
pub struct KubeLister {
    clients: ClientCache<Client>,
}

fn client_err(e: impl std::fmt::Display) -> FetchError {
    FetchError::Client { reason: e.to_string() }
}

impl KubeLister {
    pub fn new() -> Self { Self::default() }

    async fn client_for(&self, cluster: &ClusterRef) -> Result<Client, FetchError> {
        self.clients.get_or_build(&cluster.name, cluster.fingerprint(), || build_client(cluster)).await
    }

    async fn api_resource(
        &self,
        cluster: &ClusterRef,
        client: &Client,
        selector: &KindSelector,
    ) -> Result<(ApiResource, bool), FetchError> {
        let gvk = GroupVersionKind::gvk(&selector.group, &selector.version, &selector.kind);
        let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        if let Some(hit) = self.clients.resource(&cluster.name, &key).await {
            return Ok(hit);
        }
        let (ar, caps) = discovery::pinned_kind(client, &gvk).await.map_err(|e| match e {
            kube::Error::Discovery(_) => FetchError::NotServed { selector: selector.key() },
            other => FetchError::Api { selector: selector.key(), reason: other.to_string() },
        })?;
        let found = (ar, matches!(caps.scope, Scope::Namespaced));
        self.clients.remember_resource(&cluster.name, key, found.clone()).await;
        Ok(found)
    }

    /// Served resources (incl. CRDs) on one cluster, sorted by group/version/kind.
    pub async fn discover_kinds(&self, cluster: &ClusterRef) -> anyhow::Result<Vec<DiscoveredResource>> {
        let t0 = Instant::now();
        let client = self.client_for(cluster).await?;
        let discovery = Discovery::new(client).run().await?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                out.push(DiscoveredResource {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                });
            }
        }
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        info!(cluster = %cluster.name, count = out.len(), took_ms = %t0.elapsed().as_millis(), "kube: discovery done");
        Ok(out)
    }
}

#[async_trait::async_trait]
impl ResourceLister for KubeLister {
    async fn list_page(
        &self,
        cluster: &ClusterRef,
        selector: &KindSelector,
        continue_token: Option<&str>,
        limit: u32,
    ) -> Result<ListPage, FetchError> {
        let client = self.client_for(cluster).await?;
        let (ar, namespaced) = self.api_resource(cluster, &client, selector).await?;
        let api: Api<DynamicObject> = match (namespaced, selector.namespace.as_deref()) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        let mut lp = ListParams::default().limit(limit.max(1));
        if let Some(token) = continue_token {
            lp = lp.continue_token(token);
        }
        let list = api
            .list(&lp)
            .await
            .map_err(|e| FetchError::Api { selector: selector.key(), reason: e.to_string() })?;
        let continue_token = list.metadata.continue_.filter(|t| !t.is_empty());
        let mut items = Vec::with_capacity(list.items.len());
        for obj in &list.items {
            let mut v = serde_json::to_value(obj)
                .map_err(|e| FetchError::Api { selector: selector.key(), reason: format!("serializing object: {}", e) })?;
            if v.get("apiVersion").is_none() {
                v["apiVersion"] = serde_json::Value::String(ar.api_version.clone());
                v["kind"] = serde_json::Value::String(ar.kind.clone());
            }
            items.push(v);
        }
        Ok(ListPage { items, continue_token, namespaced })
    }
}

async fn build_client(cluster: &ClusterRef) -> Result<Client, FetchError> {
    let mut config = match &cluster.credentials {
        Credentials::Kubeconfig { path, context } => {
            let kubeconfig = match path {
                Some(p) => Kubeconfig::read_from(p).map_err(client_err)?,
                None => Kubeconfig::read().map_err(client_err)?,
            };
            let options = KubeConfigOptions { context: context.clone(), ..Default::default() };
            Config::from_custom_kubeconfig(kubeconfig, &options).await.map_err(client_err)?
        }
        Credentials::InCluster => Config::incluster().map_err(client_err)?,
        Credentials::Token { token } => token_config(cluster, Some(token)).await?,
        // The locator reads token files into `Token` on every pass.
        Credentials::TokenFile { path } => {
            return Err(client_err(format!("token file {} was not resolved by the locator", path.display())));
        }
        Credentials::Anonymous => token_config(cluster, None).await?,
    };
    config.cluster_url = cluster
        .api_base_url
        .parse()
        .map_err(|e| client_err(format!("invalid apiBaseUrl {:?}: {}", cluster.api_base_url, e)))?;
    Client::try_from(config).map_err(client_err)
}

/// Synthesize a single-context kubeconfig for a server URL and optional bearer token.
async fn token_config(cluster: &ClusterRef, token: Option<&str>) -> Result<Config, FetchError> {
    let user = match token {
        Some(t) => serde_json::json!({ "token": t }),
        None => serde_json::json!({}),
    };
    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": cluster.name, "cluster": { "server": cluster.api_base_url } }],
        "users": [{ "name": cluster.name, "user": user }],
        "contexts": [{ "name": cluster.name, "context": { "cluster": cluster.name, "user": cluster.name } }],
        "current-context": cluster.name,
    });
    let kubeconfig: Kubeconfig = serde_json::from_value(doc).map_err(client_err)?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await.map_err(client_err)
}
