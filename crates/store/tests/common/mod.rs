#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kgraph_core::config::{ClusterDefinition, FetchConfig};
use kgraph_core::{ClusterRef, FetchError, KindSelector, DEFAULT_ANNOTATION_PREFIX};
use kgraph_entity::Normalizer;
use kgraph_kubehub::{Fetcher, ListPage, ResourceLister};
use kgraph_store::{CatalogSink, GraphIndex, Pipeline};
use serde_json::{json, Value};
use tokio::time::Instant;

pub fn roots() -> KindSelector { KindSelector::new("example.org", "v1", "XBucket") }
pub fn children() -> KindSelector { KindSelector::new("s3.aws.example.org", "v1", "Bucket") }

/// In-memory cluster API. Responses are keyed by (cluster, selector key)
/// and can be swapped between cycles.
#[derive(Default)]
pub struct FakeLister {
    responses: Mutex<HashMap<(String, String), Result<Vec<Value>, FetchError>>>,
    stalls: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl FakeLister {
    /// Every list call against `cluster` takes `d` before answering.
    pub fn stall(&self, cluster: &str, d: Duration) {
        self.stalls.lock().unwrap().insert(cluster.into(), d);
    }

    /// Distinct instants at which `cluster` was listed, i.e. cycle starts.
    pub fn cycle_starts(&self, cluster: &str) -> Vec<Instant> {
        let mut out: Vec<Instant> =
            self.calls.lock().unwrap().iter().filter(|(c, _)| c == cluster).map(|(_, at)| *at).collect();
        out.dedup();
        out
    }

    pub fn set(&self, cluster: &str, selector: &KindSelector, items: Vec<Value>) {
        self.responses.lock().unwrap().insert((cluster.into(), selector.key()), Ok(items));
    }

    pub fn fail(&self, cluster: &str, selector: &KindSelector) {
        let err = FetchError::Api { selector: selector.key(), reason: "503 Service Unavailable".into() };
        self.responses.lock().unwrap().insert((cluster.into(), selector.key()), Err(err));
    }

    /// `composites` roots, each owning `per_root` managed resources.
    pub fn seed(&self, cluster: &str, composites: usize, per_root: usize) {
        let mut roots_out = Vec::new();
        let mut children_out = Vec::new();
        for i in 0..composites {
            let root_uid = format!("{}-root-{}", cluster, i);
            roots_out.push(json!({
                "apiVersion": "example.org/v1",
                "kind": "XBucket",
                "metadata": { "name": format!("xb-{}", i), "uid": root_uid },
                "spec": { "region": "eu-west-1" }
            }));
            for j in 0..per_root {
                children_out.push(json!({
                    "apiVersion": "s3.aws.example.org/v1",
                    "kind": "Bucket",
                    "metadata": {
                        "name": format!("xb-{}-{}", i, j),
                        "uid": format!("{}-child-{}-{}", cluster, i, j),
                        "ownerReferences": [{ "uid": root_uid, "kind": "XBucket", "name": format!("xb-{}", i), "controller": true }]
                    },
                    "status": { "ready": true }
                }));
            }
        }
        self.set(cluster, &roots(), roots_out);
        self.set(cluster, &children(), children_out);
    }
}

#[async_trait::async_trait]
impl ResourceLister for FakeLister {
    async fn list_page(
        &self,
        cluster: &ClusterRef,
        selector: &KindSelector,
        _continue_token: Option<&str>,
        _limit: u32,
    ) -> Result<ListPage, FetchError> {
        self.calls.lock().unwrap().push((cluster.name.clone(), Instant::now()));
        let stall = self.stalls.lock().unwrap().get(&cluster.name).copied();
        if let Some(d) = stall {
            tokio::time::sleep(d).await;
        }
        let res = self.responses.lock().unwrap().get(&(cluster.name.clone(), selector.key())).cloned();
        match res {
            Some(Ok(items)) => Ok(ListPage { items, continue_token: None, namespaced: false }),
            Some(Err(e)) => Err(e),
            None => Ok(ListPage::default()),
        }
    }
}

pub fn pipeline(lister: Arc<FakeLister>, sink: Arc<dyn CatalogSink>, index: Arc<GraphIndex>) -> Pipeline {
    pipeline_with_fetch(lister, sink, index, FetchConfig::default())
}

pub fn pipeline_with_fetch(
    lister: Arc<FakeLister>,
    sink: Arc<dyn CatalogSink>,
    index: Arc<GraphIndex>,
    fetch: FetchConfig,
) -> Pipeline {
    let selectors = vec![roots(), children()];
    let normalizer = Normalizer::new(DEFAULT_ANNOTATION_PREFIX).with_selectors(&selectors);
    Pipeline::new(Fetcher::new(lister, fetch), selectors, normalizer, sink, index)
}

pub fn cluster(name: &str) -> ClusterRef { ClusterRef::new(name, format!("https://{}.example.org", name)) }

pub fn definition(name: &str) -> ClusterDefinition {
    ClusterDefinition { name: name.into(), api_base_url: Some(format!("https://{}.example.org", name)), ..Default::default() }
}
