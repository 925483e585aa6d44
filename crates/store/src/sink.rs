//! Downstream catalog sinks. Deltas are delivered at least once, so every
//! sink must treat a repeated delta with identical content as a no-op.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use kgraph_core::{EntityDelta, NormalizedEntity};
use rustc_hash::FxHashMap;
use serde::Serialize;

/// Incremental-apply interface of the external catalog. This is the only
/// write path the engine uses.
#[async_trait::async_trait]
pub trait CatalogSink: Send + Sync {
    async fn apply(&self, cluster: &str, delta: &EntityDelta) -> Result<()>;
}

/// In-memory catalog: the current entity set per cluster plus a log of
/// every delivery.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    entities: FxHashMap<String, BTreeMap<String, NormalizedEntity>>,
    deliveries: Vec<(String, EntityDelta)>,
}

impl MemorySink {
    pub fn new() -> Self { Self::default() }

    /// Entities currently held for `cluster`, ordered by id.
    pub fn entities(&self, cluster: &str) -> Vec<NormalizedEntity> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.entities.get(cluster).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    pub fn deliveries(&self) -> Vec<(String, EntityDelta)> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).deliveries.clone()
    }
}

#[async_trait::async_trait]
impl CatalogSink for MemorySink {
    async fn apply(&self, cluster: &str, delta: &EntityDelta) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| anyhow!("memory sink poisoned"))?;
        let entities = state.entities.entry(cluster.to_string()).or_default();
        for e in delta.added.iter().chain(delta.updated.iter()) {
            entities.insert(e.id.clone(), e.clone());
        }
        for id in &delta.removed {
            entities.remove(id);
        }
        state.deliveries.push((cluster.to_string(), delta.clone()));
        Ok(())
    }
}

#[derive(Serialize)]
struct DeltaLine<'a> {
    cluster: &'a str,
    #[serde(flatten)]
    delta: &'a EntityDelta,
}

/// Writes one JSON document per delta, newline separated.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self { Self { out: Mutex::new(out) } }

    pub fn into_inner(self) -> W { self.out.into_inner().unwrap_or_else(|p| p.into_inner()) }
}

#[async_trait::async_trait]
impl<W: Write + Send> CatalogSink for JsonLinesSink<W> {
    async fn apply(&self, cluster: &str, delta: &EntityDelta) -> Result<()> {
        let line = serde_json::to_string(&DeltaLine { cluster, delta }).context("serializing delta")?;
        let mut out = self.out.lock().map_err(|_| anyhow!("json sink poisoned"))?;
        writeln!(out, "{}", line).context("writing delta")?;
        out.flush().context("flushing delta")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgraph_core::EntityKind;

    fn entity(id: &str) -> NormalizedEntity {
        NormalizedEntity {
            id: id.into(),
            kind: EntityKind::Other,
            cluster: "c1".into(),
            namespace: None,
            name: id.into(),
            source_api_version: "v1".into(),
            source_kind: "Thing".into(),
            labels: Default::default(),
            annotations: Default::default(),
            relations: Vec::new(),
            spec: serde_json::Value::Null,
            status: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn memory_sink_tolerates_duplicate_delivery() {
        let sink = MemorySink::new();
        let delta = EntityDelta { added: vec![entity("a"), entity("b")], updated: vec![], removed: vec!["gone".into()] };
        sink.apply("c1", &delta).await.unwrap();
        let once = sink.entities("c1");
        sink.apply("c1", &delta).await.unwrap();
        assert_eq!(sink.entities("c1"), once);
        assert_eq!(sink.deliveries().len(), 2);
    }

    #[tokio::test]
    async fn json_lines_sink_writes_one_line_per_delta() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.apply("c1", &EntityDelta { added: vec![entity("a")], ..Default::default() }).await.unwrap();
        sink.apply("c2", &EntityDelta { removed: vec!["x".into()], ..Default::default() }).await.unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["cluster"], "c1");
        assert_eq!(lines[0]["added"][0]["id"], "a");
        assert_eq!(lines[1]["removed"][0], "x");
    }
}
