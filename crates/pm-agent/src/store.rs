//! In-memory metric store
//!
//! Holds the metrics pushed by co-located processes, keyed by the source
//! id they were written under. The local HTTP surface and the check
//! manager both read from here.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;

use pm_core::Metric;

/// Summary of one metric source for `/inventory`
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    /// Source id (the `<id>` of `/write/<id>`)
    pub id: String,
    /// Number of metrics currently stored for this source
    pub metrics: usize,
    /// Seconds since the source last wrote
    pub last_update_secs: u64,
}

struct Source {
    metrics: HashMap<String, Metric>,
    last_update: Instant,
}

/// Shared store of pushed metrics
#[derive(Default)]
pub struct MetricStore {
    sources: RwLock<HashMap<String, Source>>,
}

impl MetricStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch of metrics into `id`'s source
    pub async fn write(&self, id: &str, metrics: HashMap<String, Metric>) {
        let mut sources = self.sources.write().await;
        let source = sources.entry(id.to_string()).or_insert_with(|| Source {
            metrics: HashMap::new(),
            last_update: Instant::now(),
        });
        source.metrics.extend(metrics);
        source.last_update = Instant::now();
    }

    /// Snapshot of every stored metric, flattened to `` source`metric ``
    pub async fn snapshot(&self) -> BTreeMap<String, Metric> {
        let sources = self.sources.read().await;
        let mut out = BTreeMap::new();
        for (id, source) in sources.iter() {
            for (name, metric) in &source.metrics {
                out.insert(format!("{}`{}", id, name), metric.clone());
            }
        }
        out
    }

    /// Per-source summaries, sorted by source id
    pub async fn inventory(&self) -> Vec<SourceInfo> {
        let sources = self.sources.read().await;
        let mut out: Vec<SourceInfo> = sources
            .iter()
            .map(|(id, source)| SourceInfo {
                id: id.clone(),
                metrics: source.metrics.len(),
                last_update_secs: source.last_update.elapsed().as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
