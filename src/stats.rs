use crate::config::STATS_FILE_NAME;
use crate::element::PropertyMap;
use crate::label::Label;
use crate::schema::graph_schema::write_json_atomically;
use crate::writer::OutputKind;
use anyhow::Result;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Element and property counts of one label
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelStats {
    pub count: u64,
    pub properties: BTreeMap<String, u64>,
}

/// Statistics collected while exporting, shared by every task of a job
#[derive(Default)]
pub struct ExportStats {
    nodes: AtomicU64,
    edges: AtomicU64,
    results: AtomicU64,
    properties: AtomicU64,
    skipped_elements: AtomicU64,
    abandoned_queries: AtomicU64,
    labels: DashMap<(OutputKind, Label), LabelStats>,
}

impl ExportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: OutputKind, label: &Label, properties: &PropertyMap) {
        let counter = match kind {
            OutputKind::Nodes => &self.nodes,
            OutputKind::Edges => &self.edges,
            OutputKind::Results => &self.results,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.properties
            .fetch_add(properties.len() as u64, Ordering::Relaxed);

        let mut entry = self.labels.entry((kind, label.clone())).or_default();
        entry.count += 1;
        for name in properties.keys() {
            *entry.properties.entry(name.clone()).or_insert(0) += 1;
        }
    }

    pub fn inc_skipped(&self) {
        self.skipped_elements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_abandoned_queries(&self) {
        self.abandoned_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn nodes(&self) -> u64 {
        self.nodes.load(Ordering::Relaxed)
    }

    pub fn edges(&self) -> u64 {
        self.edges.load(Ordering::Relaxed)
    }

    pub fn results(&self) -> u64 {
        self.results.load(Ordering::Relaxed)
    }

    pub fn properties(&self) -> u64 {
        self.properties.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped_elements.load(Ordering::Relaxed)
    }

    pub fn abandoned_queries(&self) -> u64 {
        self.abandoned_queries.load(Ordering::Relaxed)
    }

    /// Per-label stats of one kind, ordered by label
    pub fn label_stats(&self, kind: OutputKind) -> Vec<(Label, LabelStats)> {
        let mut stats: Vec<(Label, LabelStats)> = self
            .labels
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    pub fn label_count(&self, kind: OutputKind, label: &Label) -> u64 {
        self.labels
            .get(&(kind, label.clone()))
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    fn details(&self, kind: OutputKind) -> Value {
        self.label_stats(kind)
            .into_iter()
            .map(|(label, stats)| {
                let properties: Vec<Value> = stats
                    .properties
                    .iter()
                    .map(|(name, count)| json!({"property": name, "count": count}))
                    .collect();
                json!({
                    "description": label.fully_qualified_label(),
                    "count": stats.count,
                    "properties": properties,
                })
            })
            .collect()
    }

    pub fn to_json(&self) -> Value {
        let mut details = json!({
            "nodes": self.details(OutputKind::Nodes),
            "edges": self.details(OutputKind::Edges),
        });
        if self.results() > 0 {
            details["results"] = self.details(OutputKind::Results);
        }
        json!({
            "stats": {
                "nodes": self.nodes(),
                "edges": self.edges(),
                "properties": self.properties(),
                "details": details,
            }
        })
    }

    /// Writes `stats.json` into `output_dir`.
    pub fn write_to(&self, output_dir: &Path) -> Result<()> {
        write_json_atomically(&output_dir.join(STATS_FILE_NAME), &self.to_json())
    }
}

impl fmt::Display for ExportStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Source:")?;
        writeln!(f, "  Nodes: {}", self.nodes())?;
        writeln!(f, "  Edges: {}", self.edges())?;
        if self.results() > 0 {
            writeln!(f, "  Results: {}", self.results())?;
        }
        writeln!(f, "Export:")?;
        writeln!(f, "  Properties: {}", self.properties())?;
        writeln!(f, "  Skipped elements: {}", self.skipped())?;
        if self.abandoned_queries() > 0 {
            writeln!(f, "  Abandoned queries: {}", self.abandoned_queries())?;
        }
        for (title, kind) in [("Nodes", OutputKind::Nodes), ("Edges", OutputKind::Edges)] {
            let stats = self.label_stats(kind);
            if stats.is_empty() {
                continue;
            }
            writeln!(f, "{title}:")?;
            for (label, stats) in stats {
                writeln!(f, "  {label}: {}", stats.count)?;
            }
        }
        Ok(())
    }
}
