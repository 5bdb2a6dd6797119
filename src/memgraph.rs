//! Local graph source backed by a JSON dump
//!
//! The dump is `{"nodes": [{id, labels, properties}], "edges": [{id, label,
//! from, to, properties}]}`, optionally bzip2-compressed. Elements keep their
//! file order, which is the ordinal space ranges are cut from.
//!
//! Named queries accept a small traversal dialect:
//! `g.V()` or `g.E()`, then any of `.hasLabel('a', ..)`, `.range(a, b)`,
//! `.limit(n)`, and at most one terminal step out of `.elementMap()`,
//! `.valueMap(true)`, `.valueMap()`, `.id()` and `.count()`.

use crate::client::{ElementQuery, GraphQueryClient};
use crate::element::{
    value_to_tags, value_to_text, EdgeResult, GraphElementType, NodeResult, PgResult,
    PropertyMap, QueryResult, QueryRow, ResultKey,
};
use crate::error::ExportError;
use crate::label::{Label, SourcePredicate};
use crate::range::Range;
use anyhow::{Context, Result};
use bzip2::read::MultiBzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

static QUERY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*g\.(V|E)\(\)((?:\.\w+\([^()]*\))*)\s*;?\s*$").unwrap());

static STEP_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.(\w+)\(([^()]*)\)").unwrap());

/// Multi-label vertices come back from a traversal as one `a::b` tag.
const TRAVERSAL_LABEL_SEPARATOR: &str = "::";

#[derive(Deserialize)]
struct GraphDump {
    #[serde(default)]
    nodes: Vec<NodeRecord>,
    #[serde(default)]
    edges: Vec<EdgeRecord>,
}

#[derive(Deserialize)]
struct NodeRecord {
    id: Value,
    #[serde(default, alias = "label")]
    labels: Value,
    #[serde(default)]
    properties: PropertyMap,
}

#[derive(Deserialize)]
struct EdgeRecord {
    id: Value,
    label: String,
    from: Value,
    to: Value,
    #[serde(default)]
    properties: PropertyMap,
}

pub struct InMemoryGraph {
    nodes: Vec<NodeResult>,
    edges: Vec<EdgeResult>,
}

impl InMemoryGraph {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open graph dump: {}", path.display()))?;
        let reader = BufReader::with_capacity(256 * 1024, file);

        let is_bz2 = path.extension().is_some_and(|ext| ext == "bz2");
        let graph = if is_bz2 {
            Self::from_reader(BufReader::new(MultiBzDecoder::new(reader)))
        } else {
            Self::from_reader(reader)
        }
        .with_context(|| format!("Failed to parse graph dump: {}", path.display()))?;

        info!(
            path = %path.display(),
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "Loaded graph"
        );
        Ok(graph)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let dump: GraphDump = serde_json::from_reader(reader)?;
        Ok(Self::from_dump(dump))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_reader(json.as_bytes())
    }

    fn from_dump(dump: GraphDump) -> Self {
        let nodes: Vec<NodeResult> = dump
            .nodes
            .into_iter()
            .map(|record| NodeResult {
                id: value_to_text(&record.id).into_owned(),
                labels: value_to_tags(&record.labels),
                properties: record.properties,
            })
            .collect();

        let labels_by_id: FxHashMap<&str, &[String]> = nodes
            .iter()
            .map(|node| (node.id.as_str(), node.labels.as_slice()))
            .collect();

        let edges = dump
            .edges
            .into_iter()
            .map(|record| {
                let from = value_to_text(&record.from).into_owned();
                let to = value_to_text(&record.to).into_owned();
                let endpoint_labels =
                    |id: &str| labels_by_id.get(id).map(|l| l.to_vec()).unwrap_or_default();
                EdgeResult {
                    id: value_to_text(&record.id).into_owned(),
                    label: record.label,
                    from_labels: endpoint_labels(&from),
                    to_labels: endpoint_labels(&to),
                    from,
                    to,
                    properties: record.properties,
                }
            })
            .collect();

        Self { nodes, edges }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn matching(&self, kind: GraphElementType, predicate: &SourcePredicate) -> Vec<Item<'_>> {
        match kind {
            GraphElementType::Nodes => self
                .nodes
                .iter()
                .filter(|n| predicate.accepts(&Label::from_tags(n.labels.iter().cloned())))
                .map(Item::Node)
                .collect(),
            GraphElementType::Edges => self
                .edges
                .iter()
                .filter(|e| {
                    predicate.accepts(&Label::with_endpoints(
                        e.label.clone(),
                        e.from_labels.iter().cloned(),
                        e.to_labels.iter().cloned(),
                    ))
                })
                .map(Item::Edge)
                .collect(),
        }
    }
}

impl GraphQueryClient for InMemoryGraph {
    fn approx_count(&self, query: &ElementQuery) -> Result<u64> {
        Ok(self.matching(query.kind(), query.predicate()).len() as u64)
    }

    fn query_elements(
        &self,
        query: &ElementQuery,
        sink: &mut dyn FnMut(PgResult) -> Result<()>,
    ) -> Result<()> {
        let items = self.matching(query.kind(), query.predicate());
        let (start, end) = query.range().bounds(items.len());
        debug!(query = %query, rows = end - start, "Executing element query");
        for item in &items[start..end] {
            sink(item.to_result())?;
        }
        Ok(())
    }

    fn submit(&self, query: &str, sink: &mut dyn FnMut(QueryRow) -> Result<()>) -> Result<()> {
        let plan = TraversalPlan::parse(query)?;
        let mut items = self.matching(plan.kind, &SourcePredicate::default());

        for step in &plan.steps {
            match step {
                Step::HasLabel(labels) => items.retain(|item| item.has_any_label(labels)),
                Step::Range(range) => {
                    let (start, end) = range.bounds(items.len());
                    items = items[start..end].to_vec();
                }
                Step::Limit(n) => items.truncate(*n),
            }
        }

        debug!(query, rows = items.len(), "Executing named query");

        match plan.projection {
            Projection::Count => sink(QueryRow::Value(json!(items.len()))),
            Projection::Id => items
                .iter()
                .try_for_each(|item| sink(QueryRow::Value(json!(item.id())))),
            projection => items
                .iter()
                .try_for_each(|item| sink(QueryRow::Map(item.project(projection)))),
        }
    }
}

#[derive(Clone, Copy)]
enum Item<'g> {
    Node(&'g NodeResult),
    Edge(&'g EdgeResult),
}

impl Item<'_> {
    fn id(&self) -> &str {
        match self {
            Item::Node(node) => &node.id,
            Item::Edge(edge) => &edge.id,
        }
    }

    fn properties(&self) -> &PropertyMap {
        match self {
            Item::Node(node) => &node.properties,
            Item::Edge(edge) => &edge.properties,
        }
    }

    fn has_any_label(&self, labels: &[String]) -> bool {
        match self {
            Item::Node(node) => node.labels.iter().any(|l| labels.contains(l)),
            Item::Edge(edge) => labels.contains(&edge.label),
        }
    }

    fn to_result(self) -> PgResult {
        match self {
            Item::Node(node) => PgResult::Node(node.clone()),
            Item::Edge(edge) => PgResult::Edge(edge.clone()),
        }
    }

    fn project(&self, projection: Projection) -> QueryResult {
        let mut result = QueryResult::new();
        if projection != Projection::ValueMap {
            result.insert(ResultKey::Id, json!(self.id()));
            let label = match self {
                Item::Node(node) => node.labels.join(TRAVERSAL_LABEL_SEPARATOR),
                Item::Edge(edge) => edge.label.clone(),
            };
            result.insert(ResultKey::Label, json!(label));
        }
        if let (Projection::ElementMap, Item::Edge(edge)) = (projection, self) {
            result.insert(
                ResultKey::Out,
                json!({"~id": edge.from, "~label": edge.from_labels.join(TRAVERSAL_LABEL_SEPARATOR)}),
            );
            result.insert(
                ResultKey::In,
                json!({"~id": edge.to, "~label": edge.to_labels.join(TRAVERSAL_LABEL_SEPARATOR)}),
            );
        }
        for (name, value) in self.properties() {
            result.insert(ResultKey::Property(name.clone()), value.clone());
        }
        result
    }
}

enum Step {
    HasLabel(Vec<String>),
    Range(Range),
    Limit(usize),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Projection {
    ElementMap,
    ValueMapWithTokens,
    ValueMap,
    Id,
    Count,
}

struct TraversalPlan {
    kind: GraphElementType,
    steps: Vec<Step>,
    projection: Projection,
}

impl TraversalPlan {
    fn parse(query: &str) -> Result<Self, ExportError> {
        let unsupported = || ExportError::UnsupportedQuery(query.trim().to_string());
        let caps = QUERY_REGEX.captures(query).ok_or_else(unsupported)?;
        let kind = match &caps[1] {
            "V" => GraphElementType::Nodes,
            _ => GraphElementType::Edges,
        };

        let mut steps = Vec::new();
        let mut projection = None;
        for step in STEP_REGEX.captures_iter(&caps[2]) {
            if projection.is_some() {
                return Err(unsupported());
            }
            let args = parse_args(&step[2]);
            match (&step[1], args.as_slice()) {
                ("hasLabel", [_, ..]) => steps.push(Step::HasLabel(args.clone())),
                ("range", [start, end]) => {
                    let start = start.parse().map_err(|_| unsupported())?;
                    let end = end.parse().map_err(|_| unsupported())?;
                    steps.push(Step::Range(Range::new(start, end)));
                }
                ("limit", [n]) => steps.push(Step::Limit(n.parse().map_err(|_| unsupported())?)),
                ("elementMap", []) => projection = Some(Projection::ElementMap),
                ("valueMap", [flag]) if flag == "true" => {
                    projection = Some(Projection::ValueMapWithTokens)
                }
                ("valueMap", []) => projection = Some(Projection::ValueMap),
                ("id", []) => projection = Some(Projection::Id),
                ("count", []) => projection = Some(Projection::Count),
                _ => return Err(unsupported()),
            }
        }

        Ok(Self {
            kind,
            steps,
            projection: projection.unwrap_or(Projection::ElementMap),
        })
    }
}

fn parse_args(args: &str) -> Vec<String> {
    args.split(',')
        .map(|arg| arg.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
        .filter(|arg| !arg.is_empty())
        .collect()
}
