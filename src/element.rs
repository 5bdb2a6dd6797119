//! Element shapes delivered by a graph client
//!
//! Every shape answers the same read-only questions (id, tags, properties,
//! endpoints) so nothing past the label dispatch ever looks at the raw
//! representation.

use crate::config::{EDGES_DIR, NODES_DIR};
use crate::error::ExportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

pub type PropertyMap = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphElementType {
    Nodes,
    Edges,
}

impl GraphElementType {
    pub fn dir_name(&self) -> &'static str {
        match self {
            GraphElementType::Nodes => NODES_DIR,
            GraphElementType::Edges => EDGES_DIR,
        }
    }
}

impl fmt::Display for GraphElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Key of a flexible query result; structural tokens are kept apart from property names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResultKey {
    Id,
    Label,
    In,
    Out,
    Property(String),
}

impl ResultKey {
    pub fn name(&self) -> &str {
        match self {
            ResultKey::Id => "~id",
            ResultKey::Label => "~label",
            ResultKey::In => "~in",
            ResultKey::Out => "~out",
            ResultKey::Property(name) => name,
        }
    }

    pub fn is_token(&self) -> bool {
        !matches!(self, ResultKey::Property(_))
    }
}

pub type QueryResult = BTreeMap<ResultKey, Value>;

/// One row returned by a named query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRow {
    Map(QueryResult),
    Value(Value),
}

impl QueryRow {
    pub fn into_map(self) -> Result<QueryResult, ExportError> {
        match self {
            QueryRow::Map(map) => Ok(map),
            QueryRow::Value(value) => Err(ExportError::UnexpectedResult(format!(
                "Expected map, found {}",
                json_kind(&value)
            ))),
        }
    }
}

/// Flattens a query result into named columns; tokens are kept only when allowed.
pub fn query_result_columns(result: &QueryResult, allow_tokens: bool) -> PropertyMap {
    result
        .iter()
        .filter(|(key, _)| allow_tokens || !key.is_token())
        .map(|(key, value)| (key.name().to_string(), value.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult {
    pub id: String,
    pub labels: Vec<String>,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeResult {
    pub id: String,
    pub label: String,
    pub from: String,
    pub to: String,
    pub from_labels: Vec<String>,
    pub to_labels: Vec<String>,
    pub properties: PropertyMap,
}

/// A graph element in one of the shapes a client may produce.
#[derive(Debug, Clone, PartialEq)]
pub enum PgResult {
    /// Parsed node from a ranged export query
    Node(NodeResult),
    /// Parsed edge from a ranged export query
    Edge(EdgeResult),
    /// Projection map (`~id`, `~label`, `properties`, `~from`, ...) as sent over the wire
    Projected {
        kind: GraphElementType,
        map: PropertyMap,
    },
    /// Element-shaped named query result without both endpoint references
    QueryNode(QueryResult),
    /// Element-shaped named query result carrying `IN` and `OUT`
    QueryEdge(QueryResult),
}

impl PgResult {
    /// Routes a structured query result: both endpoint references make it an edge.
    pub fn from_query_result(result: QueryResult) -> Self {
        if result.contains_key(&ResultKey::In) && result.contains_key(&ResultKey::Out) {
            PgResult::QueryEdge(result)
        } else {
            PgResult::QueryNode(result)
        }
    }

    pub fn element_type(&self) -> GraphElementType {
        match self {
            PgResult::Node(_) | PgResult::QueryNode(_) => GraphElementType::Nodes,
            PgResult::Edge(_) | PgResult::QueryEdge(_) => GraphElementType::Edges,
            PgResult::Projected { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> Result<Cow<'_, str>, ExportError> {
        match self {
            PgResult::Node(node) => Ok(Cow::Borrowed(&node.id)),
            PgResult::Edge(edge) => Ok(Cow::Borrowed(&edge.id)),
            PgResult::Projected { map, .. } => map
                .get("~id")
                .map(value_to_text)
                .ok_or_else(|| ExportError::malformed("?", "missing ~id")),
            PgResult::QueryNode(result) | PgResult::QueryEdge(result) => result
                .get(&ResultKey::Id)
                .map(value_to_text)
                .ok_or_else(|| ExportError::malformed("?", "missing id token")),
        }
    }

    /// The element's own tags. Edges always carry exactly one.
    pub fn labels(&self) -> Result<Vec<String>, ExportError> {
        match self {
            PgResult::Node(node) => Ok(node.labels.clone()),
            PgResult::Edge(edge) => Ok(vec![edge.label.clone()]),
            PgResult::Projected { kind, map } => {
                let value = map
                    .get("~label")
                    .ok_or_else(|| self.malformed("missing ~label"))?;
                match kind {
                    GraphElementType::Nodes => Ok(value_to_tags(value)),
                    GraphElementType::Edges => Ok(vec![value_to_text(value).into_owned()]),
                }
            }
            PgResult::QueryNode(result) | PgResult::QueryEdge(result) => result
                .get(&ResultKey::Label)
                .map(|value| vec![value_to_text(value).into_owned()])
                .ok_or_else(|| self.malformed("missing label token")),
        }
    }

    pub fn properties(&self) -> Result<Cow<'_, PropertyMap>, ExportError> {
        match self {
            PgResult::Node(node) => Ok(Cow::Borrowed(&node.properties)),
            PgResult::Edge(edge) => Ok(Cow::Borrowed(&edge.properties)),
            PgResult::Projected { map, .. } => match map.get("properties") {
                None | Some(Value::Null) => Ok(Cow::Owned(PropertyMap::new())),
                Some(Value::Object(properties)) => Ok(Cow::Borrowed(properties)),
                Some(other) => Err(self.malformed(&format!(
                    "properties must be a map, found {}",
                    json_kind(other)
                ))),
            },
            PgResult::QueryNode(result) | PgResult::QueryEdge(result) => {
                Ok(Cow::Owned(query_result_columns(result, false)))
            }
        }
    }

    pub fn from(&self) -> Result<Cow<'_, str>, ExportError> {
        self.endpoint(Endpoint::Out).map(|(id, _)| id)
    }

    pub fn to(&self) -> Result<Cow<'_, str>, ExportError> {
        self.endpoint(Endpoint::In).map(|(id, _)| id)
    }

    pub fn from_labels(&self) -> Result<Vec<String>, ExportError> {
        self.endpoint(Endpoint::Out).map(|(_, labels)| labels)
    }

    pub fn to_labels(&self) -> Result<Vec<String>, ExportError> {
        self.endpoint(Endpoint::In).map(|(_, labels)| labels)
    }

    fn endpoint(&self, side: Endpoint) -> Result<(Cow<'_, str>, Vec<String>), ExportError> {
        match self {
            PgResult::Edge(edge) => Ok(match side {
                Endpoint::Out => (Cow::Borrowed(edge.from.as_str()), edge.from_labels.clone()),
                Endpoint::In => (Cow::Borrowed(edge.to.as_str()), edge.to_labels.clone()),
            }),
            PgResult::Projected {
                kind: GraphElementType::Edges,
                map,
            } => {
                let (id_key, labels_key) = match side {
                    Endpoint::Out => ("~from", "~fromLabels"),
                    Endpoint::In => ("~to", "~toLabels"),
                };
                let id = map
                    .get(id_key)
                    .map(value_to_text)
                    .ok_or_else(|| self.malformed(&format!("missing {id_key}")))?;
                let labels = map.get(labels_key).map(value_to_tags).unwrap_or_default();
                Ok((id, labels))
            }
            PgResult::QueryEdge(result) => {
                let key = match side {
                    Endpoint::Out => ResultKey::Out,
                    Endpoint::In => ResultKey::In,
                };
                let reference = result
                    .get(&key)
                    .ok_or_else(|| self.malformed(&format!("missing {} token", key.name())))?;
                match reference {
                    Value::Object(vertex) => {
                        let id = vertex
                            .get("~id")
                            .map(value_to_text)
                            .ok_or_else(|| self.malformed("endpoint without id"))?;
                        let labels = vertex.get("~label").map(value_to_tags).unwrap_or_default();
                        Ok((id, labels))
                    }
                    other => Ok((value_to_text(other), Vec::new())),
                }
            }
            _ => Err(self.malformed("not an edge")),
        }
    }

    fn malformed(&self, reason: &str) -> ExportError {
        let id = self
            .id()
            .map(|id| id.into_owned())
            .unwrap_or_else(|_| "?".to_string());
        ExportError::malformed(id, reason)
    }
}

#[derive(Clone, Copy)]
enum Endpoint {
    Out,
    In,
}

/// Renders a scalar as plain text (strings unquoted, null empty).
pub fn value_to_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s),
        Value::Null => Cow::Borrowed(""),
        other => Cow::Owned(other.to_string()),
    }
}

pub(crate) fn value_to_tags(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(|v| value_to_text(v).into_owned()).collect(),
        Value::Null => Vec::new(),
        other => vec![value_to_text(other).into_owned()],
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
