use crate::client::ElementQuery;
use crate::element::{GraphElementType, PgResult};
use crate::error::ExportError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `(from)-label-(to)` as written by the edge-and-vertex strategy
static QUALIFIED_EDGE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(([^)]*)\)-(.+)-\(([^)]*)\)$").unwrap());

const TAG_SEPARATOR: &str = ";";

/// Some stores return multi-label vertices as one `a::b` tag.
const CONCATENATED_TAG_SEPARATOR: &str = "::";

/// Canonical identity of a group of same-shaped elements.
///
/// Tags are kept sorted and deduplicated, so equality and hashing do not depend
/// on the order the source returned them in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "LabelJson", from = "LabelJson")]
pub struct Label {
    labels: Vec<String>,
    from_labels: Vec<String>,
    to_labels: Vec<String>,
}

impl Label {
    pub fn new(label: impl Into<String>) -> Self {
        Self::from_tags([label.into()])
    }

    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: normalize_tags(tags),
            from_labels: Vec::new(),
            to_labels: Vec::new(),
        }
    }

    pub fn with_endpoints<F, T>(label: impl Into<String>, from_labels: F, to_labels: T) -> Self
    where
        F: IntoIterator,
        F::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            labels: normalize_tags([label.into()]),
            from_labels: normalize_tags(from_labels),
            to_labels: normalize_tags(to_labels),
        }
    }

    /// Parses the text form used in filters: `person`, `a;b` or `(person)-knows-(software)`.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        match QUALIFIED_EDGE_REGEX.captures(text) {
            Some(caps) => {
                Self::with_endpoints(&caps[2], split_tags(&caps[1]), split_tags(&caps[3]))
            }
            None => Self::from_tags(split_tags(text)),
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn from_labels(&self) -> &[String] {
        &self.from_labels
    }

    pub fn to_labels(&self) -> &[String] {
        &self.to_labels
    }

    pub fn has_from_and_to_labels(&self) -> bool {
        !self.from_labels.is_empty() || !self.to_labels.is_empty()
    }

    /// The element's own tags joined with `;`
    pub fn label_text(&self) -> String {
        self.labels.join(TAG_SEPARATOR)
    }

    pub fn fully_qualified_label(&self) -> String {
        if self.has_from_and_to_labels() {
            format!(
                "({})-{}-({})",
                self.from_labels.join(TAG_SEPARATOR),
                self.label_text(),
                self.to_labels.join(TAG_SEPARATOR)
            )
        } else {
            self.label_text()
        }
    }

    /// True when every tag of this (filter) label is present on `candidate`.
    pub fn matches(&self, candidate: &Label) -> bool {
        contains_all(&candidate.labels, &self.labels)
            && contains_all(&candidate.from_labels, &self.from_labels)
            && contains_all(&candidate.to_labels, &self.to_labels)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fully_qualified_label())
    }
}

fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = tags
        .into_iter()
        .map(Into::into)
        .flat_map(|tag| {
            if tag.contains(CONCATENATED_TAG_SEPARATOR) {
                tag.split(CONCATENATED_TAG_SEPARATOR)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            } else {
                vec![tag]
            }
        })
        .filter(|tag| !tag.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn split_tags(text: &str) -> Vec<String> {
    text.split(TAG_SEPARATOR)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn contains_all(haystack: &[String], needles: &[String]) -> bool {
    needles.iter().all(|n| haystack.binary_search(n).is_ok())
}

/// Schema-file representation of a label
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum LabelJson {
    Single(String),
    Multi(Vec<String>),
    Edge {
        #[serde(rename = "~label")]
        label: String,
        #[serde(rename = "~fromLabels")]
        from_labels: Vec<String>,
        #[serde(rename = "~toLabels")]
        to_labels: Vec<String>,
    },
}

impl From<Label> for LabelJson {
    fn from(label: Label) -> Self {
        if label.has_from_and_to_labels() {
            LabelJson::Edge {
                label: label.label_text(),
                from_labels: label.from_labels,
                to_labels: label.to_labels,
            }
        } else if label.labels.len() == 1 {
            LabelJson::Single(label.labels.into_iter().next().unwrap_or_default())
        } else {
            LabelJson::Multi(label.labels)
        }
    }
}

impl From<LabelJson> for Label {
    fn from(json: LabelJson) -> Self {
        match json {
            LabelJson::Single(label) => Label::new(label),
            LabelJson::Multi(labels) => Label::from_tags(labels),
            LabelJson::Edge {
                label,
                from_labels,
                to_labels,
            } => Label::with_endpoints(label, from_labels, to_labels),
        }
    }
}

/// How a raw element is turned into its `Label`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LabelStrategy {
    NodeLabelsOnly,
    EdgeLabelsOnly,
    EdgeAndVertexLabels,
}

impl LabelStrategy {
    pub fn element_type(&self) -> GraphElementType {
        match self {
            LabelStrategy::NodeLabelsOnly => GraphElementType::Nodes,
            LabelStrategy::EdgeLabelsOnly | LabelStrategy::EdgeAndVertexLabels => {
                GraphElementType::Edges
            }
        }
    }

    pub fn is_edge_strategy(&self) -> bool {
        self.element_type() == GraphElementType::Edges
    }

    pub fn label_for(&self, element: &PgResult) -> Result<Label, ExportError> {
        match self {
            LabelStrategy::NodeLabelsOnly | LabelStrategy::EdgeLabelsOnly => {
                Ok(Label::from_tags(element.labels()?))
            }
            LabelStrategy::EdgeAndVertexLabels => {
                let tags = element.labels()?;
                let label = tags.into_iter().next().unwrap_or_default();
                Ok(Label::with_endpoints(
                    label,
                    element.from_labels()?,
                    element.to_labels()?,
                ))
            }
        }
    }
}

/// Labels a source-side query is restricted to; empty means unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePredicate {
    labels: Vec<Label>,
}

impl SourcePredicate {
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn is_unrestricted(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn accepts(&self, label: &Label) -> bool {
        self.is_unrestricted() || self.labels.iter().any(|l| l.matches(label))
    }

    /// Gremlin steps equivalent to this predicate.
    pub fn to_gremlin(&self) -> String {
        match self.labels.as_slice() {
            [] => String::new(),
            [single] => label_steps(single),
            many => {
                let branches: Vec<String> =
                    many.iter().map(|l| format!("__{}", label_steps(l))).collect();
                format!(".or({})", branches.join(", "))
            }
        }
    }
}

fn label_steps(label: &Label) -> String {
    let mut steps: String = label
        .labels()
        .iter()
        .map(|tag| format!(".hasLabel('{tag}')"))
        .collect();
    for tag in label.from_labels() {
        steps.push_str(&format!(".where(__.outV().hasLabel('{tag}'))"));
    }
    for tag in label.to_labels() {
        steps.push_str(&format!(".where(__.inV().hasLabel('{tag}'))"));
    }
    steps
}

/// Which labels of one element kind are exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelsFilter {
    All { strategy: LabelStrategy },
    Specified { strategy: LabelStrategy, labels: Vec<Label> },
}

impl LabelsFilter {
    pub fn all(strategy: LabelStrategy) -> Self {
        LabelsFilter::All { strategy }
    }

    pub fn specified(strategy: LabelStrategy, labels: Vec<Label>) -> Self {
        if labels.is_empty() {
            LabelsFilter::All { strategy }
        } else {
            LabelsFilter::Specified { strategy, labels }
        }
    }

    pub fn strategy(&self) -> LabelStrategy {
        match self {
            LabelsFilter::All { strategy } | LabelsFilter::Specified { strategy, .. } => *strategy,
        }
    }

    pub fn is_specified(&self) -> bool {
        matches!(self, LabelsFilter::Specified { .. })
    }

    pub fn element_type(&self) -> GraphElementType {
        self.strategy().element_type()
    }

    pub fn label_for(&self, element: &PgResult) -> Result<Label, ExportError> {
        self.strategy().label_for(element)
    }

    /// Whether an already-classified element passes the filter.
    pub fn accepts(&self, label: &Label) -> bool {
        match self {
            LabelsFilter::All { .. } => true,
            LabelsFilter::Specified { labels, .. } => labels.iter().any(|l| l.matches(label)),
        }
    }

    /// Pushes the filter into the source query so rejected elements never cross the wire.
    pub fn apply(&self, query: ElementQuery) -> ElementQuery {
        match self {
            LabelsFilter::All { .. } => query,
            LabelsFilter::Specified { labels, .. } => query.with_predicate(SourcePredicate {
                labels: labels.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{EdgeResult, NodeResult, PropertyMap};
    use crate::range::Range;

    fn node(labels: &[&str]) -> PgResult {
        PgResult::Node(NodeResult {
            id: "1".into(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            properties: PropertyMap::new(),
        })
    }

    fn edge() -> PgResult {
        PgResult::Edge(EdgeResult {
            id: "7".into(),
            label: "TestLabel".into(),
            from: "FromID".into(),
            to: "ToID".into(),
            from_labels: vec!["FromLabel".into()],
            to_labels: vec!["ToLabels".into()],
            properties: PropertyMap::new(),
        })
    }

    #[test]
    fn tag_order_does_not_affect_identity() {
        assert_eq!(Label::from_tags(["b", "a"]), Label::from_tags(["a", "b", "a"]));
    }

    #[test]
    fn concatenated_tags_are_split() {
        assert_eq!(Label::new("a::b"), Label::from_tags(["b", "a"]));
    }

    #[test]
    fn multi_label_node_is_one_label() {
        let label = LabelStrategy::NodeLabelsOnly
            .label_for(&node(&["person", "employee"]))
            .unwrap();
        assert_eq!(label.labels(), ["employee", "person"]);
        assert_eq!(label.fully_qualified_label(), "employee;person");
    }

    #[test]
    fn edge_labels_only() {
        let label = LabelStrategy::EdgeLabelsOnly.label_for(&edge()).unwrap();
        assert_eq!(label, Label::new("TestLabel"));
        assert!(!label.has_from_and_to_labels());
    }

    #[test]
    fn edge_and_vertex_labels() {
        let label = LabelStrategy::EdgeAndVertexLabels.label_for(&edge()).unwrap();
        assert_eq!(
            label,
            Label::with_endpoints("TestLabel", ["FromLabel"], ["ToLabels"])
        );
        assert_eq!(label.fully_qualified_label(), "(FromLabel)-TestLabel-(ToLabels)");
    }

    #[test]
    fn edge_and_vertex_strategy_on_node_is_malformed() {
        assert!(LabelStrategy::EdgeAndVertexLabels.label_for(&node(&["x"])).is_err());
    }

    #[test]
    fn parse_round_trips_qualified_label() {
        let label = Label::parse("(person)-created-(software)");
        assert_eq!(label, Label::with_endpoints("created", ["person"], ["software"]));
        assert_eq!(Label::parse("a;b"), Label::from_tags(["a", "b"]));
    }

    #[test]
    fn filter_label_matches_supersets() {
        let filter = Label::new("knows");
        let element = Label::with_endpoints("knows", ["person"], ["person"]);
        assert!(filter.matches(&element));
        assert!(!element.matches(&filter));
        assert!(Label::new("person").matches(&Label::from_tags(["person", "employee"])));
    }

    #[test]
    fn all_labels_adds_no_predicate() {
        let filter = LabelsFilter::all(LabelStrategy::NodeLabelsOnly);
        let query = filter.apply(ElementQuery::new(GraphElementType::Nodes, Range::ALL));
        assert_eq!(query.to_string(), "g.V()");

        let filter = LabelsFilter::all(LabelStrategy::EdgeLabelsOnly);
        let query = filter.apply(ElementQuery::new(GraphElementType::Edges, Range::ALL));
        assert_eq!(query.to_string(), "g.E()");
    }

    #[test]
    fn specified_labels_compile_to_has_label() {
        let filter =
            LabelsFilter::specified(LabelStrategy::NodeLabelsOnly, vec![Label::new("person")]);
        let query = filter.apply(ElementQuery::new(GraphElementType::Nodes, Range::new(0, 10)));
        assert_eq!(query.to_string(), "g.V().hasLabel('person').range(0, 10)");
    }

    #[test]
    fn several_specified_labels_compile_to_or() {
        let filter = LabelsFilter::specified(
            LabelStrategy::EdgeAndVertexLabels,
            vec![Label::new("knows"), Label::parse("(person)-created-(software)")],
        );
        let query = filter.apply(ElementQuery::new(GraphElementType::Edges, Range::ALL));
        assert_eq!(
            query.to_string(),
            "g.E().or(__.hasLabel('knows'), __.hasLabel('created')\
             .where(__.outV().hasLabel('person')).where(__.inV().hasLabel('software')))"
        );
    }

    #[test]
    fn empty_specification_means_all() {
        assert!(!LabelsFilter::specified(LabelStrategy::NodeLabelsOnly, vec![]).is_specified());
    }

    #[test]
    fn label_json_shapes() {
        let single = serde_json::to_value(Label::new("person")).unwrap();
        assert_eq!(single, serde_json::json!("person"));
        let multi = serde_json::to_value(Label::from_tags(["b", "a"])).unwrap();
        assert_eq!(multi, serde_json::json!(["a", "b"]));
        let edge = Label::with_endpoints("knows", ["person"], ["person"]);
        let value = serde_json::to_value(&edge).unwrap();
        assert_eq!(value["~label"], "knows");
        let back: Label = serde_json::from_value(value).unwrap();
        assert_eq!(back, edge);
    }
}
