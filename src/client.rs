use crate::element::{GraphElementType, PgResult, QueryRow};
use crate::label::SourcePredicate;
use crate::range::Range;
use anyhow::Result;
use std::fmt;

/// Source of graph elements.
///
/// Results are pushed into `sink` one at a time; an error returned by the sink
/// aborts the query and is returned unchanged.
pub trait GraphQueryClient: Send + Sync {
    /// Number of elements the query would return if it were not ranged.
    fn approx_count(&self, query: &ElementQuery) -> Result<u64>;

    fn query_elements(
        &self,
        query: &ElementQuery,
        sink: &mut dyn FnMut(PgResult) -> Result<()>,
    ) -> Result<()>;

    /// Executes a named query expression.
    fn submit(&self, query: &str, sink: &mut dyn FnMut(QueryRow) -> Result<()>) -> Result<()>;
}

/// Ranged "export everything of one kind" query with an optional label predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementQuery {
    kind: GraphElementType,
    range: Range,
    predicate: SourcePredicate,
}

impl ElementQuery {
    pub fn new(kind: GraphElementType, range: Range) -> Self {
        Self {
            kind,
            range,
            predicate: SourcePredicate::default(),
        }
    }

    pub fn with_predicate(mut self, predicate: SourcePredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_range(mut self, range: Range) -> Self {
        self.range = range;
        self
    }

    pub fn kind(&self) -> GraphElementType {
        self.kind
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn predicate(&self) -> &SourcePredicate {
        &self.predicate
    }
}

impl fmt::Display for ElementQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            GraphElementType::Nodes => f.write_str("g.V()")?,
            GraphElementType::Edges => f.write_str("g.E()")?,
        }
        f.write_str(&self.predicate.to_gremlin())?;
        if !self.range.is_all() {
            write!(f, ".{}", self.range)?;
        }
        Ok(())
    }
}
