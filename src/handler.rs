//! Per-element processing stages
//!
//! A task builds a chain for each range or named query it runs, outermost
//! first: counting, status, then either label dispatch (writer lookup, write,
//! statistics) or a schema-only stage. Stages borrow the task's writer pool
//! rather than owning it, so the pool outlives every chain and is closed once
//! by the task.

use crate::element::{query_result_columns, GraphElementType, PgResult, QueryRow};
use crate::error::ExportError;
use crate::label::{Label, LabelsFilter};
use crate::pool::LabelWriters;
use crate::schema::{GraphElementSchemas, GraphSchema};
use crate::stats::ExportStats;
use crate::status::Status;
use crate::writer::OutputKind;
use anyhow::Result;
use tracing::{debug, warn};

pub trait ElementHandler<T> {
    fn handle(&mut self, element: T, allow_tokens: bool) -> Result<()>;
}

/// Counts elements that reached this stage.
pub struct CountingHandler<H> {
    inner: H,
    count: u64,
}

impl<H> CountingHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<T, H: ElementHandler<T>> ElementHandler<T> for CountingHandler<H> {
    fn handle(&mut self, element: T, allow_tokens: bool) -> Result<()> {
        self.count += 1;
        self.inner.handle(element, allow_tokens)
    }
}

/// Records one unit of progress in the shared status.
pub struct StatusHandler<'s, H> {
    inner: H,
    status: &'s Status,
}

impl<'s, H> StatusHandler<'s, H> {
    pub fn new(inner: H, status: &'s Status) -> Self {
        Self { inner, status }
    }
}

impl<T, H: ElementHandler<T>> ElementHandler<T> for StatusHandler<'_, H> {
    fn handle(&mut self, element: T, allow_tokens: bool) -> Result<()> {
        self.status.update();
        self.inner.handle(element, allow_tokens)
    }
}

/// The label filter to apply per element kind; a kind without one is ignored.
#[derive(Debug, Clone, Copy)]
pub struct KindFilters<'a> {
    nodes: Option<&'a LabelsFilter>,
    edges: Option<&'a LabelsFilter>,
}

impl<'a> KindFilters<'a> {
    pub fn single(filter: &'a LabelsFilter) -> Self {
        match filter.element_type() {
            GraphElementType::Nodes => Self::both(Some(filter), None),
            GraphElementType::Edges => Self::both(None, Some(filter)),
        }
    }

    pub fn both(nodes: Option<&'a LabelsFilter>, edges: Option<&'a LabelsFilter>) -> Self {
        Self { nodes, edges }
    }

    pub fn get(&self, kind: GraphElementType) -> Option<&'a LabelsFilter> {
        match kind {
            GraphElementType::Nodes => self.nodes,
            GraphElementType::Edges => self.edges,
        }
    }
}

/// Classifies an element by label and writes it to that label's file.
///
/// Elements that turn out to be malformed are logged and skipped.
pub struct ExportTaskHandler<'a, 'w> {
    filters: KindFilters<'a>,
    writers: &'a mut LabelWriters<'w>,
    stats: &'a ExportStats,
}

impl<'a, 'w> ExportTaskHandler<'a, 'w> {
    pub fn new(
        filters: KindFilters<'a>,
        writers: &'a mut LabelWriters<'w>,
        stats: &'a ExportStats,
    ) -> Self {
        Self {
            filters,
            writers,
            stats,
        }
    }

    fn dispatch(&mut self, element: &PgResult) -> Result<()> {
        let kind = element.element_type();
        let Some(filter) = self.filters.get(kind) else {
            return Ok(());
        };
        let label = filter.label_for(element)?;
        if !filter.accepts(&label) {
            return Ok(());
        }
        element.id()?;
        if kind == GraphElementType::Edges {
            element.from()?;
            element.to()?;
        }
        let properties = element.properties()?;

        self.writers.get(kind.into(), &label)?.write_element(element)?;
        self.stats.record(kind.into(), &label, &properties);
        Ok(())
    }
}

impl ElementHandler<PgResult> for ExportTaskHandler<'_, '_> {
    fn handle(&mut self, element: PgResult, _allow_tokens: bool) -> Result<()> {
        match self.dispatch(&element) {
            Err(e) if ExportError::is_element_local(&e) => {
                warn!(error = %e, "Skipping malformed element");
                self.stats.inc_skipped();
                Ok(())
            }
            other => other,
        }
    }
}

/// Records label schemas without writing anything.
pub struct SchemaOnlyHandler<'a> {
    filters: KindFilters<'a>,
    schemas: &'a mut GraphSchema,
}

impl<'a> SchemaOnlyHandler<'a> {
    pub fn new(filters: KindFilters<'a>, schemas: &'a mut GraphSchema) -> Self {
        Self { filters, schemas }
    }
}

impl ElementHandler<PgResult> for SchemaOnlyHandler<'_> {
    fn handle(&mut self, element: PgResult, allow_tokens: bool) -> Result<()> {
        let kind = element.element_type();
        let Some(filter) = self.filters.get(kind) else {
            return Ok(());
        };
        let observed = filter.label_for(&element).and_then(|label| {
            let properties = element.properties()?;
            Ok((label, properties))
        });
        match observed {
            Ok((label, properties)) => {
                if filter.accepts(&label) {
                    self.schemas
                        .for_kind_mut(kind)
                        .update(&label, &properties, allow_tokens);
                }
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "Ignoring malformed element in schema pass");
                Ok(())
            }
        }
    }
}

/// Turns structured query rows into node- or edge-shaped elements.
///
/// A row that is not a key/value map fails the whole query.
pub struct QueryResultsHandler<H> {
    inner: H,
}

impl<H> QueryResultsHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<H: ElementHandler<PgResult>> ElementHandler<QueryRow> for QueryResultsHandler<H> {
    fn handle(&mut self, row: QueryRow, allow_tokens: bool) -> Result<()> {
        let element = PgResult::from_query_result(row.into_map()?);
        self.inner.handle(element, allow_tokens)
    }
}

/// Writes unstructured query rows, one column per key, to the query's own file.
pub struct ResultsHandler<'a, 'w> {
    label: Label,
    writers: &'a mut LabelWriters<'w>,
    stats: &'a ExportStats,
}

impl<'a, 'w> ResultsHandler<'a, 'w> {
    pub fn new(
        query_name: &str,
        writers: &'a mut LabelWriters<'w>,
        stats: &'a ExportStats,
    ) -> Self {
        Self {
            label: Label::new(query_name),
            writers,
            stats,
        }
    }
}

impl ElementHandler<QueryRow> for ResultsHandler<'_, '_> {
    fn handle(&mut self, row: QueryRow, allow_tokens: bool) -> Result<()> {
        let columns = query_result_columns(&row.into_map()?, allow_tokens);
        self.writers
            .get(OutputKind::Results, &self.label)?
            .write_columns(&columns)?;
        self.stats.record(OutputKind::Results, &self.label, &columns);
        Ok(())
    }
}

/// Schema-only counterpart of `ResultsHandler`
pub struct ResultsSchemaHandler<'a> {
    label: Label,
    schemas: &'a mut GraphElementSchemas,
}

impl<'a> ResultsSchemaHandler<'a> {
    pub fn new(query_name: &str, schemas: &'a mut GraphElementSchemas) -> Self {
        Self {
            label: Label::new(query_name),
            schemas,
        }
    }
}

impl ElementHandler<QueryRow> for ResultsSchemaHandler<'_> {
    fn handle(&mut self, row: QueryRow, allow_tokens: bool) -> Result<()> {
        let columns = query_result_columns(&row.into_map()?, allow_tokens);
        self.schemas.update(&self.label, &columns, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputFormat;
    use crate::element::{NodeResult, QueryResult, ResultKey};
    use crate::label::LabelStrategy;
    use crate::pool::FileHandleBudget;
    use crate::writer::WriterFactory;
    use serde_json::json;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recording {
        seen: Vec<(GraphElementType, String)>,
    }

    impl ElementHandler<PgResult> for Recording {
        fn handle(&mut self, element: PgResult, _allow_tokens: bool) -> Result<()> {
            let id = element.id()?.into_owned();
            self.seen.push((element.element_type(), id));
            Ok(())
        }
    }

    fn node(id: &str, labels: &[&str]) -> PgResult {
        PgResult::Node(NodeResult {
            id: id.into(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            properties: json!({"name": id}).as_object().unwrap().clone(),
        })
    }

    fn edge_row(id: &str) -> QueryRow {
        let mut result = QueryResult::new();
        result.insert(ResultKey::Id, json!(id));
        result.insert(ResultKey::Label, json!("knows"));
        result.insert(ResultKey::Out, json!({"~id": "1", "~label": "person"}));
        result.insert(ResultKey::In, json!({"~id": "2", "~label": "person"}));
        QueryRow::Map(result)
    }

    fn node_row(id: &str) -> QueryRow {
        let mut result = QueryResult::new();
        result.insert(ResultKey::Id, json!(id));
        result.insert(ResultKey::Label, json!("person"));
        result.insert(ResultKey::Property("name".into()), json!("marko"));
        QueryRow::Map(result)
    }

    fn pool<'a>(
        dir: &std::path::Path,
        kind: OutputKind,
        budget: &'a FileHandleBudget,
    ) -> LabelWriters<'a> {
        let factory =
            WriterFactory::new(dir, kind, OutputFormat::Csv, Arc::new(AtomicUsize::new(0)));
        LabelWriters::new(factory, budget)
    }

    #[test]
    fn counting_and_status_wrap_inner() -> Result<()> {
        let status = Status::hidden("test");
        let mut chain = CountingHandler::new(StatusHandler::new(Recording::default(), &status));
        chain.handle(node("1", &["a"]), false)?;
        chain.handle(node("2", &["a"]), false)?;
        assert_eq!(chain.count(), 2);
        assert_eq!(status.processed(), 2);
        Ok(())
    }

    #[test]
    fn dispatch_writes_per_label_and_skips_malformed() -> Result<()> {
        let dir = TempDir::new()?;
        let budget = FileHandleBudget::new(0);
        let stats = ExportStats::new();
        let filter = LabelsFilter::all(LabelStrategy::NodeLabelsOnly);
        let mut writers = pool(dir.path(), OutputKind::Nodes, &budget);
        {
            let mut handler =
                ExportTaskHandler::new(KindFilters::single(&filter), &mut writers, &stats);
            handler.handle(node("1", &["person"]), false)?;
            handler.handle(node("3", &["software"]), false)?;
            let broken = PgResult::Projected {
                kind: GraphElementType::Nodes,
                map: json!({"~id": "9"}).as_object().unwrap().clone(),
            };
            handler.handle(broken, false)?;
        }
        assert_eq!(stats.nodes(), 2);
        assert_eq!(stats.skipped(), 1);

        let schemas = writers.close().nodes;
        assert_eq!(schemas.file_count(), 2);
        let person = &schemas.files_for(&Label::new("person"))[0];
        assert_eq!(fs::read_to_string(&person.path)?, "~id,~label\n1,person,1\n");
        Ok(())
    }

    #[test]
    fn specified_filter_drops_other_labels() -> Result<()> {
        let dir = TempDir::new()?;
        let budget = FileHandleBudget::new(0);
        let stats = ExportStats::new();
        let filter =
            LabelsFilter::specified(LabelStrategy::NodeLabelsOnly, vec![Label::new("person")]);
        let mut writers = pool(dir.path(), OutputKind::Nodes, &budget);
        {
            let mut handler =
                ExportTaskHandler::new(KindFilters::single(&filter), &mut writers, &stats);
            handler.handle(node("1", &["person"]), false)?;
            handler.handle(node("3", &["software"]), false)?;
            // No edge filter, so edges are ignored
            handler.handle(PgResult::from_query_result(edge_row("7").into_map()?), false)?;
        }
        assert_eq!(writers.len(), 1);
        writers.close();
        Ok(())
    }

    #[test]
    fn query_rows_classified_by_shape() -> Result<()> {
        let mut rows = QueryResultsHandler::new(Recording::default());
        rows.handle(node_row("1"), false)?;
        rows.handle(edge_row("7"), false)?;
        rows.handle(node_row("2"), false)?;
        assert_eq!(
            rows.inner.seen,
            vec![
                (GraphElementType::Nodes, "1".to_string()),
                (GraphElementType::Edges, "7".to_string()),
                (GraphElementType::Nodes, "2".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn structured_rows_share_one_pool() -> Result<()> {
        let dir = TempDir::new()?;
        let budget = FileHandleBudget::new(1);
        let stats = ExportStats::new();
        let nodes = LabelsFilter::all(LabelStrategy::NodeLabelsOnly);
        let edges = LabelsFilter::all(LabelStrategy::EdgeLabelsOnly);
        let index = Arc::new(AtomicUsize::new(0));
        let factory =
            |kind| WriterFactory::new(dir.path(), kind, OutputFormat::Csv, index.clone());
        let mut writers = LabelWriters::with_factories(
            vec![factory(OutputKind::Nodes), factory(OutputKind::Edges)],
            &budget,
        );
        {
            let filters = KindFilters::both(Some(&nodes), Some(&edges));
            let mut rows =
                QueryResultsHandler::new(ExportTaskHandler::new(filters, &mut writers, &stats));
            rows.handle(node_row("1"), false)?;
            rows.handle(edge_row("7"), false)?;
            rows.handle(node_row("2"), false)?;
        }
        assert_eq!(stats.nodes(), 2);
        assert_eq!(stats.edges(), 1);
        assert_eq!(writers.evictions(), 2);

        let files = writers.close();
        assert_eq!(files.nodes.file_count(), 1);
        assert_eq!(files.edges.file_count(), 1);
        assert_eq!(budget.open_count(), 0);
        Ok(())
    }

    #[test]
    fn scalar_row_fails_the_query() {
        let mut router = QueryResultsHandler::new(Recording::default());
        let err = router
            .handle(QueryRow::Value(json!("marko")), false)
            .unwrap_err();
        assert!(ExportError::is_query_local(&err));
    }

    #[test]
    fn schema_only_pass_records_without_files() -> Result<()> {
        let filter = LabelsFilter::all(LabelStrategy::NodeLabelsOnly);
        let mut schemas = GraphSchema::new();
        {
            let mut handler = SchemaOnlyHandler::new(KindFilters::single(&filter), &mut schemas);
            handler.handle(node("1", &["person"]), false)?;
            handler.handle(node("2", &["person"]), false)?;
        }
        assert!(schemas.edges.is_empty());
        let person = schemas.nodes.get(&Label::new("person")).unwrap();
        assert_eq!(person.element_count(), 2);
        assert!(person.has_property("name"));
        Ok(())
    }

    #[test]
    fn unstructured_rows_keep_tokens_as_columns() -> Result<()> {
        let dir = TempDir::new()?;
        let budget = FileHandleBudget::new(0);
        let stats = ExportStats::new();
        let mut writers = pool(dir.path(), OutputKind::Results, &budget);
        {
            let mut handler = ResultsHandler::new("people", &mut writers, &stats);
            handler.handle(node_row("1"), true)?;
        }
        assert_eq!(stats.results(), 1);
        let schemas = writers.close().results;
        let file = &schemas.files_for(&Label::new("people"))[0];
        assert!(file.path.starts_with(dir.path().join("results")));
        assert!(fs::read_to_string(&file.path)?.ends_with("\nmarko,1,person\n"));

        let mut results = GraphElementSchemas::new();
        ResultsSchemaHandler::new("people", &mut results).handle(node_row("1"), true)?;
        let columns: Vec<&str> = results
            .get(&Label::new("people"))
            .unwrap()
            .properties()
            .map(|p| p.name())
            .collect();
        assert_eq!(columns, vec!["name", "~id", "~label"]);
        Ok(())
    }
}
