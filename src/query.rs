//! Export of the results of a fixed set of named queries
//!
//! Queries are loaded from a JSON file, optionally split into one query per
//! range, and put on a shared queue. Each `QueryTask` polls the queue until it
//! comes back empty. A query that fails is logged and abandoned; the task moves
//! on to the next one.

use crate::client::GraphQueryClient;
use crate::config::{ExportConfig, SchemaMode};
use crate::element::{GraphElementType, QueryRow};
use crate::error::ExportError;
use crate::export::{run_tasks, ExportSummary};
use crate::handler::{
    CountingHandler, ElementHandler, ExportTaskHandler, KindFilters, QueryResultsHandler,
    ResultsHandler, ResultsSchemaHandler, SchemaOnlyHandler, StatusHandler,
};
use crate::pool::{FileHandleBudget, LabelWriters, TaskFiles};
use crate::range::LazyRangeFactories;
use crate::schema::{rewrite_command, GraphElementSchemas, GraphSchema, MasterLabelSchemas};
use crate::stats::ExportStats;
use crate::status::Status;
use crate::writer::{OutputKind, WriterFactory};
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, TryRecvError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

static SOURCE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*g\.(V|E)\(\)").unwrap());

/// One query expression and the name its results are filed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedQuery {
    pub name: String,
    pub query: String,
}

/// A named group of query expressions.
///
/// Accepts either `{"name": .., "query": ..}` or `{"name": .., "queries": [..]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "NamedQueriesJson")]
pub struct NamedQueries {
    pub name: String,
    pub queries: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NamedQueriesJson {
    Many { name: String, queries: Vec<String> },
    One { name: String, query: String },
}

impl From<NamedQueriesJson> for NamedQueries {
    fn from(json: NamedQueriesJson) -> Self {
        match json {
            NamedQueriesJson::Many { name, queries } => Self { name, queries },
            NamedQueriesJson::One { name, query } => Self {
                name,
                queries: vec![query],
            },
        }
    }
}

impl NamedQueries {
    pub fn new(name: impl Into<String>, queries: Vec<String>) -> Self {
        Self {
            name: name.into(),
            queries,
        }
    }

    pub fn named_queries(&self) -> impl Iterator<Item = NamedQuery> + '_ {
        self.queries.iter().map(|query| NamedQuery {
            name: self.name.clone(),
            query: query.clone(),
        })
    }

    /// Rewrites each `g.V()`/`g.E()` query into one query per range of that
    /// element kind. Other queries, and kinds planned as a single ALL range,
    /// are kept as they are. Factories are rewound afterwards.
    pub fn split(&self, factories: &LazyRangeFactories<'_>) -> Result<NamedQueries> {
        let mut queries = Vec::new();
        for query in &self.queries {
            let Some((kind, at)) = source_of(query) else {
                queries.push(query.clone());
                continue;
            };

            let factory = factories.for_kind(kind)?;
            loop {
                let range = factory.next_range();
                if range.is_empty() {
                    break;
                }
                if range.is_all() {
                    queries.push(query.clone());
                } else {
                    queries.push(format!("{}.{range}{}", &query[..at], &query[at..]));
                }
            }
            factory.reset();
        }

        debug!(
            name = %self.name,
            before = self.queries.len(),
            after = queries.len(),
            "Split queries"
        );
        Ok(NamedQueries::new(self.name.clone(), queries))
    }
}

/// Element kind a query starts from, and the byte offset just past `g.V()`/`g.E()`.
fn source_of(query: &str) -> Option<(GraphElementType, usize)> {
    let caps = SOURCE_REGEX.captures(query)?;
    let kind = match &caps[1] {
        "V" => GraphElementType::Nodes,
        _ => GraphElementType::Edges,
    };
    caps.get(0).map(|m| (kind, m.end()))
}

pub fn parse_named_queries(json: &str) -> Result<Vec<NamedQueries>> {
    serde_json::from_str(json).context("Failed to parse named queries")
}

pub fn load_named_queries(path: &Path) -> Result<Vec<NamedQueries>> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read queries file: {}", path.display()))?;
    parse_named_queries(&json).with_context(|| format!("Invalid queries file: {}", path.display()))
}

/// Disk failures stop the job; anything else only costs the current query.
fn is_fatal(err: &anyhow::Error) -> bool {
    if ExportError::is_query_local(err) || ExportError::is_element_local(err) {
        return false;
    }
    err.chain().any(|cause| cause.is::<io::Error>())
}

/// One worker draining the shared query queue
pub struct QueryTask<'a> {
    index: usize,
    client: &'a dyn GraphQueryClient,
    config: &'a ExportConfig,
    queue: &'a Receiver<NamedQuery>,
    status: &'a Status,
    stats: &'a ExportStats,
    structured: bool,
}

impl<'a> QueryTask<'a> {
    pub fn new(
        index: usize,
        client: &'a dyn GraphQueryClient,
        config: &'a ExportConfig,
        queue: &'a Receiver<NamedQuery>,
        status: &'a Status,
        stats: &'a ExportStats,
        structured: bool,
    ) -> Self {
        Self {
            index,
            client,
            config,
            queue,
            status,
            stats,
            structured,
        }
    }

    pub fn run(&self, mut writers: LabelWriters<'_>) -> Result<TaskFiles> {
        let result = self.drain(&mut writers);
        let output = writers.close();
        result.map(|()| output)
    }

    fn drain(&self, writers: &mut LabelWriters<'_>) -> Result<()> {
        while self.status.allow_continue() {
            let named = match self.queue.try_recv() {
                Ok(named) => named,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    self.status.halt();
                    break;
                }
            };

            let start = Instant::now();
            match self.execute(&named, writers) {
                Ok(rows) => debug!(
                    task = self.index,
                    name = %named.name,
                    rows,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Query complete"
                ),
                Err(e) if !is_fatal(&e) => {
                    warn!(
                        task = self.index,
                        name = %named.name,
                        query = %named.query,
                        error = %e,
                        "Abandoning query"
                    );
                    self.stats.inc_abandoned_queries();
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Task {} failed on query {}", self.index, named.name)
                    })
                }
            }
        }
        Ok(())
    }

    fn filters(&self) -> KindFilters<'a> {
        KindFilters::both(Some(&self.config.node_filter), Some(&self.config.edge_filter))
    }

    fn execute(&self, named: &NamedQuery, writers: &mut LabelWriters<'_>) -> Result<u64> {
        if self.config.schema_mode == SchemaMode::TwoPass {
            self.seed(named, writers)?;
        }

        let query = named.query.as_str();
        if self.structured {
            let handler = StatusHandler::new(
                QueryResultsHandler::new(ExportTaskHandler::new(
                    self.filters(),
                    writers,
                    self.stats,
                )),
                self.status,
            );
            self.submit(query, CountingHandler::new(handler), false)
        } else {
            let handler = StatusHandler::new(
                ResultsHandler::new(&named.name, writers, self.stats),
                self.status,
            );
            self.submit(query, CountingHandler::new(handler), true)
        }
    }

    /// Schema-only run of the query; its columns become the header seed.
    fn seed(&self, named: &NamedQuery, writers: &mut LabelWriters<'_>) -> Result<()> {
        let query = named.query.as_str();
        if self.structured {
            let mut schema = GraphSchema::new();
            let handler =
                QueryResultsHandler::new(SchemaOnlyHandler::new(self.filters(), &mut schema));
            self.submit(query, CountingHandler::new(handler), false)?;
            writers.seed_with(OutputKind::Nodes, &schema.nodes);
            writers.seed_with(OutputKind::Edges, &schema.edges);
        } else {
            let mut results = GraphElementSchemas::new();
            let handler = ResultsSchemaHandler::new(&named.name, &mut results);
            self.submit(query, CountingHandler::new(handler), true)?;
            writers.seed_with(OutputKind::Results, &results);
        }
        Ok(())
    }

    fn submit<H>(
        &self,
        query: &str,
        mut handler: CountingHandler<H>,
        allow_tokens: bool,
    ) -> Result<u64>
    where
        H: ElementHandler<QueryRow>,
    {
        self.client
            .submit(query, &mut |row: QueryRow| handler.handle(row, allow_tokens))?;
        Ok(handler.count())
    }
}

/// Exports the results of a list of named queries.
pub struct QueryJob<'a> {
    client: &'a dyn GraphQueryClient,
    config: &'a ExportConfig,
    queries: Vec<NamedQueries>,
    structured: bool,
    split: bool,
}

impl<'a> QueryJob<'a> {
    pub fn new(
        client: &'a dyn GraphQueryClient,
        config: &'a ExportConfig,
        queries: Vec<NamedQueries>,
    ) -> Self {
        Self {
            client,
            config,
            queries,
            structured: false,
            split: false,
        }
    }

    /// Route element-shaped rows to node and edge files instead of per-query results.
    pub fn structured_output(mut self, structured: bool) -> Self {
        self.structured = structured;
        self
    }

    pub fn split_queries(mut self, split: bool) -> Self {
        self.split = split;
        self
    }

    pub fn run(&self) -> Result<ExportSummary> {
        self.config.validate_for_queries(self.structured)?;
        let output_dir = &self.config.output_dir;
        fs::create_dir_all(output_dir).with_context(|| {
            format!("Failed to create output directory: {}", output_dir.display())
        })?;

        let start = Instant::now();
        let (sender, queue) = crossbeam_channel::unbounded();
        let factories = LazyRangeFactories::new(
            self.client,
            &self.config.node_filter,
            &self.config.edge_filter,
            self.config.range,
            self.config.concurrency,
        );
        let mut queued = 0usize;
        for named_queries in &self.queries {
            let named_queries = if self.split {
                named_queries.split(&factories)?
            } else {
                named_queries.clone()
            };
            for named in named_queries.named_queries() {
                sender.send(named).context("Failed to queue named query")?;
                queued += 1;
            }
        }
        drop(sender);
        info!(queries = queued, structured = self.structured, "Queued named queries");

        let budget = FileHandleBudget::new(self.config.max_file_handles);
        let stats = ExportStats::new();
        let file_index = Arc::new(AtomicUsize::new(0));
        let kinds = if self.structured {
            vec![OutputKind::Nodes, OutputKind::Edges]
        } else {
            vec![OutputKind::Results]
        };
        let factories: Vec<WriterFactory> = kinds
            .into_iter()
            .map(|kind| {
                WriterFactory::new(output_dir, kind, self.config.format, file_index.clone())
            })
            .collect();

        let workers = self.config.concurrency.concurrency();
        let status = Status::new("Running queries");
        let outputs = run_tasks(workers, |index| {
            let writers = LabelWriters::with_factories(factories.clone(), &budget);
            QueryTask::new(
                index,
                self.client,
                self.config,
                &queue,
                &status,
                &stats,
                self.structured,
            )
            .run(writers)
        });
        status.finish();
        let outputs = outputs?;

        let mut node_fragments = Vec::with_capacity(outputs.len());
        let mut edge_fragments = Vec::with_capacity(outputs.len());
        let mut result_fragments = Vec::with_capacity(outputs.len());
        for output in outputs {
            node_fragments.push(output.nodes);
            edge_fragments.push(output.edges);
            result_fragments.push(output.results);
        }

        let rewrite = rewrite_command(self.config.format);
        let mut schema = GraphSchema::new();
        schema.nodes = rewrite
            .execute(&MasterLabelSchemas::from_fragments(node_fragments), OutputKind::Nodes)
            .context("Failed to reconcile node files")?;
        schema.edges = rewrite
            .execute(&MasterLabelSchemas::from_fragments(edge_fragments), OutputKind::Edges)
            .context("Failed to reconcile edge files")?;
        schema.results = rewrite
            .execute(&MasterLabelSchemas::from_fragments(result_fragments), OutputKind::Results)
            .context("Failed to reconcile result files")?;

        schema.write_to(output_dir)?;
        stats.write_to(output_dir)?;

        info!(
            rows = status.processed(),
            abandoned = stats.abandoned_queries(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Named-query export complete"
        );

        Ok(ExportSummary {
            schema,
            stats,
            max_open_files: budget.high_water(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::LabelsFilter;
    use crate::memgraph::tests::modern;
    use crate::range::RangeConfig;

    fn factories<'a>(
        graph: &'a dyn GraphQueryClient,
        filters: &'a (LabelsFilter, LabelsFilter),
        range: RangeConfig,
    ) -> LazyRangeFactories<'a> {
        LazyRangeFactories::new(graph, &filters.0, &filters.1, range, Default::default())
    }

    fn default_filters() -> (LabelsFilter, LabelsFilter) {
        let config = ExportConfig::new("/tmp/unused");
        (config.node_filter, config.edge_filter)
    }

    #[test]
    fn parses_both_entry_shapes() -> Result<()> {
        let queries = parse_named_queries(
            r#"[
                {"name": "people", "query": "g.V().hasLabel('person')"},
                {"name": "links", "queries": ["g.E().hasLabel('knows')", "g.E().hasLabel('created')"]}
            ]"#,
        )?;
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].queries, vec!["g.V().hasLabel('person')"]);
        assert_eq!(queries[1].named_queries().count(), 2);
        assert!(queries[1].named_queries().all(|q| q.name == "links"));
        Ok(())
    }

    #[test]
    fn malformed_queries_file_is_an_error() {
        assert!(parse_named_queries(r#"[{"query": "g.V()"}]"#).is_err());
    }

    #[test]
    fn split_inserts_ranges_after_source_step() -> Result<()> {
        let graph = modern();
        let filters = default_filters();
        let range = RangeConfig {
            range_size: 5,
            ..RangeConfig::default()
        };
        let factories = factories(&graph, &filters, range);

        let named = NamedQueries::new("people", vec!["g.V().hasLabel('person')".into()]);
        let split = named.split(&factories)?;
        assert_eq!(
            split.queries,
            vec![
                "g.V().range(0, 5).hasLabel('person')",
                "g.V().range(5, -1).hasLabel('person')",
            ]
        );
        assert!(!factories.is_initialized(GraphElementType::Edges));

        // Rewound, so a second split plans the same ranges
        assert_eq!(named.split(&factories)?, split);
        Ok(())
    }

    #[test]
    fn split_edges_by_estimate() -> Result<()> {
        let graph = modern();
        let filters = default_filters();
        let range = RangeConfig {
            range_size: 5,
            approx_edge_count: Some(14),
            ..RangeConfig::default()
        };
        let factories = factories(&graph, &filters, range);

        let named = NamedQueries::new("links", vec!["g.E().elementMap()".into()]);
        assert_eq!(
            named.split(&factories)?.queries,
            vec![
                "g.E().range(0, 5).elementMap()",
                "g.E().range(5, 10).elementMap()",
                "g.E().range(10, -1).elementMap()",
            ]
        );
        Ok(())
    }

    #[test]
    fn single_range_leaves_query_unaltered() -> Result<()> {
        let graph = modern();
        let filters = default_filters();
        let factories = factories(&graph, &filters, RangeConfig::default());

        let named = NamedQueries::new("all", vec!["g.V()".into(), "inject(1)".into()]);
        assert_eq!(named.split(&factories)?, named);
        Ok(())
    }

    #[test]
    fn query_errors_are_not_fatal_but_io_is() {
        let unsupported = anyhow::Error::new(ExportError::UnsupportedQuery("x".into()));
        assert!(!is_fatal(&unsupported));
        let io = anyhow::Error::new(io::Error::other("disk full")).context("Failed to write");
        assert!(is_fatal(&io));
    }
}
