//! Range-partitioned export of all nodes and edges
//!
//! Each element kind is exported in its own phase: a `RangeFactory` hands out
//! windows, a fixed set of `ExportTask`s claims them until the shared `Status`
//! halts, and the per-task file schemas are merged and reconciled before the
//! next phase begins.

use crate::client::{ElementQuery, GraphQueryClient};
use crate::config::{ExportConfig, SchemaMode};
use crate::element::{GraphElementType, PgResult};
use crate::handler::{
    CountingHandler, ElementHandler, ExportTaskHandler, KindFilters, SchemaOnlyHandler,
    StatusHandler,
};
use crate::label::LabelsFilter;
use crate::pool::{FileHandleBudget, LabelWriters};
use crate::range::RangeFactory;
use crate::schema::{
    rewrite_command, FileSpecificLabelSchemas, GraphElementSchemas, GraphSchema,
    MasterLabelSchemas,
};
use crate::stats::ExportStats;
use crate::status::Status;
use crate::writer::WriterFactory;
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::fs;
use std::mem;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// What a finished job produced
pub struct ExportSummary {
    pub schema: GraphSchema,
    pub stats: ExportStats,
    /// Most label writers that were open at the same time
    pub max_open_files: usize,
}

/// Runs `task(0..workers)` on a dedicated pool of `workers` threads.
pub(crate) fn run_tasks<T, F>(workers: usize, task: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> Result<T> + Sync + Send,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("ariadne-worker-{i}"))
        .build()
        .context("Failed to build worker pool")?;
    pool.install(|| (0..workers).into_par_iter().map(&task).collect())
}

/// One worker of a range-partitioned phase
pub struct ExportTask<'a> {
    index: usize,
    client: &'a dyn GraphQueryClient,
    factory: &'a RangeFactory,
    filter: &'a LabelsFilter,
    status: &'a Status,
    stats: &'a ExportStats,
}

impl<'a> ExportTask<'a> {
    pub fn new(
        index: usize,
        client: &'a dyn GraphQueryClient,
        factory: &'a RangeFactory,
        filter: &'a LabelsFilter,
        status: &'a Status,
        stats: &'a ExportStats,
    ) -> Self {
        Self {
            index,
            client,
            factory,
            filter,
            status,
            stats,
        }
    }

    /// Exports ranges until the status halts, then closes the writers.
    ///
    /// Writers are closed on failure too, so partially written files still end
    /// up flushed.
    pub fn run(&self, mut writers: LabelWriters<'_>) -> Result<FileSpecificLabelSchemas> {
        let stats = self.stats;
        let filters = KindFilters::single(self.filter);
        let status = self.status;
        let result = self.for_each_range(|client, query| {
            let mut handler = CountingHandler::new(StatusHandler::new(
                ExportTaskHandler::new(filters, &mut writers, stats),
                status,
            ));
            client.query_elements(query, &mut |element: PgResult| handler.handle(element, false))?;
            Ok(handler.count())
        });

        let files = writers.close().into_kind(self.factory.kind().into());
        result.map(|()| files)
    }

    /// Walks the ranges recording label schemas only.
    pub fn scan_schemas(&self) -> Result<GraphElementSchemas> {
        let mut schema = GraphSchema::new();
        let filters = KindFilters::single(self.filter);
        let status = self.status;
        self.for_each_range(|client, query| {
            let mut handler = CountingHandler::new(StatusHandler::new(
                SchemaOnlyHandler::new(filters, &mut schema),
                status,
            ));
            client.query_elements(query, &mut |element: PgResult| handler.handle(element, false))?;
            Ok(handler.count())
        })?;
        Ok(mem::take(schema.for_kind_mut(self.factory.kind())))
    }

    fn for_each_range<F>(&self, mut run: F) -> Result<()>
    where
        F: FnMut(&dyn GraphQueryClient, &ElementQuery) -> Result<u64>,
    {
        let kind = self.factory.kind();
        while self.status.allow_continue() {
            let range = self.factory.next_range();
            if range.is_empty() {
                self.status.halt();
                break;
            }

            let query = self.filter.apply(ElementQuery::new(kind, range));
            debug!(task = self.index, query = %query, "Running range");
            let count = run(self.client, &query)
                .with_context(|| format!("Task {} failed on {query}", self.index))?;

            // A short window means the source ran out before the estimate did
            if range.size_exceeds(count) || self.factory.is_exhausted() {
                self.status.halt();
            }
        }
        Ok(())
    }
}

/// Exports every node and then every edge the filters admit.
pub struct ExportPropertyGraphJob<'a> {
    client: &'a dyn GraphQueryClient,
    config: &'a ExportConfig,
}

impl<'a> ExportPropertyGraphJob<'a> {
    pub fn new(client: &'a dyn GraphQueryClient, config: &'a ExportConfig) -> Self {
        Self { client, config }
    }

    pub fn run(&self) -> Result<ExportSummary> {
        self.config.validate()?;
        let output_dir = &self.config.output_dir;
        fs::create_dir_all(output_dir).with_context(|| {
            format!("Failed to create output directory: {}", output_dir.display())
        })?;

        let budget = FileHandleBudget::new(self.config.max_file_handles);
        let stats = ExportStats::new();
        let file_index = Arc::new(AtomicUsize::new(0));
        let mut schema = GraphSchema::new();

        for filter in [&self.config.node_filter, &self.config.edge_filter] {
            let kind = filter.element_type();
            let writer_factory =
                WriterFactory::new(output_dir, kind.into(), self.config.format, file_index.clone());
            *schema.for_kind_mut(kind) =
                self.export_kind(kind, filter, writer_factory, &budget, &stats)?;
        }

        schema.write_to(output_dir)?;
        stats.write_to(output_dir)?;

        Ok(ExportSummary {
            schema,
            stats,
            max_open_files: budget.high_water(),
        })
    }

    fn export_kind(
        &self,
        kind: GraphElementType,
        filter: &LabelsFilter,
        writer_factory: WriterFactory,
        budget: &FileHandleBudget,
        stats: &ExportStats,
    ) -> Result<GraphElementSchemas> {
        let start = Instant::now();
        let factory =
            RangeFactory::create(self.client, filter, &self.config.range, self.config.concurrency)?;
        let workers = factory.concurrency();

        let seed = match self.config.schema_mode {
            SchemaMode::SinglePass => None,
            SchemaMode::TwoPass => {
                let seed = self.scan_schemas(&factory, filter, stats)?;
                factory.reset();
                Some(seed)
            }
        };

        let status = Status::new(&format!("Exporting {kind}"));
        let fragments = run_tasks(workers, |index| {
            let mut writers = LabelWriters::new(writer_factory.clone(), budget);
            if let Some(seed) = &seed {
                writers.seed_with(kind.into(), seed);
            }
            ExportTask::new(index, self.client, &factory, filter, &status, stats).run(writers)
        });
        status.finish();
        let fragments = fragments?;

        let master = MasterLabelSchemas::from_fragments(fragments);
        let schemas = rewrite_command(self.config.format)
            .execute(&master, kind.into())
            .with_context(|| format!("Failed to reconcile {kind} files"))?;

        info!(
            kind = %kind,
            elements = status.processed(),
            labels = schemas.len(),
            workers,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Exported"
        );
        Ok(schemas)
    }

    fn scan_schemas(
        &self,
        factory: &RangeFactory,
        filter: &LabelsFilter,
        stats: &ExportStats,
    ) -> Result<GraphElementSchemas> {
        let status = Status::new(&format!("Scanning {} schema", factory.kind()));
        let scanned = run_tasks(factory.concurrency(), |index| {
            ExportTask::new(index, self.client, factory, filter, &status, stats).scan_schemas()
        });
        status.finish();

        let mut schemas = GraphElementSchemas::new();
        for fragment in scanned? {
            schemas.union(&fragment);
        }
        debug!(kind = %factory.kind(), labels = schemas.len(), "Schema pass complete");
        Ok(schemas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputFormat;
    use crate::label::{Label, LabelStrategy};
    use crate::memgraph::tests::modern;
    use crate::writer::OutputKind;
    use tempfile::TempDir;

    fn task_over<'a>(
        graph: &'a dyn GraphQueryClient,
        factory: &'a RangeFactory,
        filter: &'a LabelsFilter,
        status: &'a Status,
        stats: &'a ExportStats,
    ) -> ExportTask<'a> {
        ExportTask::new(0, graph, factory, filter, status, stats)
    }

    #[test]
    fn single_task_drains_all_ranges() -> Result<()> {
        let dir = TempDir::new()?;
        let graph = modern();
        let filter = LabelsFilter::all(LabelStrategy::NodeLabelsOnly);
        let factory = RangeFactory::new(GraphElementType::Nodes, 2, 0, None, 6, 1);
        let status = Status::hidden("test");
        let stats = ExportStats::new();
        let budget = FileHandleBudget::new(0);
        let writer_factory = WriterFactory::new(
            dir.path(),
            OutputKind::Nodes,
            OutputFormat::Csv,
            Arc::new(AtomicUsize::new(0)),
        );
        let writers = LabelWriters::new(writer_factory, &budget);

        let files = task_over(&graph, &factory, &filter, &status, &stats).run(writers)?;
        assert_eq!(stats.nodes(), 6);
        assert_eq!(status.processed(), 6);
        assert!(!status.allow_continue());
        assert_eq!(files.file_count(), 2);
        assert_eq!(budget.open_count(), 0);
        Ok(())
    }

    #[test]
    fn short_window_halts() -> Result<()> {
        let graph = modern();
        let filter = LabelsFilter::all(LabelStrategy::NodeLabelsOnly);
        // Estimate well above the real count; the first window comes back short
        let factory = RangeFactory::new(GraphElementType::Nodes, 10, 0, None, 100, 1);
        let status = Status::hidden("test");
        let stats = ExportStats::new();

        let schemas = task_over(&graph, &factory, &filter, &status, &stats).scan_schemas()?;
        assert!(!status.allow_continue());
        assert!(!factory.is_exhausted());
        assert_eq!(status.processed(), 6);
        assert_eq!(schemas.get(&Label::new("person")).unwrap().element_count(), 4);
        Ok(())
    }

    #[test]
    fn halted_status_claims_nothing() -> Result<()> {
        let graph = modern();
        let filter = LabelsFilter::all(LabelStrategy::NodeLabelsOnly);
        let factory = RangeFactory::new(GraphElementType::Nodes, 2, 0, None, 6, 1);
        let status = Status::hidden("test");
        status.halt();
        let stats = ExportStats::new();

        let schemas = task_over(&graph, &factory, &filter, &status, &stats).scan_schemas()?;
        assert!(schemas.is_empty());
        assert_eq!(factory.next_range().start(), 0);
        Ok(())
    }

    #[test]
    fn job_writes_schema_and_stats() -> Result<()> {
        let dir = TempDir::new()?;
        let graph = modern();
        let config = ExportConfig::new(dir.path());

        let summary = ExportPropertyGraphJob::new(&graph, &config).run()?;
        assert_eq!(summary.stats.nodes(), 6);
        assert_eq!(summary.stats.edges(), 6);
        assert_eq!(summary.schema.nodes.len(), 2);
        assert_eq!(summary.schema.edges.len(), 2);
        assert!(dir.path().join("schema.json").exists());
        assert!(dir.path().join("stats.json").exists());
        Ok(())
    }

    #[test]
    fn invalid_config_fails_before_writing() {
        let dir = TempDir::new().unwrap();
        let graph = modern();
        let mut config = ExportConfig::new(dir.path().join("out"));
        config.range.range_size = 0;

        assert!(ExportPropertyGraphJob::new(&graph, &config).run().is_err());
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn run_tasks_runs_each_index_once() -> Result<()> {
        let mut seen = run_tasks(4, |i| Ok(i * 10))?;
        seen.sort();
        assert_eq!(seen, vec![0, 10, 20, 30]);
        Ok(())
    }
}
