use crate::error::ExportError;
use crate::label::{LabelStrategy, LabelsFilter};
use crate::range::RangeConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Worker count used when the caller does not choose one
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Below this many elements a range factory falls back to a single worker
pub const MIN_COUNT_FOR_CONCURRENCY: u64 = 1000;

/// Progress update interval (tick every N elements)
pub const PROGRESS_INTERVAL: u64 = 10_000;

/// Buffer size for label writers
pub const WRITER_BUFFER_SIZE: usize = 128 * 1024;

/// Buffer size for the header rewrite pass
pub const REWRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Back-off between attempts to acquire a file handle held by another task
pub const HANDLE_WAIT_MILLIS: u64 = 5;

pub const SCHEMA_FILE_NAME: &str = "schema.json";
pub const STATS_FILE_NAME: &str = "stats.json";

pub const NODES_DIR: &str = "nodes";
pub const EDGES_DIR: &str = "edges";
pub const RESULTS_DIR: &str = "results";

/// Row format of every output file in a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "CSV",
            OutputFormat::Json => "line-JSON",
        }
    }
}

/// How the schema of each label is discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SchemaMode {
    /// Discover the schema from the rows being written; stale CSV headers are rewritten afterwards
    #[default]
    SinglePass,
    /// Run a schema-only pass first so every file starts with its final header
    TwoPass,
}

#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyConfig {
    concurrency: usize,
}

impl ConcurrencyConfig {
    pub fn new(concurrency: usize) -> Self {
        Self { concurrency }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Range widths are derived from counts only when the caller left them open
    /// and there is more than one worker to share them.
    pub fn is_unbounded_parallel_execution(&self, range: &RangeConfig) -> bool {
        range.range_size == -1 && self.concurrency > 1
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

/// Everything a job needs besides the graph client
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub concurrency: ConcurrencyConfig,
    pub range: RangeConfig,
    /// Process-wide cap on open label writers; 0 means unlimited
    pub max_file_handles: usize,
    pub schema_mode: SchemaMode,
    pub node_filter: LabelsFilter,
    pub edge_filter: LabelsFilter,
}

impl ExportConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            format: OutputFormat::Csv,
            concurrency: ConcurrencyConfig::default(),
            range: RangeConfig::default(),
            max_file_handles: 0,
            schema_mode: SchemaMode::default(),
            node_filter: LabelsFilter::all(LabelStrategy::NodeLabelsOnly),
            edge_filter: LabelsFilter::all(LabelStrategy::EdgeLabelsOnly),
        }
    }

    /// Rejects settings that cannot work together before any worker starts.
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.concurrency.concurrency() == 0 {
            return Err(ExportError::Config("concurrency must be at least 1".into()));
        }
        if self.range.range_size == 0 || self.range.range_size < -1 {
            return Err(ExportError::Config(format!(
                "range size must be positive or -1, got {}",
                self.range.range_size
            )));
        }
        if self.range.limit == Some(0) {
            return Err(ExportError::Config("limit must be greater than 0".into()));
        }
        if self.range.approx_node_count == Some(0) || self.range.approx_edge_count == Some(0) {
            return Err(ExportError::Config(
                "approximate counts must be greater than 0".into(),
            ));
        }
        if self.node_filter.strategy().is_edge_strategy() {
            return Err(ExportError::Config(
                "node filter must use the node label strategy".into(),
            ));
        }
        if !self.edge_filter.strategy().is_edge_strategy() {
            return Err(ExportError::Config(
                "edge filter must use an edge label strategy".into(),
            ));
        }
        Ok(())
    }

    /// Extra checks for named-query jobs.
    pub fn validate_for_queries(&self, structured_output: bool) -> Result<(), ExportError> {
        self.validate()?;
        if !structured_output {
            if self.node_filter.is_specified() || self.edge_filter.is_specified() {
                return Err(ExportError::Config(
                    "label filters require structured query output".into(),
                ));
            }
            if self.edge_filter.strategy() == LabelStrategy::EdgeAndVertexLabels {
                return Err(ExportError::Config(
                    "edge and vertex labels require structured query output".into(),
                ));
            }
        }
        Ok(())
    }
}
