use anyhow::{Context, Result};
use ariadne::config::{
    ConcurrencyConfig, ExportConfig, OutputFormat, SchemaMode, DEFAULT_CONCURRENCY,
};
use ariadne::export::{ExportPropertyGraphJob, ExportSummary};
use ariadne::label::{Label, LabelStrategy, LabelsFilter};
use ariadne::memgraph::InMemoryGraph;
use ariadne::query::{load_named_queries, QueryJob};
use ariadne::range::RangeConfig;
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "ariadne")]
#[command(about = "Export a property graph into per-label CSV or line-JSON files")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export every node and edge
    ExportPg(ExportPgArgs),
    /// Export the results of named queries
    ExportPgFromQueries(ExportQueriesArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// Graph dump to export (.json or .json.bz2)
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory for generated files
    #[arg(short, long)]
    output: PathBuf,

    /// Output file format
    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,

    /// Number of export workers
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Elements per range (-1 derives it from the element count)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    range_size: i64,

    /// Skip this many elements of each kind
    #[arg(long, default_value_t = 0)]
    skip: u64,

    /// Export at most this many elements of each kind
    #[arg(long)]
    limit: Option<u64>,

    /// Estimated node count, used instead of a count query
    #[arg(long)]
    approx_node_count: Option<u64>,

    /// Estimated edge count, used instead of a count query
    #[arg(long)]
    approx_edge_count: Option<u64>,

    /// Maximum number of label files open at once (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_file_handles: usize,

    /// Discover each label's schema while writing, or in a separate pass first
    #[arg(long, value_enum, default_value_t = SchemaMode::SinglePass)]
    schema_mode: SchemaMode,

    /// Only export nodes with this label (repeatable)
    #[arg(long = "node-label")]
    node_labels: Vec<String>,

    /// Only export edges with this label, e.g. `knows` or `(person)-knows-(person)` (repeatable)
    #[arg(long = "edge-label")]
    edge_labels: Vec<String>,

    /// How edges are labeled
    #[arg(long, value_enum, default_value_t = LabelStrategy::EdgeLabelsOnly)]
    edge_label_strategy: LabelStrategy,

    /// Remove the output directory before exporting
    #[arg(long)]
    clean: bool,
}

#[derive(Args)]
struct ExportPgArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct ExportQueriesArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// JSON file of named queries
    #[arg(short, long)]
    queries: PathBuf,

    /// Write element-shaped rows to node and edge files instead of per-query results
    #[arg(long)]
    structured_output: bool,

    /// Split each `g.V()`/`g.E()` query into one query per range
    #[arg(long)]
    split_queries: bool,
}

impl CommonArgs {
    fn to_config(&self) -> ExportConfig {
        let parse =
            |labels: &[String]| -> Vec<Label> { labels.iter().map(|l| Label::parse(l)).collect() };
        ExportConfig {
            output_dir: self.output.clone(),
            format: self.format,
            concurrency: ConcurrencyConfig::new(self.concurrency),
            range: RangeConfig {
                range_size: self.range_size,
                skip: self.skip,
                limit: self.limit,
                approx_node_count: self.approx_node_count,
                approx_edge_count: self.approx_edge_count,
            },
            max_file_handles: self.max_file_handles,
            schema_mode: self.schema_mode,
            node_filter: LabelsFilter::specified(
                LabelStrategy::NodeLabelsOnly,
                parse(&self.node_labels),
            ),
            edge_filter: LabelsFilter::specified(
                self.edge_label_strategy,
                parse(&self.edge_labels),
            ),
        }
    }

    fn prepare(&self) -> Result<(InMemoryGraph, ExportConfig)> {
        if self.clean && self.output.exists() {
            info!("Cleaning output directory: {}", self.output.display());
            fs::remove_dir_all(&self.output).with_context(|| {
                format!("Failed to clean output directory: {}", self.output.display())
            })?;
        }
        let graph = InMemoryGraph::load(&self.input)?;
        Ok((graph, self.to_config()))
    }
}

fn run_export(args: ExportPgArgs) -> Result<()> {
    let (graph, config) = args.common.prepare()?;

    let start = Instant::now();
    let summary = ExportPropertyGraphJob::new(&graph, &config).run()?;
    print_summary(&summary, &config, start.elapsed());
    Ok(())
}

fn run_queries(args: ExportQueriesArgs) -> Result<()> {
    let (graph, config) = args.common.prepare()?;
    let queries = load_named_queries(&args.queries)?;

    let start = Instant::now();
    let summary = QueryJob::new(&graph, &config, queries)
        .structured_output(args.structured_output)
        .split_queries(args.split_queries)
        .run()?;
    print_summary(&summary, &config, start.elapsed());
    Ok(())
}

fn print_summary(summary: &ExportSummary, config: &ExportConfig, elapsed: Duration) {
    println!();
    println!("=== Summary ===");
    println!("Export time:        {:.2}s", elapsed.as_secs_f64());
    println!("Output directory:   {}", display_dir(&config.output_dir));
    println!("Format:             {}", config.format.description());
    println!("Node labels:        {}", summary.schema.nodes.len());
    println!("Edge labels:        {}", summary.schema.edges.len());
    if !summary.schema.results.is_empty() {
        println!("Query results:      {}", summary.schema.results.len());
    }
    println!("Max open files:     {}", summary.max_open_files);
    println!();
    print!("{}", summary.stats);
}

fn display_dir(path: &Path) -> String {
    fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let result = match cli.command {
        Commands::ExportPg(args) => run_export(args),
        Commands::ExportPgFromQueries(args) => run_queries(args),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
