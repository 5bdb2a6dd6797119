//! Ariadne: concurrent, range-partitioned property-graph export
//!
//! This crate exports a labeled property graph into one file per label, with a
//! schema inferred from the data as it streams past:
//!
//! 1. **Range planning** -- Count (or estimate) the elements of a kind and cut the
//!    ordinal space into windows that workers claim through one atomic cursor
//! 2. **Extraction** -- Each worker streams its window through a handler chain:
//!    classify by label, fetch the label's writer, update the label schema, write
//! 3. **Merge** -- Per-worker file schemas are unioned into one canonical schema
//!    per label, and CSV files written with an older header are rewritten
//!
//! Besides "export everything", a fixed list of named queries can be exported,
//! either as node/edge files or as one results file per query name.
//!
//! # Architecture
//!
//! - **Lock-free range claims** -- `RangeFactory` hands out windows with a CAS loop
//! - **Bounded file handles** -- All writer pools share one `FileHandleBudget`;
//!   a pool over budget suspends its least-recently-used writer
//! - **Worker-owned state** -- Writers and schema fragments belong to one task
//!   until the job barrier, then move to the single-threaded merge
//! - **Shared halt flag** -- `Status` stops every worker at its next loop iteration
//!
//! # Key Modules
//!
//! - [`range`] -- Range windows and the concurrent range factory
//! - [`label`] -- Labels, labeling strategies and label filters
//! - [`element`] -- The closed set of element shapes a client may return
//! - [`client`] -- The `GraphQueryClient` seam and ranged element queries
//! - [`memgraph`] -- A local graph source loaded from a JSON dump
//! - [`schema`] -- Type inference, label schemas, merge and CSV rewrite
//! - [`writer`] -- CSV and line-JSON printers, per-label writers
//! - [`pool`] -- Writer pools under a shared open-handle budget
//! - [`handler`] -- The per-element processing stages
//! - [`export`] -- Full export of nodes and edges
//! - [`query`] -- Named-query export
//! - [`stats`] -- Per-label export statistics
//! - [`config`] -- Constants and job configuration
//!
//! # Example Usage
//!
//! ```bash
//! # Export a graph dump with 8 workers and at most 64 open files
//! ariadne export-pg -i graph.json.bz2 -o out/ --concurrency 8 --max-file-handles 64
//!
//! # Export the results of named queries, split by range
//! ariadne export-pg-from-queries -i graph.json -o out/ -q queries.json --split-queries
//! ```

pub mod client;
pub mod config;
pub mod element;
pub mod error;
pub mod export;
pub mod handler;
pub mod label;
pub mod memgraph;
pub mod pool;
pub mod query;
pub mod range;
pub mod schema;
pub mod stats;
pub mod status;
pub mod writer;
