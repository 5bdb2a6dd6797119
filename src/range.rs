//! Range planning for partitioned element queries
//!
//! A `RangeFactory` hands out disjoint `[start, end)` windows over the ordinal
//! positions of one element kind. The cursor is a single `AtomicI64` advanced by
//! compare-and-swap, so concurrent workers never receive overlapping windows and
//! exactly one caller receives the final, open-ended window.

use crate::client::{ElementQuery, GraphQueryClient};
use crate::config::{ConcurrencyConfig, MIN_COUNT_FOR_CONCURRENCY};
use crate::element::GraphElementType;
use crate::label::LabelsFilter;
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::info;

/// Half-open window over element ordinals; `end == -1` means "to completion".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    start: i64,
    end: i64,
}

impl Range {
    /// No partitioning: every element in one window
    pub const ALL: Range = Range { start: 0, end: -1 };

    /// No more work
    pub const EMPTY: Range = Range { start: -1, end: -1 };

    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn is_all(&self) -> bool {
        *self == Range::ALL
    }

    pub fn is_empty(&self) -> bool {
        *self == Range::EMPTY
    }

    pub fn is_open_ended(&self) -> bool {
        self.end == -1 && !self.is_empty()
    }

    /// True when the window is bounded and wider than `count`, i.e. the source
    /// returned fewer rows than the window could hold.
    pub fn size_exceeds(&self, count: u64) -> bool {
        if self.end == -1 {
            return false;
        }
        (self.end - self.start) > count as i64
    }

    /// Slice bounds for a sequence of `len` items.
    pub fn bounds(&self, len: usize) -> (usize, usize) {
        if self.is_empty() {
            return (0, 0);
        }
        let start = (self.start.max(0) as usize).min(len);
        let end = if self.end == -1 {
            len
        } else {
            (self.end.max(0) as usize).clamp(start, len)
        };
        (start, end)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "range({}, {})", self.start, self.end)
    }
}

/// How the element space of one kind is partitioned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeConfig {
    /// Width of each window; -1 derives it from the count and the worker count
    pub range_size: i64,
    pub skip: u64,
    /// Maximum number of elements to export after `skip`; `None` exports everything
    pub limit: Option<u64>,
    /// Caller-supplied estimates that replace the count query
    pub approx_node_count: Option<u64>,
    pub approx_edge_count: Option<u64>,
}

impl RangeConfig {
    pub fn approx_count(&self, kind: GraphElementType) -> Option<u64> {
        match kind {
            GraphElementType::Nodes => self.approx_node_count,
            GraphElementType::Edges => self.approx_edge_count,
        }
    }
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            range_size: -1,
            skip: 0,
            limit: None,
            approx_node_count: None,
            approx_edge_count: None,
        }
    }
}

/// Cursor value once the final window has been handed out
const EXHAUSTED: i64 = i64::MIN;

pub struct RangeFactory {
    kind: GraphElementType,
    range_size: i64,
    skip: i64,
    upper_bound: i64,
    unlimited: bool,
    concurrency: usize,
    cursor: AtomicI64,
}

impl RangeFactory {
    pub fn new(
        kind: GraphElementType,
        range_size: i64,
        skip: u64,
        limit: Option<u64>,
        estimated_count: u64,
        concurrency: usize,
    ) -> Self {
        let skip = skip as i64;
        let upper_bound = match limit {
            Some(limit) => skip.saturating_add(limit as i64),
            None => estimated_count as i64,
        };
        Self {
            kind,
            range_size,
            skip,
            upper_bound,
            unlimited: limit.is_none(),
            concurrency,
            cursor: AtomicI64::new(skip),
        }
    }

    /// Builds a factory, asking the client for a count only when no estimate or
    /// limit was supplied.
    pub fn create(
        client: &dyn GraphQueryClient,
        filter: &LabelsFilter,
        config: &RangeConfig,
        concurrency: ConcurrencyConfig,
    ) -> Result<Self> {
        let kind = filter.element_type();
        let estimated_count = match (config.approx_count(kind), config.limit) {
            (Some(approx), _) => approx,
            (None, Some(limit)) => limit,
            (None, None) => {
                let query = filter.apply(ElementQuery::new(kind, Range::ALL));
                client
                    .approx_count(&query)
                    .with_context(|| format!("Failed to count {kind}"))?
            }
        };

        let effective_concurrency = if estimated_count < MIN_COUNT_FOR_CONCURRENCY {
            1
        } else {
            concurrency.concurrency()
        };
        let effective = ConcurrencyConfig::new(effective_concurrency);
        let range_size = if effective.is_unbounded_parallel_execution(config) {
            (estimated_count / effective_concurrency as u64) as i64 + 1
        } else {
            config.range_size
        };

        info!(
            kind = %kind,
            estimated_count,
            range_size,
            concurrency = effective_concurrency,
            "Planned ranges"
        );

        Ok(Self::new(
            kind,
            range_size,
            config.skip,
            config.limit,
            estimated_count,
            effective_concurrency,
        ))
    }

    pub fn kind(&self) -> GraphElementType {
        self.kind
    }

    /// Number of workers this partitioning was planned for.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn range_size(&self) -> i64 {
        self.range_size
    }

    /// Next unclaimed window, or `Range::EMPTY` once the space is used up.
    pub fn next_range(&self) -> Range {
        let mut current = self.cursor.load(Ordering::Acquire);
        loop {
            if current == EXHAUSTED {
                return Range::EMPTY;
            }

            let (range, next) = self.window_at(current);
            match self.cursor.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return range,
                Err(actual) => current = actual,
            }
        }
    }

    fn window_at(&self, start: i64) -> (Range, i64) {
        let last_end = if self.unlimited { -1 } else { self.upper_bound };
        if self.range_size <= 0 {
            return (Range::new(start, last_end), EXHAUSTED);
        }
        let end = start.saturating_add(self.range_size);
        if end >= self.upper_bound {
            (Range::new(start, last_end), EXHAUSTED)
        } else {
            (Range::new(start, end), end)
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.load(Ordering::Acquire) == EXHAUSTED
    }

    /// Rewinds the cursor so the same windows can be replayed.
    pub fn reset(&self) {
        self.cursor.store(self.skip, Ordering::Release);
    }
}

impl fmt::Debug for RangeFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeFactory")
            .field("kind", &self.kind)
            .field("range_size", &self.range_size)
            .field("skip", &self.skip)
            .field("upper_bound", &self.upper_bound)
            .field("unlimited", &self.unlimited)
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish()
    }
}

/// Node and edge factories built on first use, each paying for its count query
/// only if a caller actually needs it.
pub struct LazyRangeFactories<'a> {
    client: &'a dyn GraphQueryClient,
    node_filter: &'a LabelsFilter,
    edge_filter: &'a LabelsFilter,
    config: RangeConfig,
    concurrency: ConcurrencyConfig,
    nodes: OnceCell<RangeFactory>,
    edges: OnceCell<RangeFactory>,
}

impl<'a> LazyRangeFactories<'a> {
    pub fn new(
        client: &'a dyn GraphQueryClient,
        node_filter: &'a LabelsFilter,
        edge_filter: &'a LabelsFilter,
        config: RangeConfig,
        concurrency: ConcurrencyConfig,
    ) -> Self {
        Self {
            client,
            node_filter,
            edge_filter,
            config,
            concurrency,
            nodes: OnceCell::new(),
            edges: OnceCell::new(),
        }
    }

    pub fn for_kind(&self, kind: GraphElementType) -> Result<&RangeFactory> {
        let (cell, filter) = match kind {
            GraphElementType::Nodes => (&self.nodes, self.node_filter),
            GraphElementType::Edges => (&self.edges, self.edge_filter),
        };
        cell.get_or_try_init(|| {
            RangeFactory::create(self.client, filter, &self.config, self.concurrency)
        })
    }

    pub fn is_initialized(&self, kind: GraphElementType) -> bool {
        match kind {
            GraphElementType::Nodes => self.nodes.get().is_some(),
            GraphElementType::Edges => self.edges.get().is_some(),
        }
    }
}
