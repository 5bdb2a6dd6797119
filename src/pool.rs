//! Writer pool with a process-wide cap on open file handles
//!
//! Every task owns one `LabelWriters`. All pools of a job share one
//! `FileHandleBudget`; a pool that needs a handle while the budget is spent
//! closes its own least-recently-used writer first, and if it has none open it
//! waits for another task to give one back.

use crate::config::HANDLE_WAIT_MILLIS;
use crate::label::Label;
use crate::schema::{FileSpecificLabelSchemas, GraphElementSchemas};
use crate::writer::{LabelWriter, OutputKind, WriterFactory};
use anyhow::{anyhow, Result};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Shared open-handle counter
#[derive(Debug)]
pub struct FileHandleBudget {
    max: usize,
    open: AtomicUsize,
    high_water: AtomicUsize,
}

impl FileHandleBudget {
    /// `max == 0` means unlimited.
    pub fn new(max: usize) -> Self {
        Self {
            max,
            open: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn is_unlimited(&self) -> bool {
        self.max == 0
    }

    pub fn try_acquire(&self) -> bool {
        let mut current = self.open.load(Ordering::Acquire);
        loop {
            if !self.is_unlimited() && current >= self.max {
                return false;
            }
            match self.open.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.high_water.fetch_max(current + 1, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Largest number of handles ever open at once.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}

/// Files one task wrote, per output kind
#[derive(Debug, Default)]
pub struct TaskFiles {
    pub nodes: FileSpecificLabelSchemas,
    pub edges: FileSpecificLabelSchemas,
    pub results: FileSpecificLabelSchemas,
}

impl TaskFiles {
    pub fn for_kind_mut(&mut self, kind: OutputKind) -> &mut FileSpecificLabelSchemas {
        match kind {
            OutputKind::Nodes => &mut self.nodes,
            OutputKind::Edges => &mut self.edges,
            OutputKind::Results => &mut self.results,
        }
    }

    pub fn into_kind(self, kind: OutputKind) -> FileSpecificLabelSchemas {
        match kind {
            OutputKind::Nodes => self.nodes,
            OutputKind::Edges => self.edges,
            OutputKind::Results => self.results,
        }
    }
}

/// One task's writers, keyed by output kind and label.
///
/// A task keeps every kind it writes in a single pool, so the writer it evicts
/// under handle pressure can belong to any of them. A task only ever waits for
/// the budget while it holds no handle at all.
pub struct LabelWriters<'a> {
    factories: Vec<WriterFactory>,
    budget: &'a FileHandleBudget,
    writers: FxHashMap<(OutputKind, Label), LabelWriter>,
    seeds: FxHashMap<OutputKind, GraphElementSchemas>,
    clock: u64,
    evictions: u64,
}

impl<'a> LabelWriters<'a> {
    pub fn new(factory: WriterFactory, budget: &'a FileHandleBudget) -> Self {
        Self::with_factories(vec![factory], budget)
    }

    /// Pool writing several output kinds, one factory each.
    pub fn with_factories(factories: Vec<WriterFactory>, budget: &'a FileHandleBudget) -> Self {
        Self {
            factories,
            budget,
            writers: FxHashMap::default(),
            seeds: FxHashMap::default(),
            clock: 0,
            evictions: 0,
        }
    }

    /// Headers of `kind` writers created from now on start with these columns.
    pub fn seed_with(&mut self, kind: OutputKind, schemas: &GraphElementSchemas) {
        self.seeds.entry(kind).or_default().union(schemas);
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.writers.values().filter(|w| w.is_open()).count()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Writer for `label`, created or reopened in append mode as needed.
    pub fn get(&mut self, kind: OutputKind, label: &Label) -> Result<&mut LabelWriter> {
        self.clock += 1;
        let key = (kind, label.clone());

        match self.writers.get(&key).map(LabelWriter::is_open) {
            Some(true) => {}
            Some(false) => {
                self.acquire_handle()?;
                let reopened = self
                    .writers
                    .get_mut(&key)
                    .map(LabelWriter::reopen)
                    .unwrap_or_else(|| Err(anyhow!("Writer for {label} disappeared")));
                if let Err(e) = reopened {
                    self.budget.release();
                    return Err(e);
                }
            }
            None => {
                let at = self
                    .factories
                    .iter()
                    .position(|f| f.kind() == kind)
                    .ok_or_else(|| anyhow!("No {} writers in this pool", kind.dir_name()))?;
                self.acquire_handle()?;
                let seed = self.seeds.get(&kind).and_then(|seeds| seeds.get(label));
                match self.factories[at].create(label, seed) {
                    Ok(writer) => {
                        self.writers.insert(key.clone(), writer);
                    }
                    Err(e) => {
                        self.budget.release();
                        return Err(e);
                    }
                }
            }
        }

        let clock = self.clock;
        let writer = self
            .writers
            .get_mut(&key)
            .ok_or_else(|| anyhow!("No writer for {label}"))?;
        writer.last_used = clock;
        Ok(writer)
    }

    fn acquire_handle(&mut self) -> Result<()> {
        loop {
            if self.budget.try_acquire() {
                return Ok(());
            }
            if !self.evict_one()? {
                thread::sleep(Duration::from_millis(HANDLE_WAIT_MILLIS));
            }
        }
    }

    /// Closes this pool's least-recently-used open writer. False if none is open.
    fn evict_one(&mut self) -> Result<bool> {
        let victim = self
            .writers
            .values_mut()
            .filter(|w| w.is_open())
            .min_by_key(|w| w.last_used);

        let Some(victim) = victim else {
            return Ok(false);
        };

        debug!(label = %victim.label(), path = %victim.path().display(), "Evicting writer");
        let result = victim.suspend();
        self.budget.release();
        self.evictions += 1;
        result.map(|_| true)
    }

    /// Closes every writer, best effort, and returns the schema of every file written.
    pub fn close(self) -> TaskFiles {
        let mut files = TaskFiles::default();
        for ((kind, _), mut writer) in self.writers {
            if writer.is_open() {
                if let Err(e) = writer.close() {
                    warn!(
                        label = %writer.label(),
                        path = %writer.path().display(),
                        error = %e,
                        "Failed to close writer"
                    );
                }
                self.budget.release();
            }
            files.for_kind_mut(kind).add(writer.file_schema());
        }
        files
    }
}
