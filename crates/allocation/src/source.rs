use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use sectorflow_core::{FlowRecord, Geoscale};

use crate::context::EngineContext;
use crate::error::{AllocError, Result};
use crate::merge::{SecondaryKind, SecondaryTable};

/// Loads a secondary weighting dataset by name and year.
pub trait SecondarySource: Send + Sync {
    fn load(&self, source: &str, year: i32) -> Result<Vec<FlowRecord>>;
}

/// Tables held in memory, keyed by `(source, year)`.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    tables: FxHashMap<(String, i32), Vec<FlowRecord>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: impl Into<String>, year: i32, records: Vec<FlowRecord>) -> &mut Self {
        self.tables.insert((source.into(), year), records);
        self
    }
}

impl SecondarySource for InMemorySource {
    fn load(&self, source: &str, year: i32) -> Result<Vec<FlowRecord>> {
        self.tables
            .get(&(source.to_string(), year))
            .cloned()
            .ok_or_else(|| AllocError::SourceLoad {
                source_name: source.to_string(),
                year,
                geoscale: Geoscale::National,
                message: "no such table".into(),
            })
    }
}

type CacheKey = (String, i32, Geoscale, SecondaryKind);

/// Prepared secondary tables for one run, memoized per
/// `(source, year, geoscale, kind)`. Shared by every partition of the run.
pub struct SourceCache<'a> {
    source: &'a dyn SecondarySource,
    tables: Mutex<FxHashMap<CacheKey, Arc<SecondaryTable>>>,
    loads: AtomicUsize,
}

impl<'a> SourceCache<'a> {
    pub fn new(source: &'a dyn SecondarySource) -> Self {
        Self {
            source,
            tables: Mutex::new(FxHashMap::default()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn get(
        &self,
        name: &str,
        year: i32,
        geoscale: Geoscale,
        kind: SecondaryKind,
        ctx: &EngineContext,
    ) -> Result<Arc<SecondaryTable>> {
        let key = (name.to_string(), year, geoscale, kind);
        if let Some(table) = self.tables.lock().get(&key) {
            return Ok(Arc::clone(table));
        }

        // Loaded outside the lock; a concurrent miss on the same key may load
        // twice, and the first insert wins.
        log::info!("loading {name} {year} at {geoscale} level");
        let raw = self.source.load(name, year).map_err(|e| match e {
            AllocError::SourceLoad { message, .. } => AllocError::SourceLoad {
                source_name: name.to_string(),
                year,
                geoscale,
                message,
            },
            other => other,
        })?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        let table = Arc::new(SecondaryTable::prepare(name, year, &raw, geoscale, kind, ctx));

        let mut tables = self.tables.lock();
        Ok(Arc::clone(tables.entry(key).or_insert(table)))
    }

    /// Number of times the underlying source was read.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}
