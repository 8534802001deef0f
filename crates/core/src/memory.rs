//! Keyed in-memory table backing the dev/test stores.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::entity::Entity;
use crate::error::{PipelineError, PipelineResult};

/// In-memory rows of one entity type, keyed by id.
///
/// Every operation is a single-row (or full-scan) critical section, which is
/// the same granularity the relational store offers.
#[derive(Debug)]
pub struct InMemoryTable<E: Entity> {
    rows: RwLock<HashMap<E::Id, E>>,
    unavailable: AtomicBool,
}

impl<E: Entity> Default for InMemoryTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> InMemoryTable<E> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate a store outage: every subsequent call fails with a store error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> PipelineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::store("store unavailable"));
        }
        Ok(())
    }
}

impl<E> InMemoryTable<E>
where
    E: Entity + Clone,
{
    pub fn insert(&self, row: E) -> PipelineResult<()> {
        self.check_available()?;
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let id = row.id();
        if rows.contains_key(&id) {
            return Err(PipelineError::conflict(format!("row already exists: {id}")));
        }
        rows.insert(id, row);
        Ok(())
    }

    pub fn get(&self, id: E::Id) -> PipelineResult<Option<E>> {
        self.check_available()?;
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(&id).cloned())
    }

    /// Mutate a row in place. Returns `None` when the row does not exist.
    pub fn update<R>(&self, id: E::Id, f: impl FnOnce(&mut E) -> R) -> PipelineResult<Option<R>> {
        self.check_available()?;
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        Ok(rows.get_mut(&id).map(f))
    }

    pub fn remove(&self, id: E::Id) -> PipelineResult<Option<E>> {
        self.check_available()?;
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        Ok(rows.remove(&id))
    }

    /// Clone every row matching `filter` (unordered).
    pub fn select(&self, filter: impl Fn(&E) -> bool) -> PipelineResult<Vec<E>> {
        self.check_available()?;
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.values().filter(|r| filter(r)).cloned().collect())
    }

    pub fn count(&self, filter: impl Fn(&E) -> bool) -> PipelineResult<usize> {
        self.check_available()?;
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.values().filter(|r| filter(r)).count())
    }
}

fn poisoned() -> PipelineError {
    PipelineError::store("in-memory table lock poisoned")
}
