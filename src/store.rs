//! An in-memory document collection.
//!
//! This is a stand-in for a real backing store: enough to build realistic
//! fetch functions for tests and documentation. It answers `find` the way a
//! document store answers an `$in` query with a projection: only the ids it
//! holds, in its own order, with `_id` always included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use crate::fields::FieldSet;
use crate::record::Record;

#[derive(Debug, Default)]
pub struct MemoryCollection {
    name: String,
    records: Vec<Record>,
    // `_id` -> position in `records`
    index: HashMap<String, usize>,
    queries: AtomicUsize,
}

impl MemoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Build a collection from a list of records. Records without an `_id`
    /// are dropped.
    pub fn with_records(name: impl Into<String>, records: impl IntoIterator<Item = Record>) -> Self {
        let mut collection = Self::new(name);
        records.into_iter().for_each(|record| collection.insert(record));
        collection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a record, replacing any existing record with the same `_id`.
    pub fn insert(&mut self, record: Record) {
        let id = match record.id() {
            Some(id) => id.to_owned(),
            None => return,
        };

        match self.index.get(&id) {
            Some(&position) => self.records[position] = record,
            None => {
                self.index.insert(id, self.records.len());
                self.records.push(record);
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Find the records whose `_id` is one of `ids`, projected onto `fields`.
    /// Missing ids are skipped; results are in collection order.
    pub fn find<Id: AsRef<str>>(&self, ids: &[Id], fields: &FieldSet) -> Vec<Record> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        trace!(collection = %self.name, ids = ids.len(), fields = %fields, "find");

        let mut positions: Vec<usize> = ids
            .iter()
            .filter_map(|id| self.index.get(id.as_ref()).copied())
            .collect();
        positions.sort_unstable();
        positions.dedup();

        positions
            .into_iter()
            .filter_map(|position| self.records.get(position))
            .map(|record| record.project(fields))
            .collect()
    }

    /// How many times `find` has been called.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}
