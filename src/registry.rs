//! Operation registry - the arena of live operation records.
//!
//! Records are keyed by [`OperationId`]s handed out in increasing order, so
//! iteration follows insertion order and ids stay valid no matter what else
//! is removed. Bulk removal drains the arena instead of mutating it while
//! iterating.

use std::collections::BTreeMap;

use crate::operation::{OperationId, OperationRecord};

/// Arena of live operation records.
pub(crate) struct Registry {
    /// Records by id, in insertion order.
    records: BTreeMap<OperationId, OperationRecord>,
    /// Next id to assign.
    next_id: u64,
}

impl Registry {
    /// Create an empty registry.
    pub(crate) fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1, // Start from 1, 0 is reserved
        }
    }

    /// Store a record and return its id.
    pub(crate) fn add(&mut self, record: OperationRecord) -> OperationId {
        let id = OperationId(self.next_id);
        self.next_id += 1;
        self.records.insert(id, record);
        id
    }

    pub(crate) fn get(&self, id: OperationId) -> Option<&OperationRecord> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: OperationId) -> Option<&mut OperationRecord> {
        self.records.get_mut(&id)
    }

    /// Ids of every record matching `predicate`, in insertion order.
    pub(crate) fn find<P>(&self, mut predicate: P) -> Vec<OperationId>
    where
        P: FnMut(&OperationRecord) -> bool,
    {
        self.records
            .iter()
            .filter(|(_, record)| predicate(record))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Id of the first record matching `predicate`.
    pub(crate) fn find_first<P>(&self, mut predicate: P) -> Option<OperationId>
    where
        P: FnMut(&OperationRecord) -> bool,
    {
        self.records
            .iter()
            .find(|(_, record)| predicate(record))
            .map(|(id, _)| *id)
    }

    /// Remove a record. Removing an absent id is a no-op.
    pub(crate) fn remove(&mut self, id: OperationId) -> Option<OperationRecord> {
        self.records.remove(&id)
    }

    /// Remove and return every record, in insertion order.
    pub(crate) fn drain(&mut self) -> Vec<OperationRecord> {
        std::mem::take(&mut self.records).into_values().collect()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
