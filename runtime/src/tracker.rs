use std::collections::HashMap;

use super::heap::HeapAllocator;
use super::table::{
    AllocationId,
    AllocationTable,
};

pub(crate) type BatchId = u64;

/// In-flight batches and the references they own. Batches complete strictly
/// in submission order, so a single watermark answers "has batch N
/// completed".
pub(crate) struct CompletionTracker {
    in_flight: HashMap<BatchId, Vec<AllocationId>>,
    completed_watermark: BatchId,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self {
            in_flight: HashMap::new(),
            completed_watermark: 0,
        }
    }

    pub fn register(&mut self, batch: BatchId, retained: Vec<AllocationId>) {
        let previous = self.in_flight.insert(batch, retained);
        debug_assert!(previous.is_none());
    }

    /// Runs on the completion thread, under the device lock. Releasing the
    /// batch's references finalizes the deletion of every allocation whose
    /// handles are already gone and whose last referencing batch is this
    /// one.
    pub fn retire(&mut self, batch: BatchId, table: &mut AllocationTable, heap: &mut HeapAllocator) {
        assert_eq!(
            batch,
            self.completed_watermark + 1,
            "batches must complete in submission order"
        );
        self.completed_watermark = batch;
        let retained = self
            .in_flight
            .remove(&batch)
            .expect("completion fired for an unknown batch");
        for id in retained {
            if let Some(block) = table.release(id) {
                heap.free(block);
            }
        }
    }

    #[inline(always)]
    pub fn is_complete(&self, batch: BatchId) -> bool {
        batch <= self.completed_watermark
    }

    #[inline(always)]
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    #[inline(always)]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
