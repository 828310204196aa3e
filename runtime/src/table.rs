use std::collections::HashMap;

use log::trace;
use smallvec::SmallVec;
use tensorstream_core::dtype::DType;

use super::debug::refcount_tracing;
use super::heap::HeapBlock;
use super::tracker::BatchId;
use super::TensorError;

pub(crate) type AllocationId = u64;

pub(crate) const MAX_TENSOR_RANK: usize = 5;

/// One live tensor. Owned exclusively by the [`AllocationTable`]; everything
/// else refers to it by id.
#[derive(Debug)]
pub(crate) struct Allocation {
    pub id: AllocationId,
    pub byte_size: u64,
    pub dtype: DType,
    pub dims: SmallVec<[u64; MAX_TENSOR_RANK]>,
    pub element_count: u64,
    pub reference_count: u64,
    pub initialized: bool,
    /// Device memory, borrowed from the heap allocator until deletion.
    pub block: Option<HeapBlock>,
    pub last_modified_batch: Option<BatchId>,
    pub last_referenced_batch: Option<BatchId>,
}

impl Allocation {
    #[inline(always)]
    pub fn materialized(&self) -> bool {
        self.block.is_some()
    }

    #[inline(always)]
    pub fn rank(&self) -> u32 {
        self.dims.len() as u32
    }
}

/// Process-wide id → allocation registry. Ids are never reused; an id at or
/// above `next_id` was never issued, which is how `fetch` distinguishes
/// `NeverAllocated` from `Deallocated`.
pub(crate) struct AllocationTable {
    entries: HashMap<AllocationId, Allocation>,
    next_id: AllocationId,
    /// Device-buffer identity back to its owning allocation, for debugging.
    buffer_owners: HashMap<u64, AllocationId>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
            buffer_owners: HashMap::new(),
        }
    }

    pub fn allocate(&mut self, dtype: DType, dims: &[u64]) -> Result<AllocationId, TensorError> {
        if dims.len() > MAX_TENSOR_RANK {
            return Err(TensorError::ShapeOverflow);
        }
        let id = self.next_id;
        self.next_id += 1;
        let element_count: u64 = dims.iter().product();
        let allocation = Allocation {
            id,
            byte_size: element_count * dtype.size(),
            dtype,
            dims: SmallVec::from_slice(dims),
            element_count,
            reference_count: 1,
            initialized: false,
            block: None,
            last_modified_batch: None,
            last_referenced_batch: None,
        };
        if refcount_tracing() {
            trace!("Allocation #{id} jumped to a reference count of 1");
        }
        self.entries.insert(id, allocation);
        Ok(id)
    }

    pub fn fetch(&self, id: AllocationId) -> Result<&Allocation, TensorError> {
        if id >= self.next_id {
            return Err(TensorError::NeverAllocated);
        }
        self.entries.get(&id).ok_or(TensorError::Deallocated)
    }

    pub fn fetch_mut(&mut self, id: AllocationId) -> Result<&mut Allocation, TensorError> {
        if id >= self.next_id {
            return Err(TensorError::NeverAllocated);
        }
        self.entries.get_mut(&id).ok_or(TensorError::Deallocated)
    }

    /// Infallible lookup for ids the runtime itself is holding a reference
    /// to; absence is a refcounting bug.
    pub fn get(&self, id: AllocationId) -> &Allocation {
        self.entries
            .get(&id)
            .unwrap_or_else(|| panic!("allocation #{id} disappeared while referenced"))
    }

    pub fn get_mut(&mut self, id: AllocationId) -> &mut Allocation {
        self.entries
            .get_mut(&id)
            .unwrap_or_else(|| panic!("allocation #{id} disappeared while referenced"))
    }

    pub fn retain(&mut self, id: AllocationId) {
        let allocation = self.get_mut(id);
        allocation.reference_count += 1;
        if refcount_tracing() {
            trace!(
                "Allocation #{id} jumped to a reference count of {}",
                allocation.reference_count
            );
        }
    }

    /// Drops one reference. At zero the entry is deleted immediately; any
    /// batch still referencing the allocation holds its own reference, so a
    /// zero count implies the last referencing batch already completed.
    /// Returns the backing block so the caller can hand it back to the heap
    /// allocator.
    pub fn release(&mut self, id: AllocationId) -> Option<HeapBlock> {
        let allocation = self.get_mut(id);
        assert!(allocation.reference_count > 0, "allocation #{id} over-released");
        allocation.reference_count -= 1;
        if allocation.reference_count > 0 {
            if refcount_tracing() {
                trace!(
                    "Allocation #{id} jumped to a reference count of {}",
                    allocation.reference_count
                );
            }
            return None;
        }

        let allocation = self.entries.remove(&id).unwrap();
        if refcount_tracing() {
            if allocation.initialized {
                trace!("Allocation #{id} was deallocated after being initialized");
            } else {
                trace!("Allocation #{id} was deallocated");
            }
        }
        if let Some(block) = allocation.block.as_ref() {
            self.buffer_owners.remove(&block.id);
        }
        allocation.block
    }

    pub fn set_block(&mut self, id: AllocationId, block: HeapBlock) {
        self.buffer_owners.insert(block.id, id);
        let allocation = self.get_mut(id);
        debug_assert!(allocation.block.is_none());
        allocation.block = Some(block);
    }

    #[inline(always)]
    pub fn live_count(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn next_id(&self) -> AllocationId {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_distinguishes_dead_from_never_issued() {
        let mut table = AllocationTable::new();
        let id = table.allocate(DType::F32, &[2, 2]).unwrap();
        assert!(table.fetch(id).is_ok());
        assert_eq!(table.fetch(id + 1).unwrap_err(), TensorError::NeverAllocated);

        assert!(table.release(id).is_none());
        assert_eq!(table.fetch(id).unwrap_err(), TensorError::Deallocated);
        assert_eq!(table.fetch(id + 1).unwrap_err(), TensorError::NeverAllocated);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut table = AllocationTable::new();
        let a = table.allocate(DType::F32, &[1]).unwrap();
        table.release(a);
        let b = table.allocate(DType::F32, &[1]).unwrap();
        assert!(b > a);
    }

    #[test]
    fn rank_above_five_is_shape_overflow() {
        let mut table = AllocationTable::new();
        assert_eq!(
            table.allocate(DType::F32, &[1, 1, 1, 1, 1, 1]).unwrap_err(),
            TensorError::ShapeOverflow
        );
        // The failed call issues no id.
        assert_eq!(table.next_id(), 0);
    }

    #[test]
    fn element_count_of_scalar_shape_is_one() {
        let mut table = AllocationTable::new();
        let id = table.allocate(DType::I64, &[]).unwrap();
        let allocation = table.fetch(id).unwrap();
        assert_eq!(allocation.element_count, 1);
        assert_eq!(allocation.byte_size, 8);
    }
}
