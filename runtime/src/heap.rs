use std::collections::BTreeMap;
use std::sync::Arc;

use log::{
    trace,
    warn,
};
use tensorstream_core::gpu::{
    BufferInfo,
    BufferUsage,
    Device as _,
    Heap as _,
    OutOfMemoryError,
};

use super::active_backend;

/// Smallest bucket quantum. Writes are 16 byte aligned, so sizes are at
/// least rounded to that; the quantum keeps tiny tensors from fragmenting
/// the cache.
const MIN_BUCKET_SIZE: u64 = 1024;

/// Target size of a freshly created heap; it is carved into bucket-quantum
/// blocks up front.
const HEAP_CARVE_TARGET: u64 = 1 << 20;
const MAX_BLOCKS_PER_HEAP: u64 = 8;

/// A device buffer the heap allocator handed out. Blocks keep their backing
/// heap alive through the `Arc`; returning the block to the allocator (or
/// dropping it during eviction) severs the link.
#[derive(Debug)]
pub(crate) struct HeapBlock {
    pub id: u64,
    pub size: u64,
    pub buffer: Arc<active_backend::Buffer>,
    _heap: Arc<active_backend::Heap>,
    bucket: Option<usize>,
}

/// Free blocks ordered by (size, insertion order). The smallest block is
/// always removed first; insertion and removal are `O(log n)`.
pub(crate) struct OrderedBlockSet {
    blocks: BTreeMap<(u64, u64), HeapBlock>,
}

impl OrderedBlockSet {
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, sequence: u64, block: HeapBlock) {
        let previous = self.blocks.insert((block.size, sequence), block);
        debug_assert!(previous.is_none());
    }

    /// `remove_at(0)`: pops the smallest block, ties broken by insertion
    /// order.
    pub fn remove_smallest(&mut self) -> Option<HeapBlock> {
        let key = *self.blocks.keys().next()?;
        self.blocks.remove(&key)
    }

    pub fn remove_largest(&mut self) -> Option<HeapBlock> {
        let key = *self.blocks.keys().next_back()?;
        self.blocks.remove(&key)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

struct Bucket {
    quantum: u64,
    free: OrderedBlockSet,
}

/// Size-bucketed cache of device buffer blocks. Buckets double from
/// [`MIN_BUCKET_SIZE`] up to the device's maximum buffer length; larger
/// requests get dedicated exact-size allocations that are never cached.
pub(crate) struct HeapAllocator {
    device: Arc<active_backend::Device>,
    buckets: Vec<Bucket>,
    next_sequence: u64,
    next_block_id: u64,
    outstanding_bytes: u64,
    cached_bytes: u64,
    permit_exceeding_system_ram: bool,
}

impl HeapAllocator {
    pub fn new(device: &Arc<active_backend::Device>) -> Self {
        let max_buffer_length = device.limits().max_buffer_length;
        let mut buckets = Vec::new();
        let mut quantum = MIN_BUCKET_SIZE;
        while quantum <= max_buffer_length {
            buckets.push(Bucket {
                quantum,
                free: OrderedBlockSet::new(),
            });
            quantum <<= 1;
        }
        Self {
            device: device.clone(),
            buckets,
            next_sequence: 0,
            next_block_id: 0,
            outstanding_bytes: 0,
            cached_bytes: 0,
            permit_exceeding_system_ram: false,
        }
    }

    fn bucket_index(&self, size: u64) -> Option<usize> {
        let rounded = size.max(MIN_BUCKET_SIZE).next_power_of_two();
        let index = (rounded / MIN_BUCKET_SIZE).trailing_zeros() as usize;
        if index < self.buckets.len() {
            Some(index)
        } else {
            None
        }
    }

    fn check_working_set(&self, additional: u64) -> Result<(), OutOfMemoryError> {
        if self.permit_exceeding_system_ram {
            return Ok(());
        }
        let limit = self.device.limits().recommended_max_working_set_size;
        if self.outstanding_bytes + self.cached_bytes + additional > limit {
            return Err(OutOfMemoryError {});
        }
        Ok(())
    }

    fn carve(
        &mut self,
        heap: &Arc<active_backend::Heap>,
        offset: u64,
        size: u64,
        bucket: Option<usize>,
    ) -> Result<HeapBlock, OutOfMemoryError> {
        let info = BufferInfo {
            size,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
        };
        let buffer = unsafe { heap.create_buffer(&info, offset)? };
        let id = self.next_block_id;
        self.next_block_id += 1;
        Ok(HeapBlock {
            id,
            size,
            buffer: Arc::new(buffer),
            _heap: heap.clone(),
            bucket,
        })
    }

    /// Hands out a block of at least `size` bytes, preferring the cache.
    /// Fails when the working-set limit or the device itself refuses; the
    /// caller runs the pressure protocol and retries once.
    pub fn malloc(&mut self, size: u64) -> Result<HeapBlock, OutOfMemoryError> {
        let size = size.max(1);
        match self.bucket_index(size) {
            Some(index) => {
                if let Some(block) = self.buckets[index].free.remove_smallest() {
                    self.cached_bytes -= block.size;
                    self.outstanding_bytes += block.size;
                    return Ok(block);
                }

                let quantum = self.buckets[index].quantum;
                let mut block_count = (HEAP_CARVE_TARGET / quantum).clamp(1, MAX_BLOCKS_PER_HEAP);
                // Carve less eagerly when the working set is nearly full.
                while block_count > 1 && self.check_working_set(quantum * block_count).is_err() {
                    block_count /= 2;
                }
                let heap_size = quantum * block_count;
                self.check_working_set(heap_size)?;
                let heap = Arc::new(unsafe { self.device.create_heap(heap_size)? });
                trace!("Created {heap_size} byte heap for bucket quantum {quantum}");

                for i in 1..block_count {
                    let block = self.carve(&heap, i * quantum, quantum, Some(index))?;
                    let sequence = self.next_sequence;
                    self.next_sequence += 1;
                    self.buckets[index].free.insert(sequence, block);
                    self.cached_bytes += quantum;
                }
                let block = self.carve(&heap, 0, quantum, Some(index))?;
                self.outstanding_bytes += quantum;
                Ok(block)
            }
            None => {
                // Above the largest bucket: dedicated exact-size allocation,
                // rounded for aligned writes.
                let size = (size + 15) & !15;
                self.check_working_set(size)?;
                let heap = Arc::new(unsafe { self.device.create_heap(size)? });
                let block = self.carve(&heap, 0, size, None)?;
                self.outstanding_bytes += size;
                Ok(block)
            }
        }
    }

    /// Returns a block to its bucket. Dedicated blocks release their device
    /// memory immediately; cached bytes above the watermark trigger
    /// eviction.
    pub fn free(&mut self, block: HeapBlock) {
        self.outstanding_bytes -= block.size;
        match block.bucket {
            Some(index) => {
                self.cached_bytes += block.size;
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                self.buckets[index].free.insert(sequence, block);
                let watermark = self.device.limits().recommended_max_working_set_size / 4;
                if self.cached_bytes > watermark {
                    self.evict_down_to(watermark / 2);
                }
            }
            None => drop(block),
        }
    }

    fn evict_down_to(&mut self, target: u64) {
        for index in (0..self.buckets.len()).rev() {
            while self.cached_bytes > target {
                match self.buckets[index].free.remove_largest() {
                    Some(block) => {
                        self.cached_bytes -= block.size;
                        drop(block);
                    }
                    None => break,
                }
            }
            if self.cached_bytes <= target {
                break;
            }
        }
        trace!("Evicted cached buffer blocks down to {} bytes", self.cached_bytes);
    }

    /// Marks the device allowed to exceed its recommended working set until
    /// the next explicit cache release. One-shot pressure valve.
    pub fn set_permit_exceeding_system_ram(&mut self) {
        if !self.permit_exceeding_system_ram {
            warn!("Device working set exceeded; permitting allocations beyond system RAM");
        }
        self.permit_exceeding_system_ram = true;
    }

    #[inline(always)]
    pub fn permits_exceeding_system_ram(&self) -> bool {
        self.permit_exceeding_system_ram
    }

    /// Drops every cached block without touching the pressure flag; used by
    /// the out-of-memory recovery path before its retry.
    pub fn evict_all_cached(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.free.clear();
        }
        self.cached_bytes = 0;
    }

    /// Drops every cached block and re-arms the working-set limit.
    pub fn release_cached_buffer_blocks(&mut self) {
        self.evict_all_cached();
        self.permit_exceeding_system_ram = false;
    }

    #[inline(always)]
    pub fn cached_bytes(&self) -> u64 {
        self.cached_bytes
    }

    #[inline(always)]
    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding_bytes
    }
}
