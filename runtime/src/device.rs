use std::sync::Arc;

use smallvec::SmallVec;
use tensorstream_core::dtype::DType;
use tensorstream_core::gpu::{
    Device as _,
    StorageMode,
};

use super::active_backend;
use super::encoder::{
    self,
    buffer_bytes,
    buffer_bytes_mut,
    materialize,
};
use super::fold;
use super::heap::HeapAllocator;
use super::ops::{
    self,
    ResolvedOperation,
};
use super::stream::{
    CommandStream,
    PendingItem,
    PendingOp,
    MAX_COMMANDS_PER_BATCH,
};
use super::table::AllocationTable;
use super::tracker::{
    BatchId,
    CompletionTracker,
};
use super::{
    Condvar,
    Mutex,
    MutexGuard,
    TensorError,
};

#[derive(Clone, Copy, Debug)]
pub struct DeviceDescriptor {
    pub storage_mode: StorageMode,
    pub memory_capacity: u64,
    pub max_buffer_length: u64,
    pub recommended_max_working_set_size: u64,
    pub max_commands_per_batch: usize,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::Shared,
            memory_capacity: 256 << 20,
            max_buffer_length: 64 << 20,
            recommended_max_working_set_size: 128 << 20,
            max_commands_per_batch: MAX_COMMANDS_PER_BATCH,
        }
    }
}

/// Opaque frontend handle: the allocation id. The holder owns one counted
/// reference and gives it back through [`Device::release_tensor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TensorHandle {
    pub(crate) id: u64,
}

impl TensorHandle {
    /// Raw id for an FFI boundary; `from_raw` does not confer a reference.
    #[inline(always)]
    pub fn into_raw(self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn from_raw(id: u64) -> Self {
        Self { id }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FlushStats {
    /// Queue length before fusion, zombies already pruned.
    pub pending_operations: usize,
    /// Instructions the batch was encoded with.
    pub instructions: usize,
    pub batch_id: u64,
}

pub(crate) struct DeviceInner {
    pub table: AllocationTable,
    pub stream: CommandStream,
    pub heap: HeapAllocator,
    pub tracker: CompletionTracker,
    pub next_batch_id: BatchId,
    pub committed_batches: u64,
    pub last_flush: Option<FlushStats>,
}

/// The single serialization point: every frontend call and every completion
/// callback goes through `inner`.
pub(crate) struct DeviceShared {
    pub gpu: Arc<active_backend::Device>,
    pub inner: Mutex<DeviceInner>,
    pub completion_condvar: Condvar,
}

/// One eager-execution device: allocation table, command stream and heap
/// cache behind one lock, plus the backend queue they feed.
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    pub fn new(descriptor: &DeviceDescriptor) -> Self {
        let gpu = Arc::new(active_backend::Device::new(&active_backend::DeviceDescriptor {
            storage_mode: descriptor.storage_mode,
            memory_capacity: descriptor.memory_capacity,
            max_buffer_length: descriptor.max_buffer_length,
            recommended_max_working_set_size: descriptor.recommended_max_working_set_size,
        }));
        let inner = DeviceInner {
            table: AllocationTable::new(),
            stream: CommandStream::new(descriptor.max_commands_per_batch),
            heap: HeapAllocator::new(&gpu),
            tracker: CompletionTracker::new(),
            next_batch_id: 1,
            committed_batches: 0,
            last_flush: None,
        };
        Self {
            shared: Arc::new(DeviceShared {
                gpu,
                inner: Mutex::new(inner),
                completion_condvar: Condvar::new(),
            }),
        }
    }

    /// Allocates an uninitialized tensor. Device memory is attached lazily
    /// at first use. Panics on rank above 5.
    pub fn allocate_tensor(&self, dtype: DType, dims: &[u64]) -> (TensorHandle, u32) {
        let mut guard = self.shared.inner.lock();
        let id = guard
            .table
            .allocate(dtype, dims)
            .unwrap_or_else(|error| panic!("{error}"));
        (TensorHandle { id }, dims.len() as u32)
    }

    /// One-shot host initialization through a writer over the raw bytes.
    pub fn initialize_tensor<F>(&self, handle: TensorHandle, writer: F) -> Result<(), TensorError>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut guard = self.shared.inner.lock();
        if guard.table.fetch(handle.id)?.initialized {
            return Err(TensorError::AlreadyInitialized);
        }
        materialize(&self.shared, &mut guard, handle.id)?;

        let allocation = guard.table.get(handle.id);
        let buffer = allocation.block.as_ref().unwrap().buffer.clone();
        let byte_size = allocation.byte_size;
        unsafe {
            writer(&mut buffer_bytes_mut(&buffer, byte_size.max(1))[..byte_size as usize]);
        }
        guard.table.get_mut(handle.id).initialized = true;
        Ok(())
    }

    /// Flushes, waits for the last write to the tensor, then hands its bytes
    /// to the reader. With `mutating` set, changes made by the reader are
    /// guaranteed to reach device memory even on private-storage devices.
    pub fn read_tensor<F>(
        &self,
        handle: TensorHandle,
        mutating: bool,
        reader: F,
    ) -> Result<(), TensorError>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut guard = self.shared.inner.lock();
        guard.table.fetch(handle.id)?;
        encoder::flush(&self.shared, &mut guard)?;

        let last_modified = {
            let allocation = guard.table.fetch(handle.id)?;
            if !allocation.initialized {
                return Err(TensorError::NotInitialized);
            }
            // Every initialization path materializes before setting the
            // flag, so an initialized allocation always has its block.
            debug_assert!(allocation.materialized());
            allocation.last_modified_batch
        };
        if let Some(batch) = last_modified {
            while !guard.tracker.is_complete(batch) {
                self.shared.completion_condvar.wait(&mut guard);
            }
        }

        let allocation = guard.table.get(handle.id);
        let buffer = allocation.block.as_ref().unwrap().buffer.clone();
        let byte_size = allocation.byte_size;
        match self.shared.gpu.storage_mode() {
            StorageMode::Shared => unsafe {
                reader(&mut buffer_bytes_mut(&buffer, byte_size.max(1))[..byte_size as usize]);
            },
            StorageMode::Private => {
                // Discrete-GPU path: stage through host memory and write the
                // (possibly mutated) bytes back.
                let mut staging = vec![0u8; byte_size as usize];
                unsafe {
                    staging.copy_from_slice(
                        &buffer_bytes(&buffer, byte_size.max(1))[..byte_size as usize],
                    );
                }
                reader(&mut staging);
                if mutating {
                    unsafe {
                        buffer_bytes_mut(&buffer, byte_size.max(1))[..byte_size as usize]
                            .copy_from_slice(&staging);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn copy_tensor_shape(
        &self,
        handle: TensorHandle,
        out_dims: &mut [u64],
    ) -> Result<u32, TensorError> {
        let guard = self.shared.inner.lock();
        let allocation = guard.table.fetch(handle.id)?;
        let rank = allocation.dims.len();
        out_dims[..rank].copy_from_slice(&allocation.dims);
        Ok(rank as u32)
    }

    /// Gives back the frontend's reference. Never fails; releasing a dead
    /// handle is a no-op.
    pub fn release_tensor(&self, handle: TensorHandle) {
        let mut guard = self.shared.inner.lock();
        if guard.table.fetch(handle.id).is_err() {
            return;
        }
        let inner = &mut *guard;
        if let Some(block) = inner.table.release(handle.id) {
            inner.heap.free(block);
        }
    }

    /// Appends one operation. The output is allocated here and returned with
    /// its rank; the computation itself happens at the next flush, or never,
    /// if the result is provably dead by then, or immediately on the host if
    /// the operands are tiny constants.
    pub fn execute_operation(
        &self,
        name: &str,
        attributes: &[u8],
        inputs: &[TensorHandle],
    ) -> Result<(TensorHandle, u32), TensorError> {
        let mut guard = self.shared.inner.lock();

        // Resolve before touching any state so failures leave the table
        // unchanged.
        let mut dtypes: SmallVec<[DType; 3]> = SmallVec::new();
        for handle in inputs {
            dtypes.push(guard.table.fetch(handle.id)?.dtype);
        }
        let resolved = match ops::resolve(name, attributes, &dtypes)? {
            ResolvedOperation::Copy => {
                return self.execute_copy_locked(&mut guard, inputs[0]);
            }
            ResolvedOperation::Elementwise(resolved) => resolved,
        };
        if inputs.len() != ops::operand_count(resolved.op) {
            return Err(TensorError::UnknownOp(name.to_string()));
        }
        for handle in inputs {
            // An operand must have a backing store by dispatch time: either
            // the host wrote it or a queued operation will. Anything else
            // would hand the encoder a buffer that does not exist.
            let allocation = guard.table.get(handle.id);
            if !allocation.initialized && !guard.stream.writes_to(handle.id) {
                return Err(TensorError::NullBackingBuffer);
            }
        }

        // The output takes the shape of the widest operand; anything smaller
        // must be a scalar broadcast.
        let mut out_dims: SmallVec<[u64; 5]> = SmallVec::new();
        let mut out_count = 0u64;
        for handle in inputs {
            let allocation = guard.table.get(handle.id);
            if allocation.element_count > out_count {
                out_count = allocation.element_count;
                out_dims = allocation.dims.clone();
            }
        }
        for handle in inputs {
            let count = guard.table.get(handle.id).element_count;
            assert!(
                count == out_count || count == 1,
                "operand element count {count} incompatible with {out_count}"
            );
        }

        for handle in inputs {
            guard.table.retain(handle.id);
        }
        let output = match guard.table.allocate(resolved.out_dtype, &out_dims) {
            Ok(output) => output,
            Err(error) => {
                let inner = &mut *guard;
                for handle in inputs {
                    if let Some(block) = inner.table.release(handle.id) {
                        inner.heap.free(block);
                    }
                }
                return Err(error);
            }
        };
        let rank = out_dims.len() as u32;
        let input_ids: SmallVec<[u64; 3]> = inputs.iter().map(|handle| handle.id).collect();

        if fold::try_fold(&mut guard, &resolved, &input_ids, output) {
            let inner = &mut *guard;
            for &input in &input_ids {
                if let Some(block) = inner.table.release(input) {
                    inner.heap.free(block);
                }
            }
            return Ok((TensorHandle { id: output }, rank));
        }

        guard.table.retain(output);
        let must_flush = guard.stream.push(PendingItem::Op(PendingOp {
            op: resolved.op,
            metadata: resolved.metadata,
            group: resolved.group,
            inputs: input_ids,
            output,
            out_dtype: resolved.out_dtype,
            primary_input: resolved.primary_input,
            element_count: out_count,
        }));
        if must_flush {
            encoder::flush(&self.shared, &mut guard)?;
        }
        Ok((TensorHandle { id: output }, rank))
    }

    fn execute_copy_locked(
        &self,
        guard: &mut MutexGuard<'_, DeviceInner>,
        source: TensorHandle,
    ) -> Result<(TensorHandle, u32), TensorError> {
        let (dtype, dims) = {
            let allocation = guard.table.get(source.id);
            if !allocation.initialized && !guard.stream.writes_to(source.id) {
                return Err(TensorError::NullBackingBuffer);
            }
            (allocation.dtype, allocation.dims.clone())
        };
        guard.table.retain(source.id);
        let destination = match guard.table.allocate(dtype, &dims) {
            Ok(destination) => destination,
            Err(error) => {
                let inner = &mut **guard;
                if let Some(block) = inner.table.release(source.id) {
                    inner.heap.free(block);
                }
                return Err(error);
            }
        };
        guard.table.retain(destination);
        guard.stream.push(PendingItem::Copy {
            src: source.id,
            dst: destination,
        });
        // Explicit copies are a synchronization edge.
        encoder::flush(&self.shared, guard)?;
        Ok((TensorHandle { id: destination }, dims.len() as u32))
    }

    /// Flushes and blocks until every submitted batch has completed.
    pub fn barrier(&self) -> Result<(), TensorError> {
        let mut guard = self.shared.inner.lock();
        encoder::flush(&self.shared, &mut guard)?;
        while !guard.tracker.is_idle() {
            self.shared.completion_condvar.wait(&mut guard);
        }
        Ok(())
    }

    #[inline(always)]
    pub fn committed_batch_count(&self) -> u64 {
        self.shared.inner.lock().committed_batches
    }

    #[inline(always)]
    pub fn last_flush_stats(&self) -> Option<FlushStats> {
        self.shared.inner.lock().last_flush
    }

    #[inline(always)]
    pub fn live_allocation_count(&self) -> usize {
        self.shared.inner.lock().table.live_count()
    }

    #[inline(always)]
    pub fn queued_operation_count(&self) -> usize {
        self.shared.inner.lock().stream.len()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.barrier();
        self.shared.inner.lock().heap.release_cached_buffer_blocks();
        unsafe {
            self.shared.gpu.wait_for_idle();
        }
    }
}
