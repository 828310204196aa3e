//! Flush path: zombie pruning, fusion, buffer materialization, command
//! buffer encoding and submission.

use std::sync::Arc;
use std::time::Instant;

use log::{
    debug,
    warn,
};
use smallvec::SmallVec;
use tensorstream_core::gpu::{
    Buffer as _,
    BufferBinding,
    BufferCopy,
    CommandBuffer as _,
    CompletionHandler,
    Device as _,
    Dispatch,
    Queue as _,
};
use tensorstream_core::isa::{
    DispatchParams,
    MemoryCast,
    ReadParams,
    WriteParams,
};

use super::active_backend;
use super::debug::profiling_tracing;
use super::device::{
    DeviceInner,
    DeviceShared,
    FlushStats,
};
use super::fusion::{
    self,
    Instruction,
};
use super::heap::HeapBlock;
use super::stream::PendingItem;
use super::table::AllocationId;
use super::{
    MutexGuard,
    TensorError,
};

pub(crate) unsafe fn buffer_bytes<'a>(buffer: &'a active_backend::Buffer, length: u64) -> &'a [u8] {
    let ptr = buffer
        .map_unsafe(0, length, true)
        .expect("buffer mapping out of bounds");
    std::slice::from_raw_parts(ptr, length as usize)
}

pub(crate) unsafe fn buffer_bytes_mut<'a>(
    buffer: &'a active_backend::Buffer,
    length: u64,
) -> &'a mut [u8] {
    let ptr = buffer
        .map_unsafe(0, length, false)
        .expect("buffer mapping out of bounds");
    std::slice::from_raw_parts_mut(ptr, length as usize)
}

/// Allocates through the heap cache, falling back to the out-of-memory
/// protocol: permit exceeding the working set, drain every in-flight batch
/// so completed ones return their blocks, drop the cache and retry once.
pub(crate) fn malloc_with_pressure(
    shared: &Arc<DeviceShared>,
    guard: &mut MutexGuard<'_, DeviceInner>,
    size: u64,
) -> Result<HeapBlock, TensorError> {
    if let Ok(block) = guard.heap.malloc(size) {
        return Ok(block);
    }
    warn!("Device out of memory for {size} bytes; draining in-flight batches and retrying");
    guard.heap.set_permit_exceeding_system_ram();
    while !guard.tracker.is_idle() {
        shared.completion_condvar.wait(guard);
    }
    guard.heap.evict_all_cached();
    guard
        .heap
        .malloc(size)
        .map_err(|_| TensorError::DeviceOutOfMemory)
}

pub(crate) fn materialize(
    shared: &Arc<DeviceShared>,
    guard: &mut MutexGuard<'_, DeviceInner>,
    id: AllocationId,
) -> Result<(), TensorError> {
    if guard.table.get(id).materialized() {
        return Ok(());
    }
    let size = guard.table.get(id).byte_size.max(1);
    let block = malloc_with_pressure(shared, guard, size)?;
    guard.table.set_block(id, block);
    Ok(())
}

fn release_all(guard: &mut MutexGuard<'_, DeviceInner>, ids: &[AllocationId]) {
    let inner = &mut **guard;
    for &id in ids {
        if let Some(block) = inner.table.release(id) {
            inner.heap.free(block);
        }
    }
}

/// Compiles and submits everything pending. Idempotent on an empty queue.
pub(crate) fn flush(
    shared: &Arc<DeviceShared>,
    guard: &mut MutexGuard<'_, DeviceInner>,
) -> Result<(), TensorError> {
    if guard.stream.is_empty() {
        return Ok(());
    }

    let compile_start = Instant::now();
    {
        let inner = &mut **guard;
        inner.stream.prune_zombies(&mut inner.table, &mut inner.heap);
    }
    let pending = guard.stream.take_pending();
    if pending.is_empty() {
        return Ok(());
    }

    let pre_fusion_count = pending.len();
    let instructions = fusion::compile(&pending, &guard.table);
    let instruction_count = instructions.len();
    let compile_time = compile_start.elapsed();

    // The queue entries' references now belong to the batch.
    let mut retained: Vec<AllocationId> = Vec::new();
    for item in &pending {
        match item {
            PendingItem::Op(op) => {
                retained.extend(op.inputs.iter().copied());
                retained.push(op.output);
            }
            PendingItem::Copy { src, dst } => {
                retained.push(*src);
                retained.push(*dst);
            }
        }
    }

    // Materialize every buffer first: allocation is the only fallible step,
    // and failing before any encoding keeps batch ids and modification
    // stamps consistent.
    let encode_start = Instant::now();
    for instruction in &instructions {
        let result = match instruction {
            Instruction::Elementwise(elementwise) => elementwise
                .inputs
                .iter()
                .chain(std::iter::once(&elementwise.output))
                .try_for_each(|&id| materialize(shared, guard, id)),
            Instruction::Copy { src, dst } => materialize(shared, guard, *src)
                .and_then(|_| materialize(shared, guard, *dst)),
        };
        if let Err(error) = result {
            release_all(guard, &retained);
            return Err(error);
        }
    }

    let batch_id = guard.next_batch_id;
    guard.next_batch_id += 1;

    let mut command_buffer = shared.gpu.create_command_buffer();
    for instruction in instructions {
        match instruction {
            Instruction::Elementwise(elementwise) => {
                let mut read_params = [ReadParams::unused(); 4];
                let mut bindings: SmallVec<[BufferBinding<active_backend::Backend>; 4]> =
                    SmallVec::new();
                for (index, &input) in elementwise.inputs.iter().enumerate() {
                    let allocation = guard.table.get(input);
                    let broadcast = allocation.element_count == 1
                        && elementwise.element_count > 1;
                    read_params[index] = ReadParams::new(
                        MemoryCast::for_dtype(allocation.dtype, elementwise.group),
                        broadcast,
                    );
                    bindings.push(BufferBinding {
                        buffer: allocation.block.as_ref().unwrap().buffer.clone(),
                        offset: 0,
                    });
                }

                let output_allocation = guard.table.get(elementwise.output);
                debug_assert_eq!(output_allocation.dtype, elementwise.write_dtype);
                let params = DispatchParams {
                    read_params,
                    num_inputs: elementwise.inputs.len() as u16,
                    num_operations: elementwise.opcodes.len() as u16,
                    write_params: WriteParams::new(MemoryCast::for_dtype(
                        elementwise.write_dtype,
                        elementwise.group,
                    )),
                    element_count: elementwise.element_count,
                    group: elementwise.group,
                };
                let output_binding = BufferBinding {
                    buffer: output_allocation.block.as_ref().unwrap().buffer.clone(),
                    offset: 0,
                };
                unsafe {
                    command_buffer.encode_dispatch(Dispatch {
                        params,
                        opcodes: elementwise.opcodes,
                        metadata: elementwise.metadata,
                        inputs: bindings,
                        output: output_binding,
                    });
                }

                for &input in &elementwise.inputs {
                    guard.table.get_mut(input).last_referenced_batch = Some(batch_id);
                }
                let output = guard.table.get_mut(elementwise.output);
                output.last_referenced_batch = Some(batch_id);
                output.last_modified_batch = Some(batch_id);
                output.initialized = true;
            }
            Instruction::Copy { src, dst } => {
                let length = guard.table.get(src).byte_size;
                let src_binding = BufferBinding {
                    buffer: guard.table.get(src).block.as_ref().unwrap().buffer.clone(),
                    offset: 0,
                };
                let dst_binding = BufferBinding {
                    buffer: guard.table.get(dst).block.as_ref().unwrap().buffer.clone(),
                    offset: 0,
                };
                unsafe {
                    command_buffer.encode_copy(BufferCopy {
                        src: src_binding,
                        dst: dst_binding,
                        length,
                    });
                }

                guard.table.get_mut(src).last_referenced_batch = Some(batch_id);
                let destination = guard.table.get_mut(dst);
                destination.last_referenced_batch = Some(batch_id);
                destination.last_modified_batch = Some(batch_id);
                destination.initialized = true;
            }
        }
    }

    debug_assert_eq!(command_buffer.encoded_command_count(), instruction_count);

    // The completion handler re-enters the device lock from the completion
    // thread; it cannot run before `register` below because this thread
    // still holds the lock.
    let weak = Arc::downgrade(shared);
    let completion: CompletionHandler = Box::new(move || {
        if let Some(shared) = weak.upgrade() {
            let mut guard = shared.inner.lock();
            let inner = &mut *guard;
            inner
                .tracker
                .retire(batch_id, &mut inner.table, &mut inner.heap);
            shared.completion_condvar.notify_all();
        }
    });
    unsafe {
        shared.gpu.queue().submit(command_buffer, completion);
    }
    guard.tracker.register(batch_id, retained);

    let encode_time = encode_start.elapsed();
    guard.committed_batches += 1;
    guard.last_flush = Some(FlushStats {
        pending_operations: pre_fusion_count,
        instructions: instruction_count,
        batch_id,
    });
    if profiling_tracing() {
        debug!("Compile time: {compile_time:?}");
        debug!("Encode time: {encode_time:?}");
        debug!("Batches in flight: {}", guard.tracker.in_flight_count());
        debug!("#Commands: {pre_fusion_count} -> {instruction_count}");
    }
    Ok(())
}
