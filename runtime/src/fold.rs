//! Host-side constant folding.
//!
//! A tiny, fully known operand set never reaches the GPU: the op runs
//! element by element through the same scalar interpreter the backend uses,
//! so the stored bits match a dispatch exactly.

use std::sync::Arc;

use log::trace;
use smallvec::SmallVec;
use tensorstream_core::dtype::DtypeGroup;
use tensorstream_core::isa::{
    read_scalar32,
    read_scalar64,
    run_chain32,
    run_chain64,
    MemoryCast,
    Op,
    ReadParams,
    WriteParams,
    write_scalar32,
    write_scalar64,
};

use super::active_backend;
use super::device::DeviceInner;
use super::encoder::{
    buffer_bytes,
    buffer_bytes_mut,
};
use super::ops::ResolvedOp;
use super::table::AllocationId;

/// Operands above this size take the dispatch path.
pub(crate) const MAX_CONSTANT_FOLD_BYTES: u64 = 4096;

/// Folds one unary or binary op on the host. The folder interprets one
/// scalar at a time, so it only takes single-element operands that are
/// tiny, initialized and stable; everything else routes to the queue.
pub(crate) fn try_fold(
    inner: &mut DeviceInner,
    resolved: &ResolvedOp,
    inputs: &[AllocationId],
    output: AllocationId,
) -> bool {
    if !matches!(resolved.op, Op::Unary(_) | Op::Binary(_)) {
        return false;
    }
    for &input in inputs {
        let allocation = inner.table.get(input);
        if !allocation.initialized
            || allocation.element_count != 1
            || allocation.byte_size > MAX_CONSTANT_FOLD_BYTES
        {
            return false;
        }
        // A pending write from an in-flight batch would race the host read.
        if let Some(batch) = allocation.last_modified_batch {
            if !inner.tracker.is_complete(batch) {
                return false;
            }
        }
        debug_assert!(allocation.materialized());
    }
    if inner.table.get(output).element_count != 1 {
        return false;
    }

    // Plain malloc here: under memory pressure the dispatch path recovers
    // and folding is just skipped.
    let block = match inner.heap.malloc(inner.table.get(output).byte_size.max(1)) {
        Ok(block) => block,
        Err(_) => return false,
    };
    inner.table.set_block(output, block);

    let element_count = inner.table.get(output).element_count;
    let group = resolved.group;

    // Register order: the primary operand loads into register 1, the rest
    // follow, matching the dispatch path's calling convention.
    let mut ordered: SmallVec<[AllocationId; 2]> = SmallVec::new();
    ordered.push(inputs[resolved.primary_input]);
    for (index, &input) in inputs.iter().enumerate() {
        if index != resolved.primary_input {
            ordered.push(input);
        }
    }

    // Detach the buffer handles from the table borrow.
    let input_buffers: SmallVec<[(Arc<active_backend::Buffer>, ReadParams, u64); 2]> = ordered
        .iter()
        .map(|&input| {
            let allocation = inner.table.get(input);
            let cast = MemoryCast::for_dtype(allocation.dtype, group);
            let broadcast = allocation.element_count == 1 && element_count > 1;
            (
                allocation.block.as_ref().unwrap().buffer.clone(),
                ReadParams::new(cast, broadcast),
                allocation.byte_size.max(1),
            )
        })
        .collect();
    let output_allocation = inner.table.get(output);
    let write_params = WriteParams::new(MemoryCast::for_dtype(output_allocation.dtype, group));
    let output_buffer = output_allocation.block.as_ref().unwrap().buffer.clone();
    let output_size = output_allocation.byte_size.max(1);

    let opcodes = [resolved.op.encode()];
    let metadata: &[u8] = match resolved.metadata.as_ref() {
        Some(metadata) => &metadata.0,
        None => &[],
    };

    unsafe {
        let input_bytes: SmallVec<[&[u8]; 2]> = input_buffers
            .iter()
            .map(|(buffer, _, size)| buffer_bytes(buffer, *size))
            .collect();
        let output_bytes = buffer_bytes_mut(&output_buffer, output_size);

        match group {
            DtypeGroup::Wide32 => {
                for element in 0..element_count as usize {
                    let mut regs = [0u32; 4];
                    for (index, (_, params, _)) in input_buffers.iter().enumerate() {
                        regs[index] = read_scalar32(input_bytes[index], element, *params);
                    }
                    run_chain32(&opcodes, metadata, &mut regs);
                    write_scalar32(output_bytes, element, write_params, regs[0]);
                }
            }
            DtypeGroup::Wide64 => {
                for element in 0..element_count as usize {
                    let mut regs = [0u64; 4];
                    for (index, (_, params, _)) in input_buffers.iter().enumerate() {
                        regs[index] = read_scalar64(input_bytes[index], element, *params);
                    }
                    run_chain64(&opcodes, metadata, &mut regs);
                    write_scalar64(output_bytes, element, write_params, regs[0]);
                }
            }
        }
    }

    inner.table.get_mut(output).initialized = true;
    trace!("Constant folded {:?} into allocation #{output}", resolved.op);
    true
}
