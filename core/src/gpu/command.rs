use std::sync::Arc;

use smallvec::SmallVec;

use crate::isa::DispatchParams;

use super::*;

pub struct BufferBinding<B: GpuBackend> {
    pub buffer: Arc<B::Buffer>,
    pub offset: u64,
}

impl<B: GpuBackend> Clone for BufferBinding<B> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            offset: self.offset,
        }
    }
}

/// One encoded ubershader dispatch: the parameter block, the op-code stream,
/// the per-op metadata stream laid out in the same FIFO order the compiler
/// assigned, and the buffer bindings (inputs first, output last).
pub struct Dispatch<B: GpuBackend> {
    pub params: DispatchParams,
    pub opcodes: Vec<u16>,
    pub metadata: Vec<u8>,
    pub inputs: SmallVec<[BufferBinding<B>; 4]>,
    pub output: BufferBinding<B>,
}

pub struct BufferCopy<B: GpuBackend> {
    pub src: BufferBinding<B>,
    pub dst: BufferBinding<B>,
    pub length: u64,
}

pub trait CommandBuffer<B: GpuBackend> {
    unsafe fn encode_dispatch(&mut self, dispatch: Dispatch<B>);
    unsafe fn encode_copy(&mut self, copy: BufferCopy<B>);
    fn encoded_command_count(&self) -> usize;
}
