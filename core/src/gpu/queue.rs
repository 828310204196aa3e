use super::*;

pub type CompletionHandler = Box<dyn FnOnce() + Send + 'static>;

/// Ordered submission queue. Submitted command buffers execute and complete
/// in FIFO order; the completion handler runs on the backend's completion
/// thread after the command buffer's work is observable.
pub trait Queue<B: GpuBackend> {
    unsafe fn submit(&self, command_buffer: B::CommandBuffer, completion: CompletionHandler);
    unsafe fn wait_for_idle(&self);
}
