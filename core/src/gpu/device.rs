use super::*;

/// Static limits the runtime sizes its allocator against. They mirror what a
/// Metal device reports: the largest single buffer allocation and the byte
/// total the driver recommends keeping resident.
#[derive(Clone, Copy, Debug)]
pub struct DeviceLimits {
    pub max_buffer_length: u64,
    pub recommended_max_working_set_size: u64,
}

pub trait Device<B: GpuBackend> {
    unsafe fn create_heap(&self, size: u64) -> Result<B::Heap, OutOfMemoryError>;
    fn create_command_buffer(&self) -> B::CommandBuffer;
    fn queue(&self) -> &B::Queue;
    fn limits(&self) -> &DeviceLimits;
    fn storage_mode(&self) -> StorageMode;
    unsafe fn wait_for_idle(&self);
}
