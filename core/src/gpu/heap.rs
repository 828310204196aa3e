use super::*;

pub trait Heap<B: GpuBackend> {
    fn size(&self) -> u64;
    unsafe fn create_buffer(
        &self,
        info: &BufferInfo,
        offset: u64,
    ) -> Result<B::Buffer, OutOfMemoryError>;
}
