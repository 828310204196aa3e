use super::*;

pub trait GpuBackend: 'static + Sized {
    type Device: Device<Self> + Send + Sync;
    type Heap: Heap<Self> + Send + Sync;
    type Buffer: Buffer + Send + Sync;
    type CommandBuffer: CommandBuffer<Self> + Send;
    type Queue: Queue<Self> + Send + Sync;

    fn name() -> &'static str;
}
