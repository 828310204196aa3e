//! Pure-host implementation of the tensorstream backend traits.
//!
//! Heaps are byte arenas, command buffers record encoded dispatches and the
//! queue replays them on a worker thread through the core scalar
//! interpreter. This is the executor the runtime's constant folder is held
//! bit-identical to.

pub use self::device::{
    HostDevice,
    HostDeviceDescriptor,
};
pub use self::heap::{
    HostBuffer,
    HostHeap,
};
pub use self::command::HostCommandBuffer;
pub use self::queue::HostQueue;

mod command;
mod device;
mod heap;
mod queue;

use tensorstream_core::gpu::GpuBackend;

pub struct HostBackend;

impl GpuBackend for HostBackend {
    type Device = HostDevice;
    type Heap = HostHeap;
    type Buffer = HostBuffer;
    type CommandBuffer = HostCommandBuffer;
    type Queue = HostQueue;

    fn name() -> &'static str {
        "Host"
    }
}
