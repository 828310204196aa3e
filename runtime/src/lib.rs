//! Eager-execution tensor runtime.
//!
//! Frontends submit one operation at a time through [`Device`]; the runtime
//! coalesces chains of elementwise work into fused ubershader dispatches,
//! constant-folds tiny tensors on the host, prunes operations whose results
//! are provably dead and recycles device buffers through a size-bucketed
//! heap cache. Results are bit-identical whether an op ran fused on the
//! backend, alone, or on the host folder.

#![allow(dead_code)]

pub use tensorstream_core::dtype::{
    DType,
    DtypeGroup,
};
pub use tensorstream_core::gpu::StorageMode;

pub use self::device::{
    Device,
    DeviceDescriptor,
    FlushStats,
    TensorHandle,
};
pub use self::error::TensorError;

mod debug;
mod device;
mod encoder;
mod error;
mod fold;
mod fusion;
mod heap;
mod ops;
mod stream;
mod table;
mod tracker;

pub(crate) use parking_lot::{
    Condvar,
    Mutex,
    MutexGuard,
};

/// The backend this build dispatches to, bound the same way for every module
/// in the crate. Additional backends slot in beside the host one behind a
/// target cfg.
pub(crate) mod active_backend {
    pub use tensorstream_host::{
        HostBackend as Backend,
        HostBuffer as Buffer,
        HostCommandBuffer as CommandBuffer,
        HostDevice as Device,
        HostDeviceDescriptor as DeviceDescriptor,
        HostHeap as Heap,
        HostQueue as Queue,
    };
}
