use std::sync::atomic::{
    AtomicU64,
    Ordering,
};
use std::sync::Arc;

use tensorstream_core::gpu::{
    Device,
    DeviceLimits,
    OutOfMemoryError,
    Queue as _,
    StorageMode,
};

use super::{
    HostBackend,
    HostCommandBuffer,
    HostHeap,
    HostQueue,
};

#[derive(Clone, Copy, Debug)]
pub struct HostDeviceDescriptor {
    pub storage_mode: StorageMode,
    /// Hard ceiling on live heap bytes; `create_heap` fails beyond it.
    pub memory_capacity: u64,
    pub max_buffer_length: u64,
    pub recommended_max_working_set_size: u64,
}

impl Default for HostDeviceDescriptor {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::Shared,
            memory_capacity: 256 << 20,
            max_buffer_length: 64 << 20,
            recommended_max_working_set_size: 128 << 20,
        }
    }
}

pub struct HostDevice {
    limits: DeviceLimits,
    storage_mode: StorageMode,
    memory_capacity: u64,
    allocated_bytes: Arc<AtomicU64>,
    queue: HostQueue,
}

impl HostDevice {
    pub fn new(descriptor: &HostDeviceDescriptor) -> Self {
        Self {
            limits: DeviceLimits {
                max_buffer_length: descriptor.max_buffer_length,
                recommended_max_working_set_size: descriptor.recommended_max_working_set_size,
            },
            storage_mode: descriptor.storage_mode,
            memory_capacity: descriptor.memory_capacity,
            allocated_bytes: Arc::new(AtomicU64::new(0)),
            queue: HostQueue::new(),
        }
    }

    #[inline(always)]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }
}

impl Device<HostBackend> for HostDevice {
    unsafe fn create_heap(&self, size: u64) -> Result<HostHeap, OutOfMemoryError> {
        if self.allocated_bytes() + size > self.memory_capacity {
            return Err(OutOfMemoryError {});
        }
        Ok(HostHeap::new(size, &self.allocated_bytes))
    }

    fn create_command_buffer(&self) -> HostCommandBuffer {
        HostCommandBuffer::new()
    }

    #[inline(always)]
    fn queue(&self) -> &HostQueue {
        &self.queue
    }

    #[inline(always)]
    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    #[inline(always)]
    fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    unsafe fn wait_for_idle(&self) {
        self.queue.wait_for_idle();
    }
}

#[cfg(test)]
mod tests {
    use tensorstream_core::dtype::DtypeGroup;
    use tensorstream_core::gpu::{
        Buffer as _,
        BufferBinding,
        BufferInfo,
        BufferUsage,
        CommandBuffer as _,
        Dispatch,
        Heap as _,
    };
    use tensorstream_core::isa::{
        DispatchParams,
        MemoryCast,
        ReadParams,
        UnaryOp,
        WriteParams,
    };

    use super::*;

    #[test]
    fn dispatch_roundtrip_through_worker() {
        let device = HostDevice::new(&HostDeviceDescriptor::default());
        let heap = unsafe { device.create_heap(4096).unwrap() };
        let info = BufferInfo {
            size: 16,
            usage: BufferUsage::STORAGE,
        };
        let input = Arc::new(unsafe { heap.create_buffer(&info, 0).unwrap() });
        let output = Arc::new(unsafe { heap.create_buffer(&info, 1024).unwrap() });

        unsafe {
            let ptr = input.map_unsafe(0, 16, false).unwrap();
            let values = [1.0f32, 2.0, 3.0, 4.0];
            std::ptr::copy_nonoverlapping(values.as_ptr() as *const u8, ptr, 16);
        }

        let mut command_buffer = device.create_command_buffer();
        let read = ReadParams::new(MemoryCast::F32AsF32, false);
        unsafe {
            command_buffer.encode_dispatch(Dispatch {
                params: DispatchParams {
                    read_params: [read, ReadParams::unused(), ReadParams::unused(), ReadParams::unused()],
                    num_inputs: 1,
                    num_operations: 1,
                    write_params: WriteParams::new(MemoryCast::F32AsF32),
                    element_count: 4,
                    group: DtypeGroup::Wide32,
                },
                opcodes: vec![UnaryOp::IncrementF32 as u16],
                metadata: Vec::new(),
                inputs: [BufferBinding {
                    buffer: input.clone(),
                    offset: 0,
                }]
                .into_iter()
                .collect(),
                output: BufferBinding {
                    buffer: output.clone(),
                    offset: 0,
                },
            });
        }

        let (sender, receiver) = crossbeam_channel::bounded(1);
        unsafe {
            device.queue().submit(
                command_buffer,
                Box::new(move || {
                    sender.send(()).unwrap();
                }),
            );
            device.wait_for_idle();
        }
        receiver.recv().unwrap();

        let mut result = [0.0f32; 4];
        unsafe {
            let ptr = output.map_unsafe(0, 16, true).unwrap();
            std::ptr::copy_nonoverlapping(ptr, result.as_mut_ptr() as *mut u8, 16);
        }
        assert_eq!(result, [2.0, 3.0, 4.0, 5.0]);
    }
}
