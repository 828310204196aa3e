use std::cell::UnsafeCell;
use std::sync::atomic::{
    AtomicU64,
    Ordering,
};
use std::sync::Arc;

use tensorstream_core::gpu::{
    Buffer,
    BufferInfo,
    Heap,
    OutOfMemoryError,
};

use super::HostBackend;

pub(crate) struct HeapStorage {
    bytes: UnsafeCell<Box<[u8]>>,
}

impl std::fmt::Debug for HeapStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapStorage")
            .field("len", &self.len())
            .finish()
    }
}

// Access discipline comes from the command stream: the runtime only maps an
// allocation after the batches referencing it have completed, and the worker
// thread only touches buffers bound to the command buffer it is executing.
unsafe impl Send for HeapStorage {}
unsafe impl Sync for HeapStorage {}

impl HeapStorage {
    fn new(size: u64) -> Self {
        Self {
            bytes: UnsafeCell::new(vec![0u8; size as usize].into_boxed_slice()),
        }
    }

    #[inline(always)]
    pub(crate) unsafe fn base_ptr(&self) -> *mut u8 {
        (*self.bytes.get()).as_mut_ptr()
    }

    fn len(&self) -> u64 {
        unsafe { (&*self.bytes.get()).len() as u64 }
    }
}

#[derive(Debug)]
pub struct HostHeap {
    storage: Arc<HeapStorage>,
    size: u64,
    allocated_bytes: Arc<AtomicU64>,
}

impl HostHeap {
    pub(crate) fn new(size: u64, allocated_bytes: &Arc<AtomicU64>) -> Self {
        allocated_bytes.fetch_add(size, Ordering::Relaxed);
        Self {
            storage: Arc::new(HeapStorage::new(size)),
            size,
            allocated_bytes: allocated_bytes.clone(),
        }
    }
}

impl Drop for HostHeap {
    fn drop(&mut self) {
        self.allocated_bytes.fetch_sub(self.size, Ordering::Relaxed);
    }
}

impl Heap<HostBackend> for HostHeap {
    #[inline(always)]
    fn size(&self) -> u64 {
        self.size
    }

    unsafe fn create_buffer(
        &self,
        info: &BufferInfo,
        offset: u64,
    ) -> Result<HostBuffer, OutOfMemoryError> {
        if offset + info.size > self.storage.len() {
            return Err(OutOfMemoryError {});
        }
        Ok(HostBuffer {
            storage: self.storage.clone(),
            offset,
            length: info.size,
        })
    }
}

#[derive(Debug)]
pub struct HostBuffer {
    storage: Arc<HeapStorage>,
    offset: u64,
    length: u64,
}

impl Buffer for HostBuffer {
    #[inline(always)]
    fn length(&self) -> u64 {
        self.length
    }

    unsafe fn map_unsafe(&self, offset: u64, length: u64, _invalidate: bool) -> Option<*mut u8> {
        if offset + length > self.length {
            return None;
        }
        Some(self.storage.base_ptr().add((self.offset + offset) as usize))
    }

    unsafe fn unmap_unsafe(&self, _offset: u64, _length: u64, _flush: bool) {}
}
