bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct BufferUsage: u32 {
        const STORAGE  = 0b1;
        const COPY_SRC = 0b10;
        const COPY_DST = 0b100;
    }
}

#[derive(Debug, Clone)]
pub struct BufferInfo {
    pub size: u64,
    pub usage: BufferUsage,
}

pub trait Buffer {
    fn length(&self) -> u64;
    unsafe fn map_unsafe(&self, offset: u64, length: u64, invalidate: bool) -> Option<*mut u8>;
    unsafe fn unmap_unsafe(&self, offset: u64, length: u64, flush: bool);
}
