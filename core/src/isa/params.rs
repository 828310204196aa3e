use crate::dtype::{
    DType,
    DtypeGroup,
};

/// Bit 7 of a layout byte marks a scalar broadcast: the element at the
/// buffer base is replicated across the whole dispatch. The low bits carry
/// the element byte width (1, 2, 4 or 8).
pub const LAYOUT_SCALAR_BROADCAST: u8 = 0x80;

/// How compressed on-device bytes widen into a virtual register on read, and
/// symmetrically how the register narrows back to memory on write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryCast {
    // 32 bit registers
    F32AsF32,
    F16AsF32,
    I8AsI32,
    I16AsI32,
    I32AsI32,
    U8AsI32,
    U16AsI32,
    BoolAsI32,
    // 64 bit registers
    I64AsI64,
    U32AsI64,
    I32AsI64,
    I16AsI64,
    I8AsI64,
    U16AsI64,
    U8AsI64,
    BoolAsI64,
    F32AsF32Padded,
    F16AsF32Padded,
}

impl MemoryCast {
    #[inline(always)]
    pub fn element_width(self) -> u8 {
        match self {
            MemoryCast::I8AsI32
            | MemoryCast::U8AsI32
            | MemoryCast::BoolAsI32
            | MemoryCast::I8AsI64
            | MemoryCast::U8AsI64
            | MemoryCast::BoolAsI64 => 1,
            MemoryCast::F16AsF32
            | MemoryCast::I16AsI32
            | MemoryCast::U16AsI32
            | MemoryCast::I16AsI64
            | MemoryCast::U16AsI64
            | MemoryCast::F16AsF32Padded => 2,
            MemoryCast::F32AsF32
            | MemoryCast::I32AsI32
            | MemoryCast::U32AsI64
            | MemoryCast::I32AsI64
            | MemoryCast::F32AsF32Padded => 4,
            MemoryCast::I64AsI64 => 8,
        }
    }

    #[inline(always)]
    pub fn group(self) -> DtypeGroup {
        match self {
            MemoryCast::F32AsF32
            | MemoryCast::F16AsF32
            | MemoryCast::I8AsI32
            | MemoryCast::I16AsI32
            | MemoryCast::I32AsI32
            | MemoryCast::U8AsI32
            | MemoryCast::U16AsI32
            | MemoryCast::BoolAsI32 => DtypeGroup::Wide32,
            _ => DtypeGroup::Wide64,
        }
    }

    /// The widening scheme for an element type inside a given ubershader
    /// variant. A 64 bit dtype inside the 32 bit variant is a compiler bug.
    pub fn for_dtype(dtype: DType, group: DtypeGroup) -> MemoryCast {
        match group {
            DtypeGroup::Wide32 => match dtype {
                DType::F32 => MemoryCast::F32AsF32,
                DType::F16 => MemoryCast::F16AsF32,
                DType::I8 => MemoryCast::I8AsI32,
                DType::I16 => MemoryCast::I16AsI32,
                DType::I32 => MemoryCast::I32AsI32,
                DType::U8 => MemoryCast::U8AsI32,
                DType::U16 => MemoryCast::U16AsI32,
                DType::Bool => MemoryCast::BoolAsI32,
                _ => panic!("dtype {dtype:?} does not fit the 32-bit ubershader"),
            },
            DtypeGroup::Wide64 => match dtype {
                DType::I64 | DType::U64 => MemoryCast::I64AsI64,
                DType::U32 => MemoryCast::U32AsI64,
                DType::I32 => MemoryCast::I32AsI64,
                DType::I16 => MemoryCast::I16AsI64,
                DType::I8 => MemoryCast::I8AsI64,
                DType::U16 => MemoryCast::U16AsI64,
                DType::U8 => MemoryCast::U8AsI64,
                DType::Bool => MemoryCast::BoolAsI64,
                DType::F32 => MemoryCast::F32AsF32Padded,
                DType::F16 => MemoryCast::F16AsF32Padded,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadParams {
    pub layout: u8,
    pub cast: MemoryCast,
}

impl ReadParams {
    pub fn new(cast: MemoryCast, broadcast: bool) -> Self {
        let mut layout = cast.element_width();
        if broadcast {
            layout |= LAYOUT_SCALAR_BROADCAST;
        }
        Self { layout, cast }
    }

    /// Filler for unused input slots; never dereferenced.
    pub fn unused() -> Self {
        Self {
            layout: 0,
            cast: MemoryCast::F32AsF32,
        }
    }

    #[inline(always)]
    pub fn is_broadcast(self) -> bool {
        self.layout & LAYOUT_SCALAR_BROADCAST != 0
    }

    #[inline(always)]
    pub fn element_width(self) -> u8 {
        self.layout & !LAYOUT_SCALAR_BROADCAST
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteParams {
    pub layout: u8,
    pub cast: MemoryCast,
}

impl WriteParams {
    pub fn new(cast: MemoryCast) -> Self {
        Self {
            layout: cast.element_width(),
            cast,
        }
    }
}

/// The parameter block of one fused dispatch.
#[derive(Clone, Debug)]
pub struct DispatchParams {
    pub read_params: [ReadParams; 4],
    pub num_inputs: u16,
    pub num_operations: u16,
    pub write_params: WriteParams,
    pub element_count: u64,
    pub group: DtypeGroup,
}

impl DispatchParams {
    /// Grid size: each thread covers the variant's vector width.
    #[inline(always)]
    pub fn thread_count(&self) -> u64 {
        let width = self.group.vector_width();
        (self.element_count + width - 1) / width
    }
}

/// Per-op 8 byte immediate. Ops that declare metadata (`Op::has_metadata`)
/// consume one slot each, in the order the compiler appended them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct OpMetadata(pub [u8; 8]);

impl OpMetadata {
    pub fn from_f32(value: f32) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&value.to_le_bytes());
        Self(bytes)
    }

    pub fn from_f32_pair(a: f32, b: f32) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&a.to_le_bytes());
        bytes[4..].copy_from_slice(&b.to_le_bytes());
        Self(bytes)
    }

    pub fn from_u32_pair(a: u32, b: u32) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&a.to_le_bytes());
        bytes[4..].copy_from_slice(&b.to_le_bytes());
        Self(bytes)
    }

    pub fn from_i32(value: i32) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&value.to_le_bytes());
        Self(bytes)
    }

    pub fn from_i64(value: i64) -> Self {
        Self(value.to_le_bytes())
    }

    #[inline(always)]
    pub fn f32(self) -> f32 {
        f32::from_le_bytes(self.0[..4].try_into().unwrap())
    }

    #[inline(always)]
    pub fn f32_pair(self) -> (f32, f32) {
        (
            f32::from_le_bytes(self.0[..4].try_into().unwrap()),
            f32::from_le_bytes(self.0[4..].try_into().unwrap()),
        )
    }

    #[inline(always)]
    pub fn u32_pair(self) -> (u32, u32) {
        (
            u32::from_le_bytes(self.0[..4].try_into().unwrap()),
            u32::from_le_bytes(self.0[4..].try_into().unwrap()),
        )
    }

    #[inline(always)]
    pub fn i32(self) -> i32 {
        i32::from_le_bytes(self.0[..4].try_into().unwrap())
    }

    #[inline(always)]
    pub fn i64(self) -> i64 {
        i64::from_le_bytes(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_byte_carries_width_and_broadcast_bit() {
        let params = ReadParams::new(MemoryCast::F16AsF32, true);
        assert!(params.is_broadcast());
        assert_eq!(params.element_width(), 2);

        let params = ReadParams::new(MemoryCast::I64AsI64, false);
        assert!(!params.is_broadcast());
        assert_eq!(params.element_width(), 8);
    }

    #[test]
    fn thread_count_covers_the_vector_width() {
        let params = DispatchParams {
            read_params: [ReadParams::unused(); 4],
            num_inputs: 1,
            num_operations: 1,
            write_params: WriteParams::new(MemoryCast::F32AsF32),
            element_count: 9,
            group: DtypeGroup::Wide32,
        };
        assert_eq!(params.thread_count(), 3);

        let params = DispatchParams {
            group: DtypeGroup::Wide64,
            write_params: WriteParams::new(MemoryCast::I64AsI64),
            ..params
        };
        assert_eq!(params.thread_count(), 5);
    }

    #[test]
    fn metadata_roundtrips_pairs() {
        let meta = OpMetadata::from_f32_pair(-128.0, 127.0);
        assert_eq!(meta.f32_pair(), (-128.0, 127.0));
        let meta = OpMetadata::from_u32_pair(0xFF, 0x80);
        assert_eq!(meta.u32_pair(), (0xFF, 0x80));
        let meta = OpMetadata::from_i64(-5);
        assert_eq!(meta.i64(), -5);
    }
}
