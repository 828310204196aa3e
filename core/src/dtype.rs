/// Scalar element types a tensor allocation can carry.
///
/// The set is partitioned into the two [`DtypeGroup`]s, one per ubershader
/// variant. Anything that widens losslessly into a 32 bit register belongs to
/// [`DtypeGroup::Wide32`]; `u32` does not (its upper half would alias the
/// `i32` sign bit) and is served by the 64 bit variant together with the
/// 64 bit integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    F16,
    F32,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DtypeGroup {
    Wide32,
    Wide64,
}

impl DType {
    #[inline(always)]
    pub fn size(self) -> u64 {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::F16 | DType::I16 | DType::U16 => 2,
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::I64 | DType::U64 => 8,
        }
    }

    #[inline(always)]
    pub fn group(self) -> DtypeGroup {
        match self {
            DType::U32 | DType::I64 | DType::U64 => DtypeGroup::Wide64,
            _ => DtypeGroup::Wide32,
        }
    }

    #[inline(always)]
    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::F32)
    }

    #[inline(always)]
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            DType::F16 | DType::F32 | DType::I8 | DType::I16 | DType::I32 | DType::I64
        )
    }

    pub fn code(self) -> u8 {
        match self {
            DType::F16 => 0,
            DType::F32 => 1,
            DType::Bool => 2,
            DType::I8 => 3,
            DType::I16 => 4,
            DType::I32 => 5,
            DType::I64 => 6,
            DType::U8 => 7,
            DType::U16 => 8,
            DType::U32 => 9,
            DType::U64 => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<DType> {
        Some(match code {
            0 => DType::F16,
            1 => DType::F32,
            2 => DType::Bool,
            3 => DType::I8,
            4 => DType::I16,
            5 => DType::I32,
            6 => DType::I64,
            7 => DType::U8,
            8 => DType::U16,
            9 => DType::U32,
            10 => DType::U64,
            _ => return None,
        })
    }
}

impl DtypeGroup {
    /// Elements processed per ubershader thread.
    #[inline(always)]
    pub fn vector_width(self) -> u64 {
        match self {
            DtypeGroup::Wide32 => 4,
            DtypeGroup::Wide64 => 2,
        }
    }

    /// Distinct input allocations a single fused instruction may carry.
    #[inline(always)]
    pub fn max_instruction_inputs(self) -> usize {
        match self {
            DtypeGroup::Wide32 => 4,
            DtypeGroup::Wide64 => 3,
        }
    }
}
