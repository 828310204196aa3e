pub use self::interpret::*;
pub use self::params::*;

mod interpret;
mod params;

use crate::dtype::DtypeGroup;

pub const UNARY_BASE: u16 = 0;
pub const BINARY_BASE: u16 = 1000;
pub const TERNARY_BASE: u16 = 2000;
pub const SWAP_BASE: u16 = 3000;

/// Unary op-codes below 500 execute in the 32 bit ubershader variant, the
/// rest in the 64 bit one. The split is mirrored by `BinaryOp` at 1500.
macro_rules! opcodes {
    ($name:ident, { $($variant:ident = $code:expr),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum $name {
            $($variant = $code),+
        }

        impl $name {
            pub fn from_u16(code: u16) -> Option<Self> {
                match code {
                    $(value if value == $code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

opcodes!(UnaryOp, {
    AbsF32 = 0,
    CeilF32 = 1,
    CosF32 = 2,
    EluF32 = 3,
    ExpF32 = 4,
    Expm1F32 = 5,
    FloorF32 = 6,
    IncrementF32 = 7,
    LeakyReluF32 = 8,
    LogF32 = 9,
    Log1pF32 = 10,
    NegF32 = 11,
    ReluF32 = 12,
    Relu6F32 = 13,
    RoundF32 = 14,
    RsqrtF32 = 15,
    SeluF32 = 16,
    SigmoidF32 = 17,
    SignF32 = 18,
    SinF32 = 19,
    SoftplusF32 = 20,
    SoftsignF32 = 21,
    SqrtF32 = 22,
    SquareF32 = 23,
    TanF32 = 24,
    TanhF32 = 25,
    ScalarAddF32 = 26,
    ScalarMulF32 = 27,

    AbsI32 = 40,
    IncrementI32 = 41,
    LogicalNotI32 = 42,
    NegI32 = 43,
    SignI32 = 44,
    SquareI32 = 45,
    ScalarAddI32 = 46,
    ScalarMulI32 = 47,

    CastF32ToI32 = 60,
    CastI32ToF32 = 61,
    CastI32ToI32 = 62,
    CastF32ToBool = 63,
    CastI32ToBool = 64,

    AbsI64 = 500,
    IncrementI64 = 501,
    LogicalNotI64 = 502,
    NegI64 = 503,
    SignI64 = 504,
    SignU64 = 505,
    SquareI64 = 506,
    ScalarAddI64 = 507,
    ScalarMulI64 = 508,

    CastToI64 = 520,
    CastF32ToI64 = 521,
    CastI64ToF32 = 522,
    CastU64ToF32 = 523,
    CastI64ToI64 = 524,
    CastI64ToBool = 525,
});

opcodes!(BinaryOp, {
    AddF32 = 1000,
    SubF32 = 1001,
    MulF32 = 1002,
    DivF32 = 1003,
    MaxF32 = 1004,
    MinF32 = 1005,
    PowF32 = 1006,
    SquaredDifferenceF32 = 1007,
    ComparisonF32 = 1008,
    ReluGradF32 = 1009,
    SigmoidGradF32 = 1010,

    AddI32 = 1020,
    SubI32 = 1021,
    MulI32 = 1022,
    DivI32 = 1023,
    MaxI32 = 1024,
    MinI32 = 1025,
    ComparisonI32 = 1026,

    AddI64 = 1500,
    SubI64 = 1501,
    MulI64 = 1502,
    DivI64 = 1503,
    DivU64 = 1504,
    MaxI64 = 1505,
    MinI64 = 1506,
    MaxU64 = 1507,
    MinU64 = 1508,
    ComparisonI64 = 1509,
    ComparisonU64 = 1510,
});

opcodes!(TernaryOp, {
    ClipByValueF32 = 2000,
    ClipByValueI32 = 2001,
    Select = 2002,
});

opcodes!(RegisterSwap, {
    Swap12 = 3000,
    Swap13 = 3001,
    Swap14 = 3002,
    Swap23 = 3003,
    Swap24 = 3004,
    Swap34 = 3005,
});

impl RegisterSwap {
    /// Zero-based register indices exchanged by this pseudo-op.
    #[inline(always)]
    pub fn indices(self) -> (usize, usize) {
        match self {
            RegisterSwap::Swap12 => (0, 1),
            RegisterSwap::Swap13 => (0, 2),
            RegisterSwap::Swap14 => (0, 3),
            RegisterSwap::Swap23 => (1, 2),
            RegisterSwap::Swap24 => (1, 3),
            RegisterSwap::Swap34 => (2, 3),
        }
    }

    pub fn for_indices(a: usize, b: usize) -> RegisterSwap {
        let (a, b) = if a < b { (a, b) } else { (b, a) };
        match (a, b) {
            (0, 1) => RegisterSwap::Swap12,
            (0, 2) => RegisterSwap::Swap13,
            (0, 3) => RegisterSwap::Swap14,
            (1, 2) => RegisterSwap::Swap23,
            (1, 3) => RegisterSwap::Swap24,
            (2, 3) => RegisterSwap::Swap34,
            _ => panic!("no register swap for pair ({a}, {b})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Ternary(TernaryOp),
    Swap(RegisterSwap),
}

impl Op {
    pub fn decode(code: u16) -> Option<Op> {
        if code < BINARY_BASE {
            UnaryOp::from_u16(code).map(Op::Unary)
        } else if code < TERNARY_BASE {
            BinaryOp::from_u16(code).map(Op::Binary)
        } else if code < SWAP_BASE {
            TernaryOp::from_u16(code).map(Op::Ternary)
        } else {
            RegisterSwap::from_u16(code).map(Op::Swap)
        }
    }

    #[inline(always)]
    pub fn encode(self) -> u16 {
        match self {
            Op::Unary(op) => op as u16,
            Op::Binary(op) => op as u16,
            Op::Ternary(op) => op as u16,
            Op::Swap(op) => op as u16,
        }
    }

    /// Ubershader variant this op-code executes in. Swaps are neutral.
    pub fn group(self) -> Option<DtypeGroup> {
        match self {
            Op::Unary(op) => Some(if (op as u16) < 500 {
                DtypeGroup::Wide32
            } else {
                DtypeGroup::Wide64
            }),
            Op::Binary(op) => Some(if (op as u16) < 1500 {
                DtypeGroup::Wide32
            } else {
                DtypeGroup::Wide64
            }),
            Op::Ternary(_) => Some(DtypeGroup::Wide32),
            Op::Swap(_) => None,
        }
    }

    /// Whether this op-code reads an 8 byte immediate from the metadata
    /// stream. The encoder and the interpreter must agree on this set or the
    /// streams desynchronize.
    pub fn has_metadata(self) -> bool {
        match self {
            Op::Unary(op) => matches!(
                op,
                UnaryOp::LeakyReluF32
                    | UnaryOp::ScalarAddF32
                    | UnaryOp::ScalarMulF32
                    | UnaryOp::ScalarAddI32
                    | UnaryOp::ScalarMulI32
                    | UnaryOp::CastF32ToI32
                    | UnaryOp::CastI32ToI32
                    | UnaryOp::ScalarAddI64
                    | UnaryOp::ScalarMulI64
                    | UnaryOp::CastF32ToI64
                    | UnaryOp::CastI64ToI64
            ),
            Op::Binary(op) => matches!(
                op,
                BinaryOp::ComparisonF32
                    | BinaryOp::ComparisonI32
                    | BinaryOp::ComparisonI64
                    | BinaryOp::ComparisonU64
            ),
            Op::Ternary(_) => false,
            Op::Swap(_) => false,
        }
    }
}

/// Comparison direction codes carried in comparison metadata.
pub const COMPARISON_EQUAL: u32 = 0;
pub const COMPARISON_LESS: u32 = 1;
pub const COMPARISON_GREATER: u32 = 2;
