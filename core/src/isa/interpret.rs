//! Scalar interpreter for the ubershader contract.
//!
//! Both executors share these functions: the host backend loops them over
//! whole dispatches and the runtime's constant folder runs them on tiny
//! tensors. Keeping a single definition is what makes the two paths produce
//! identical bit patterns for every op-code and operand.

use half::f16;

use super::*;

pub struct MetadataCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> MetadataCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn next(&mut self) -> OpMetadata {
        let end = self.pos + 8;
        if end > self.bytes.len() {
            panic!("metadata stream exhausted at offset {}", self.pos);
        }
        let meta = OpMetadata(self.bytes[self.pos..end].try_into().unwrap());
        self.pos = end;
        meta
    }
}

/// Runs a fused op-code chain over one element's worth of 32 bit registers.
/// Register 0 holds the running value; the final result is left there.
pub fn run_chain32(opcodes: &[u16], metadata: &[u8], regs: &mut [u32; 4]) {
    let mut meta = MetadataCursor::new(metadata);
    for &code in opcodes {
        let op = Op::decode(code)
            .unwrap_or_else(|| panic!("undecodable op-code {code} in 32-bit dispatch"));
        match op {
            Op::Unary(op) => regs[0] = unary32(op, regs[0], &mut meta),
            Op::Binary(op) => regs[0] = binary32(op, regs[0], regs[1], &mut meta),
            Op::Ternary(op) => regs[0] = ternary32(op, regs[0], regs[1], regs[2]),
            Op::Swap(op) => {
                let (i, j) = op.indices();
                regs.swap(i, j);
            }
        }
    }
}

pub fn run_chain64(opcodes: &[u16], metadata: &[u8], regs: &mut [u64; 4]) {
    let mut meta = MetadataCursor::new(metadata);
    for &code in opcodes {
        let op = Op::decode(code)
            .unwrap_or_else(|| panic!("undecodable op-code {code} in 64-bit dispatch"));
        match op {
            Op::Unary(op) => regs[0] = unary64(op, regs[0], &mut meta),
            Op::Binary(op) => regs[0] = binary64(op, regs[0], regs[1], &mut meta),
            Op::Ternary(_) => panic!("ternary op-code {code} in 64-bit dispatch"),
            Op::Swap(op) => {
                let (i, j) = op.indices();
                regs.swap(i, j);
            }
        }
    }
}

#[inline(always)]
fn f(bits: u32) -> f32 {
    f32::from_bits(bits)
}

#[inline(always)]
fn b(value: f32) -> u32 {
    value.to_bits()
}

fn unary32(op: UnaryOp, x: u32, meta: &mut MetadataCursor) -> u32 {
    match op {
        UnaryOp::AbsF32 => b(f(x).abs()),
        UnaryOp::CeilF32 => b(f(x).ceil()),
        UnaryOp::CosF32 => b(f(x).cos()),
        UnaryOp::EluF32 => {
            let v = f(x);
            b(if v > 0.0 { v } else { v.exp_m1() })
        }
        UnaryOp::ExpF32 => b(f(x).exp()),
        UnaryOp::Expm1F32 => b(f(x).exp_m1()),
        UnaryOp::FloorF32 => b(f(x).floor()),
        UnaryOp::IncrementF32 => b(f(x) + 1.0),
        UnaryOp::LeakyReluF32 => {
            let alpha = meta.next().f32();
            let v = f(x);
            b(v.max(v * alpha))
        }
        UnaryOp::LogF32 => b(f(x).ln()),
        UnaryOp::Log1pF32 => b(f(x).ln_1p()),
        UnaryOp::NegF32 => b(-f(x)),
        UnaryOp::ReluF32 => b(f(x).max(0.0)),
        UnaryOp::Relu6F32 => b(f(x).max(0.0).min(6.0)),
        UnaryOp::RoundF32 => b(f(x).round()),
        UnaryOp::RsqrtF32 => b(1.0 / f(x).sqrt()),
        UnaryOp::SeluF32 => {
            const SCALE: f32 = 1.050_700_987_355_480_5;
            const ALPHA: f32 = 1.673_263_242_354_377_2;
            let v = f(x);
            b(SCALE * if v > 0.0 { v } else { ALPHA * v.exp_m1() })
        }
        UnaryOp::SigmoidF32 => b(1.0 / (1.0 + (-f(x)).exp())),
        UnaryOp::SignF32 => {
            let v = f(x);
            b(if v > 0.0 {
                1.0
            } else if v < 0.0 {
                -1.0
            } else {
                0.0
            })
        }
        UnaryOp::SinF32 => b(f(x).sin()),
        UnaryOp::SoftplusF32 => {
            // Overflow-safe split keeps the result finite for large x.
            let v = f(x);
            b(if v > 0.0 {
                v + (-v).exp().ln_1p()
            } else {
                v.exp().ln_1p()
            })
        }
        UnaryOp::SoftsignF32 => {
            let v = f(x);
            b(v / (1.0 + v.abs()))
        }
        UnaryOp::SqrtF32 => b(f(x).sqrt()),
        UnaryOp::SquareF32 => b(f(x) * f(x)),
        UnaryOp::TanF32 => b(f(x).tan()),
        UnaryOp::TanhF32 => b(f(x).tanh()),
        UnaryOp::ScalarAddF32 => b(f(x) + meta.next().f32()),
        UnaryOp::ScalarMulF32 => b(f(x) * meta.next().f32()),

        UnaryOp::AbsI32 => (x as i32).wrapping_abs() as u32,
        UnaryOp::IncrementI32 => (x as i32).wrapping_add(1) as u32,
        UnaryOp::LogicalNotI32 => (x == 0) as u32,
        UnaryOp::NegI32 => (x as i32).wrapping_neg() as u32,
        UnaryOp::SignI32 => (x as i32).signum() as u32,
        UnaryOp::SquareI32 => (x as i32).wrapping_mul(x as i32) as u32,
        UnaryOp::ScalarAddI32 => (x as i32).wrapping_add(meta.next().i32()) as u32,
        UnaryOp::ScalarMulI32 => (x as i32).wrapping_mul(meta.next().i32()) as u32,

        UnaryOp::CastF32ToI32 => {
            let (lower, upper) = meta.next().f32_pair();
            let v = f(x);
            if v.is_nan() {
                0
            } else {
                (v.clamp(lower, upper)) as i32 as u32
            }
        }
        UnaryOp::CastI32ToF32 => b(x as i32 as f32),
        UnaryOp::CastI32ToI32 => {
            let (truncate_mask, sign_bit_mask) = meta.next().u32_pair();
            let mut r = x & truncate_mask;
            if sign_bit_mask != 0 && x & sign_bit_mask != 0 {
                r |= !truncate_mask;
            }
            r
        }
        UnaryOp::CastF32ToBool => (f(x) != 0.0) as u32,
        UnaryOp::CastI32ToBool => (x != 0) as u32,

        _ => panic!("64-bit op-code {:?} in 32-bit dispatch", op),
    }
}

fn unary64(op: UnaryOp, x: u64, meta: &mut MetadataCursor) -> u64 {
    match op {
        UnaryOp::AbsI64 => (x as i64).wrapping_abs() as u64,
        UnaryOp::IncrementI64 => (x as i64).wrapping_add(1) as u64,
        UnaryOp::LogicalNotI64 => (x == 0) as u64,
        UnaryOp::NegI64 => (x as i64).wrapping_neg() as u64,
        UnaryOp::SignI64 => (x as i64).signum() as u64,
        UnaryOp::SignU64 => (x != 0) as u64,
        UnaryOp::SquareI64 => (x as i64).wrapping_mul(x as i64) as u64,
        UnaryOp::ScalarAddI64 => (x as i64).wrapping_add(meta.next().i64()) as u64,
        UnaryOp::ScalarMulI64 => (x as i64).wrapping_mul(meta.next().i64()) as u64,

        UnaryOp::CastToI64 => x,
        UnaryOp::CastF32ToI64 => {
            let (lower, upper) = meta.next().f32_pair();
            let v = f32::from_bits(x as u32);
            if v.is_nan() {
                0
            } else {
                (v.clamp(lower, upper)) as i64 as u64
            }
        }
        UnaryOp::CastI64ToF32 => (x as i64 as f32).to_bits() as u64,
        UnaryOp::CastU64ToF32 => (x as f32).to_bits() as u64,
        UnaryOp::CastI64ToI64 => {
            let (truncate_mask, sign_bit_mask) = meta.next().u32_pair();
            let truncate_mask = truncate_mask as u64;
            let sign_bit_mask = sign_bit_mask as u64;
            let mut r = x & truncate_mask;
            if sign_bit_mask != 0 && x & sign_bit_mask != 0 {
                r |= !truncate_mask;
            }
            r
        }
        UnaryOp::CastI64ToBool => (x != 0) as u64,

        _ => panic!("32-bit op-code {:?} in 64-bit dispatch", op),
    }
}

fn comparison(code: u32, invert: u32, ordering: std::cmp::Ordering, unordered: bool) -> bool {
    use std::cmp::Ordering;
    let result = if unordered {
        false
    } else {
        match code {
            COMPARISON_EQUAL => ordering == Ordering::Equal,
            COMPARISON_LESS => ordering == Ordering::Less,
            COMPARISON_GREATER => ordering == Ordering::Greater,
            _ => panic!("invalid comparison code {code}"),
        }
    };
    result != (invert != 0)
}

fn binary32(op: BinaryOp, a: u32, rhs: u32, meta: &mut MetadataCursor) -> u32 {
    match op {
        BinaryOp::AddF32 => b(f(a) + f(rhs)),
        BinaryOp::SubF32 => b(f(a) - f(rhs)),
        BinaryOp::MulF32 => b(f(a) * f(rhs)),
        BinaryOp::DivF32 => b(f(a) / f(rhs)),
        BinaryOp::MaxF32 => b(f(a).max(f(rhs))),
        BinaryOp::MinF32 => b(f(a).min(f(rhs))),
        BinaryOp::PowF32 => b(f(a).powf(f(rhs))),
        BinaryOp::SquaredDifferenceF32 => {
            let d = f(a) - f(rhs);
            b(d * d)
        }
        BinaryOp::ComparisonF32 => {
            let (code, invert) = meta.next().u32_pair();
            let (x, y) = (f(a), f(rhs));
            match x.partial_cmp(&y) {
                Some(ordering) => comparison(code, invert, ordering, false) as u32,
                None => comparison(code, invert, std::cmp::Ordering::Equal, true) as u32,
            }
        }
        BinaryOp::ReluGradF32 => {
            // dy in register 1, the forward input in register 2.
            if f(rhs) > 0.0 {
                a
            } else {
                b(0.0)
            }
        }
        BinaryOp::SigmoidGradF32 => {
            let y = f(rhs);
            b(f(a) * y * (1.0 - y))
        }

        BinaryOp::AddI32 => (a as i32).wrapping_add(rhs as i32) as u32,
        BinaryOp::SubI32 => (a as i32).wrapping_sub(rhs as i32) as u32,
        BinaryOp::MulI32 => (a as i32).wrapping_mul(rhs as i32) as u32,
        BinaryOp::DivI32 => {
            let d = rhs as i32;
            if d == 0 {
                0
            } else {
                (a as i32).wrapping_div(d) as u32
            }
        }
        BinaryOp::MaxI32 => (a as i32).max(rhs as i32) as u32,
        BinaryOp::MinI32 => (a as i32).min(rhs as i32) as u32,
        BinaryOp::ComparisonI32 => {
            let (code, invert) = meta.next().u32_pair();
            comparison(code, invert, (a as i32).cmp(&(rhs as i32)), false) as u32
        }

        _ => panic!("64-bit op-code {:?} in 32-bit dispatch", op),
    }
}

fn binary64(op: BinaryOp, a: u64, rhs: u64, meta: &mut MetadataCursor) -> u64 {
    match op {
        BinaryOp::AddI64 => (a as i64).wrapping_add(rhs as i64) as u64,
        BinaryOp::SubI64 => (a as i64).wrapping_sub(rhs as i64) as u64,
        BinaryOp::MulI64 => (a as i64).wrapping_mul(rhs as i64) as u64,
        BinaryOp::DivI64 => {
            let d = rhs as i64;
            if d == 0 {
                0
            } else {
                (a as i64).wrapping_div(d) as u64
            }
        }
        BinaryOp::DivU64 => {
            if rhs == 0 {
                0
            } else {
                a / rhs
            }
        }
        BinaryOp::MaxI64 => (a as i64).max(rhs as i64) as u64,
        BinaryOp::MinI64 => (a as i64).min(rhs as i64) as u64,
        BinaryOp::MaxU64 => a.max(rhs),
        BinaryOp::MinU64 => a.min(rhs),
        BinaryOp::ComparisonI64 => {
            let (code, invert) = meta.next().u32_pair();
            comparison(code, invert, (a as i64).cmp(&(rhs as i64)), false) as u64
        }
        BinaryOp::ComparisonU64 => {
            let (code, invert) = meta.next().u32_pair();
            comparison(code, invert, a.cmp(&rhs), false) as u64
        }

        _ => panic!("32-bit op-code {:?} in 64-bit dispatch", op),
    }
}

fn ternary32(op: TernaryOp, a: u32, rhs: u32, third: u32) -> u32 {
    match op {
        TernaryOp::ClipByValueF32 => {
            let (x, lo, hi) = (f(a), f(rhs), f(third));
            b(if x < lo {
                lo
            } else if x > hi {
                hi
            } else {
                x
            })
        }
        TernaryOp::ClipByValueI32 => {
            let (x, lo, hi) = (a as i32, rhs as i32, third as i32);
            x.max(lo).min(hi) as u32
        }
        TernaryOp::Select => {
            if a != 0 {
                rhs
            } else {
                third
            }
        }
    }
}

/// Loads element `index` of a buffer into a 32 bit register, applying the
/// read layout (broadcast bit) and widening memory cast.
pub fn read_scalar32(bytes: &[u8], index: usize, params: ReadParams) -> u32 {
    let index = if params.is_broadcast() { 0 } else { index };
    let off = index * params.cast.element_width() as usize;
    match params.cast {
        MemoryCast::F32AsF32 | MemoryCast::I32AsI32 => {
            u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
        }
        MemoryCast::F16AsF32 => {
            f16::from_le_bytes(bytes[off..off + 2].try_into().unwrap())
                .to_f32()
                .to_bits()
        }
        MemoryCast::I8AsI32 => bytes[off] as i8 as i32 as u32,
        MemoryCast::I16AsI32 => {
            i16::from_le_bytes(bytes[off..off + 2].try_into().unwrap()) as i32 as u32
        }
        MemoryCast::U8AsI32 => bytes[off] as u32,
        MemoryCast::U16AsI32 => {
            u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap()) as u32
        }
        MemoryCast::BoolAsI32 => (bytes[off] != 0) as u32,
        _ => panic!("64-bit memory cast {:?} in 32-bit read", params.cast),
    }
}

pub fn write_scalar32(bytes: &mut [u8], index: usize, params: WriteParams, value: u32) {
    let off = index * params.cast.element_width() as usize;
    match params.cast {
        MemoryCast::F32AsF32 | MemoryCast::I32AsI32 => {
            bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
        }
        MemoryCast::F16AsF32 => {
            let h = f16::from_f32(f32::from_bits(value));
            bytes[off..off + 2].copy_from_slice(&h.to_le_bytes());
        }
        MemoryCast::I8AsI32 | MemoryCast::U8AsI32 => bytes[off] = value as u8,
        MemoryCast::I16AsI32 | MemoryCast::U16AsI32 => {
            bytes[off..off + 2].copy_from_slice(&(value as u16).to_le_bytes());
        }
        MemoryCast::BoolAsI32 => bytes[off] = (value != 0) as u8,
        _ => panic!("64-bit memory cast {:?} in 32-bit write", params.cast),
    }
}

pub fn read_scalar64(bytes: &[u8], index: usize, params: ReadParams) -> u64 {
    let index = if params.is_broadcast() { 0 } else { index };
    let off = index * params.cast.element_width() as usize;
    match params.cast {
        MemoryCast::I64AsI64 => u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()),
        MemoryCast::U32AsI64 => {
            u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as u64
        }
        MemoryCast::I32AsI64 => {
            i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as i64 as u64
        }
        MemoryCast::I16AsI64 => {
            i16::from_le_bytes(bytes[off..off + 2].try_into().unwrap()) as i64 as u64
        }
        MemoryCast::I8AsI64 => bytes[off] as i8 as i64 as u64,
        MemoryCast::U16AsI64 => {
            u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap()) as u64
        }
        MemoryCast::U8AsI64 => bytes[off] as u64,
        MemoryCast::BoolAsI64 => (bytes[off] != 0) as u64,
        MemoryCast::F32AsF32Padded => {
            u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as u64
        }
        MemoryCast::F16AsF32Padded => {
            f16::from_le_bytes(bytes[off..off + 2].try_into().unwrap())
                .to_f32()
                .to_bits() as u64
        }
        _ => panic!("32-bit memory cast {:?} in 64-bit read", params.cast),
    }
}

pub fn write_scalar64(bytes: &mut [u8], index: usize, params: WriteParams, value: u64) {
    let off = index * params.cast.element_width() as usize;
    match params.cast {
        MemoryCast::I64AsI64 => bytes[off..off + 8].copy_from_slice(&value.to_le_bytes()),
        MemoryCast::U32AsI64 | MemoryCast::I32AsI64 | MemoryCast::F32AsF32Padded => {
            bytes[off..off + 4].copy_from_slice(&(value as u32).to_le_bytes());
        }
        MemoryCast::I16AsI64 | MemoryCast::U16AsI64 => {
            bytes[off..off + 2].copy_from_slice(&(value as u16).to_le_bytes());
        }
        MemoryCast::I8AsI64 | MemoryCast::U8AsI64 => bytes[off] = value as u8,
        MemoryCast::BoolAsI64 => bytes[off] = (value != 0) as u8,
        MemoryCast::F16AsF32Padded => {
            let h = f16::from_f32(f32::from_bits(value as u32));
            bytes[off..off + 2].copy_from_slice(&h.to_le_bytes());
        }
        _ => panic!("32-bit memory cast {:?} in 64-bit write", params.cast),
    }
}
