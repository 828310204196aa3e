use tensorstream_core::dtype::{
    DType,
    DtypeGroup,
};
use tensorstream_core::isa::{
    BinaryOp,
    Op,
    OpMetadata,
    TernaryOp,
    UnaryOp,
    COMPARISON_EQUAL,
    COMPARISON_GREATER,
    COMPARISON_LESS,
};

use super::TensorError;

/// One frontend operation resolved against its input dtypes: the op-code,
/// its immediate, the ubershader variant it needs and the inferred output
/// dtype.
pub(crate) struct ResolvedOp {
    pub op: Op,
    pub metadata: Option<OpMetadata>,
    pub group: DtypeGroup,
    pub out_dtype: DType,
    /// Operand that must sit in register 1 when the op executes. Gradient
    /// ops take `dy` there regardless of the order the frontend passed it.
    pub primary_input: usize,
}

pub(crate) enum ResolvedOperation {
    Elementwise(ResolvedOp),
    Copy,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Category {
    Float32,
    Int32,
    Int64,
    Uns64,
}

fn category(dtype: DType) -> Category {
    match dtype {
        DType::F16 | DType::F32 => Category::Float32,
        DType::Bool | DType::I8 | DType::I16 | DType::I32 | DType::U8 | DType::U16 => {
            Category::Int32
        }
        DType::U32 | DType::I64 => Category::Int64,
        DType::U64 => Category::Uns64,
    }
}

fn unknown(name: &str) -> TensorError {
    TensorError::UnknownOp(name.to_string())
}

fn attr_f32(name: &str, attributes: &[u8]) -> Result<f32, TensorError> {
    if attributes.len() < 4 {
        return Err(unknown(name));
    }
    Ok(f32::from_le_bytes(attributes[..4].try_into().unwrap()))
}

fn attr_i64(name: &str, attributes: &[u8]) -> Result<i64, TensorError> {
    if attributes.len() < 8 {
        return Err(unknown(name));
    }
    Ok(i64::from_le_bytes(attributes[..8].try_into().unwrap()))
}

/// Clamp bounds for a float → integer conversion, expressed in the f32
/// domain the register holds.
fn float_cast_bounds(target: DType) -> (f32, f32) {
    match target {
        DType::I8 => (-128.0, 127.0),
        DType::I16 => (-32768.0, 32767.0),
        DType::I32 => (-2147483648.0, 2147483647.0),
        DType::I64 => (-9.223372e18, 9.223372e18),
        DType::U8 => (0.0, 255.0),
        DType::U16 => (0.0, 65535.0),
        DType::U32 => (0.0, 4294967295.0),
        DType::U64 => (0.0, 1.8446744e19),
        _ => panic!("no integer cast bounds for {target:?}"),
    }
}

/// (truncate_mask, sign_bit_mask) for an integer → integer narrowing.
fn int_cast_masks(target: DType) -> (u32, u32) {
    match target {
        DType::I8 => (0xFF, 0x80),
        DType::I16 => (0xFFFF, 0x8000),
        DType::I32 => (0xFFFF_FFFF, 0x8000_0000),
        DType::U8 => (0xFF, 0),
        DType::U16 => (0xFFFF, 0),
        DType::U32 => (0xFFFF_FFFF, 0),
        // Full-width targets keep every bit.
        DType::I64 | DType::U64 => (0xFFFF_FFFF, 0xFFFF_FFFF),
        _ => panic!("no integer cast masks for {target:?}"),
    }
}

fn resolve_cast(name: &str, attributes: &[u8], src: DType) -> Result<ResolvedOperation, TensorError> {
    let target = attributes
        .first()
        .and_then(|&code| DType::from_code(code))
        .ok_or_else(|| unknown(name))?;
    if target == src {
        return Ok(ResolvedOperation::Copy);
    }

    let group = if src.group() == DtypeGroup::Wide64 || target.group() == DtypeGroup::Wide64 {
        DtypeGroup::Wide64
    } else {
        DtypeGroup::Wide32
    };

    let (op, metadata) = match group {
        DtypeGroup::Wide32 => {
            if src.is_float() {
                match target {
                    DType::Bool => (UnaryOp::CastF32ToBool, None),
                    DType::F16 | DType::F32 => {
                        // The memory casts do the conversion; the register
                        // value passes through unchanged.
                        (UnaryOp::ScalarMulF32, Some(OpMetadata::from_f32(1.0)))
                    }
                    _ => {
                        let (lower, upper) = float_cast_bounds(target);
                        (UnaryOp::CastF32ToI32, Some(OpMetadata::from_f32_pair(lower, upper)))
                    }
                }
            } else {
                match target {
                    DType::Bool => (UnaryOp::CastI32ToBool, None),
                    DType::F16 | DType::F32 => (UnaryOp::CastI32ToF32, None),
                    _ => {
                        let (truncate, sign) = int_cast_masks(target);
                        (UnaryOp::CastI32ToI32, Some(OpMetadata::from_u32_pair(truncate, sign)))
                    }
                }
            }
        }
        DtypeGroup::Wide64 => {
            if src.is_float() {
                let (lower, upper) = float_cast_bounds(target);
                (UnaryOp::CastF32ToI64, Some(OpMetadata::from_f32_pair(lower, upper)))
            } else if target.is_float() {
                match src {
                    DType::U64 => (UnaryOp::CastU64ToF32, None),
                    _ => (UnaryOp::CastI64ToF32, None),
                }
            } else if target == DType::Bool {
                (UnaryOp::CastI64ToBool, None)
            } else if src.group() == DtypeGroup::Wide32
                || matches!(target, DType::I64 | DType::U64)
            {
                // The widening read (or full-width target) already carries
                // the value; the register passes through.
                (UnaryOp::CastToI64, None)
            } else {
                let (truncate, sign) = int_cast_masks(target);
                (UnaryOp::CastI64ToI64, Some(OpMetadata::from_u32_pair(truncate, sign)))
            }
        }
    };

    Ok(ResolvedOperation::Elementwise(ResolvedOp {
        op: Op::Unary(op),
        metadata,
        group,
        out_dtype: target,
        primary_input: 0,
    }))
}

fn resolve_comparison(code: u32, invert: u32, dtype: DType) -> Result<ResolvedOperation, TensorError> {
    let op = match category(dtype) {
        Category::Float32 => BinaryOp::ComparisonF32,
        Category::Int32 => BinaryOp::ComparisonI32,
        Category::Int64 => BinaryOp::ComparisonI64,
        Category::Uns64 => BinaryOp::ComparisonU64,
    };
    Ok(ResolvedOperation::Elementwise(ResolvedOp {
        op: Op::Binary(op),
        metadata: Some(OpMetadata::from_u32_pair(code, invert)),
        group: dtype.group(),
        out_dtype: DType::Bool,
        primary_input: 0,
    }))
}

/// Maps a frontend op name plus attribute blob onto an op-code. The output
/// dtype defaults to the first input's; comparisons narrow to bool and casts
/// to their attribute target.
pub(crate) fn resolve(
    name: &str,
    attributes: &[u8],
    input_dtypes: &[DType],
) -> Result<ResolvedOperation, TensorError> {
    if name == "copy" {
        if input_dtypes.len() != 1 {
            return Err(unknown(name));
        }
        return Ok(ResolvedOperation::Copy);
    }

    let dtype = *input_dtypes.first().ok_or_else(|| unknown(name))?;
    let cat = category(dtype);
    let group = dtype.group();

    let elementwise = |op: Op, metadata: Option<OpMetadata>| {
        Ok(ResolvedOperation::Elementwise(ResolvedOp {
            op,
            metadata,
            group,
            out_dtype: dtype,
            primary_input: 0,
        }))
    };
    let unary = |op: UnaryOp, metadata: Option<OpMetadata>| elementwise(Op::Unary(op), metadata);
    let binary = |op: BinaryOp| elementwise(Op::Binary(op), None);
    let ternary = |op: TernaryOp| elementwise(Op::Ternary(op), None);

    match name {
        "cast" => return resolve_cast(name, attributes, dtype),

        "equal" => return resolve_comparison(COMPARISON_EQUAL, 0, dtype),
        "not_equal" => return resolve_comparison(COMPARISON_EQUAL, 1, dtype),
        "less" => return resolve_comparison(COMPARISON_LESS, 0, dtype),
        "greater_equal" => return resolve_comparison(COMPARISON_LESS, 1, dtype),
        "greater" => return resolve_comparison(COMPARISON_GREATER, 0, dtype),
        "less_equal" => return resolve_comparison(COMPARISON_GREATER, 1, dtype),
        _ => {}
    }

    match (name, cat) {
        // Unary float.
        ("abs", Category::Float32) => unary(UnaryOp::AbsF32, None),
        ("ceil", Category::Float32) => unary(UnaryOp::CeilF32, None),
        ("cos", Category::Float32) => unary(UnaryOp::CosF32, None),
        ("elu", Category::Float32) => unary(UnaryOp::EluF32, None),
        ("exp", Category::Float32) => unary(UnaryOp::ExpF32, None),
        ("expm1", Category::Float32) => unary(UnaryOp::Expm1F32, None),
        ("floor", Category::Float32) => unary(UnaryOp::FloorF32, None),
        ("increment", Category::Float32) => unary(UnaryOp::IncrementF32, None),
        ("leaky_relu", Category::Float32) => {
            let alpha = attr_f32(name, attributes)?;
            unary(UnaryOp::LeakyReluF32, Some(OpMetadata::from_f32(alpha)))
        }
        ("log", Category::Float32) => unary(UnaryOp::LogF32, None),
        ("log1p", Category::Float32) => unary(UnaryOp::Log1pF32, None),
        ("neg", Category::Float32) => unary(UnaryOp::NegF32, None),
        ("relu", Category::Float32) => unary(UnaryOp::ReluF32, None),
        ("relu6", Category::Float32) => unary(UnaryOp::Relu6F32, None),
        ("round", Category::Float32) => unary(UnaryOp::RoundF32, None),
        ("rsqrt", Category::Float32) => unary(UnaryOp::RsqrtF32, None),
        ("selu", Category::Float32) => unary(UnaryOp::SeluF32, None),
        ("sigmoid", Category::Float32) => unary(UnaryOp::SigmoidF32, None),
        ("sign", Category::Float32) => unary(UnaryOp::SignF32, None),
        ("sin", Category::Float32) => unary(UnaryOp::SinF32, None),
        ("softplus", Category::Float32) => unary(UnaryOp::SoftplusF32, None),
        ("softsign", Category::Float32) => unary(UnaryOp::SoftsignF32, None),
        ("sqrt", Category::Float32) => unary(UnaryOp::SqrtF32, None),
        ("square", Category::Float32) => unary(UnaryOp::SquareF32, None),
        ("tan", Category::Float32) => unary(UnaryOp::TanF32, None),
        ("tanh", Category::Float32) => unary(UnaryOp::TanhF32, None),
        ("scalar_add", Category::Float32) => {
            let value = attr_f32(name, attributes)?;
            unary(UnaryOp::ScalarAddF32, Some(OpMetadata::from_f32(value)))
        }
        ("scalar_mul", Category::Float32) => {
            let value = attr_f32(name, attributes)?;
            unary(UnaryOp::ScalarMulF32, Some(OpMetadata::from_f32(value)))
        }

        // Unary integer, 32 bit group.
        ("abs", Category::Int32) => unary(UnaryOp::AbsI32, None),
        ("increment", Category::Int32) => unary(UnaryOp::IncrementI32, None),
        ("logical_not", Category::Int32) => unary(UnaryOp::LogicalNotI32, None),
        ("neg", Category::Int32) => unary(UnaryOp::NegI32, None),
        ("sign", Category::Int32) => unary(UnaryOp::SignI32, None),
        ("square", Category::Int32) => unary(UnaryOp::SquareI32, None),
        ("scalar_add", Category::Int32) => {
            let value = attr_i64(name, attributes)?;
            unary(UnaryOp::ScalarAddI32, Some(OpMetadata::from_i32(value as i32)))
        }
        ("scalar_mul", Category::Int32) => {
            let value = attr_i64(name, attributes)?;
            unary(UnaryOp::ScalarMulI32, Some(OpMetadata::from_i32(value as i32)))
        }

        // Unary integer, 64 bit group.
        ("abs", Category::Int64) => unary(UnaryOp::AbsI64, None),
        ("increment", Category::Int64 | Category::Uns64) => unary(UnaryOp::IncrementI64, None),
        ("logical_not", Category::Int64 | Category::Uns64) => {
            unary(UnaryOp::LogicalNotI64, None)
        }
        ("neg", Category::Int64 | Category::Uns64) => unary(UnaryOp::NegI64, None),
        ("sign", Category::Int64) => unary(UnaryOp::SignI64, None),
        ("sign", Category::Uns64) => unary(UnaryOp::SignU64, None),
        ("square", Category::Int64 | Category::Uns64) => unary(UnaryOp::SquareI64, None),
        ("scalar_add", Category::Int64 | Category::Uns64) => {
            let value = attr_i64(name, attributes)?;
            unary(UnaryOp::ScalarAddI64, Some(OpMetadata::from_i64(value)))
        }
        ("scalar_mul", Category::Int64 | Category::Uns64) => {
            let value = attr_i64(name, attributes)?;
            unary(UnaryOp::ScalarMulI64, Some(OpMetadata::from_i64(value)))
        }

        // Binary float.
        ("add", Category::Float32) => binary(BinaryOp::AddF32),
        ("sub", Category::Float32) => binary(BinaryOp::SubF32),
        ("mul", Category::Float32) => binary(BinaryOp::MulF32),
        ("div", Category::Float32) => binary(BinaryOp::DivF32),
        ("max", Category::Float32) => binary(BinaryOp::MaxF32),
        ("min", Category::Float32) => binary(BinaryOp::MinF32),
        ("pow", Category::Float32) => binary(BinaryOp::PowF32),
        ("squared_difference", Category::Float32) => binary(BinaryOp::SquaredDifferenceF32),
        ("relu_grad", Category::Float32) => {
            Ok(ResolvedOperation::Elementwise(ResolvedOp {
                op: Op::Binary(BinaryOp::ReluGradF32),
                metadata: None,
                group,
                out_dtype: dtype,
                primary_input: 1,
            }))
        }
        ("sigmoid_grad", Category::Float32) => {
            Ok(ResolvedOperation::Elementwise(ResolvedOp {
                op: Op::Binary(BinaryOp::SigmoidGradF32),
                metadata: None,
                group,
                out_dtype: dtype,
                primary_input: 1,
            }))
        }

        // Binary integer, 32 bit group.
        ("add", Category::Int32) => binary(BinaryOp::AddI32),
        ("sub", Category::Int32) => binary(BinaryOp::SubI32),
        ("mul", Category::Int32) => binary(BinaryOp::MulI32),
        ("div", Category::Int32) => binary(BinaryOp::DivI32),
        ("max", Category::Int32) => binary(BinaryOp::MaxI32),
        ("min", Category::Int32) => binary(BinaryOp::MinI32),

        // Binary integer, 64 bit group. Additions and multiplies are
        // bit-identical for signed and unsigned; order-sensitive ops split.
        ("add", Category::Int64 | Category::Uns64) => binary(BinaryOp::AddI64),
        ("sub", Category::Int64 | Category::Uns64) => binary(BinaryOp::SubI64),
        ("mul", Category::Int64 | Category::Uns64) => binary(BinaryOp::MulI64),
        ("div", Category::Int64) => binary(BinaryOp::DivI64),
        ("div", Category::Uns64) => binary(BinaryOp::DivU64),
        ("max", Category::Int64) => binary(BinaryOp::MaxI64),
        ("min", Category::Int64) => binary(BinaryOp::MinI64),
        ("max", Category::Uns64) => binary(BinaryOp::MaxU64),
        ("min", Category::Uns64) => binary(BinaryOp::MinU64),

        // Ternary.
        ("clip_by_value", Category::Float32) => ternary(TernaryOp::ClipByValueF32),
        ("clip_by_value", Category::Int32) => ternary(TernaryOp::ClipByValueI32),
        ("select", _) => {
            // The condition mask drives register 1; the result carries the
            // value operands' dtype.
            let value_dtype = *input_dtypes.get(1).ok_or_else(|| unknown(name))?;
            if value_dtype.group() != DtypeGroup::Wide32 {
                return Err(unknown(name));
            }
            Ok(ResolvedOperation::Elementwise(ResolvedOp {
                op: Op::Ternary(TernaryOp::Select),
                metadata: None,
                group: DtypeGroup::Wide32,
                out_dtype: value_dtype,
                primary_input: 0,
            }))
        }

        _ => Err(unknown(name)),
    }
}

/// Operand count an op-code expects, swaps excluded.
pub(crate) fn operand_count(op: Op) -> usize {
    match op {
        Op::Unary(_) => 1,
        Op::Binary(_) => 2,
        Op::Ternary(_) => 3,
        Op::Swap(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(name: &str, attributes: &[u8], dtypes: &[DType]) -> ResolvedOp {
        match resolve(name, attributes, dtypes).unwrap() {
            ResolvedOperation::Elementwise(op) => op,
            ResolvedOperation::Copy => panic!("unexpected copy"),
        }
    }

    #[test]
    fn increment_dispatches_on_dtype() {
        assert_eq!(
            resolved("increment", &[], &[DType::F32]).op,
            Op::Unary(UnaryOp::IncrementF32)
        );
        assert_eq!(
            resolved("increment", &[], &[DType::I8]).op,
            Op::Unary(UnaryOp::IncrementI32)
        );
        assert_eq!(
            resolved("increment", &[], &[DType::U64]).op,
            Op::Unary(UnaryOp::IncrementI64)
        );
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(
            resolve("transmogrify", &[], &[DType::F32]),
            Err(TensorError::UnknownOp(_))
        ));
        assert!(matches!(
            resolve("tanh", &[], &[DType::I32]),
            Err(TensorError::UnknownOp(_))
        ));
    }

    #[test]
    fn cross_group_cast_runs_in_the_wide_variant() {
        let op = resolved("cast", &[DType::I64.code()], &[DType::F32]);
        assert_eq!(op.group, DtypeGroup::Wide64);
        assert_eq!(op.out_dtype, DType::I64);

        let op = resolved("cast", &[DType::F32.code()], &[DType::I64]);
        assert_eq!(op.group, DtypeGroup::Wide64);
        assert_eq!(op.out_dtype, DType::F32);
    }

    #[test]
    fn same_dtype_cast_degenerates_to_copy() {
        assert!(matches!(
            resolve("cast", &[DType::F32.code()], &[DType::F32]).unwrap(),
            ResolvedOperation::Copy
        ));
    }

    #[test]
    fn comparisons_narrow_to_bool() {
        let op = resolved("less_equal", &[], &[DType::F32, DType::F32]);
        assert_eq!(op.out_dtype, DType::Bool);
        let (code, invert) = op.metadata.unwrap().u32_pair();
        assert_eq!((code, invert), (COMPARISON_GREATER, 1));
    }

    #[test]
    fn gradient_ops_take_dy_as_primary() {
        assert_eq!(resolved("relu_grad", &[], &[DType::F32, DType::F32]).primary_input, 1);
    }
}
