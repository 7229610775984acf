//! Arithmetic, comparison and conversion on evaluation stack values.
//!
//! Integer operations wrap like CIL's unchecked forms. `I4` and `I8` operands may be mixed,
//! the result is then widened to `I8`. Division by zero is reported as `None` so the
//! caller can raise the managed exception.

use crate::{runtime::Value, Error, Result};

/// Binary arithmetic and bitwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
}

/// Unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Neg,
    Not,
}

/// Comparisons shared by `ceq`-style opcodes and compare-and-branch opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LtUn,
    LeUn,
    GtUn,
    GeUn,
}

/// Target of a `conv.*` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConversionType {
    I1,
    I2,
    I4,
    I8,
    U4,
    U8,
    R4,
    R8,
}

fn mismatch(operation: &str, left: &Value, right: &Value) -> Error {
    Error::InvalidProgram(format!(
        "'{operation}' cannot combine {left:?} and {right:?}"
    ))
}

/// Outcome of a binary operation: `None` on integer division by zero.
pub(crate) fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Option<Value>> {
    match (left, right) {
        (Value::I4(a), Value::I4(b)) => Ok(binary_i4(op, *a, *b)),
        (Value::I4(_) | Value::I8(_), Value::I4(_) | Value::I8(_)) => {
            let (Some(a), Some(b)) = (left.as_i8(), right.as_i8()) else {
                return Err(mismatch("binary", left, right));
            };
            Ok(binary_i8(op, a, b))
        }
        (Value::R8(a), Value::R8(b)) => binary_r8(op, *a, *b)
            .map(|value| Some(Value::R8(value)))
            .ok_or_else(|| mismatch("binary", left, right)),
        _ => Err(mismatch("binary", left, right)),
    }
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
fn binary_i4(op: BinaryOp, a: i32, b: i32) -> Option<Value> {
    let value = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => a.checked_div(b).or_else(|| (b == -1).then(|| a.wrapping_neg()))?,
        BinaryOp::DivUn => (a as u32).checked_div(b as u32)? as i32,
        BinaryOp::Rem => a.checked_rem(b).or_else(|| (b == -1).then_some(0))?,
        BinaryOp::RemUn => (a as u32).checked_rem(b as u32)? as i32,
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::Shl => a.wrapping_shl(b as u32),
        BinaryOp::Shr => a.wrapping_shr(b as u32),
        BinaryOp::ShrUn => (a as u32).wrapping_shr(b as u32) as i32,
    };
    Some(Value::I4(value))
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn binary_i8(op: BinaryOp, a: i64, b: i64) -> Option<Value> {
    let value = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => a.checked_div(b).or_else(|| (b == -1).then(|| a.wrapping_neg()))?,
        BinaryOp::DivUn => (a as u64).checked_div(b as u64)? as i64,
        BinaryOp::Rem => a.checked_rem(b).or_else(|| (b == -1).then_some(0))?,
        BinaryOp::RemUn => (a as u64).checked_rem(b as u64)? as i64,
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::Shl => a.wrapping_shl(b as u32),
        BinaryOp::Shr => a.wrapping_shr(b as u32),
        BinaryOp::ShrUn => (a as u64).wrapping_shr(b as u32) as i64,
    };
    Some(Value::I8(value))
}

fn binary_r8(op: BinaryOp, a: f64, b: f64) -> Option<f64> {
    match op {
        BinaryOp::Add => Some(a + b),
        BinaryOp::Sub => Some(a - b),
        BinaryOp::Mul => Some(a * b),
        BinaryOp::Div => Some(a / b),
        BinaryOp::Rem => Some(a % b),
        _ => None,
    }
}

/// Applies a unary operation.
pub(crate) fn unary(op: UnaryOp, value: &Value) -> Result<Value> {
    match (op, value) {
        (UnaryOp::Neg, Value::I4(v)) => Ok(Value::I4(v.wrapping_neg())),
        (UnaryOp::Neg, Value::I8(v)) => Ok(Value::I8(v.wrapping_neg())),
        (UnaryOp::Neg, Value::R8(v)) => Ok(Value::R8(-v)),
        (UnaryOp::Not, Value::I4(v)) => Ok(Value::I4(!v)),
        (UnaryOp::Not, Value::I8(v)) => Ok(Value::I8(!v)),
        _ => Err(Error::InvalidProgram(format!(
            "'{op:?}' cannot be applied to {value:?}"
        ))),
    }
}

/// Evaluates a comparison. Unsigned forms compare integers as unsigned and are true for
/// unordered floats.
#[allow(clippy::cast_sign_loss, clippy::float_cmp)]
pub(crate) fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool> {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::I4(a), Value::I4(b)) => match op {
            CompareOp::LtUn | CompareOp::LeUn | CompareOp::GtUn | CompareOp::GeUn => {
                Some((*a as u32).cmp(&(*b as u32)))
            }
            _ => Some(a.cmp(b)),
        },
        (Value::I4(_) | Value::I8(_), Value::I4(_) | Value::I8(_)) => {
            let (Some(a), Some(b)) = (left.as_i8(), right.as_i8()) else {
                return Err(mismatch("compare", left, right));
            };
            match op {
                CompareOp::LtUn | CompareOp::LeUn | CompareOp::GtUn | CompareOp::GeUn => {
                    Some((a as u64).cmp(&(b as u64)))
                }
                _ => Some(a.cmp(&b)),
            }
        }
        (Value::R8(a), Value::R8(b)) => a.partial_cmp(b),
        _ => {
            return match op {
                CompareOp::Eq => Ok(left == right),
                CompareOp::Ne => Ok(left != right),
                _ => Err(mismatch("compare", left, right)),
            }
        }
    };

    let Some(ordering) = ordering else {
        // NaN involved
        return Ok(matches!(
            op,
            CompareOp::Ne | CompareOp::LtUn | CompareOp::LeUn | CompareOp::GtUn | CompareOp::GeUn
        ));
    };

    Ok(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt | CompareOp::LtUn => ordering == Ordering::Less,
        CompareOp::Le | CompareOp::LeUn => ordering != Ordering::Greater,
        CompareOp::Gt | CompareOp::GtUn => ordering == Ordering::Greater,
        CompareOp::Ge | CompareOp::GeUn => ordering != Ordering::Less,
    })
}

/// Applies a `conv.*` conversion.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]
pub(crate) fn convert(target: ConversionType, value: &Value) -> Result<Value> {
    let integer = match value {
        Value::I4(v) => i64::from(*v),
        Value::I8(v) => *v,
        Value::R8(v) => match target {
            ConversionType::R4 => return Ok(Value::R8(f64::from(*v as f32))),
            ConversionType::R8 => return Ok(Value::R8(*v)),
            _ => *v as i64,
        },
        _ => {
            return Err(Error::InvalidProgram(format!(
                "conv.{target:?} cannot be applied to {value:?}"
            )))
        }
    };

    Ok(match target {
        ConversionType::I1 => Value::I4(i32::from(integer as i8)),
        ConversionType::I2 => Value::I4(i32::from(integer as i16)),
        ConversionType::I4 => Value::I4(integer as i32),
        ConversionType::U4 => Value::I4(integer as u32 as i32),
        ConversionType::I8 | ConversionType::U8 => Value::I8(integer),
        ConversionType::R4 => Value::R8(f64::from(integer as f32)),
        ConversionType::R8 => Value::R8(integer as f64),
    })
}
