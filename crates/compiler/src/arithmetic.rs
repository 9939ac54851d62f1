//! Binary operator dispatch with numeric promotion and implicit casts.
//!
//! The rules are deliberately small: if either operand is a double the
//! operation is floating (ordered comparisons), otherwise it is integral at
//! the left operand's type. Integer division and comparisons are signed.
//! Implicit casts cover int→double, integer resize (zero-extend widening,
//! truncating narrowing) and pointer↔pointer; everything else is left
//! untouched for the caller to reject.

use inkwell::builder::Builder;
use inkwell::types::BasicTypeEnum;
use inkwell::values::BasicValueEnum;
use inkwell::{FloatPredicate, IntPredicate};

use crate::{CompilerError, CompilerResult};

/// Maps an operator glyph or its mangled internal alias to the glyph the
/// dispatcher works with. `None` when the symbol is not an operator at all.
pub fn canonical_operator(op: &str) -> Option<&'static str> {
    match op {
        "+" | "__PLUS_OPERAND__" => Some("+"),
        "-" | "__SUB_OPERAND__" => Some("-"),
        "*" | "__MUL_OPERAND__" => Some("*"),
        "/" | "__DIV_OPERAND__" => Some("/"),
        ">" | "__CMPG__" => Some(">"),
        "<" | "__CMPL__" => Some("<"),
        ">=" | "__CMPGE__" => Some(">="),
        "<=" | "__CMPLE__" => Some("<="),
        "==" | "__CMPEQ__" => Some("=="),
        "!=" | "__CMPNE__" => Some("!="),
        _ => None,
    }
}

/// The type both operands are brought to before the operation.
pub fn common_type<'ctx>(
    left: BasicValueEnum<'ctx>,
    right: BasicValueEnum<'ctx>,
) -> BasicTypeEnum<'ctx> {
    if left.get_type().is_float_type() {
        left.get_type()
    } else if right.get_type().is_float_type() {
        right.get_type()
    } else {
        left.get_type()
    }
}

/// Applies the implicit conversion rules. Returns the value unchanged when no
/// rule applies; callers that require an exact type use [`coerce`].
pub fn implicit_cast<'ctx>(
    builder: &Builder<'ctx>,
    value: BasicValueEnum<'ctx>,
    target: BasicTypeEnum<'ctx>,
) -> CompilerResult<BasicValueEnum<'ctx>> {
    if value.get_type() == target {
        return Ok(value);
    }

    if value.is_int_value() && target.is_float_type() {
        let cast = builder.build_signed_int_to_float(
            value.into_int_value(),
            target.into_float_type(),
            "cast_int_to_double",
        )?;
        return Ok(cast.into());
    }

    if value.is_pointer_value() && target.is_pointer_type() {
        let cast = builder.build_pointer_cast(
            value.into_pointer_value(),
            target.into_pointer_type(),
            "cast_ptr",
        )?;
        return Ok(cast.into());
    }

    if value.is_int_value() && target.is_int_type() {
        let value_bits = value.into_int_value().get_type().get_bit_width();
        let target_bits = target.into_int_type().get_bit_width();

        if value_bits < target_bits {
            let cast = builder.build_int_z_extend(
                value.into_int_value(),
                target.into_int_type(),
                "zext_cast",
            )?;
            return Ok(cast.into());
        }
        if value_bits > target_bits {
            let cast = builder.build_int_truncate(
                value.into_int_value(),
                target.into_int_type(),
                "trunc_cast",
            )?;
            return Ok(cast.into());
        }
    }

    Ok(value)
}

/// Like [`implicit_cast`], but a value that still does not match `target`
/// afterwards is a fatal type mismatch.
pub fn coerce<'ctx>(
    builder: &Builder<'ctx>,
    value: BasicValueEnum<'ctx>,
    target: BasicTypeEnum<'ctx>,
    what: &str,
) -> CompilerResult<BasicValueEnum<'ctx>> {
    let cast = implicit_cast(builder, value, target)?;
    if cast.get_type() != target {
        return Err(CompilerError::TypeMismatch(format!(
            "{what}: cannot convert {:?} to {:?}",
            value.get_type(),
            target
        )));
    }
    Ok(cast)
}

/// Lowers one binary operation over already-lowered operands.
pub fn build_binary_op<'ctx>(
    builder: &Builder<'ctx>,
    op: &str,
    left: BasicValueEnum<'ctx>,
    right: BasicValueEnum<'ctx>,
) -> CompilerResult<BasicValueEnum<'ctx>> {
    let operation = canonical_operator(op)
        .ok_or_else(|| CompilerError::CodeGen(format!("unknown binary operator \"{op}\"")))?;

    let target = common_type(left, right);
    let left = implicit_cast(builder, left, target)?;
    let right = implicit_cast(builder, right, target)?;

    if target.is_float_type() {
        let lhs = left.into_float_value();
        let rhs = right.into_float_value();
        let result: BasicValueEnum = match operation {
            "+" => builder.build_float_add(lhs, rhs, "fadd_tmp")?.into(),
            "-" => builder.build_float_sub(lhs, rhs, "fsub_tmp")?.into(),
            "*" => builder.build_float_mul(lhs, rhs, "fmul_tmp")?.into(),
            "/" => builder.build_float_div(lhs, rhs, "fdiv_tmp")?.into(),
            ">" => builder
                .build_float_compare(FloatPredicate::OGT, lhs, rhs, "fcmp_tmp")?
                .into(),
            "<" => builder
                .build_float_compare(FloatPredicate::OLT, lhs, rhs, "fcmp_tmp")?
                .into(),
            ">=" => builder
                .build_float_compare(FloatPredicate::OGE, lhs, rhs, "fcmp_tmp")?
                .into(),
            "<=" => builder
                .build_float_compare(FloatPredicate::OLE, lhs, rhs, "fcmp_tmp")?
                .into(),
            "==" => builder
                .build_float_compare(FloatPredicate::OEQ, lhs, rhs, "fcmp_tmp")?
                .into(),
            "!=" => builder
                .build_float_compare(FloatPredicate::ONE, lhs, rhs, "fcmp_tmp")?
                .into(),
            _ => unreachable!("canonical operator set"),
        };
        return Ok(result);
    }

    if !left.is_int_value() || !right.is_int_value() {
        return Err(CompilerError::TypeMismatch(format!(
            "operator \"{operation}\" requires numeric operands"
        )));
    }

    let lhs = left.into_int_value();
    let rhs = right.into_int_value();
    let result: BasicValueEnum = match operation {
        "+" => builder.build_int_add(lhs, rhs, "add_tmp")?.into(),
        "-" => builder.build_int_sub(lhs, rhs, "sub_tmp")?.into(),
        "*" => builder.build_int_mul(lhs, rhs, "mul_tmp")?.into(),
        "/" => builder.build_int_signed_div(lhs, rhs, "div_tmp")?.into(),
        ">" => builder
            .build_int_compare(IntPredicate::SGT, lhs, rhs, "icmp_tmp")?
            .into(),
        "<" => builder
            .build_int_compare(IntPredicate::SLT, lhs, rhs, "icmp_tmp")?
            .into(),
        ">=" => builder
            .build_int_compare(IntPredicate::SGE, lhs, rhs, "icmp_tmp")?
            .into(),
        "<=" => builder
            .build_int_compare(IntPredicate::SLE, lhs, rhs, "icmp_tmp")?
            .into(),
        "==" => builder
            .build_int_compare(IntPredicate::EQ, lhs, rhs, "icmp_tmp")?
            .into(),
        "!=" => builder
            .build_int_compare(IntPredicate::NE, lhs, rhs, "icmp_tmp")?
            .into(),
        _ => unreachable!("canonical operator set"),
    };
    Ok(result)
}
