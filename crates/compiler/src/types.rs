//! Resolution of `!`-prefixed type tags to LLVM types.
//!
//! The tag set is closed: scalar integers of four widths, `!bool`, `!frac`,
//! the byte-pointer family (`!str`, `!ptr`, `!ptr<T>`), fixed-size arrays
//! and the `!size:N!T` constraint wrapper. Unknown tags degrade to `!int`
//! with a warning; `!none` is only meaningful in return position.

use inkwell::context::Context;
use inkwell::types::{BasicType, BasicTypeEnum};
use inkwell::AddressSpace;

use crate::{diagnostics, CompilerError, CompilerResult};

/// Tag assumed when a declaration carries no annotation.
pub const DEFAULT_INT_TAG: &str = "!int";

/// Resolves a tag in value position (variables, parameters, loads).
pub fn resolve<'ctx>(context: &'ctx Context, tag: &str) -> CompilerResult<BasicTypeEnum<'ctx>> {
    match tag {
        "!int" | "!int64" => Ok(context.i64_type().into()),
        "!int32" => Ok(context.i32_type().into()),
        "!int16" => Ok(context.i16_type().into()),
        "!int8" => Ok(context.i8_type().into()),
        "!bool" => Ok(context.i8_type().into()),
        "!frac" => Ok(context.f64_type().into()),
        "!str" | "!ptr" => Ok(byte_ptr(context).into()),
        "!none" => Err(CompilerError::TypeMismatch(
            "!none is only valid as a function return type".into(),
        )),
        _ => {
            if let Some(inner) = strip_wrapper(tag, "!ptr<") {
                // The element type is validated but not embedded: pointers
                // are opaque at the IR level.
                resolve(context, inner)?;
                return Ok(byte_ptr(context).into());
            }
            if let Some(body) = strip_wrapper(tag, "!array<") {
                return resolve_array(context, tag, body);
            }
            if let Some(rest) = tag.strip_prefix("!size:") {
                return resolve_sized(context, tag, rest);
            }

            diagnostics::warn(format!("unknown type tag \"{tag}\", assuming !int"));
            Ok(context.i64_type().into())
        }
    }
}

/// Resolves a tag in return position; `None` means `void`.
pub fn resolve_return<'ctx>(
    context: &'ctx Context,
    tag: &str,
) -> CompilerResult<Option<BasicTypeEnum<'ctx>>> {
    if tag == "!none" {
        Ok(None)
    } else {
        resolve(context, tag).map(Some)
    }
}

/// Platform allocation size of a resolved type under the fixed x86_64
/// target: integers round up to whole bytes, doubles and pointers are 8.
pub fn alloc_size(ty: BasicTypeEnum<'_>) -> CompilerResult<u64> {
    match ty {
        BasicTypeEnum::IntType(int_ty) => Ok(u64::from((int_ty.get_bit_width() + 7) / 8)),
        BasicTypeEnum::FloatType(_) => Ok(8),
        BasicTypeEnum::PointerType(_) => Ok(8),
        BasicTypeEnum::ArrayType(array_ty) => {
            let element = alloc_size(array_ty.get_element_type())?;
            Ok(element * u64::from(array_ty.len()))
        }
        other => Err(CompilerError::CodeGen(format!(
            "no allocation size for type {other:?}"
        ))),
    }
}

fn byte_ptr(context: &Context) -> inkwell::types::PointerType<'_> {
    context.i8_type().ptr_type(AddressSpace::default())
}

/// Strips `prefix` and the closing `>`, returning the bracket body.
fn strip_wrapper<'a>(tag: &'a str, prefix: &str) -> Option<&'a str> {
    tag.strip_prefix(prefix)?.strip_suffix('>')
}

/// `!array<T,N>`: T may itself be an array, so the element/length split must
/// respect angle-bracket nesting.
fn resolve_array<'ctx>(
    context: &'ctx Context,
    tag: &str,
    body: &str,
) -> CompilerResult<BasicTypeEnum<'ctx>> {
    let malformed = || {
        CompilerError::TypeMismatch(format!(
            "malformed array type \"{tag}\", expected !array<TYPE,LENGTH>"
        ))
    };

    let mut depth = 0usize;
    let mut split = None;
    for (i, ch) in body.char_indices() {
        match ch {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                split = Some(i);
                break;
            }
            _ => {}
        }
    }

    let split = split.ok_or_else(malformed)?;
    let element_tag = &body[..split];
    let length_text = &body[split + 1..];

    let length: u32 = length_text.trim().parse().map_err(|_| malformed())?;
    if length == 0 {
        return Err(CompilerError::TypeMismatch(format!(
            "array type \"{tag}\" must have a positive length"
        )));
    }

    let element = resolve(context, element_tag)?;
    Ok(element.array_type(length).into())
}

/// `!size:N!T`: resolves T, then fails when its allocation size is not
/// exactly N bytes.
fn resolve_sized<'ctx>(
    context: &'ctx Context,
    tag: &str,
    rest: &str,
) -> CompilerResult<BasicTypeEnum<'ctx>> {
    let inner_start = rest.find('!').ok_or_else(|| {
        CompilerError::TypeMismatch(format!(
            "malformed size constraint \"{tag}\", expected !size:N!TYPE"
        ))
    })?;

    let expected: u64 = rest[..inner_start].trim().parse().map_err(|_| {
        CompilerError::TypeMismatch(format!(
            "malformed size constraint \"{tag}\", expected !size:N!TYPE"
        ))
    })?;

    let inner = resolve(context, &rest[inner_start..])?;
    let actual = alloc_size(inner)?;
    if actual != expected {
        return Err(CompilerError::SizeMismatch {
            type_tag: rest[inner_start..].to_string(),
            expected,
            actual,
        });
    }

    Ok(inner)
}
