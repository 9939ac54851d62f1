//! # Morning Compiler
//!
//! Lowering engine for the Morning language: walks the [`morning_syntax::Exp`]
//! tree and emits an LLVM module containing `main`, user functions, global
//! constants and the libc externs the emitted code relies on
//! (`printf`, `scanf`, `getchar`, `malloc`, `free`).
//!
//! ## Architecture
//!
//! - [`lowering::Codegen`]: owns the LLVM context handle, module, builders,
//!   the loop-frame stack and the declaration tables; the recursive
//!   expression lowerer lives here.
//! - [`types`]: maps `!`-prefixed type tags to concrete LLVM types.
//! - [`env::Environment`]: lexically nested name → value bindings.
//! - [`arithmetic`]: binary operator dispatch with numeric promotion.
//! - [`diagnostics`]: the `[MORNING :: LEVEL]` log lines and the expression
//!   traceback recorded while lowering.
//! - [`linter`]: style rules, off the codegen critical path.
//!
//! Fatal conditions surface as [`CompilerError`] values; the CLI prints the
//! diagnostic together with the traceback and terminates. Warnings are
//! printed as they happen and lowering continues with the documented
//! fallback.

pub mod arithmetic;
pub mod diagnostics;
pub mod env;
pub mod linter;
pub mod lowering;
pub mod types;

pub use lowering::{compile_program, compile_to_ir, Codegen};

use thiserror::Error;

/// Every way a compilation can fail.
///
/// The variants follow the diagnostic categories of the language: structure
/// of a form, name resolution, typing, control flow, code generation and IO.
#[derive(Error, Debug)]
pub enum CompilerError {
    #[error("syntax error: {0}")]
    Parse(#[from] morning_syntax::ParseError),

    #[error("malformed expression: {0}")]
    Structural(String),

    #[error("name \"{0}\" is not defined")]
    UnboundName(String),

    #[error("name \"{0}\" is already declared in this scope")]
    DuplicateDeclaration(String),

    #[error("name \"{0}\" is constant and cannot be assigned")]
    ConstantWrite(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("size constraint violated for {type_tag}: expected {expected} bytes, actual {actual}")]
    SizeMismatch {
        type_tag: String,
        expected: u64,
        actual: u64,
    },

    #[error("control flow error: {0}")]
    ControlFlow(String),

    #[error("code generation error: {0}")]
    CodeGen(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<inkwell::builder::BuilderError> for CompilerError {
    fn from(err: inkwell::builder::BuilderError) -> Self {
        CompilerError::CodeGen(format!("LLVM builder error: {err}"))
    }
}

pub type CompilerResult<T> = Result<T, CompilerError>;
