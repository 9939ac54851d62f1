//! The lowering engine: a tree walker emitting LLVM IR.
//!
//! [`Codegen`] owns the module, the two builders (the main one plus a
//! dedicated builder that inserts allocations into the entry block of the
//! active function), the loop-frame stack and the declaration tables. One
//! instance compiles one program: construction bootstraps the module
//! (target triple, libc externs, seed globals), [`Codegen::compile`] lowers
//! the parsed program into `main`, and [`Codegen::write_to_file`] verifies
//! and serializes the textual IR.
//!
//! Dispatch is textual on the head symbol of each list, falling through to
//! "function call" for anything that is not a built-in form.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;

use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::targets::TargetTriple;
use inkwell::types::{
    ArrayType, BasicMetadataTypeEnum, BasicType, BasicTypeEnum, FunctionType,
};
use inkwell::values::{
    ArrayValue, BasicMetadataValueEnum, BasicValueEnum, FunctionValue, IntValue, PointerValue,
};
use inkwell::{AddressSpace, FloatPredicate, IntPredicate};

use morning_syntax::{parse, Exp};

use crate::arithmetic::{self, coerce, implicit_cast};
use crate::env::{Binding, Environment};
use crate::{diagnostics, types, CompilerError, CompilerResult};

const MODULE_NAME: &str = "MorningLangCompilationUnit";
const TARGET_TRIPLE: &str = "x86_64-unknown-linux-gnu";

/// Value of the seeded `_VERSION` global.
const LANGUAGE_VERSION: u64 = 300;

/// Stack buffer size for each `%s` target of `finput`.
const INPUT_BUFFER_BYTES: u32 = 256;

/// Branch targets of the innermost active loop.
struct LoopFrame<'ctx> {
    break_target: BasicBlock<'ctx>,
    continue_target: BasicBlock<'ctx>,
}

/// The lowering engine. See the module docs for the overall shape.
pub struct Codegen<'ctx> {
    context: &'ctx Context,
    module: Module<'ctx>,
    builder: Builder<'ctx>,
    /// Secondary builder; always inserts allocations into the entry block of
    /// the active function, wherever the main builder currently is.
    vars_builder: Builder<'ctx>,
    globals: Rc<Environment<'ctx>>,
    active_function: Option<FunctionValue<'ctx>>,
    loop_stack: Vec<LoopFrame<'ctx>>,
    /// Names declared with `const`; assignment to them is fatal.
    constants: HashSet<String>,
    /// Full array type per array-typed variable, for `index` lowering.
    array_types: HashMap<String, ArrayType<'ctx>>,
}

impl<'ctx> Codegen<'ctx> {
    /// Bootstraps the module: target triple, libc externs, seed globals.
    pub fn new(context: &'ctx Context) -> Self {
        let module = context.create_module(MODULE_NAME);
        module.set_triple(&TargetTriple::create(TARGET_TRIPLE));

        let engine = Self {
            context,
            module,
            builder: context.create_builder(),
            vars_builder: context.create_builder(),
            globals: Environment::root(),
            active_function: None,
            loop_stack: Vec::new(),
            constants: HashSet::new(),
            array_types: HashMap::new(),
        };

        engine.declare_externs();
        engine.install_globals();
        engine
    }

    /// Parses and lowers a whole program into `main`, then verifies and
    /// writes `<output_base>.ll`.
    pub fn execute(&mut self, program: &str, output_base: &str) -> CompilerResult<()> {
        self.compile(program)?;
        self.write_to_file(format!("{output_base}.ll"))
    }

    /// Parses `program`, wraps it in the root `scope` and lowers it.
    pub fn compile(&mut self, program: &str) -> CompilerResult<()> {
        diagnostics::reset_traceback();

        let mut forms = vec![Exp::Symbol("scope".into())];
        forms.extend(parse(program)?);

        self.generate_ir(&Exp::List(forms))
    }

    /// The emitted module, for inspection.
    pub fn module(&self) -> &Module<'ctx> {
        &self.module
    }

    /// Textual IR of the current module.
    pub fn emit_ir(&self) -> String {
        self.module.print_to_string().to_string()
    }

    /// Verifies the module and serializes it. Verification failures are
    /// reported but do not abort: the downstream optimizer rejects invalid
    /// IR with a better message than we could produce here.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> CompilerResult<()> {
        if let Err(message) = self.module.verify() {
            diagnostics::error(format!(
                "module verification failed:\n{}",
                message.to_string()
            ));
        }

        self.module
            .print_to_file(path.as_ref())
            .map_err(|e| CompilerError::Io(std::io::Error::other(e.to_string())))
    }

    // ========== Bootstrap ==========

    fn declare_externs(&self) {
        let i64_ty = self.context.i64_type();
        let byte_ptr = self.context.i8_type().ptr_type(AddressSpace::default());

        // i64 printf(i8*, ...) and i64 scanf(i8*, ...)
        let printf_ty = i64_ty.fn_type(&[byte_ptr.into()], true);
        self.module.add_function("printf", printf_ty, None);
        let scanf_ty = i64_ty.fn_type(&[byte_ptr.into()], true);
        self.module.add_function("scanf", scanf_ty, None);

        // i64 getchar()
        let getchar_ty = i64_ty.fn_type(&[], false);
        self.module.add_function("getchar", getchar_ty, None);

        // malloc and free are declared lazily on first use.
    }

    fn install_globals(&self) {
        let version = self.context.i64_type().const_int(LANGUAGE_VERSION, false);
        let seed = [("_VERSION", BasicValueEnum::from(version))];

        for (name, init) in seed {
            let global = self
                .module
                .add_global(init.get_type(), Some(AddressSpace::default()), name);
            global.set_alignment(4);
            global.set_constant(true);
            global.set_initializer(&init);
            self.globals.define(name, Binding::Global(global));
        }
    }

    /// Creates `main() -> i64`, lowers the root scope into it and closes it
    /// with `ret i64 0`.
    fn generate_ir(&mut self, ast: &Exp) -> CompilerResult<()> {
        if self.module.get_function("main").is_some() {
            return Err(CompilerError::CodeGen(
                "module already contains a main function".into(),
            ));
        }

        let main_type = self.context.i64_type().fn_type(&[], false);
        let main_fn = self.module.add_function("main", main_type, None);
        self.globals.define("main", Binding::Function(main_fn));

        let entry = self.context.append_basic_block(main_fn, "entry");
        self.builder.position_at_end(entry);
        self.active_function = Some(main_fn);

        let env = Rc::clone(&self.globals);
        self.gen(ast, &env)?;

        if self.current_block()?.get_terminator().is_none() {
            let zero = self.context.i64_type().const_int(0, false);
            self.builder.build_return(Some(&zero))?;
        }

        Ok(())
    }

    // ========== Block management ==========

    fn active_fn(&self) -> CompilerResult<FunctionValue<'ctx>> {
        self.active_function
            .ok_or_else(|| CompilerError::CodeGen("no active function".into()))
    }

    fn current_block(&self) -> CompilerResult<BasicBlock<'ctx>> {
        self.builder
            .get_insert_block()
            .ok_or_else(|| CompilerError::CodeGen("builder is not positioned".into()))
    }

    /// Appends a new block to the active function.
    fn new_block(&self, label: &str) -> CompilerResult<BasicBlock<'ctx>> {
        Ok(self.context.append_basic_block(self.active_fn()?, label))
    }

    /// Whether the block currently being filled still needs a terminator.
    fn block_open(&self) -> CompilerResult<bool> {
        Ok(self.current_block()?.get_terminator().is_none())
    }

    /// Allocates a stack slot in the entry block of the active function and
    /// binds it in `env`.
    fn alloc_var(
        &self,
        name: &str,
        var_type: BasicTypeEnum<'ctx>,
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<PointerValue<'ctx>> {
        let entry = self
            .active_fn()?
            .get_first_basic_block()
            .ok_or_else(|| CompilerError::CodeGen("active function has no entry block".into()))?;

        // Allocas must precede the entry block's terminator once one exists.
        match entry.get_terminator() {
            Some(terminator) => self.vars_builder.position_before(&terminator),
            None => self.vars_builder.position_at_end(entry),
        }

        let slot = self.vars_builder.build_alloca(var_type, name)?;
        env.define(name, Binding::Local { ptr: slot, ty: var_type });
        Ok(slot)
    }

    // ========== The expression lowerer ==========

    /// Lowers one expression; the central recursive dispatcher.
    fn gen(&mut self, exp: &Exp, env: &Rc<Environment<'ctx>>) -> CompilerResult<BasicValueEnum<'ctx>> {
        diagnostics::push_expression(exp.context_name(), exp.to_short_string());

        match exp {
            Exp::Number(value) => Ok(self.minimal_int_const(*value).into()),
            Exp::Fractional(value) => Ok(self.context.f64_type().const_float(*value).into()),
            Exp::Str(text) => self.gen_string(text),
            Exp::Symbol(name) => self.gen_symbol(name, env),
            Exp::List(items) => {
                let Some(head) = items.first() else {
                    return Err(CompilerError::Structural(
                        "empty list used in operator position".into(),
                    ));
                };

                let Exp::Symbol(oper) = head else {
                    return Err(CompilerError::Structural(format!(
                        "expression {} is not callable",
                        head.to_short_string()
                    )));
                };

                if arithmetic::canonical_operator(oper).is_some() {
                    self.expect_operands(items, 2, oper)?;
                    let left = self.gen(&items[1], env)?;
                    let right = self.gen(&items[2], env)?;
                    return arithmetic::build_binary_op(&self.builder, oper, left, right);
                }

                match oper.as_str() {
                    "scope" => self.gen_scope(items, env),
                    "var" => self.gen_declaration(items, env, false),
                    "const" => self.gen_declaration(items, env, true),
                    "set" => self.gen_set(items, env),
                    "check" => self.gen_check(items, env),
                    "if" => self.gen_if(items, env),
                    "while" => self.gen_while(items, env),
                    "loop" => self.gen_loop(items, env),
                    "for" => self.gen_for(items, env),
                    "break" => self.gen_break(),
                    "continue" => self.gen_continue(),
                    "func" => self.gen_function(items, env),
                    "fprint" => self.gen_fprint(items, env),
                    "finput" => self.gen_finput(items, env),
                    "array" => self.gen_array(&items[1..], None, env).map(Into::into),
                    "index" => self.gen_index_load(items, env),
                    "mem-alloc" => self.gen_mem_alloc(items, env),
                    "mem-free" => self.gen_mem_free(items, env),
                    "mem-write" => self.gen_mem_write(items, env),
                    "mem-read" | "mem-deref" => self.gen_mem_read(items, env),
                    "mem-ptr" => self.gen_mem_ptr(items, env),
                    "byte-read" => self.gen_byte_read(items, env),
                    "byte-write" => self.gen_byte_write(items, env),
                    "sizeof" => self.gen_sizeof(items),
                    "bit-and" | "bit-or" | "bit-xor" | "bit-shl" | "bit-shr" => {
                        self.gen_bitwise(oper, items, env)
                    }
                    "bit-not" => self.gen_bit_not(items, env),
                    _ => self.gen_call(oper, items, env),
                }
            }
        }
    }

    // ========== Literals and names ==========

    /// Integer constants are emitted at the smallest width that holds the
    /// value and widened by context. Negative values go straight to 64 bits:
    /// the widening cast is a zero-extension, which would corrupt a narrow
    /// negative constant.
    fn minimal_int_const(&self, value: i64) -> IntValue<'ctx> {
        if value < 0 {
            return self.context.i64_type().const_int(value as u64, true);
        }

        let magnitude = value as u64;
        if magnitude <= u64::from(u8::MAX) {
            self.context.i8_type().const_int(magnitude, false)
        } else if magnitude <= u64::from(u16::MAX) {
            self.context.i16_type().const_int(magnitude, false)
        } else if magnitude <= u64::from(u32::MAX) {
            self.context.i32_type().const_int(magnitude, false)
        } else {
            self.context.i64_type().const_int(magnitude, false)
        }
    }

    fn gen_string(&mut self, text: &str) -> CompilerResult<BasicValueEnum<'ctx>> {
        let interpreted = interpret_escapes(text);
        let global = self.builder.build_global_string_ptr(&interpreted, "str")?;
        Ok(global.as_pointer_value().into())
    }

    fn gen_symbol(
        &mut self,
        name: &str,
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        if name == "true" || name == "false" {
            let bit = u64::from(name == "true");
            return Ok(self.context.i8_type().const_int(bit, false).into());
        }

        match env.lookup(name)? {
            Binding::Local { ptr, ty } => Ok(self.builder.build_load(ty, ptr, name)?),
            Binding::Global(global) => {
                let init_ty = global
                    .get_initializer()
                    .ok_or_else(|| {
                        CompilerError::CodeGen(format!("global \"{name}\" has no initializer"))
                    })?
                    .get_type();
                Ok(self
                    .builder
                    .build_load(init_ty, global.as_pointer_value(), name)?)
            }
            Binding::Function(function) => {
                Ok(function.as_global_value().as_pointer_value().into())
            }
        }
    }

    // ========== Declarations and assignment ==========

    fn gen_declaration(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
        is_const: bool,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        let form = if is_const { "const" } else { "var" };
        self.expect_operands(items, 2, form)?;

        let (name, var_type) = self.declared_name_and_type(&items[1], form)?;
        log::debug!("lowering {form} {name}");

        if env.declares_locally(&name) {
            return Err(CompilerError::DuplicateDeclaration(name));
        }
        if env.resolves(&name) {
            diagnostics::warn(format!(
                "declaration of \"{name}\" shadows an outer binding"
            ));
        }

        let value = match (&items[2], var_type) {
            (Exp::List(init_items), BasicTypeEnum::ArrayType(declared))
                if init_items.first().map_or(false, |h| h.is_symbol("array")) =>
            {
                self.gen_array(&init_items[1..], Some(declared), env)?.into()
            }
            _ => self.gen(&items[2], env)?,
        };

        if let BasicTypeEnum::ArrayType(array_ty) = var_type {
            self.array_types.insert(name.clone(), array_ty);
        }

        let value = coerce(
            &self.builder,
            value,
            var_type,
            &format!("initializer for \"{name}\""),
        )?;

        let slot = self.alloc_var(&name, var_type, env)?;
        if is_const {
            self.constants.insert(name);
        }

        self.builder.build_store(slot, value)?;
        Ok(value)
    }

    /// `NAME` or `(NAME TYPETAG)`; a missing tag is inferred as `!int` with
    /// a warning.
    fn declared_name_and_type(
        &self,
        declaration: &Exp,
        form: &str,
    ) -> CompilerResult<(String, BasicTypeEnum<'ctx>)> {
        match declaration {
            Exp::Symbol(name) => {
                diagnostics::warn(format!(
                    "no type annotation for \"{name}\", assuming {}",
                    types::DEFAULT_INT_TAG
                ));
                Ok((name.clone(), self.context.i64_type().into()))
            }
            Exp::List(parts) => match (parts.first(), parts.get(1), parts.len()) {
                (Some(Exp::Symbol(name)), Some(Exp::Symbol(tag)), 2) => {
                    Ok((name.clone(), types::resolve(self.context, tag)?))
                }
                _ => Err(CompilerError::Structural(format!(
                    "{form} declaration must be NAME or (NAME TYPETAG)"
                ))),
            },
            _ => Err(CompilerError::Structural(format!(
                "{form} declaration must be NAME or (NAME TYPETAG)"
            ))),
        }
    }

    fn gen_set(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 2, "set")?;

        // [set (index ARR IDX) VALUE]
        if items[1].head_symbol() == Some("index") {
            let Exp::List(target) = &items[1] else { unreachable!() };
            let (slot, element_ty) = self.gen_index_ptr(target, env)?;
            let value = self.gen(&items[2], env)?;
            let value = coerce(&self.builder, value, element_ty, "array element")?;
            self.builder.build_store(slot, value)?;
            return Ok(value);
        }

        let Exp::Symbol(name) = &items[1] else {
            return Err(CompilerError::Structural(
                "set target must be a variable name or (index ARR IDX)".into(),
            ));
        };

        if self.constants.contains(name) {
            return Err(CompilerError::ConstantWrite(name.clone()));
        }

        let value = self.gen(&items[2], env)?;
        match env.lookup(name)? {
            Binding::Local { ptr, ty } => {
                let value = coerce(
                    &self.builder,
                    value,
                    ty,
                    &format!("assignment to \"{name}\""),
                )?;
                self.builder.build_store(ptr, value)?;
                Ok(value)
            }
            Binding::Global(_) => Err(CompilerError::ConstantWrite(name.clone())),
            Binding::Function(_) => Err(CompilerError::TypeMismatch(format!(
                "cannot assign to function \"{name}\""
            ))),
        }
    }

    // ========== Scope ==========

    fn gen_scope(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        let block_env = Environment::child(env);

        let mut result: BasicValueEnum<'ctx> =
            self.context.i64_type().const_int(0, false).into();
        for item in &items[1..] {
            result = self.gen(item, &block_env)?;
        }
        Ok(result)
    }

    // ========== Conditionals ==========

    /// `[check COND THEN]` / `[check COND THEN ELSE]`: two-way conditional
    /// with a PHI join when both branches flow into the merge block.
    fn gen_check(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        if items.len() != 3 && items.len() != 4 {
            return Err(CompilerError::Structural(
                "check expects a condition, a then-branch and an optional else-branch".into(),
            ));
        }

        let condition = self.gen(&items[1], env)?;
        let condition = self.to_bool(condition)?;

        let then_block = self.new_block("then")?;
        let else_block = self.new_block("else")?;
        let merge_block = self.new_block("ifend")?;

        self.builder
            .build_conditional_branch(condition, then_block, else_block)?;

        self.builder.position_at_end(then_block);
        let then_value = self.gen(&items[2], env)?;
        let then_end = self.current_block()?;
        let then_flows = then_end.get_terminator().is_none();

        self.builder.position_at_end(else_block);
        let else_value = match items.get(3) {
            Some(else_exp) => Some(self.gen(else_exp, env)?),
            None => None,
        };
        let else_end = self.current_block()?;
        let else_flows = else_end.get_terminator().is_none();

        // A PHI join only exists when both branches carry a value to the
        // merge block; a branch that already terminated (break, continue)
        // skips the branch-to-merge.
        if let (true, true, Some(else_value)) = (then_flows, else_flows, else_value) {
            let result_ty = self.unify_branch_types(then_value, else_value, "check")?;

            self.builder.position_at_end(then_end);
            let then_value = coerce(&self.builder, then_value, result_ty, "check branch")?;
            self.builder.build_unconditional_branch(merge_block)?;

            self.builder.position_at_end(else_end);
            let else_value = coerce(&self.builder, else_value, result_ty, "check branch")?;
            self.builder.build_unconditional_branch(merge_block)?;

            self.builder.position_at_end(merge_block);
            let phi = self.builder.build_phi(result_ty, "check_tmp")?;
            phi.add_incoming(&[(&then_value, then_end), (&else_value, else_end)]);
            return Ok(phi.as_basic_value());
        }

        if then_flows {
            self.builder.position_at_end(then_end);
            self.builder.build_unconditional_branch(merge_block)?;
        }
        if else_flows {
            self.builder.position_at_end(else_end);
            self.builder.build_unconditional_branch(merge_block)?;
        }

        self.builder.position_at_end(merge_block);
        Ok(self.context.i64_type().const_int(0, false).into())
    }

    /// `[if C1 B1 elif C2 B2 ... else BN]`, desugared into a chain of
    /// conditional branches with one merge block.
    fn gen_if(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        if items.len() < 4 {
            return Err(CompilerError::Structural(
                "if requires a condition, a block and an else/elif continuation".into(),
            ));
        }

        // Branches that flow to the merge block, with the block each one
        // ends in. Terminators to the merge block are emitted after all
        // branches are known, so result casts can be placed first.
        let mut contributions: Vec<(BasicValueEnum<'ctx>, BasicBlock<'ctx>)> = Vec::new();
        let mut has_else = false;

        let mut i = 1;
        while i < items.len() {
            if items[i].is_symbol("elif") || items[i].is_symbol("else") {
                break;
            }
            if i + 1 >= items.len() {
                return Err(CompilerError::Structural(
                    "if: missing block for condition".into(),
                ));
            }

            let condition = self.gen(&items[i], env)?;
            let condition = self.to_bool(condition)?;
            let then_block = self.new_block("if.then")?;
            let next_block = self.new_block("if.next")?;
            self.builder
                .build_conditional_branch(condition, then_block, next_block)?;

            self.builder.position_at_end(then_block);
            let value = self.gen(&items[i + 1], env)?;
            if self.block_open()? {
                contributions.push((value, self.current_block()?));
            }

            self.builder.position_at_end(next_block);
            i += 2;
        }

        while i < items.len() {
            if items[i].is_symbol("elif") {
                if i + 2 >= items.len() {
                    return Err(CompilerError::Structural(
                        "elif requires a condition and a block".into(),
                    ));
                }

                let condition = self.gen(&items[i + 1], env)?;
                let condition = self.to_bool(condition)?;
                let elif_block = self.new_block("elif.then")?;
                let next_block = self.new_block("elif.next")?;
                self.builder
                    .build_conditional_branch(condition, elif_block, next_block)?;

                self.builder.position_at_end(elif_block);
                let value = self.gen(&items[i + 2], env)?;
                if self.block_open()? {
                    contributions.push((value, self.current_block()?));
                }

                self.builder.position_at_end(next_block);
                i += 3;
            } else if items[i].is_symbol("else") {
                if i + 1 >= items.len() {
                    return Err(CompilerError::Structural("else requires a block".into()));
                }

                has_else = true;
                let value = self.gen(&items[i + 1], env)?;
                if self.block_open()? {
                    contributions.push((value, self.current_block()?));
                }
                i += 2;
                break;
            } else {
                return Err(CompilerError::Structural(
                    "expected elif or else after if conditions".into(),
                ));
            }
        }

        // Without an else the final fall-through block reaches the merge
        // carrying no value, so no PHI can be formed.
        let fallthrough = if has_else {
            None
        } else {
            Some(self.current_block()?)
        };

        let merge_block = self.new_block("if.end")?;

        if has_else && !contributions.is_empty() {
            let mut result_ty = contributions[0].0.get_type();
            for (value, _) in &contributions[1..] {
                result_ty = self.unify_types(result_ty, value.get_type(), "if")?;
            }

            let mut incoming: Vec<(BasicValueEnum<'ctx>, BasicBlock<'ctx>)> = Vec::new();
            for (value, block) in &contributions {
                self.builder.position_at_end(*block);
                let value = coerce(&self.builder, *value, result_ty, "if branch")?;
                self.builder.build_unconditional_branch(merge_block)?;
                incoming.push((value, *block));
            }

            self.builder.position_at_end(merge_block);
            let phi = self.builder.build_phi(result_ty, "if_result")?;
            for (value, block) in &incoming {
                phi.add_incoming(&[(value, *block)]);
            }
            return Ok(phi.as_basic_value());
        }

        for (_, block) in &contributions {
            self.builder.position_at_end(*block);
            self.builder.build_unconditional_branch(merge_block)?;
        }
        if let Some(block) = fallthrough {
            if block.get_terminator().is_none() {
                self.builder.position_at_end(block);
                self.builder.build_unconditional_branch(merge_block)?;
            }
        }

        self.builder.position_at_end(merge_block);
        Ok(self.context.i64_type().const_int(0, false).into())
    }

    // ========== Loops ==========

    fn gen_while(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 2, "while")?;
        log::debug!("lowering while loop");

        let cond_block = self.new_block("cond")?;
        let body_block = self.new_block("body")?;
        let continue_block = self.new_block("continue")?;
        let break_block = self.new_block("break")?;

        self.loop_stack.push(LoopFrame {
            break_target: break_block,
            continue_target: continue_block,
        });

        self.builder.build_unconditional_branch(cond_block)?;
        self.builder.position_at_end(cond_block);
        let condition = self.gen(&items[1], env)?;
        let condition = self.to_bool(condition)?;
        self.builder
            .build_conditional_branch(condition, body_block, break_block)?;

        self.builder.position_at_end(body_block);
        self.gen(&items[2], env)?;
        if self.block_open()? {
            self.builder.build_unconditional_branch(continue_block)?;
        }

        self.builder.position_at_end(continue_block);
        self.builder.build_unconditional_branch(cond_block)?;

        self.builder.position_at_end(break_block);
        self.loop_stack.pop();

        Ok(self.context.i64_type().const_int(0, false).into())
    }

    fn gen_loop(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        log::debug!("lowering infinite loop");

        let body_block = self.new_block("loop.body")?;
        let exit_block = self.new_block("loop.exit")?;

        self.builder.build_unconditional_branch(body_block)?;
        self.builder.position_at_end(body_block);

        self.loop_stack.push(LoopFrame {
            break_target: exit_block,
            continue_target: body_block,
        });

        for item in &items[1..] {
            self.gen(item, env)?;
        }

        if self.block_open()? {
            self.builder.build_unconditional_branch(body_block)?;
        }

        self.builder.position_at_end(exit_block);
        self.loop_stack.pop();

        Ok(self.context.i64_type().const_int(0, false).into())
    }

    fn gen_for(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 4, "for")?;
        log::debug!("lowering for loop");

        // Loop-local bindings (the induction variable) live in their own
        // frame.
        let for_env = Environment::child(env);
        self.gen(&items[1], &for_env)?;

        let cond_block = self.new_block("for.cond")?;
        let body_block = self.new_block("for.body")?;
        let step_block = self.new_block("for.step")?;
        let break_block = self.new_block("for.break")?;

        self.builder.build_unconditional_branch(cond_block)?;
        self.builder.position_at_end(cond_block);
        let condition = self.gen(&items[2], &for_env)?;
        let condition = self.to_bool(condition)?;
        self.builder
            .build_conditional_branch(condition, body_block, break_block)?;

        self.builder.position_at_end(body_block);
        self.loop_stack.push(LoopFrame {
            break_target: break_block,
            continue_target: step_block,
        });
        self.gen(&items[4], &for_env)?;
        self.loop_stack.pop();
        if self.block_open()? {
            self.builder.build_unconditional_branch(step_block)?;
        }

        self.builder.position_at_end(step_block);
        self.gen(&items[3], &for_env)?;
        self.builder.build_unconditional_branch(cond_block)?;

        self.builder.position_at_end(break_block);

        Ok(self.context.i64_type().const_int(0, false).into())
    }

    fn gen_break(&mut self) -> CompilerResult<BasicValueEnum<'ctx>> {
        let frame = self
            .loop_stack
            .last()
            .ok_or_else(|| CompilerError::ControlFlow("break outside of loop".into()))?;
        self.builder.build_unconditional_branch(frame.break_target)?;

        // Fresh block so any accidental trailing IR stays well-formed.
        let after = self.new_block("after_break")?;
        self.builder.position_at_end(after);

        Ok(self.context.i64_type().const_int(0, false).into())
    }

    fn gen_continue(&mut self) -> CompilerResult<BasicValueEnum<'ctx>> {
        let frame = self
            .loop_stack
            .last()
            .ok_or_else(|| CompilerError::ControlFlow("continue outside of loop".into()))?;
        self.builder
            .build_unconditional_branch(frame.continue_target)?;

        let after = self.new_block("after_continue")?;
        self.builder.position_at_end(after);

        Ok(self.context.i64_type().const_int(0, false).into())
    }

    // ========== Functions ==========

    /// `[func NAME (PARAMS) BODY]` or `[func NAME (PARAMS) -> RETTAG BODY]`.
    fn gen_function(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        let has_return_tag = items.len() == 6 && items[3].is_symbol("->");
        if items.len() != 4 && !has_return_tag {
            return Err(CompilerError::Structural(
                "func expects NAME (PARAMS) [-> RETTAG] BODY".into(),
            ));
        }

        let Exp::Symbol(name) = &items[1] else {
            return Err(CompilerError::Structural("func name must be a symbol".into()));
        };
        let Exp::List(param_exps) = &items[2] else {
            return Err(CompilerError::Structural(
                "func parameters must be a list".into(),
            ));
        };
        log::debug!("lowering function {name}");

        if self.module.get_function(name).is_some() {
            return Err(CompilerError::DuplicateDeclaration(name.clone()));
        }

        let return_ty = if has_return_tag {
            let Exp::Symbol(tag) = &items[4] else {
                return Err(CompilerError::Structural(
                    "func return type must be a type tag".into(),
                ));
            };
            types::resolve_return(self.context, tag)?
        } else {
            Some(self.context.i64_type().into())
        };
        let body = if has_return_tag { &items[5] } else { &items[3] };

        let mut params: Vec<(String, BasicTypeEnum<'ctx>)> = Vec::new();
        for param in param_exps {
            match param {
                Exp::Symbol(param_name) => {
                    params.push((param_name.clone(), self.context.i64_type().into()));
                }
                Exp::List(parts) => match (parts.first(), parts.get(1), parts.len()) {
                    (Some(Exp::Symbol(param_name)), Some(Exp::Symbol(tag)), 2) => {
                        params.push((param_name.clone(), types::resolve(self.context, tag)?));
                    }
                    _ => {
                        return Err(CompilerError::Structural(
                            "func parameter must be NAME or (NAME TYPETAG)".into(),
                        ));
                    }
                },
                _ => {
                    return Err(CompilerError::Structural(
                        "func parameter must be NAME or (NAME TYPETAG)".into(),
                    ));
                }
            }
        }

        let param_types: Vec<BasicMetadataTypeEnum> =
            params.iter().map(|(_, ty)| (*ty).into()).collect();
        let fn_type: FunctionType<'ctx> = match return_ty {
            Some(ty) => ty.fn_type(&param_types, false),
            None => self.context.void_type().fn_type(&param_types, false),
        };

        // Prototype first: the body may recurse through the outer binding.
        let function = self.module.add_function(name, fn_type, None);
        env.define(name.clone(), Binding::Function(function));

        let previous_function = self.active_function;
        let previous_block = self.builder.get_insert_block();

        self.active_function = Some(function);
        let entry = self.context.append_basic_block(function, "entry");
        self.builder.position_at_end(entry);

        let fn_env = Environment::child(env);
        for (i, (param_name, param_ty)) in params.iter().enumerate() {
            let argument = function.get_nth_param(i as u32).ok_or_else(|| {
                CompilerError::CodeGen(format!("missing parameter {i} of \"{name}\""))
            })?;
            argument.set_name(param_name);

            let slot = self.alloc_var(param_name, *param_ty, &fn_env)?;
            self.builder.build_store(slot, argument)?;
        }

        let body_value = self.gen(body, &fn_env)?;
        if self.block_open()? {
            match return_ty {
                Some(ty) => {
                    let result = coerce(
                        &self.builder,
                        body_value,
                        ty,
                        &format!("return value of \"{name}\""),
                    )?;
                    self.builder.build_return(Some(&result))?;
                }
                None => {
                    self.builder.build_return(None)?;
                }
            }
        }

        self.active_function = previous_function;
        if let Some(block) = previous_block {
            self.builder.position_at_end(block);
        }

        Ok(function.as_global_value().as_pointer_value().into())
    }

    /// Any list whose head names no built-in form is a call.
    fn gen_call(
        &mut self,
        name: &str,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        log::debug!("lowering call to {name}");

        let Binding::Function(function) = env.lookup(name)? else {
            return Err(CompilerError::TypeMismatch(format!(
                "\"{name}\" is not a function"
            )));
        };

        let param_types = function
            .get_type()
            .get_param_types()
            .into_iter()
            .map(metadata_to_basic)
            .collect::<CompilerResult<Vec<_>>>()?;
        if items.len() - 1 != param_types.len() {
            return Err(CompilerError::Structural(format!(
                "\"{name}\" expects {} arguments, got {}",
                param_types.len(),
                items.len() - 1
            )));
        }

        let mut arguments: Vec<BasicMetadataValueEnum> = Vec::with_capacity(param_types.len());
        for (arg_exp, param_ty) in items[1..].iter().zip(&param_types) {
            let value = self.gen(arg_exp, env)?;
            let value = coerce(
                &self.builder,
                value,
                *param_ty,
                &format!("argument to \"{name}\""),
            )?;
            arguments.push(value.into());
        }

        let call = self.builder.build_call(function, &arguments, "call_tmp")?;
        Ok(call
            .try_as_basic_value()
            .left()
            .unwrap_or_else(|| self.context.i64_type().const_int(0, false).into()))
    }

    // ========== I/O forms ==========

    fn gen_fprint(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        if items.len() < 2 {
            return Err(CompilerError::Structural(
                "fprint expects a format string".into(),
            ));
        }

        let printf = self.runtime_fn("printf")?;

        let format = self.gen(&items[1], env)?;
        if !format.is_pointer_value() {
            return Err(CompilerError::TypeMismatch(
                "fprint format must be a string".into(),
            ));
        }

        let mut arguments: Vec<BasicMetadataValueEnum> = vec![format.into()];
        for item in &items[2..] {
            let value = self.gen(item, env)?;
            arguments.push(self.promote_vararg(value)?.into());
        }

        let call = self.builder.build_call(printf, &arguments, "print_tmp")?;
        Ok(call
            .try_as_basic_value()
            .left()
            .unwrap_or_else(|| self.context.i64_type().const_int(0, false).into()))
    }

    /// `[finput FMT TARGETS...]`. `%s` conversions are rewritten to
    /// `%[^\n]`, read through a stack buffer whose pointer lands in the
    /// target variable, and followed by a `getchar()` loop that drains the
    /// rest of the input line.
    fn gen_finput(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        if items.len() < 2 {
            return Err(CompilerError::Structural(
                "finput expects a format string".into(),
            ));
        }

        let scanf = self.runtime_fn("scanf")?;

        let (format_value, string_specs) = match &items[1] {
            Exp::Str(text) => {
                let (rewritten, specs) = rewrite_input_format(&interpret_escapes(text));
                let global = self.builder.build_global_string_ptr(&rewritten, "fmt")?;
                (BasicValueEnum::from(global.as_pointer_value()), specs)
            }
            other => (self.gen(other, env)?, Vec::new()),
        };

        let mut arguments: Vec<BasicMetadataValueEnum> = vec![format_value.into()];
        // Buffer and destination of each %s target, resolved before the
        // call so the stores can follow it.
        let mut buffered_targets: Vec<(PointerValue<'ctx>, PointerValue<'ctx>)> = Vec::new();

        for (position, target) in items[2..].iter().enumerate() {
            let Exp::Symbol(target_name) = target else {
                return Err(CompilerError::Structural(
                    "finput targets must be variable names".into(),
                ));
            };

            let Binding::Local { ptr, ty } = env.lookup(target_name)? else {
                return Err(CompilerError::TypeMismatch(format!(
                    "finput target \"{target_name}\" must be a local variable"
                )));
            };

            let is_string_spec = string_specs.get(position).copied().unwrap_or(false);
            if is_string_spec {
                if !ty.is_pointer_type() {
                    return Err(CompilerError::TypeMismatch(format!(
                        "finput %s target \"{target_name}\" must be declared !str"
                    )));
                }

                let buffer_ty = self.context.i8_type().array_type(INPUT_BUFFER_BYTES);
                let entry = self.active_fn()?.get_first_basic_block().ok_or_else(|| {
                    CompilerError::CodeGen("active function has no entry block".into())
                })?;
                match entry.get_terminator() {
                    Some(terminator) => self.vars_builder.position_before(&terminator),
                    None => self.vars_builder.position_at_end(entry),
                }
                let buffer = self.vars_builder.build_alloca(buffer_ty, "input_buf")?;

                arguments.push(buffer.into());
                buffered_targets.push((buffer, ptr));
            } else {
                arguments.push(ptr.into());
            }
        }

        let call = self.builder.build_call(scanf, &arguments, "input_tmp")?;
        let result = call
            .try_as_basic_value()
            .left()
            .unwrap_or_else(|| self.context.i64_type().const_int(0, false).into());

        for (buffer, destination) in &buffered_targets {
            self.builder.build_store(*destination, *buffer)?;
        }

        if !buffered_targets.is_empty() {
            self.drain_input_line()?;
        }

        Ok(result)
    }

    /// Emits `do { c = getchar(); } while (c != '\n' && c != EOF);`.
    fn drain_input_line(&mut self) -> CompilerResult<()> {
        let getchar = self.runtime_fn("getchar")?;
        let i64_ty = self.context.i64_type();

        let drain_block = self.new_block("input.drain")?;
        let done_block = self.new_block("input.done")?;

        self.builder.build_unconditional_branch(drain_block)?;
        self.builder.position_at_end(drain_block);

        let ch = self
            .builder
            .build_call(getchar, &[], "ch")?
            .try_as_basic_value()
            .left()
            .ok_or_else(|| CompilerError::CodeGen("getchar returned void".into()))?
            .into_int_value();

        let newline = i64_ty.const_int(u64::from(b'\n'), false);
        let eof = i64_ty.const_int(-1i64 as u64, true);
        let not_newline =
            self.builder
                .build_int_compare(IntPredicate::NE, ch, newline, "not_newline")?;
        let not_eof = self
            .builder
            .build_int_compare(IntPredicate::NE, ch, eof, "not_eof")?;
        let keep_draining = self.builder.build_and(not_newline, not_eof, "keep")?;
        self.builder
            .build_conditional_branch(keep_draining, drain_block, done_block)?;

        self.builder.position_at_end(done_block);
        Ok(())
    }

    // ========== Memory forms ==========

    fn malloc_fn(&self) -> FunctionValue<'ctx> {
        self.module.get_function("malloc").unwrap_or_else(|| {
            let byte_ptr = self.context.i8_type().ptr_type(AddressSpace::default());
            let ty = byte_ptr.fn_type(&[self.context.i64_type().into()], false);
            self.module.add_function("malloc", ty, None)
        })
    }

    fn free_fn(&self) -> FunctionValue<'ctx> {
        self.module.get_function("free").unwrap_or_else(|| {
            let byte_ptr = self.context.i8_type().ptr_type(AddressSpace::default());
            let ty = self.context.void_type().fn_type(&[byte_ptr.into()], false);
            self.module.add_function("free", ty, None)
        })
    }

    fn runtime_fn(&self, name: &str) -> CompilerResult<FunctionValue<'ctx>> {
        self.module
            .get_function(name)
            .ok_or_else(|| CompilerError::CodeGen(format!("extern \"{name}\" is not declared")))
    }

    fn gen_mem_alloc(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 1, "mem-alloc")?;

        let size = self.gen(&items[1], env)?;
        let size = coerce(
            &self.builder,
            size,
            self.context.i64_type().into(),
            "allocation size",
        )?;

        let call = self
            .builder
            .build_call(self.malloc_fn(), &[size.into()], "mem_tmp")?;
        call.try_as_basic_value()
            .left()
            .ok_or_else(|| CompilerError::CodeGen("malloc returned void".into()))
    }

    fn gen_mem_free(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 1, "mem-free")?;

        let pointer = self.expect_pointer(&items[1], env, "mem-free")?;
        self.builder
            .build_call(self.free_fn(), &[pointer.into()], "")?;
        Ok(self.context.i64_type().const_int(0, false).into())
    }

    fn gen_mem_write(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 2, "mem-write")?;

        let pointer = self.expect_pointer(&items[1], env, "mem-write")?;
        let value = self.gen(&items[2], env)?;
        self.builder.build_store(pointer, value)?;
        Ok(value)
    }

    fn gen_mem_read(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 2, "mem-read")?;

        let Exp::Symbol(tag) = &items[2] else {
            return Err(CompilerError::Structural(
                "mem-read expects a type tag".into(),
            ));
        };
        let value_ty = types::resolve(self.context, tag)?;

        let pointer = self.expect_pointer(&items[1], env, "mem-read")?;
        Ok(self.builder.build_load(value_ty, pointer, "mem_load")?)
    }

    fn gen_mem_ptr(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 1, "mem-ptr")?;

        let Exp::Symbol(name) = &items[1] else {
            return Err(CompilerError::Structural(
                "mem-ptr expects a variable name".into(),
            ));
        };

        match env.lookup(name)? {
            Binding::Local { ptr, .. } => Ok(ptr.into()),
            Binding::Global(global) => Ok(global.as_pointer_value().into()),
            Binding::Function(function) => {
                Ok(function.as_global_value().as_pointer_value().into())
            }
        }
    }

    fn gen_byte_read(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 1, "byte-read")?;

        let pointer = self.expect_pointer(&items[1], env, "byte-read")?;
        Ok(self
            .builder
            .build_load(self.context.i8_type(), pointer, "byte_load")?)
    }

    fn gen_byte_write(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 2, "byte-write")?;

        let pointer = self.expect_pointer(&items[1], env, "byte-write")?;
        let value = self.gen(&items[2], env)?;
        let value = coerce(
            &self.builder,
            value,
            self.context.i8_type().into(),
            "byte-write value",
        )?;
        self.builder.build_store(pointer, value)?;
        Ok(value)
    }

    fn gen_sizeof(&mut self, items: &[Exp]) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 1, "sizeof")?;

        let Exp::Symbol(tag) = &items[1] else {
            return Err(CompilerError::Structural("sizeof expects a type tag".into()));
        };

        let ty = types::resolve(self.context, tag)?;
        let size = types::alloc_size(ty)?;
        Ok(self.context.i64_type().const_int(size, false).into())
    }

    fn expect_pointer(
        &mut self,
        exp: &Exp,
        env: &Rc<Environment<'ctx>>,
        form: &str,
    ) -> CompilerResult<PointerValue<'ctx>> {
        let value = self.gen(exp, env)?;
        if !value.is_pointer_value() {
            return Err(CompilerError::TypeMismatch(format!(
                "{form} expects a pointer operand"
            )));
        }
        Ok(value.into_pointer_value())
    }

    // ========== Bitwise forms ==========

    fn gen_bitwise(
        &mut self,
        oper: &str,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 2, oper)?;

        let left = self.gen(&items[1], env)?;
        let right = self.gen(&items[2], env)?;
        if !left.is_int_value() || !right.is_int_value() {
            return Err(CompilerError::TypeMismatch(format!(
                "{oper} requires integer operands"
            )));
        }

        // Widen to the common width before operating.
        let left_ty = left.into_int_value().get_type();
        let right_ty = right.into_int_value().get_type();
        let wide_ty: BasicTypeEnum = if left_ty.get_bit_width() >= right_ty.get_bit_width() {
            left_ty.into()
        } else {
            right_ty.into()
        };
        let lhs = implicit_cast(&self.builder, left, wide_ty)?.into_int_value();
        let rhs = implicit_cast(&self.builder, right, wide_ty)?.into_int_value();

        let result = match oper {
            "bit-and" => self.builder.build_and(lhs, rhs, "and_tmp")?,
            "bit-or" => self.builder.build_or(lhs, rhs, "or_tmp")?,
            "bit-xor" => self.builder.build_xor(lhs, rhs, "xor_tmp")?,
            "bit-shl" => self.builder.build_left_shift(lhs, rhs, "shl_tmp")?,
            "bit-shr" => self.builder.build_right_shift(lhs, rhs, true, "shr_tmp")?,
            _ => unreachable!("bitwise dispatch"),
        };
        Ok(result.into())
    }

    fn gen_bit_not(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        self.expect_operands(items, 1, "bit-not")?;

        let value = self.gen(&items[1], env)?;
        if !value.is_int_value() {
            return Err(CompilerError::TypeMismatch(
                "bit-not requires an integer operand".into(),
            ));
        }
        Ok(self
            .builder
            .build_not(value.into_int_value(), "not_tmp")?
            .into())
    }

    // ========== Arrays ==========

    /// `[array E1 ... En]`: a constant array. The element type comes from
    /// the declaration when one provides it, otherwise from the first
    /// element; every element must be a constant conforming to it.
    fn gen_array(
        &mut self,
        elements: &[Exp],
        expected: Option<ArrayType<'ctx>>,
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<ArrayValue<'ctx>> {
        if elements.is_empty() {
            return Err(CompilerError::Structural(
                "array literal needs at least one element".into(),
            ));
        }

        if let Some(declared) = expected {
            if declared.len() as usize != elements.len() {
                return Err(CompilerError::TypeMismatch(format!(
                    "array literal has {} elements, declared type holds {}",
                    elements.len(),
                    declared.len()
                )));
            }
        }

        let mut values: Vec<BasicValueEnum<'ctx>> = Vec::with_capacity(elements.len());
        for element in elements {
            let value = match element {
                Exp::List(inner) if element.head_symbol() == Some("array") => {
                    let nested_expected = expected.and_then(|declared| {
                        match declared.get_element_type() {
                            BasicTypeEnum::ArrayType(inner_ty) => Some(inner_ty),
                            _ => None,
                        }
                    });
                    self.gen_array(&inner[1..], nested_expected, env)?.into()
                }
                other => self.gen(other, env)?,
            };
            values.push(value);
        }

        let element_ty = expected
            .map(|declared| declared.get_element_type())
            .unwrap_or_else(|| values[0].get_type());

        let values = values
            .into_iter()
            .map(|value| conform_array_element(value, element_ty, expected.is_some()))
            .collect::<CompilerResult<Vec<_>>>()?;

        build_const_array(element_ty, &values)
    }

    /// Shared GEP path of `index` reads and `[set (index ...) ...]` writes.
    fn gen_index_ptr(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<(PointerValue<'ctx>, BasicTypeEnum<'ctx>)> {
        self.expect_operands(items, 2, "index")?;

        let Exp::Symbol(name) = &items[1] else {
            return Err(CompilerError::ControlFlow(
                "index target must be an array variable".into(),
            ));
        };

        let Some(array_ty) = self.array_types.get(name).copied() else {
            return Err(CompilerError::ControlFlow(format!(
                "\"{name}\" is not an array"
            )));
        };

        let Binding::Local { ptr, .. } = env.lookup(name)? else {
            return Err(CompilerError::ControlFlow(format!(
                "\"{name}\" is not an array variable"
            )));
        };

        let index = self.gen(&items[2], env)?;
        if !index.is_int_value() {
            return Err(CompilerError::TypeMismatch(
                "array index must be an integer".into(),
            ));
        }

        let zero = self.context.i64_type().const_int(0, false);
        let element_ptr = unsafe {
            self.builder.build_gep(
                array_ty,
                ptr,
                &[zero, index.into_int_value()],
                "idx_ptr",
            )?
        };

        Ok((element_ptr, array_ty.get_element_type()))
    }

    fn gen_index_load(
        &mut self,
        items: &[Exp],
        env: &Rc<Environment<'ctx>>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        let (element_ptr, element_ty) = self.gen_index_ptr(items, env)?;
        Ok(self.builder.build_load(element_ty, element_ptr, "idx_load")?)
    }

    // ========== Shared helpers ==========

    /// Conditions are brought to `i1` before a conditional branch.
    fn to_bool(&self, value: BasicValueEnum<'ctx>) -> CompilerResult<IntValue<'ctx>> {
        if value.is_int_value() {
            let int_value = value.into_int_value();
            if int_value.get_type().get_bit_width() == 1 {
                return Ok(int_value);
            }
            let zero = int_value.get_type().const_int(0, false);
            return Ok(self.builder.build_int_compare(
                IntPredicate::NE,
                int_value,
                zero,
                "tobool",
            )?);
        }

        if value.is_float_value() {
            let zero = self.context.f64_type().const_float(0.0);
            return Ok(self.builder.build_float_compare(
                FloatPredicate::ONE,
                value.into_float_value(),
                zero,
                "tobool",
            )?);
        }

        Err(CompilerError::TypeMismatch(
            "condition must be numeric".into(),
        ))
    }

    fn unify_branch_types(
        &self,
        left: BasicValueEnum<'ctx>,
        right: BasicValueEnum<'ctx>,
        form: &str,
    ) -> CompilerResult<BasicTypeEnum<'ctx>> {
        self.unify_types(left.get_type(), right.get_type(), form)
    }

    /// The joined type of two branch results: numeric results unify through
    /// the promotion rules, anything else must match exactly.
    fn unify_types(
        &self,
        left: BasicTypeEnum<'ctx>,
        right: BasicTypeEnum<'ctx>,
        form: &str,
    ) -> CompilerResult<BasicTypeEnum<'ctx>> {
        if left == right {
            return Ok(left);
        }
        if left.is_float_type() && right.is_int_type() {
            return Ok(left);
        }
        if left.is_int_type() && right.is_float_type() {
            return Ok(right);
        }
        if let (BasicTypeEnum::IntType(a), BasicTypeEnum::IntType(b)) = (left, right) {
            return Ok(if a.get_bit_width() >= b.get_bit_width() {
                a.into()
            } else {
                b.into()
            });
        }

        Err(CompilerError::TypeMismatch(format!(
            "{form}: all branches must produce the same type"
        )))
    }

    /// Variadic arguments follow the C default promotions: integers narrower
    /// than 64 bits are widened.
    fn promote_vararg(
        &self,
        value: BasicValueEnum<'ctx>,
    ) -> CompilerResult<BasicValueEnum<'ctx>> {
        if value.is_int_value()
            && value.into_int_value().get_type().get_bit_width() < 64
        {
            return implicit_cast(&self.builder, value, self.context.i64_type().into());
        }
        Ok(value)
    }

    fn expect_operands(&self, items: &[Exp], operands: usize, form: &str) -> CompilerResult<()> {
        if items.len() != operands + 1 {
            return Err(CompilerError::Structural(format!(
                "{form} expects {operands} operands, got {}",
                items.len() - 1
            )));
        }
        Ok(())
    }
}

/// Convenience entry point: one engine, one program, one `.ll` file.
pub fn compile_program(program: &str, output_base: &str) -> CompilerResult<()> {
    let context = Context::create();
    let mut engine = Codegen::new(&context);
    engine.execute(program, output_base)
}

/// Compiles a program and returns its textual IR without touching the
/// filesystem.
pub fn compile_to_ir(program: &str) -> CompilerResult<String> {
    let context = Context::create();
    let mut engine = Codegen::new(&context);
    engine.compile(program)?;
    Ok(engine.emit_ir())
}

/// Function parameters are always basic types in this language; metadata
/// parameters cannot appear.
fn metadata_to_basic(ty: BasicMetadataTypeEnum<'_>) -> CompilerResult<BasicTypeEnum<'_>> {
    match ty {
        BasicMetadataTypeEnum::ArrayType(t) => Ok(t.into()),
        BasicMetadataTypeEnum::FloatType(t) => Ok(t.into()),
        BasicMetadataTypeEnum::IntType(t) => Ok(t.into()),
        BasicMetadataTypeEnum::PointerType(t) => Ok(t.into()),
        BasicMetadataTypeEnum::StructType(t) => Ok(t.into()),
        BasicMetadataTypeEnum::VectorType(t) => Ok(t.into()),
        other => Err(CompilerError::CodeGen(format!(
            "unsupported parameter type {other:?}"
        ))),
    }
}

/// `\n` and `\t` survive the parser as two-character sequences; they become
/// real control characters here, when the string is installed as a global.
fn interpret_escapes(text: &str) -> String {
    text.replace("\\n", "\n").replace("\\t", "\t")
}

/// Rewrites `%s` conversions to `%[^\n]` and reports, per conversion in
/// order, whether it reads a string. `%%` is not a conversion.
fn rewrite_input_format(format: &str) -> (String, Vec<bool>) {
    let mut rewritten = String::with_capacity(format.len());
    let mut specs = Vec::new();

    let mut chars = format.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            rewritten.push(ch);
            continue;
        }

        match chars.peek() {
            Some('%') => {
                rewritten.push_str("%%");
                chars.next();
            }
            Some('s') => {
                rewritten.push_str("%[^\n]");
                specs.push(true);
                chars.next();
            }
            Some(_) => {
                rewritten.push('%');
                specs.push(false);
            }
            None => rewritten.push('%'),
        }
    }

    (rewritten, specs)
}

/// Checks that an array element is a constant of the element type.
///
/// Integer constants are rebuilt at another integer width (literal widths
/// are minimal, so same-kind elements rarely match exactly). Cross-kind
/// rebuilds (int constants into a double element) are only legal against a
/// declared element type; with an inferred element type every element must
/// agree in kind with the first.
fn conform_array_element<'ctx>(
    value: BasicValueEnum<'ctx>,
    element_ty: BasicTypeEnum<'ctx>,
    to_declared: bool,
) -> CompilerResult<BasicValueEnum<'ctx>> {
    if value.get_type() == element_ty {
        let is_const = match value {
            BasicValueEnum::IntValue(v) => v.is_const(),
            BasicValueEnum::FloatValue(v) => v.get_constant().is_some(),
            BasicValueEnum::ArrayValue(v) => v.is_const(),
            BasicValueEnum::PointerValue(v) => v.is_const(),
            _ => false,
        };
        if !is_const {
            return Err(CompilerError::TypeMismatch(
                "array elements must be constants".into(),
            ));
        }
        return Ok(value);
    }

    if let BasicValueEnum::IntValue(int_value) = value {
        let Some(raw) = int_value.get_sign_extended_constant() else {
            return Err(CompilerError::TypeMismatch(
                "array elements must be constants".into(),
            ));
        };

        match element_ty {
            BasicTypeEnum::IntType(int_ty) => {
                return Ok(int_ty.const_int(raw as u64, true).into());
            }
            BasicTypeEnum::FloatType(float_ty) if to_declared => {
                return Ok(float_ty.const_float(raw as f64).into());
            }
            _ => {}
        }
    }

    Err(CompilerError::TypeMismatch(
        "array elements must be constants of one type".into(),
    ))
}

fn build_const_array<'ctx>(
    element_ty: BasicTypeEnum<'ctx>,
    values: &[BasicValueEnum<'ctx>],
) -> CompilerResult<ArrayValue<'ctx>> {
    match element_ty {
        BasicTypeEnum::IntType(int_ty) => {
            let elements: Vec<_> = values.iter().map(|v| v.into_int_value()).collect();
            Ok(int_ty.const_array(&elements))
        }
        BasicTypeEnum::FloatType(float_ty) => {
            let elements: Vec<_> = values.iter().map(|v| v.into_float_value()).collect();
            Ok(float_ty.const_array(&elements))
        }
        BasicTypeEnum::ArrayType(array_ty) => {
            let elements: Vec<_> = values.iter().map(|v| v.into_array_value()).collect();
            Ok(array_ty.const_array(&elements))
        }
        BasicTypeEnum::PointerType(pointer_ty) => {
            let elements: Vec<_> = values.iter().map(|v| v.into_pointer_value()).collect();
            Ok(pointer_ty.const_array(&elements))
        }
        other => Err(CompilerError::TypeMismatch(format!(
            "array elements of type {other:?} are not supported"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_declares_externs_and_globals() {
        let context = Context::create();
        let engine = Codegen::new(&context);

        assert!(engine.module().get_function("printf").is_some());
        assert!(engine.module().get_function("scanf").is_some());
        assert!(engine.module().get_function("getchar").is_some());
        // malloc and free are lazy.
        assert!(engine.module().get_function("malloc").is_none());
        assert!(engine.module().get_function("free").is_none());
        assert!(engine.module().get_global("_VERSION").is_some());
    }

    #[test]
    fn integer_literal_widths_are_minimal() {
        let context = Context::create();
        let engine = Codegen::new(&context);

        assert_eq!(engine.minimal_int_const(0).get_type().get_bit_width(), 8);
        assert_eq!(engine.minimal_int_const(255).get_type().get_bit_width(), 8);
        assert_eq!(engine.minimal_int_const(256).get_type().get_bit_width(), 16);
        assert_eq!(
            engine.minimal_int_const(65_536).get_type().get_bit_width(),
            32
        );
        assert_eq!(
            engine
                .minimal_int_const(4_294_967_296)
                .get_type()
                .get_bit_width(),
            64
        );
        // Negative literals stay wide: the widening cast is zero-extending.
        assert_eq!(engine.minimal_int_const(-1).get_type().get_bit_width(), 64);
    }

    #[test]
    fn input_format_rewriting() {
        let (rewritten, specs) = rewrite_input_format("%d %s %f %%");
        assert_eq!(rewritten, "%d %[^\n] %f %%");
        assert_eq!(specs, vec![false, true, false]);

        let (unchanged, specs) = rewrite_input_format("no conversions");
        assert_eq!(unchanged, "no conversions");
        assert!(specs.is_empty());
    }

    #[test]
    fn escape_interpretation() {
        assert_eq!(interpret_escapes("a\\nb\\tc"), "a\nb\tc");
        assert_eq!(interpret_escapes("plain"), "plain");
    }
}
