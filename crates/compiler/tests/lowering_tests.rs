// Integration tests for the lowering engine.
//
// Each test compiles a complete program into a fresh module, requires the
// module to pass LLVM's verifier and asserts on the printed IR. Fatal-path
// tests assert the precise error variant.

use inkwell::context::Context;
use morning_compiler::{Codegen, CompilerError};

/// Compiles a program, verifies the module and returns its textual IR.
fn compile(program: &str) -> String {
    let context = Context::create();
    let mut engine = Codegen::new(&context);
    engine
        .compile(program)
        .unwrap_or_else(|err| panic!("program should compile, got: {err}"));

    if let Err(message) = engine.module().verify() {
        panic!(
            "module verification failed:\n{}\nIR was:\n{}",
            message.to_string(),
            engine.emit_ir()
        );
    }

    engine.emit_ir()
}

fn compile_err(program: &str) -> CompilerError {
    let context = Context::create();
    let mut engine = Codegen::new(&context);
    match engine.compile(program) {
        Ok(()) => panic!("program should fail, IR was:\n{}", engine.emit_ir()),
        Err(err) => err,
    }
}

// ========== Module shape ==========

#[test]
fn empty_program_produces_main_shell() {
    let ir = compile("");
    assert!(ir.contains("MorningLangCompilationUnit"));
    assert!(ir.contains("x86_64-unknown-linux-gnu"));
    assert!(ir.contains("define i64 @main()"));
    assert!(ir.contains("ret i64 0"));
}

#[test]
fn externs_are_declared_up_front() {
    let ir = compile("[fprint \"hi\"]");
    assert!(ir.contains("declare i64 @printf"));
    assert!(ir.contains("declare i64 @scanf"));
    assert!(ir.contains("declare i64 @getchar"));
}

#[test]
fn version_global_is_seeded() {
    let ir = compile("[fprint \"%d\\n\" _VERSION]");
    assert!(ir.contains("@_VERSION"));
    assert!(ir.contains("constant i64 300"));
    assert!(ir.contains("align 4"));
}

#[test]
fn malloc_and_free_are_lazy() {
    let without = compile("[var (a !int) 1]");
    assert!(!without.contains("@malloc"));
    assert!(!without.contains("@free"));

    let with = compile("[var (p !ptr) (mem-alloc 16)] [mem-free p]");
    assert!(with.contains("declare ptr @malloc(i64)"));
    assert!(with.contains("declare void @free(ptr)"));
}

// ========== End-to-end scenarios ==========

#[test]
fn scenario_check_and_set() {
    let ir = compile(r#"[var (a !int) 10] [check (== a 10) [set a 0]] [fprint "%d\n" a]"#);
    assert!(ir.contains("icmp eq"));
    assert!(ir.contains("alloca i64"));
    assert!(ir.contains("@printf"));
}

#[test]
fn scenario_square_with_radix_literals() {
    let ir = compile(
        r#"
        [func square (x) (* x x)]
        [fprint "%d\n" (square 10)]
        [fprint "%d\n" (square 0xA)]
        [fprint "%d\n" (square 012)]
        [fprint "%d\n" (square 0b1010)]
        "#,
    );
    assert!(ir.contains("define i64 @square(i64 %x)"));
    assert!(ir.contains("mul i64"));
    assert!(ir.contains("call i64 @square(i64 10)"));
}

#[test]
fn scenario_recursive_factorial() {
    let ir = compile(
        r#"
        [func factorial (x) [check (== x 0) 1 (* x (factorial (- x 1)))]]
        [fprint "%d\n" (factorial 5)]
        "#,
    );
    assert!(ir.contains("define i64 @factorial(i64 %x)"));
    assert!(ir.contains("call i64 @factorial"));
    // Branch results join in a PHI at the merge block.
    assert!(ir.contains("phi i64"));
}

#[test]
fn scenario_while_countdown() {
    let ir = compile(
        r#"
        [var a 3]
        [while (> a 0) [scope
            [set a (- a 1)]
            [fprint "%d " a]]]
        [fprint "\n"]
        "#,
    );
    assert!(ir.contains("cond"));
    assert!(ir.contains("body"));
    assert!(ir.contains("continue"));
    assert!(ir.contains("break"));
    assert!(ir.contains("icmp sgt"));
}

#[test]
fn scenario_array_indexing() {
    let ir = compile(
        r#"
        [var (arr !array<!int,3>) (array 1 2 3)]
        [set (index arr 0) 10]
        [fprint "%d %d %d\n" (index arr 0) (index arr 1) (index arr 2)]
        "#,
    );
    assert!(ir.contains("alloca [3 x i64]"));
    assert!(ir.contains("[3 x i64] [i64 1, i64 2, i64 3]"));
    assert!(ir.contains("getelementptr"));
}

#[test]
fn scenario_for_loop_with_break() {
    let ir = compile(
        r#"
        [for (var i 0) (< i 6) (set i (+ i 1)) [scope
            (fprint "%d " i)
            [check (== i 3) (break)]]]
        "#,
    );
    assert!(ir.contains("for.cond"));
    assert!(ir.contains("for.body"));
    assert!(ir.contains("for.step"));
    assert!(ir.contains("for.break"));
    assert!(ir.contains("after_break"));
}

// ========== Literals ==========

#[test]
fn string_escapes_are_interpreted() {
    let ir = compile(r#"[fprint "a\tb\n"]"#);
    assert!(ir.contains(r#"c"a\09b\0A\00""#));
}

#[test]
fn empty_string_is_just_a_terminator() {
    // One zero byte; LLVM prints the all-zero array as zeroinitializer.
    let ir = compile(r#"[fprint ""]"#);
    assert!(ir.contains("[1 x i8] zeroinitializer"));
}

#[test]
fn narrow_literals_widen_into_typed_slots() {
    let ir = compile("[var (a !int) 10]");
    // The i8 literal is stored as a full i64 after the context widens it.
    assert!(ir.contains("store i64 10"));
}

#[test]
fn boolean_literals_are_bytes() {
    let ir = compile("[var (flag !bool) true]");
    assert!(ir.contains("alloca i8"));
    assert!(ir.contains("store i8 1"));
}

#[test]
fn fractional_literals_are_doubles() {
    let ir = compile("[var (f !frac) 2.5]");
    assert!(ir.contains("alloca double"));
    assert!(ir.contains("2.5"));
}

#[test]
fn int_initializer_casts_to_frac_slot() {
    let ir = compile("[var (f !frac) 2]");
    assert!(ir.contains("store double 2"));
}

// ========== Conditionals ==========

#[test]
fn if_elif_else_chain_joins_in_one_phi() {
    let ir = compile(
        r#"
        [var (x !int) 5]
        [fprint "%d\n" [if (< x 3) 1 elif (< x 10) 2 else 3]]
        "#,
    );
    assert!(ir.contains("if.then"));
    assert!(ir.contains("elif.then"));
    assert!(ir.contains("if.end"));
    assert!(ir.contains("phi i8"));
}

#[test]
fn check_branches_unify_numeric_widths() {
    // 1 is an i8 literal, the else branch is i64: the join widens.
    let ir = compile(r#"[var (x !int) 7] [fprint "%d\n" [check (< x 5) 1 (+ x 0)]]"#);
    assert!(ir.contains("phi i64"));
}

#[test]
fn check_branch_type_conflict_is_fatal() {
    let err = compile_err(r#"[check true "text" 1.5]"#);
    assert!(matches!(err, CompilerError::TypeMismatch(_)));
}

#[test]
fn condition_values_are_normalized_to_i1() {
    // A plain integer condition compiles to an icmp against zero.
    let ir = compile("[var (x !int) 1] [check x [fprint \"y\"]]");
    assert!(ir.contains("icmp ne i64"));
}

// ========== Scoping ==========

#[test]
fn inner_scope_shadows_and_outer_survives() {
    let ir = compile(
        r#"
        [var (x !int) 1]
        [scope [var (x !int) 2] [set x 3]]
        [set x 4]
        "#,
    );
    // Two distinct slots for the two declarations.
    assert!(ir.contains("%x = alloca i64"));
    assert!(ir.contains("%x1 = alloca i64"));
}

#[test]
fn nested_scopes_flatten_cleanly() {
    compile("[scope [scope [scope [var (a !int) 1] [fprint \"%d\" a]]]]");
}

#[test]
fn duplicate_declaration_in_same_scope_is_fatal() {
    let err = compile_err("[var (a !int) 1] [var (a !int) 2]");
    assert!(matches!(err, CompilerError::DuplicateDeclaration(name) if name == "a"));
}

#[test]
fn unbound_name_is_fatal() {
    let err = compile_err("[fprint \"%d\" ghost]");
    assert!(matches!(err, CompilerError::UnboundName(name) if name == "ghost"));
}

// ========== Constants ==========

#[test]
fn const_reads_work_and_writes_fail() {
    let ir = compile(r#"[const (limit !int) 5] [fprint "%d\n" limit]"#);
    assert!(ir.contains("alloca i64"));

    let err = compile_err("[const (limit !int) 5] [set limit 6]");
    assert!(matches!(err, CompilerError::ConstantWrite(name) if name == "limit"));
}

#[test]
fn seeded_globals_reject_writes() {
    let err = compile_err("[set _VERSION 1]");
    assert!(matches!(err, CompilerError::ConstantWrite(_)));
}

// ========== Loops ==========

#[test]
fn infinite_loop_with_break_terminates_blocks() {
    let ir = compile(
        r#"
        [var (i !int) 0]
        [loop [set i (+ i 1)] [check (== i 3) (break)]]
        "#,
    );
    assert!(ir.contains("loop.body"));
    assert!(ir.contains("loop.exit"));
}

#[test]
fn continue_branches_to_frame_target() {
    let ir = compile(
        r#"
        [var (i !int) 0]
        [while (< i 5) [scope
            [set i (+ i 1)]
            [check (== i 2) (continue)]
            [fprint "%d " i]]]
        "#,
    );
    assert!(ir.contains("after_continue"));
}

#[test]
fn break_outside_loop_is_fatal() {
    let err = compile_err("[break]");
    assert!(matches!(err, CompilerError::ControlFlow(_)));
}

#[test]
fn continue_outside_loop_is_fatal() {
    let err = compile_err("[continue]");
    assert!(matches!(err, CompilerError::ControlFlow(_)));
}

// ========== Functions ==========

#[test]
fn typed_parameters_and_return_tag() {
    let ir = compile(
        r#"
        [func half ((x !frac)) -> !frac (/ x 2)]
        [fprint "%f\n" (half 5.0)]
        "#,
    );
    assert!(ir.contains("define double @half(double %x)"));
    assert!(ir.contains("fdiv double"));
}

#[test]
fn void_functions_return_nothing() {
    let ir = compile(
        r#"
        [func report ((x !int)) -> !none [fprint "%d\n" x]]
        (report 3)
        "#,
    );
    assert!(ir.contains("define void @report(i64 %x)"));
    assert!(ir.contains("ret void"));
}

#[test]
fn call_arguments_cast_to_parameter_types() {
    let ir = compile(
        r#"
        [func scale ((x !frac)) -> !frac (* x 2.0)]
        [fprint "%f\n" (scale 3)]
        "#,
    );
    // The integer literal argument reaches the call as a double.
    assert!(ir.contains("call double @scale(double"));
}

#[test]
fn function_redefinition_is_fatal() {
    let err = compile_err("[func f (x) x] [func f (x) x]");
    assert!(matches!(err, CompilerError::DuplicateDeclaration(name) if name == "f"));
}

#[test]
fn calling_a_variable_is_fatal() {
    let err = compile_err("[var (f !int) 1] (f 2)");
    assert!(matches!(err, CompilerError::TypeMismatch(_)));
}

#[test]
fn wrong_argument_count_is_fatal() {
    let err = compile_err("[func square (x) (* x x)] (square 1 2)");
    assert!(matches!(err, CompilerError::Structural(_)));
}

// ========== Arrays ==========

#[test]
fn single_element_array() {
    let ir = compile("[var (one !array<!int,1>) (array 7)]");
    assert!(ir.contains("alloca [1 x i64]"));
}

#[test]
fn nested_array_literal() {
    let ir = compile("[var (grid !array<!array<!int,2>,2>) (array (array 1 2) (array 3 4))]");
    assert!(ir.contains("[2 x [2 x i64]]"));
}

#[test]
fn index_on_non_array_is_fatal() {
    let err = compile_err("[var (a !int) 1] [fprint \"%d\" (index a 0)]");
    assert!(matches!(err, CompilerError::ControlFlow(_)));
}

#[test]
fn non_integer_index_is_fatal() {
    let err = compile_err("[var (arr !array<!int,2>) (array 1 2)] (index arr 1.5)");
    assert!(matches!(err, CompilerError::TypeMismatch(_)));
}

#[test]
fn array_length_mismatch_is_fatal() {
    let err = compile_err("[var (arr !array<!int,3>) (array 1 2)]");
    assert!(matches!(err, CompilerError::TypeMismatch(_)));
}

#[test]
fn non_constant_array_element_is_fatal() {
    let err = compile_err("[var (a !int) 1] [var (arr !array<!int,2>) (array a 2)]");
    assert!(matches!(err, CompilerError::TypeMismatch(_)));
}

#[test]
fn mixed_type_array_literal_is_fatal() {
    // Without a declared element type the first element fixes it; later
    // elements of another kind must not be promoted to match.
    let err = compile_err("[var x (array 1.0 2 3)]");
    assert!(matches!(err, CompilerError::TypeMismatch(_)));

    let err = compile_err("[var y (array 1 2.5)]");
    assert!(matches!(err, CompilerError::TypeMismatch(_)));
}

#[test]
fn declared_frac_array_coerces_integer_literals() {
    let ir = compile("[var (arr !array<!frac,3>) (array 1 2 3)]");
    assert!(ir.contains("alloca [3 x double]"));
}

#[test]
fn size_constraint_mismatch_is_fatal() {
    let err = compile_err("[var (a !size:4!int) 1]");
    assert!(matches!(err, CompilerError::SizeMismatch { .. }));
}

// ========== Memory forms ==========

#[test]
fn heap_roundtrip_uses_malloc_and_free() {
    let ir = compile(
        r#"
        [var (p !ptr) (mem-alloc (sizeof !int))]
        [mem-write p 42]
        [fprint "%d\n" (mem-read p !int)]
        [mem-free p]
        "#,
    );
    assert!(ir.contains("call ptr @malloc(i64 8)"));
    assert!(ir.contains("call void @free"));
    assert!(ir.contains("load i64, ptr"));
}

#[test]
fn byte_access_is_eight_bit() {
    let ir = compile(
        r#"
        [var (p !ptr) (mem-alloc 1)]
        [byte-write p 65]
        [fprint "%d\n" (byte-read p)]
        "#,
    );
    assert!(ir.contains("store i8 65"));
    assert!(ir.contains("load i8, ptr"));
}

#[test]
fn mem_ptr_returns_the_allocation() {
    let ir = compile("[var (a !int) 1] [fprint \"%d\\n\" (mem-read (mem-ptr a) !int)]");
    assert!(ir.contains("load i64, ptr %a"));
}

#[test]
fn sizeof_is_a_constant() {
    let ir = compile(r#"[fprint "%d\n" (sizeof !array<!int,4>)]"#);
    assert!(ir.contains("i64 32"));
}

// ========== Bitwise forms ==========

#[test]
fn bitwise_forms_emit_integer_instructions() {
    let ir = compile(
        r#"
        [var (a !int) 12]
        [fprint "%d %d %d %d %d %d\n"
            (bit-and a 10) (bit-or a 1) (bit-xor a 6)
            (bit-shl a 2) (bit-shr a 1) (bit-not a)]
        "#,
    );
    assert!(ir.contains("and i64"));
    assert!(ir.contains("or i64"));
    assert!(ir.contains("xor i64"));
    assert!(ir.contains("shl i64"));
    assert!(ir.contains("ashr i64"));
}

#[test]
fn bitwise_on_double_is_fatal() {
    let err = compile_err("[var (f !frac) 1.0] (bit-and f 1)");
    assert!(matches!(err, CompilerError::TypeMismatch(_)));
}

// ========== I/O forms ==========

#[test]
fn finput_reads_numbers_through_slots() {
    let ir = compile(r#"[var (n !int) 0] [finput "%d" n]"#);
    assert!(ir.contains("call i64 (ptr, ...) @scanf"));
    // No string conversions: no drain loop.
    assert!(!ir.contains("input.drain"));
}

#[test]
fn finput_strings_use_buffer_and_drain_loop() {
    let ir = compile(r#"[var (name !str) ""] [finput "%s" name]"#);
    assert!(ir.contains("input_buf"));
    assert!(ir.contains("alloca [256 x i8]"));
    assert!(ir.contains("input.drain"));
    assert!(ir.contains("input.done"));
    assert!(ir.contains("call i64 @getchar"));
    // %s was rewritten to a line-oriented scan set.
    assert!(ir.contains(r#"c"%[^\0A]\00""#));
}

#[test]
fn finput_string_target_must_be_str() {
    let err = compile_err(r#"[var (n !int) 0] [finput "%s" n]"#);
    assert!(matches!(err, CompilerError::TypeMismatch(_)));
}

// ========== Structure ==========

#[test]
fn empty_operator_list_is_fatal() {
    let err = compile_err("[[] 1]");
    assert!(matches!(err, CompilerError::Structural(_)));
}

#[test]
fn binary_operator_arity_is_checked() {
    let err = compile_err("(+ 1)");
    assert!(matches!(err, CompilerError::Structural(_)));
}

#[test]
fn parse_errors_surface_as_compiler_errors() {
    let err = compile_err("[var a 1");
    assert!(matches!(err, CompilerError::Parse(_)));
}

#[test]
fn shipped_demos_compile_and_verify() {
    let demos = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("demos");

    let mut seen = 0;
    for entry in std::fs::read_dir(&demos).expect("demos directory should exist") {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) != Some("mlg") {
            continue;
        }

        let source = std::fs::read_to_string(&path).unwrap();
        let context = Context::create();
        let mut engine = Codegen::new(&context);
        engine
            .compile(&source)
            .unwrap_or_else(|err| panic!("{} should compile: {err}", path.display()));
        if let Err(message) = engine.module().verify() {
            panic!(
                "{} failed verification:\n{}",
                path.display(),
                message.to_string()
            );
        }
        seen += 1;
    }

    assert!(seen >= 5, "expected the shipped demos, found {seen}");
}

// ========== Output ==========

#[test]
fn write_to_file_emits_textual_ir() {
    let context = Context::create();
    let mut engine = Codegen::new(&context);
    engine.compile("[fprint \"%d\\n\" 1]").unwrap();

    let path = std::env::temp_dir().join("morning_lowering_test.ll");
    engine.write_to_file(&path).unwrap();

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("define i64 @main()"));
    std::fs::remove_file(&path).unwrap();
}
