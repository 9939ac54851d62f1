//! Command implementations: lint, compile, and the external tool pipeline.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use morning_compiler::diagnostics;
use morning_compiler::linter::Linter;
use morning_syntax::{parse, Exp};

use crate::cli::Cli;

const FORBIDDEN_OUTPUT_CHARS: &str = "/\\:*?\"<>|";
const REQUIRED_TOOLS: [&str; 2] = ["opt", "clang++"];

/// Dispatches the parsed command line; returns the process exit code.
pub fn run(cli: Cli) -> i32 {
    if let Some(path) = &cli.lint {
        return lint(path);
    }

    if !is_valid_output_name(&cli.output) {
        diagnostics::error(format!("Invalid output name: {}", cli.output));
        return 1;
    }

    let Some(program) = read_program(&cli) else {
        return 1;
    };

    if !tools_available() {
        return 1;
    }

    compile(&program, &cli.output, cli.keep)
}

fn read_program(cli: &Cli) -> Option<String> {
    if let Some(path) = &cli.file {
        match fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => {
                diagnostics::error(format!("File \"{}\" is empty", path.display()));
                None
            }
            Ok(text) => Some(text),
            Err(err) => {
                diagnostics::error(format!("Cannot open file \"{}\": {err}", path.display()));
                None
            }
        }
    } else if let Some(expression) = &cli.expression {
        if expression.trim().is_empty() {
            diagnostics::error("Empty expression");
            None
        } else {
            Some(expression.clone())
        }
    } else {
        diagnostics::error("No input specified (use -e or -f)");
        eprintln!("Run with --help for usage.");
        None
    }
}

fn compile(program: &str, output_base: &str, keep: bool) -> i32 {
    diagnostics::info("Compiling program...");

    if let Err(err) = morning_compiler::compile_program(program, output_base) {
        diagnostics::fatal(err);
        return 1;
    }

    let ll_file = format!("{output_base}.ll");
    if !file_has_content(&ll_file) {
        diagnostics::error("IR generation failed, no output file");
        return 1;
    }

    if !compile_ir(output_base) {
        diagnostics::error("Compilation failed, temporary files retained for debugging");
        return 1;
    }

    if keep {
        diagnostics::info(format!("IR code saved: {ll_file}"));
    } else {
        cleanup_temp_files(output_base);
    }

    diagnostics::info(format!("Successfully compiled to {output_base}"));
    0
}

fn lint(path: &Path) -> i32 {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            diagnostics::error(format!("Cannot open file \"{}\": {err}", path.display()));
            return 1;
        }
    };

    let mut linter = Linter::new();

    if let Some(issue) = linter.check_syntax(&source) {
        diagnostics::error(format!("Syntax errors in {}:", path.display()));
        diagnostics::error(format!("  {issue}"));
        return 1;
    }

    let forms = match parse(&source) {
        Ok(forms) => forms,
        Err(err) => {
            diagnostics::error(format!("Linting failed: {err}"));
            return 1;
        }
    };
    let ast = Exp::List(
        std::iter::once(Exp::Symbol("scope".into()))
            .chain(forms)
            .collect(),
    );

    let issues = linter.lint(&ast);
    if issues.is_empty() {
        diagnostics::info(format!("No lint issues found in {}", path.display()));
        return 0;
    }

    diagnostics::warn(format!("Lint issues in {}:", path.display()));
    for issue in &issues {
        diagnostics::warn(format!("  {issue}"));
    }
    2
}

/// `opt -O3` then `clang++ -O3` over the emitted IR.
fn compile_ir(output_base: &str) -> bool {
    let ll_file = format!("{output_base}.ll");
    let opt_ll_file = format!("{output_base}-opt.ll");

    diagnostics::info("Optimizing code...");
    let optimized = run_tool(
        Command::new("opt").args([ll_file.as_str(), "-O3", "-S", "-o", opt_ll_file.as_str()]),
    );
    if !optimized {
        diagnostics::error("Code optimization failed");
        return false;
    }
    if !file_has_content(&opt_ll_file) {
        diagnostics::error("Optimized IR code not created");
        return false;
    }

    diagnostics::info("Compiling optimized code...");
    let linked = run_tool(
        Command::new("clang++").args(["-O3", opt_ll_file.as_str(), "-o", output_base]),
    );
    if !linked {
        diagnostics::error("Binary compilation failed");
        return false;
    }
    if !file_has_content(output_base) {
        diagnostics::error(format!("Binary file \"{output_base}\" not created"));
        return false;
    }

    true
}

fn run_tool(command: &mut Command) -> bool {
    let program = command.get_program().to_string_lossy().to_string();
    match command.output() {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            diagnostics::error(format!("\"{program}\" exited with {}", output.status));
            eprint!("{}", String::from_utf8_lossy(&output.stderr));
            false
        }
        Err(err) => {
            diagnostics::error(format!("Cannot run \"{program}\": {err}"));
            false
        }
    }
}

fn tools_available() -> bool {
    for tool in REQUIRED_TOOLS {
        let found = Command::new(tool)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok();
        if !found {
            diagnostics::error(format!(
                "Required utility \"{tool}\" not found. Please install it."
            ));
            return false;
        }
    }
    true
}

fn cleanup_temp_files(output_base: &str) {
    for path in [format!("{output_base}.ll"), format!("{output_base}-opt.ll")] {
        if !Path::new(&path).exists() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("removed temp file {path}"),
            Err(err) => diagnostics::warn(format!("Could not remove file \"{path}\": {err}")),
        }
    }
}

fn file_has_content(path: &str) -> bool {
    fs::metadata(path).map(|meta| meta.len() > 0).unwrap_or(false)
}

fn is_valid_output_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| FORBIDDEN_OUTPUT_CHARS.contains(c))
}
