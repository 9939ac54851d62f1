//! CLI argument definitions.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "morning")]
#[command(about = "Compiler for the Morning programming language", version)]
pub struct Cli {
    /// Expression to compile
    #[arg(short, long, value_name = "EXPR")]
    pub expression: Option<String>,

    /// File to compile
    #[arg(short, long, value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// File to lint instead of compiling
    #[arg(short, long, value_name = "FILE")]
    pub lint: Option<PathBuf>,

    /// Output binary name
    #[arg(short, long, value_name = "NAME", default_value = "out")]
    pub output: String,

    /// Keep temporary IR files
    #[arg(short, long)]
    pub keep: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}
