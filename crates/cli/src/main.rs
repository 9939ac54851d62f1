//! `morning` - command-line driver for the Morning compiler.
//!
//! Pipeline: read source (`-e` expression or `-f` file), lower it to
//! `<output>.ll`, optimize with `opt -O3`, produce a binary with `clang++`
//! and clean up the temporaries unless `-k` is given. `-l FILE` runs the
//! linter instead of compiling.
//!
//! Exit codes: 0 on success, 1 on compilation or IO failure, 2 when the
//! linter reports warnings only.

mod cli;
mod commands;

use clap::Parser;
use std::process;

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    // -v raises the log floor to debug; RUST_LOG still wins when set.
    let mut logger = env_logger::Builder::new();
    logger.filter_level(if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Error
    });
    logger.parse_default_env();
    logger.init();

    process::exit(commands::run(cli));
}
