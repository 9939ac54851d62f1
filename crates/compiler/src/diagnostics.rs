//! User-visible diagnostics and the expression traceback.
//!
//! Log lines carry the `[MORNING :: LEVEL]` prefix; warnings and errors go to
//! stderr. The traceback is a thread-local ring of the expressions most
//! recently entered by the lowering engine; on a fatal error the CLI renders
//! its tail so the user sees which forms enclosed the failure.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::Display;

use colored::Colorize;

/// Oldest entries are dropped beyond this depth.
const MAX_STACK_SIZE: usize = 100;
/// How many entries a rendered traceback shows.
const TRACEBACK_LIMIT: usize = 5;

thread_local! {
    static EXPRESSION_STACK: RefCell<VecDeque<(String, String)>> =
        RefCell::new(VecDeque::new());
}

/// Severity of a reported line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }

    fn paint(self, text: String) -> colored::ColoredString {
        match self {
            Level::Info => text.blue(),
            Level::Warning => text.yellow(),
            Level::Error => text.red(),
            Level::Critical => text.purple(),
        }
    }
}

/// Prints one prefixed log line. Info goes to stdout, everything else to
/// stderr.
pub fn report(level: Level, message: impl Display) {
    let label = level.paint(format!("{:<8}", level.label())).bold();
    let line = format!("{}{}{} {}", "[MORNING :: ".bold(), label, "]".bold(), message);
    match level {
        Level::Info => println!("{line}"),
        _ => eprintln!("{line}"),
    }
}

pub fn info(message: impl Display) {
    report(Level::Info, message);
}

pub fn warn(message: impl Display) {
    report(Level::Warning, message);
}

pub fn error(message: impl Display) {
    report(Level::Error, message);
}

/// Critical diagnostic: the log line followed by the expression traceback.
pub fn fatal(message: impl Display) {
    report(Level::Critical, message);
    if let Some(traceback) = render_traceback() {
        eprintln!("{traceback}");
    }
}

/// Records an expression the lowering engine is about to process.
pub fn push_expression(context: impl Into<String>, rendered: impl Into<String>) {
    EXPRESSION_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push_back((context.into(), rendered.into()));
        if stack.len() > MAX_STACK_SIZE {
            stack.pop_front();
        }
    });
}

/// Clears the traceback; called once per compilation.
pub fn reset_traceback() {
    EXPRESSION_STACK.with(|stack| stack.borrow_mut().clear());
}

/// Renders the tail of the traceback, most recent entry last. `None` when
/// nothing was recorded.
pub fn render_traceback() -> Option<String> {
    EXPRESSION_STACK.with(|stack| {
        let stack = stack.borrow();
        if stack.is_empty() {
            return None;
        }

        let start = stack.len().saturating_sub(TRACEBACK_LIMIT);
        let mut out = format!("{}", "Expressions traceback:".bold());
        for (context, rendered) in stack.iter().skip(start) {
            out.push_str(&format!("\n    {} {}", format!("{context:<8}").cyan(), rendered));
        }
        Some(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceback_keeps_tail() {
        reset_traceback();
        for i in 0..150 {
            push_expression("var", format!("[var x{i} {i}]"));
        }
        let rendered = render_traceback().expect("traceback should be non-empty");
        // Only the last five entries are shown.
        assert!(rendered.contains("x149"));
        assert!(rendered.contains("x145"));
        assert!(!rendered.contains("x144"));
        reset_traceback();
        assert!(render_traceback().is_none());
    }
}
