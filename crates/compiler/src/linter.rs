//! Style checking over the expression tree.
//!
//! The linter runs off the codegen critical path: it never fails a build by
//! itself. Rules produce warnings (`W...`); a program that does not parse is
//! the one hard error (`E001`). The CLI maps "warnings only" to exit code 2.

use std::collections::{HashMap, HashSet};

use morning_syntax::{parse, Exp};

/// One reported issue, already formatted for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintIssue {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for LintIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

pub struct Linter {
    operators: HashSet<&'static str>,
    keywords: HashSet<&'static str>,
    declarations: HashMap<String, usize>,
}

impl Default for Linter {
    fn default() -> Self {
        Self::new()
    }
}

impl Linter {
    pub fn new() -> Self {
        Self {
            operators: [
                "+", "-", "*", "/", ">", "<", ">=", "<=", "==", "!=",
            ]
            .into_iter()
            .collect(),
            keywords: [
                "func", "scope", "fprint", "check", "if", "elif", "else", "finput", "while",
                "loop", "for", "set", "var", "const", "break", "continue", "array", "index",
                "true", "false", "->",
            ]
            .into_iter()
            .collect(),
            declarations: HashMap::new(),
        }
    }

    /// Parses `source` and reports the syntax error, if any.
    pub fn check_syntax(&self, source: &str) -> Option<LintIssue> {
        match parse(source) {
            Ok(_) => None,
            Err(err) => Some(LintIssue {
                code: "E001",
                message: format!("Syntax error: {err}"),
            }),
        }
    }

    /// Walks the tree applying every rule; resets duplicate tracking first.
    pub fn lint(&mut self, ast: &Exp) -> Vec<LintIssue> {
        self.declarations.clear();

        let mut issues = Vec::new();
        self.traverse(ast, &mut issues);
        issues
    }

    fn traverse(&mut self, node: &Exp, issues: &mut Vec<LintIssue>) {
        self.check_identifier(node, issues);
        self.check_snake_case(node, issues);
        self.check_length(node, issues);
        self.check_duplicates(node, issues);

        if let Exp::List(items) = node {
            for child in items {
                self.traverse(child, issues);
            }
        }
    }

    /// A symbol the rules should not second-guess: operators, keywords, type
    /// tags and the internal mangled aliases.
    fn exempt(&self, name: &str) -> bool {
        self.operators.contains(name)
            || self.keywords.contains(name)
            || name.starts_with('!')
            || name.starts_with("__")
    }

    // W001: identifiers use letters, digits and underscores only.
    fn check_identifier(&self, node: &Exp, issues: &mut Vec<LintIssue>) {
        let Exp::Symbol(name) = node else { return };
        if self.exempt(name) || is_valid_identifier(name) {
            return;
        }

        let suggestion = if name.contains('-') {
            name.replace('-', "_")
        } else {
            let cleaned: String = name
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if cleaned.is_empty() {
                "valid_name".to_string()
            } else {
                cleaned
            }
        };

        issues.push(LintIssue {
            code: "W001",
            message: format!(
                "Invalid identifier '{name}'\n  \
                 Contains invalid characters (only a-z, 0-9, _ allowed)\n  \
                 Suggested fix: use '{suggestion}' instead"
            ),
        });
    }

    // W002: snake_case naming.
    fn check_snake_case(&self, node: &Exp, issues: &mut Vec<LintIssue>) {
        let Exp::Symbol(name) = node else { return };
        if self.exempt(name) || !is_valid_identifier(name) {
            return;
        }

        if name.chars().any(|c| c.is_ascii_uppercase()) {
            let suggestion = suggest_snake_case(name);
            issues.push(LintIssue {
                code: "W002",
                message: format!(
                    "Not snake_case: '{name}'\n  \
                     Suggested fix: use '{suggestion}' instead\n  \
                     Example: [var {suggestion} 10]"
                ),
            });
        }
    }

    // W003: identifiers of at least three characters.
    fn check_length(&self, node: &Exp, issues: &mut Vec<LintIssue>) {
        let Exp::Symbol(name) = node else { return };
        if self.exempt(name) || !is_valid_identifier(name) {
            return;
        }

        if name.len() < 3 {
            issues.push(LintIssue {
                code: "W003",
                message: format!(
                    "Identifier too short: '{name}' ({} chars)\n  \
                     Suggested fix: use '{name}_value' instead\n  \
                     Example: [var {name}_value 10]",
                    name.len()
                ),
            });
        }
    }

    // W004: duplicate func/var/const declarations of one name.
    fn check_duplicates(&mut self, node: &Exp, issues: &mut Vec<LintIssue>) {
        let Exp::List(items) = node else { return };
        let declares = matches!(node.head_symbol(), Some("func" | "var" | "const"));
        if !declares {
            return;
        }

        let name = match items.get(1) {
            Some(Exp::Symbol(name)) => Some(name.clone()),
            Some(Exp::List(parts)) => match parts.first() {
                Some(Exp::Symbol(name)) => Some(name.clone()),
                _ => None,
            },
            _ => None,
        };

        let Some(name) = name else { return };
        if !is_valid_identifier(&name) {
            return;
        }

        let seen = self.declarations.entry(name.clone()).or_insert(0);
        *seen += 1;
        if *seen > 1 {
            issues.push(LintIssue {
                code: "W004",
                message: format!(
                    "Duplicate declaration: '{name}'\n  \
                     Suggested fix: rename to '{name}_2'\n  \
                     Example: [var {name}_2 value]"
                ),
            });
        }
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn suggest_snake_case(name: &str) -> String {
    let mut suggestion = String::with_capacity(name.len() + 4);

    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if !suggestion.is_empty() && !suggestion.ends_with('_') {
                suggestion.push('_');
            }
            suggestion.push(ch.to_ascii_lowercase());
        } else if ch == '-' {
            suggestion.push('_');
        } else if ch.is_ascii_alphanumeric() || ch == '_' {
            suggestion.push(ch);
        }
    }

    while suggestion.contains("__") {
        suggestion = suggestion.replace("__", "_");
    }
    let trimmed = suggestion.trim_matches('_');

    if trimmed.is_empty() {
        "valid_name".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lint_source(source: &str) -> Vec<LintIssue> {
        let ast = Exp::List(
            std::iter::once(Exp::Symbol("scope".into()))
                .chain(parse(source).expect("test source must parse"))
                .collect(),
        );
        Linter::new().lint(&ast)
    }

    fn codes(issues: &[LintIssue]) -> Vec<&'static str> {
        issues.iter().map(|issue| issue.code).collect()
    }

    #[test]
    fn clean_program_has_no_issues() {
        let issues = lint_source("[var counter 10] [fprint \"%d\" counter]");
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn hyphenated_identifier_flagged() {
        let issues = lint_source("[var my-var 10]");
        assert!(codes(&issues).contains(&"W001"));
        assert!(issues[0].message.contains("my_var"));
    }

    #[test]
    fn camel_case_flagged() {
        let issues = lint_source("[var myVariable 10]");
        assert!(codes(&issues).contains(&"W002"));
        assert!(issues.iter().any(|i| i.message.contains("my_variable")));
    }

    #[test]
    fn short_names_flagged() {
        let issues = lint_source("[var abc (+ 1 2)]");
        assert!(issues.is_empty());

        let issues = lint_source("[var ab 10]");
        assert_eq!(codes(&issues), vec!["W003"]);
    }

    #[test]
    fn duplicate_declarations_flagged() {
        let issues = lint_source("[var counter 1] [var counter 2]");
        assert!(codes(&issues).contains(&"W004"));
    }

    #[test]
    fn keywords_and_tags_exempt() {
        let issues = lint_source("[var (total !int) 10] [while (> total 0) [set total 0]]");
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn syntax_check_reports_parse_errors() {
        let linter = Linter::new();
        assert!(linter.check_syntax("[var a 1]").is_none());
        let issue = linter.check_syntax("[var a 1").expect("should fail");
        assert_eq!(issue.code, "E001");
    }
}
