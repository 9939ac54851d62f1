//! The expression tree shared by the parser, the linter and the lowering
//! engine.

use std::fmt;

/// Longest rendering of an expression kept in diagnostics before trimming.
const RENDER_LIMIT: usize = 120;

/// A parsed Morning expression.
///
/// A `List` whose head is a `Symbol` names a form (`var`, `while`, `func`,
/// ...); any other head is treated by the compiler as a call target. Type
/// tags (`!int`, `!array<!int,3>`) are plain symbols; the parser does not
/// interpret them.
#[derive(Debug, Clone, PartialEq)]
pub enum Exp {
    /// 64-bit signed integer literal.
    Number(i64),
    /// IEEE-754 double literal.
    Fractional(f64),
    /// String literal. `\"`, `\\` and `\'` are already un-escaped; `\n` and
    /// `\t` are kept verbatim and re-processed at lowering time.
    Str(String),
    /// Identifier, keyword, operator glyph or type tag.
    Symbol(String),
    /// Ordered sequence of sub-expressions. May be empty.
    List(Vec<Exp>),
}

impl Exp {
    /// The head symbol of a list form, if there is one.
    pub fn head_symbol(&self) -> Option<&str> {
        match self {
            Exp::List(items) => match items.first() {
                Some(Exp::Symbol(name)) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    /// True for symbols carrying exactly the given text.
    pub fn is_symbol(&self, text: &str) -> bool {
        matches!(self, Exp::Symbol(name) if name == text)
    }

    /// Context label used by the expression traceback: the head symbol for
    /// lists, the variant name for everything else.
    pub fn context_name(&self) -> String {
        match self {
            Exp::List(_) => self.head_symbol().unwrap_or("list").to_string(),
            Exp::Number(_) => "number".to_string(),
            Exp::Fractional(_) => "fractional".to_string(),
            Exp::Str(_) => "string".to_string(),
            Exp::Symbol(_) => "symbol".to_string(),
        }
    }

    /// Renders the expression for diagnostics, trimming long forms.
    pub fn to_short_string(&self) -> String {
        let full = self.to_string();
        if full.len() > RENDER_LIMIT {
            let mut cut = RENDER_LIMIT - 3;
            while !full.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}...", &full[..cut])
        } else {
            full
        }
    }
}

impl fmt::Display for Exp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exp::Number(value) => write!(f, "{value}"),
            Exp::Fractional(value) => write!(f, "{value}"),
            Exp::Str(text) => write!(f, "\"{text}\""),
            Exp::Symbol(name) => write!(f, "{name}"),
            Exp::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}
