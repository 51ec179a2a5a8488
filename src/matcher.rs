//! Output matching for shell assertions.
//!
//! Serial consoles sprinkle carriage returns around line feeds, so both sides
//! of a comparison are normalized first: any run of `\r` touching a `\n`
//! collapses into a single `\n`. Literal comparison is exact after that. Regex
//! templates may still be written against raw console output (`(\r+)\n`);
//! escaped `\r` tokens in a template are made optional so such templates keep
//! matching normalized text.

use regex::Regex;
use std::fmt;

/// How a regex template is applied to the captured text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// The template must cover the whole text
    #[default]
    Full,
    /// The template may match anywhere
    Search,
}

/// A failed comparison, with enough context to print a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// Normalized expected text or regex template
    pub expected: String,
    /// Normalized actual text
    pub actual: String,
    pub is_regex: bool,
    /// Set when the template itself was unusable
    pub error: Option<String>,
}

impl Mismatch {
    /// Line-by-line rendering of where `actual` departs from `expected`.
    pub fn diff(&self) -> String {
        render_diff(&self.expected, &self.actual)
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(error) = &self.error {
            return write!(f, "invalid pattern {:?}: {error}", self.expected);
        }
        let kind = if self.is_regex { "pattern" } else { "text" };
        writeln!(f, "expected {kind}: {:?}", self.expected)?;
        writeln!(f, "actual output:   {:?}", self.actual)?;
        write!(f, "{}", self.diff())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched,
    Mismatch(Mismatch),
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched)
    }
}

/// Collapses carriage returns adjacent to line feeds.
pub fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_cr = 0usize;
    let mut after_newline = false;
    for c in text.chars() {
        match c {
            '\r' => pending_cr += 1,
            '\n' => {
                pending_cr = 0;
                after_newline = true;
                out.push('\n');
            }
            _ => {
                if !after_newline {
                    out.extend(std::iter::repeat_n('\r', pending_cr));
                }
                pending_cr = 0;
                after_newline = false;
                out.push(c);
            }
        }
    }
    if !after_newline {
        out.extend(std::iter::repeat_n('\r', pending_cr));
    }
    out
}

/// Compares `actual` against `expected` in full-match mode.
pub fn match_output(actual: &str, expected: &str, is_regex: bool) -> MatchOutcome {
    match_with_mode(actual, expected, is_regex, MatchMode::Full)
}

/// `true` when [`match_output`] matches.
pub fn matches(actual: &str, expected: &str, is_regex: bool) -> bool {
    match_output(actual, expected, is_regex).is_match()
}

pub fn match_with_mode(actual: &str, expected: &str, is_regex: bool, mode: MatchMode) -> MatchOutcome {
    let actual = normalize_line_endings(actual);
    if !is_regex {
        let expected = normalize_line_endings(expected);
        let found = match mode {
            MatchMode::Full => actual == expected,
            MatchMode::Search => actual.contains(&expected),
        };
        return if found {
            MatchOutcome::Matched
        } else {
            MatchOutcome::Mismatch(Mismatch {
                expected,
                actual,
                is_regex,
                error: None,
            })
        };
    }

    let relaxed = relax_carriage_returns(expected);
    let source = match mode {
        MatchMode::Full => format!(r"\A(?:{relaxed})\z"),
        MatchMode::Search => relaxed,
    };
    match Regex::new(&source) {
        Ok(re) if re.is_match(&actual) => MatchOutcome::Matched,
        Ok(_) => MatchOutcome::Mismatch(Mismatch {
            expected: expected.to_string(),
            actual,
            is_regex,
            error: None,
        }),
        Err(e) => MatchOutcome::Mismatch(Mismatch {
            expected: expected.to_string(),
            actual,
            is_regex,
            error: Some(e.to_string()),
        }),
    }
}

/// Rewrites `\r` (escaped or raw) outside character classes into an
/// optional carriage return.
fn relax_carriage_returns(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 16);
    let mut chars = pattern.chars();
    let mut class_depth = 0usize;
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('r') if class_depth == 0 => out.push_str(r"(?:\r?)"),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            },
            '\r' if class_depth == 0 => out.push_str(r"(?:\r?)"),
            '[' => {
                class_depth += 1;
                out.push(c);
            }
            ']' if class_depth > 0 => {
                class_depth -= 1;
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn render_diff(expected: &str, actual: &str) -> String {
    let expected: Vec<&str> = expected.split('\n').collect();
    let actual: Vec<&str> = actual.split('\n').collect();
    let mut out = String::new();
    for i in 0..expected.len().max(actual.len()) {
        match (expected.get(i), actual.get(i)) {
            (Some(e), Some(a)) if e == a => out.push_str(&format!("  {e}\n")),
            (e, a) => {
                if let Some(e) = e {
                    out.push_str(&format!("- {e}\n"));
                }
                if let Some(a) = a {
                    out.push_str(&format!("+ {a}\n"));
                }
            }
        }
    }
    out
}
