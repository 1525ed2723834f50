//! Comparison of actual statement outcomes against fixture expectations.

use std::borrow::Cow;
use std::fmt::{self, Display};
use std::sync::OnceLock;

use itertools::Itertools;
use owo_colors::OwoColorize;
use regex::Regex;
use similar::{ChangeTag, TextDiff};

use crate::{Expectation, Row, RowOrder, Statement, Value};

/// Decides whether an actual error message satisfies an expected one.
///
/// # Default
///
/// By default, we use [`normalized_prefix_error_matcher`].
pub type ErrorMatcher = fn(expected: &str, actual: &str) -> bool;

/// The messages must be identical.
pub fn exact_error_matcher(expected: &str, actual: &str) -> bool {
    expected == actual
}

/// The actual message must contain the expected text anywhere.
pub fn contains_error_matcher(expected: &str, actual: &str) -> bool {
    actual.contains(expected)
}

/// The expected text is a regular expression searched in the actual message.
/// An invalid expression never matches.
pub fn regex_error_matcher(expected: &str, actual: &str) -> bool {
    Regex::new(expected).is_ok_and(|re| re.is_match(actual))
}

/// Both messages are normalized, then the actual one must start with the
/// expected one.
///
/// Normalization keeps the first line only, drops a leading `ERROR:` and a
/// trailing `(SQLSTATE xxxxx)`, and collapses runs of whitespace. An empty
/// expectation accepts any error.
pub fn normalized_prefix_error_matcher(expected: &str, actual: &str) -> bool {
    normalize_error(actual).starts_with(&normalize_error(expected))
}

pub fn default_error_matcher(expected: &str, actual: &str) -> bool {
    normalized_prefix_error_matcher(expected, actual)
}

fn normalize_error(message: &str) -> String {
    static SQLSTATE: OnceLock<Regex> = OnceLock::new();
    let sqlstate = SQLSTATE
        .get_or_init(|| Regex::new(r"\s*\(SQLSTATE [0-9A-Z]{5}\)\s*$").expect("invalid regex"));

    let line = message.lines().next().unwrap_or_default().trim();
    let line = match line.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("ERROR:") => line[6..].trim_start(),
        _ => line,
    };
    sqlstate.replace(line, "").split_whitespace().join(" ")
}

/// An error reported by the engine: a message plus an optional context chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub message: String,
    pub context: Vec<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        ErrorInfo {
            message: message.into(),
            context: vec![],
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.context.extend(context.into_iter().map(Into::into));
        self
    }

    /// Uses the error's `Display` as the message and its `source` chain as context.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut context = vec![];
        let mut source = err.source();
        while let Some(e) = source {
            context.push(e.to_string());
            source = e.source();
        }
        ErrorInfo {
            message: err.to_string(),
            context,
        }
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for context in &self.context {
            write!(f, "\n\t{context}")?;
        }
        Ok(())
    }
}

/// What the engine actually did with a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum ActualOutcome {
    Rows(Vec<Row>),
    /// The statement completed without a result set.
    Complete(u64),
    Error(ErrorInfo),
}

impl ActualOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ActualOutcome::Error(_))
    }

    fn rows(&self) -> &[Row] {
        match self {
            ActualOutcome::Rows(rows) => rows,
            _ => &[],
        }
    }
}

/// The result of comparing one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    Fail(Mismatch),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// The first point at which two row sequences diverge.
#[derive(Debug, Clone, PartialEq)]
pub enum RowDifference {
    RowCount { expected: usize, actual: usize },
    ColumnCount { row: usize, expected: usize, actual: usize },
    Value { row: usize, column: usize, expected: Value, actual: Value },
}

impl Display for RowDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowDifference::RowCount { expected, actual } => {
                write!(f, "expected {expected} rows, got {actual}")
            }
            RowDifference::ColumnCount {
                row,
                expected,
                actual,
            } => write!(f, "row {row}: expected {expected} columns, got {actual}"),
            RowDifference::Value {
                row,
                column,
                expected,
                actual,
            } => write!(
                f,
                "row {row}, column {column}: expected {expected}, got {actual}"
            ),
        }
    }
}

/// Why a statement failed its expectation.
///
/// For colored output, use `self.display()`.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Mismatch {
    #[error("statement is expected to fail with error:\n\t{expected}\nbut actually succeeded")]
    UnexpectedSuccess { expected: String },
    #[error("statement is expected to return rows, but failed with error:\n\t{error}")]
    UnexpectedError { error: ErrorInfo },
    // Remember to also update [`MismatchDisplay`] if this message is changed.
    #[error("statement is expected to fail with error:\n\t{expected}\nbut got error:\n\t{actual}")]
    ErrorMismatch { expected: String, actual: ErrorInfo },
    // Remember to also update [`MismatchDisplay`] if this message is changed.
    #[error(
        "query result mismatch: {difference}\n[Diff] (-expected|+actual)\n{}",
        format_diff(.expected, .actual, false)
    )]
    Rows {
        difference: RowDifference,
        expected: Vec<Row>,
        actual: Vec<Row>,
    },
}

impl Mismatch {
    pub fn display(&self, colorize: bool) -> MismatchDisplay<'_> {
        MismatchDisplay {
            mismatch: self,
            colorize,
        }
    }
}

/// Overrides the `Display` implementation of [`Mismatch`] to support controlling colorization.
pub struct MismatchDisplay<'a> {
    mismatch: &'a Mismatch,
    colorize: bool,
}

impl Display for MismatchDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.colorize {
            return write!(f, "{}", self.mismatch);
        }
        match self.mismatch {
            Mismatch::ErrorMismatch { expected, actual } => write!(
                f,
                "statement is expected to fail with error:\n\t{}\nbut got error:\n\t{}",
                expected.bright_green(),
                actual.bright_red(),
            ),
            Mismatch::Rows {
                difference,
                expected,
                actual,
            } => write!(
                f,
                "query result mismatch: {difference}\n[Diff] ({}|{})\n{}",
                "-expected".bright_red(),
                "+actual".bright_green(),
                format_diff(expected, actual, true)
            ),
            m => write!(f, "{m}"),
        }
    }
}

fn render_rows(rows: &[Row]) -> String {
    rows.iter()
        .map(|row| row.iter().map(Value::to_fixture_text).join("\t"))
        .join("\n")
}

fn format_diff(expected: &[Row], actual: &[Row], colorize: bool) -> String {
    let expected = render_rows(expected);
    let actual = render_rows(actual);
    let diff = TextDiff::from_lines(&expected, &actual);
    diff.iter_all_changes()
        .map(|change| {
            let line = change.value().trim_end_matches('\n');
            match change.tag() {
                ChangeTag::Equal => format!("    {line}"),
                ChangeTag::Delete if colorize => format!("-   {line}").bright_red().to_string(),
                ChangeTag::Delete => format!("-   {line}"),
                ChangeTag::Insert if colorize => format!("+   {line}").bright_green().to_string(),
                ChangeTag::Insert => format!("+   {line}"),
            }
        })
        .join("\n")
}

/// Judges actual outcomes against expectations.
///
/// Comparison is a pure function of its inputs.
#[derive(Debug, Clone, Copy)]
pub struct Comparator {
    error_matcher: ErrorMatcher,
}

impl Default for Comparator {
    fn default() -> Self {
        Comparator::new(default_error_matcher)
    }
}

impl Comparator {
    pub fn new(error_matcher: ErrorMatcher) -> Self {
        Comparator { error_matcher }
    }

    /// Compares the outcome of `statement` against its own expectation.
    pub fn compare(&self, statement: &Statement, actual: &ActualOutcome) -> Verdict {
        self.check(
            &statement.expected,
            statement.order,
            statement.normalize,
            actual,
        )
    }

    /// Compares an outcome against an explicit expectation.
    pub fn check(
        &self,
        expected: &Expectation,
        order: RowOrder,
        normalize: bool,
        actual: &ActualOutcome,
    ) -> Verdict {
        match (expected, actual) {
            (Expectation::None, _) => Verdict::Pass,
            (Expectation::Error(expected), ActualOutcome::Error(error)) => {
                if (self.error_matcher)(expected, &error.message) {
                    Verdict::Pass
                } else {
                    Verdict::Fail(Mismatch::ErrorMismatch {
                        expected: expected.clone(),
                        actual: error.clone(),
                    })
                }
            }
            (Expectation::Error(expected), _) => Verdict::Fail(Mismatch::UnexpectedSuccess {
                expected: expected.clone(),
            }),
            (Expectation::Rows(_), ActualOutcome::Error(error)) => {
                Verdict::Fail(Mismatch::UnexpectedError {
                    error: error.clone(),
                })
            }
            (Expectation::Rows(expected), actual) => {
                match first_difference(expected, actual.rows(), order, normalize) {
                    None => Verdict::Pass,
                    Some(difference) => Verdict::Fail(Mismatch::Rows {
                        difference,
                        expected: expected.clone(),
                        actual: actual.rows().to_vec(),
                    }),
                }
            }
        }
    }
}

fn sorted(rows: &[Row]) -> Vec<Row> {
    rows.iter()
        .cloned()
        .sorted_by_cached_key(|row| row.iter().map(Value::sort_key).collect_vec())
        .collect()
}

/// Finds the first differing row or column.
fn first_difference(
    expected: &[Row],
    actual: &[Row],
    order: RowOrder,
    normalize: bool,
) -> Option<RowDifference> {
    let (expected, actual): (Cow<'_, [Row]>, Cow<'_, [Row]>) = match order {
        RowOrder::Ordered => (expected.into(), actual.into()),
        RowOrder::Unordered => (sorted(expected).into(), sorted(actual).into()),
    };

    for (row, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
        if e.len() != a.len() {
            return Some(RowDifference::ColumnCount {
                row,
                expected: e.len(),
                actual: a.len(),
            });
        }
        for (column, (ev, av)) in e.iter().zip(a).enumerate() {
            let equal = if normalize { ev.loosely_eq(av) } else { ev == av };
            if !equal {
                return Some(RowDifference::Value {
                    row,
                    column,
                    expected: ev.clone(),
                    actual: av.clone(),
                });
            }
        }
    }

    (expected.len() != actual.len()).then(|| RowDifference::RowCount {
        expected: expected.len(),
        actual: actual.len(),
    })
}
