//! Fatal harness errors.

use std::time::Duration;

use itertools::Itertools;

use crate::{FixtureName, ParseError, SessionMisuse};

/// An error that aborts the whole run.
///
/// Statement-level assertion failures are not errors; they are recorded in
/// the [`RunReport`](crate::RunReport) and the run continues.
#[derive(thiserror::Error, Debug, Clone)]
pub enum HarnessError {
    #[error("fixture `{name}` is registered more than once")]
    DuplicateFixture { name: FixtureName },
    #[error("unknown fixture `{name}`{}", display_referrer(.referenced_by))]
    UnknownFixture {
        name: FixtureName,
        referenced_by: Option<FixtureName>,
    },
    #[error("dependency cycle detected: {}", display_cycle(.cycle))]
    CycleDetected { cycle: Vec<FixtureName> },
    #[error("invalid fixture `{name}`: {reason}")]
    InvalidFixture { name: FixtureName, reason: String },
    #[error("session misuse in fixture `{fixture}` at statement #{index}: {misuse}\n[SQL] {sql}")]
    SessionMisuse {
        fixture: FixtureName,
        index: usize,
        sql: String,
        misuse: SessionMisuse,
    },
    #[error("connection fault in fixture `{fixture}` at statement #{index}: {message}\n[SQL] {sql}")]
    ConnectionFault {
        fixture: FixtureName,
        index: usize,
        sql: String,
        message: String,
    },
    #[error("failed to connect to the engine: {message}")]
    Connect { message: String },
    #[error(
        "run timed out after {} in fixture `{fixture}` at statement #{index}\n[SQL] {sql}",
        display_duration(.timeout)
    )]
    Timeout {
        fixture: FixtureName,
        index: usize,
        sql: String,
        timeout: Duration,
    },
    #[error("invalid value {value:?} for {key}: {message}")]
    Config {
        key: &'static str,
        value: String,
        message: String,
    },
    #[error("failed to load fixtures from {path}: {message}")]
    Load { path: String, message: String },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

fn display_referrer(referenced_by: &Option<FixtureName>) -> String {
    match referenced_by {
        Some(name) => format!(" (required by `{name}`)"),
        None => String::new(),
    }
}

fn display_duration(timeout: &Duration) -> String {
    humantime::format_duration(*timeout).to_string()
}

fn display_cycle(cycle: &[FixtureName]) -> String {
    cycle.iter().chain(cycle.first()).join(" -> ")
}
