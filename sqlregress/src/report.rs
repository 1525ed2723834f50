//! Run results.

use std::fmt::{self, Display};

use owo_colors::OwoColorize;

use crate::{Expectation, FixtureName, Location, Mismatch};

/// A statement whose outcome did not meet its expectation.
///
/// For colored output, use `self.display()`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementFailure {
    pub fixture: FixtureName,
    pub index: usize,
    pub sql: String,
    /// The expectation the statement was judged against.
    pub expected: Expectation,
    /// The statement ran inside an aborted transaction.
    pub aborted: bool,
    pub mismatch: Mismatch,
    pub loc: Option<Location>,
}

impl StatementFailure {
    pub fn display(&self, colorize: bool) -> StatementFailureDisplay<'_> {
        StatementFailureDisplay {
            failure: self,
            colorize,
        }
    }
}

impl Display for StatementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.display(false).fmt(f)
    }
}

/// Overrides the `Display` implementation of [`StatementFailure`] to support controlling colorization.
pub struct StatementFailureDisplay<'a> {
    failure: &'a StatementFailure,
    colorize: bool,
}

impl Display for StatementFailureDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failure = self.failure;
        let header = format!(
            "fixture `{}` statement #{} failed",
            failure.fixture, failure.index
        );
        if self.colorize {
            writeln!(f, "{}", header.bold())?;
        } else {
            writeln!(f, "{header}")?;
        }
        writeln!(f, "{}", failure.mismatch.display(self.colorize))?;
        if failure.aborted {
            writeln!(f, "(the statement ran inside an aborted transaction)")?;
        }
        write!(f, "[SQL] {}", failure.sql)?;
        if let Some(loc) = &failure.loc {
            write!(f, "\nat {loc}")?;
        }
        Ok(())
    }
}

/// Per-fixture tracker of statement indices.
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureReport {
    pub name: FixtureName,
    pub passed: Vec<usize>,
    pub skipped: Vec<usize>,
    pub failures: Vec<StatementFailure>,
}

impl FixtureReport {
    pub fn new(name: FixtureName) -> Self {
        FixtureReport {
            name,
            passed: vec![],
            skipped: vec![],
            failures: vec![],
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Indices of the failed statements.
    pub fn failed(&self) -> impl Iterator<Item = usize> + '_ {
        self.failures.iter().map(|f| f.index)
    }
}

/// Statement counts over a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Totals {
    pub fixtures: usize,
    pub passed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Display for Totals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} fixtures: {} passed, {} skipped, {} failed",
            self.fixtures, self.passed, self.skipped, self.failed
        )
    }
}

/// The verified fixtures of a run, in execution order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunReport {
    pub fixtures: Vec<FixtureReport>,
    /// The run was cancelled before the plan completed.
    pub cancelled: bool,
}

impl RunReport {
    /// No statement failed and the run was not cancelled.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.fixtures.iter().all(FixtureReport::is_success)
    }

    pub fn fixture(&self, name: &str) -> Option<&FixtureReport> {
        self.fixtures.iter().find(|f| f.name.as_str() == name)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StatementFailure> {
        self.fixtures.iter().flat_map(|f| &f.failures)
    }

    pub fn totals(&self) -> Totals {
        self.fixtures.iter().fold(
            Totals {
                fixtures: self.fixtures.len(),
                ..Totals::default()
            },
            |mut totals, f| {
                totals.passed += f.passed.len();
                totals.skipped += f.skipped.len();
                totals.failed += f.failures.len();
                totals
            },
        )
    }

    /// Appends the fixtures of `other`.
    pub fn merge(&mut self, other: RunReport) {
        self.fixtures.extend(other.fixtures);
        self.cancelled |= other.cancelled;
    }

    pub fn display(&self, colorize: bool) -> RunReportDisplay<'_> {
        RunReportDisplay {
            report: self,
            colorize,
        }
    }
}

/// Lists every failure followed by the totals.
pub struct RunReportDisplay<'a> {
    report: &'a RunReport,
    colorize: bool,
}

impl Display for RunReportDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for failure in self.report.failures() {
            writeln!(f, "{}\n", failure.display(self.colorize))?;
        }
        if self.report.cancelled {
            writeln!(f, "run cancelled")?;
        }
        let totals = self.report.totals();
        match (self.colorize, totals.failed) {
            (true, 0) => write!(f, "{}", totals.green()),
            (true, _) => write!(f, "{}", totals.red()),
            (false, _) => write!(f, "{totals}"),
        }
    }
}
