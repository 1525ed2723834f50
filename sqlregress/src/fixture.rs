//! Fixture data model.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use educe::Educe;

use crate::session::is_aborted_transaction_error;
use crate::{Location, Row};

/// Unique identifier of a fixture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FixtureName(Arc<str>);

impl FixtureName {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        FixtureName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FixtureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for FixtureName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for FixtureName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FixtureName {
    fn from(name: &str) -> Self {
        FixtureName::new(name)
    }
}

impl From<String> for FixtureName {
    fn from(name: String) -> Self {
        FixtureName::new(name)
    }
}

/// What a statement is expected to produce.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Expectation {
    /// Executed for its side effects only.
    #[default]
    None,
    /// The statement must fail with an error matching this text.
    Error(String),
    /// The statement must succeed and return exactly these rows.
    Rows(Vec<Row>),
}

/// Whether expected rows must be returned in the recorded order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowOrder {
    /// Rows are compared position by position.
    #[default]
    Ordered,
    /// Both sides are sorted before comparing.
    Unordered,
}

/// A single statement of a fixture, together with its expectation.
#[derive(Debug, Clone, Educe)]
#[educe(PartialEq)]
pub struct Statement {
    /// The SQL text. Bulk-load statements carry their inline payload after the
    /// command, terminated by a `\.` line.
    pub sql: String,
    pub expected: Expectation,
    pub order: RowOrder,
    /// When false, values must match variant for variant.
    pub normalize: bool,
    /// Skipped statements are never sent to the engine.
    pub skip: bool,
    #[educe(PartialEq(ignore))]
    pub loc: Option<Location>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Statement {
            sql: sql.into(),
            expected: Expectation::None,
            order: RowOrder::Ordered,
            normalize: true,
            skip: false,
            loc: None,
        }
    }

    #[must_use]
    pub fn expect_error(mut self, message: impl Into<String>) -> Self {
        self.expected = Expectation::Error(message.into());
        self
    }

    #[must_use]
    pub fn expect_rows(mut self, rows: impl IntoIterator<Item = Row>) -> Self {
        self.expected = Expectation::Rows(rows.into_iter().collect());
        self
    }

    #[must_use]
    pub fn unordered(mut self) -> Self {
        self.order = RowOrder::Unordered;
        self
    }

    /// Disables value normalization.
    #[must_use]
    pub fn raw(mut self) -> Self {
        self.normalize = false;
        self
    }

    #[must_use]
    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    #[must_use]
    pub(crate) fn at(mut self, loc: Location) -> Self {
        self.loc = Some(loc);
        self
    }

    /// Returns whether the statement itself expects the aborted-transaction error.
    pub fn expects_aborted_transaction(&self) -> bool {
        matches!(&self.expected, Expectation::Error(e) if is_aborted_transaction_error(e))
    }
}

/// The persisted form of a statement: `{ Statement, ErrorString, Results }`.
///
/// An empty `error_string` means no error is expected, as in the recorded
/// regression files.
#[derive(Debug, Clone, Default)]
pub struct StatementRecord {
    pub statement: String,
    pub error_string: Option<String>,
    pub results: Option<Vec<Row>>,
}

/// A record declares both an expected error and expected rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("statement declares both an expected error and expected rows")]
pub struct ConflictingExpectations;

impl TryFrom<StatementRecord> for Statement {
    type Error = ConflictingExpectations;

    fn try_from(record: StatementRecord) -> Result<Self, Self::Error> {
        let statement = Statement::new(record.statement);
        let error_string = record.error_string.filter(|e| !e.is_empty());
        match (error_string, record.results) {
            (Some(_), Some(_)) => Err(ConflictingExpectations),
            (Some(err), None) => Ok(statement.expect_error(err)),
            (None, Some(rows)) => Ok(statement.expect_rows(rows)),
            (None, None) => Ok(statement),
        }
    }
}

/// A named, ordered list of statements with declared prerequisites.
///
/// Fixtures are immutable once registered in a [`Registry`](crate::Registry).
#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    name: FixtureName,
    depends_on: Vec<FixtureName>,
    statements: Vec<Statement>,
}

impl Fixture {
    pub fn new(name: impl Into<FixtureName>) -> Self {
        Fixture {
            name: name.into(),
            depends_on: vec![],
            statements: vec![],
        }
    }

    /// Builds a fixture from persisted statement records.
    pub fn from_records(
        name: impl Into<FixtureName>,
        depends_on: impl IntoIterator<Item = impl Into<FixtureName>>,
        records: impl IntoIterator<Item = StatementRecord>,
    ) -> Result<Self, crate::HarnessError> {
        let mut fixture = Fixture::new(name).depends_on(depends_on);
        for (index, record) in records.into_iter().enumerate() {
            let statement =
                Statement::try_from(record).map_err(|e| crate::HarnessError::InvalidFixture {
                    name: fixture.name.clone(),
                    reason: format!("statement #{index}: {e}"),
                })?;
            fixture.statements.push(statement);
        }
        Ok(fixture)
    }

    /// Adds prerequisites. Declaration order is kept and repeats are ignored.
    #[must_use]
    pub fn depends_on(mut self, names: impl IntoIterator<Item = impl Into<FixtureName>>) -> Self {
        for name in names {
            let name = name.into();
            if !self.depends_on.contains(&name) {
                self.depends_on.push(name);
            }
        }
        self
    }

    #[must_use]
    pub fn statement(mut self, statement: Statement) -> Self {
        self.statements.push(statement);
        self
    }

    #[must_use]
    pub fn with_statements(mut self, statements: impl IntoIterator<Item = Statement>) -> Self {
        self.statements.extend(statements);
        self
    }

    pub fn name(&self) -> &FixtureName {
        &self.name
    }

    pub fn dependencies(&self) -> &[FixtureName] {
        &self.depends_on
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }
}
