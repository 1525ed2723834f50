//! Fixture replay against one engine session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::executor::block_on;
use futures::future::{select, Either};

use crate::session::{split_copy_payload, SessionCommand, SessionState, ABORTED_TRANSACTION_ERROR};
use crate::substitution::Substitution;
use crate::{ActualOutcome, ErrorInfo, Expectation, Fixture, HarnessError, Row, Statement};

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutput {
    Rows { rows: Vec<Row> },
    /// A statement has completed without a result set.
    ///
    /// The number of rows modified is returned, and ignored by the comparison.
    StatementComplete(u64),
}

/// The async engine to be tested.
#[async_trait]
pub trait AsyncEngine: Send {
    /// The error type of SQL execution.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Async run a SQL statement and return the output.
    async fn run(&mut self, sql: &str) -> Result<EngineOutput, Self::Error>;

    /// Runs a `COPY ... FROM STDIN` command, feeding it `data` as the input stream.
    ///
    /// The default implementation sends the command and the payload as one
    /// text, terminated by `\.`.
    async fn copy_in(&mut self, command: &str, data: &str) -> Result<EngineOutput, Self::Error> {
        let sql = format!("{command}\n{data}\\.");
        self.run(&sql).await
    }

    /// Engine name of current database.
    fn engine_name(&self) -> &str {
        ""
    }

    /// Extracts the message and context chain of an error.
    fn describe_error(&self, err: &Self::Error) -> ErrorInfo {
        ErrorInfo::from_error(err)
    }

    /// Whether `err` means the session is unusable, e.g. the connection is lost.
    ///
    /// Such errors abort the whole run.
    fn is_connection_fault(&self, _err: &Self::Error) -> bool {
        false
    }

    /// [`SessionRunner`] calls this function to wait for the run timeout.
    ///
    /// The default implementation is `std::thread::sleep`, which is universal to any async runtime
    /// but would block the current thread. If you are running in tokio runtime, you should override
    /// this by `tokio::time::sleep`.
    async fn sleep(dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// The engine to be tested.
pub trait Engine: Send {
    /// The error type of SQL execution.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Run a SQL statement and return the output.
    fn run(&mut self, sql: &str) -> Result<EngineOutput, Self::Error>;

    /// See [`AsyncEngine::copy_in`].
    fn copy_in(&mut self, command: &str, data: &str) -> Result<EngineOutput, Self::Error> {
        self.run(&format!("{command}\n{data}\\."))
    }

    /// Engine name of current database.
    fn engine_name(&self) -> &str {
        ""
    }

    /// See [`AsyncEngine::describe_error`].
    fn describe_error(&self, err: &Self::Error) -> ErrorInfo {
        ErrorInfo::from_error(err)
    }

    /// See [`AsyncEngine::is_connection_fault`].
    fn is_connection_fault(&self, _err: &Self::Error) -> bool {
        false
    }
}

/// Compat-layer for the new AsyncEngine and Engine trait
#[async_trait]
impl<E> AsyncEngine for E
where
    E: Engine,
{
    type Error = <E as Engine>::Error;

    async fn run(&mut self, sql: &str) -> Result<EngineOutput, Self::Error> {
        <E as Engine>::run(self, sql)
    }

    async fn copy_in(&mut self, command: &str, data: &str) -> Result<EngineOutput, Self::Error> {
        <E as Engine>::copy_in(self, command, data)
    }

    fn engine_name(&self) -> &str {
        <E as Engine>::engine_name(self)
    }

    fn describe_error(&self, err: &Self::Error) -> ErrorInfo {
        <E as Engine>::describe_error(self, err)
    }

    fn is_connection_fault(&self, err: &Self::Error) -> bool {
        <E as Engine>::is_connection_fault(self, err)
    }
}

/// The point in time at which a run times out.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    timeout: Duration,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline {
            start: Instant::now(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// What happened to one statement of a fixture.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementOutcome {
    /// Position of the statement in its fixture.
    pub index: usize,
    /// The statement as executed: variables substituted, and the expectation
    /// replaced by the aborted-transaction error when `aborted` is set.
    pub statement: Statement,
    /// The statement ran inside an aborted transaction.
    pub aborted: bool,
    /// `None` if the statement was skipped.
    pub actual: Option<ActualOutcome>,
}

/// Replays fixtures statement by statement, keeping [`SessionState`] in step
/// with the engine's session.
#[derive(Clone)]
pub struct SessionRunner {
    strict: bool,
    substitution: Option<Arc<Substitution>>,
    deadline: Option<Deadline>,
}

impl Default for SessionRunner {
    fn default() -> Self {
        SessionRunner::new()
    }
}

impl SessionRunner {
    pub fn new() -> Self {
        SessionRunner {
            strict: true,
            substitution: None,
            deadline: None,
        }
    }

    /// Whether `COMMIT`/`ROLLBACK` with no open transaction fails the run
    /// instead of being forwarded to the engine. Enabled by default.
    pub fn with_strict_session(&mut self, strict: bool) {
        self.strict = strict;
    }

    /// Expand `$__TEST_DIR__` and environment variables in SQL.
    ///
    /// This feature is useful in those fixtures where data will be read from or written to local
    /// files, e.g. `COPY`.
    pub fn enable_substitution(&mut self) {
        self.substitution = Some(Arc::new(Substitution::default()));
    }

    pub fn with_deadline(&mut self, deadline: Deadline) {
        self.deadline = Some(deadline);
    }

    /// Runs every statement of `fixture` in order, returning one outcome per statement.
    pub async fn run_async<E: AsyncEngine>(
        &self,
        fixture: &Fixture,
        session: &mut SessionState,
        engine: &mut E,
    ) -> Result<Vec<StatementOutcome>, HarnessError> {
        let mut outcomes = Vec::with_capacity(fixture.statements().len());
        for (index, statement) in fixture.statements().iter().enumerate() {
            let outcome = self
                .run_statement(fixture, index, statement, session, engine)
                .await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// sync version of `run_async`
    pub fn run<E: AsyncEngine>(
        &self,
        fixture: &Fixture,
        session: &mut SessionState,
        engine: &mut E,
    ) -> Result<Vec<StatementOutcome>, HarnessError> {
        block_on(self.run_async(fixture, session, engine))
    }

    async fn run_statement<E: AsyncEngine>(
        &self,
        fixture: &Fixture,
        index: usize,
        statement: &Statement,
        session: &mut SessionState,
        engine: &mut E,
    ) -> Result<StatementOutcome, HarnessError> {
        let name = fixture.name();
        if statement.skip {
            tracing::debug!(fixture = %name, index, "skipping statement");
            return Ok(StatementOutcome {
                index,
                statement: statement.clone(),
                aborted: false,
                actual: None,
            });
        }

        let sql = match &self.substitution {
            Some(substitution) => substitution.substitute(&statement.sql).map_err(|reason| {
                HarnessError::InvalidFixture {
                    name: name.clone(),
                    reason: format!("statement #{index}: {reason}"),
                }
            })?,
            None => statement.sql.clone(),
        };

        let command = SessionCommand::classify(&sql);
        if self.strict && !matches!(statement.expected, Expectation::Error(_)) {
            session
                .check(&command)
                .map_err(|misuse| HarnessError::SessionMisuse {
                    fixture: name.clone(),
                    index,
                    sql: sql.clone(),
                    misuse,
                })?;
        }

        let aborted = session.transaction_aborted() && !command.is_recovery();
        let mut effective = statement.clone();
        if aborted && !statement.expects_aborted_transaction() {
            effective.expected = Expectation::Error(ABORTED_TRANSACTION_ERROR.to_string());
        }

        tracing::debug!(fixture = %name, index, sql = %sql, aborted, "executing statement");
        let result = match self.execute(engine, &sql).await {
            Some(result) => result,
            None => {
                let timeout = self.deadline.map(|d| d.timeout()).unwrap_or_default();
                tracing::error!(fixture = %name, index, sql = %sql, "run timed out");
                return Err(HarnessError::Timeout {
                    fixture: name.clone(),
                    index,
                    sql,
                    timeout,
                });
            }
        };

        let actual = match result {
            Ok(EngineOutput::Rows { rows }) => ActualOutcome::Rows(rows),
            Ok(EngineOutput::StatementComplete(count)) => ActualOutcome::Complete(count),
            Err(err) => {
                let info = engine.describe_error(&err);
                if engine.is_connection_fault(&err) {
                    tracing::error!(fixture = %name, index, sql = %sql, error = %info, "connection fault");
                    return Err(HarnessError::ConnectionFault {
                        fixture: name.clone(),
                        index,
                        sql,
                        message: info.to_string(),
                    });
                }
                ActualOutcome::Error(info)
            }
        };

        session.apply(&command, !actual.is_error());
        effective.sql = sql;
        Ok(StatementOutcome {
            index,
            statement: effective,
            aborted,
            actual: Some(actual),
        })
    }

    /// Sends `sql` to the engine. Returns `None` if the deadline passes first.
    async fn execute<E: AsyncEngine>(
        &self,
        engine: &mut E,
        sql: &str,
    ) -> Option<Result<EngineOutput, E::Error>> {
        let run = async {
            match split_copy_payload(sql) {
                Some(payload) => engine.copy_in(payload.command, payload.data).await,
                None => engine.run(sql).await,
            }
        };
        let Some(deadline) = self.deadline else {
            return Some(run.await);
        };
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return None;
        }
        match select(Box::pin(run), E::sleep(remaining)).await {
            Either::Left((result, _)) => Some(result),
            Either::Right(_) => None,
        }
    }
}
