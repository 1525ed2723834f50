//! Run orchestration: resolve a plan, replay it, judge every statement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::executor::block_on;
use futures::{stream, StreamExt};
use itertools::Itertools;

use crate::connection::Connections;
use crate::resolver::{ExecutionPlan, Resolver};
use crate::runner::{Deadline, SessionRunner, StatementOutcome};
use crate::{
    Comparator, ErrorMatcher, Fixture, FixtureName, FixtureReport, HarnessError, MakeConnection,
    Registry, RunReport, StatementFailure, Verdict,
};

/// How sessions are shared between the fixtures of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionScope {
    /// One cumulative session for the whole plan.
    #[default]
    Shared,
    /// A fresh connection and session state for every fixture.
    PerFixture,
}

/// Settings of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Stop after the first fixture with a failing statement.
    pub fail_fast: bool,
    /// Whole-run timeout.
    pub timeout: Option<Duration>,
    /// Judge dependencies too. When false, dependencies run for their side
    /// effects only and only the requested roots are reported.
    pub verify_dependencies: bool,
    /// Fail the run on `COMMIT`/`ROLLBACK` with no open transaction.
    pub strict_session: bool,
    pub session_scope: SessionScope,
    /// Expand `$__TEST_DIR__` and environment variables in SQL.
    pub substitution: bool,
    /// The role a fresh session starts with.
    pub session_role: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            fail_fast: false,
            timeout: None,
            verify_dependencies: true,
            strict_session: true,
            session_scope: SessionScope::Shared,
            substitution: false,
            session_role: "postgres".to_string(),
        }
    }
}

impl RunOptions {
    pub const FAIL_FAST: &'static str = "SQLREGRESS_FAIL_FAST";
    pub const TIMEOUT: &'static str = "SQLREGRESS_TIMEOUT";
    pub const VERIFY_DEPENDENCIES: &'static str = "SQLREGRESS_VERIFY_DEPENDENCIES";
    pub const STRICT_SESSION: &'static str = "SQLREGRESS_STRICT_SESSION";
    pub const SESSION_SCOPE: &'static str = "SQLREGRESS_SESSION_SCOPE";
    pub const SUBSTITUTION: &'static str = "SQLREGRESS_SUBSTITUTION";
    pub const SESSION_ROLE: &'static str = "SQLREGRESS_SESSION_ROLE";

    /// Reads options from `SQLREGRESS_*` environment variables, falling back
    /// to the defaults for unset ones.
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Like [`RunOptions::from_env`], reading variables through `get`.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, HarnessError> {
        let mut options = RunOptions::default();
        if let Some(v) = get(Self::FAIL_FAST) {
            options.fail_fast = parse_bool(Self::FAIL_FAST, v)?;
        }
        if let Some(v) = get(Self::TIMEOUT) {
            let timeout = humantime::parse_duration(v.trim()).map_err(|e| HarnessError::Config {
                key: Self::TIMEOUT,
                message: e.to_string(),
                value: v,
            })?;
            options.timeout = Some(timeout);
        }
        if let Some(v) = get(Self::VERIFY_DEPENDENCIES) {
            options.verify_dependencies = parse_bool(Self::VERIFY_DEPENDENCIES, v)?;
        }
        if let Some(v) = get(Self::STRICT_SESSION) {
            options.strict_session = parse_bool(Self::STRICT_SESSION, v)?;
        }
        if let Some(v) = get(Self::SESSION_SCOPE) {
            options.session_scope = match v.trim().to_ascii_lowercase().as_str() {
                "shared" => SessionScope::Shared,
                "per-fixture" | "per_fixture" => SessionScope::PerFixture,
                _ => {
                    return Err(HarnessError::Config {
                        key: Self::SESSION_SCOPE,
                        value: v,
                        message: "expected `shared` or `per-fixture`".to_string(),
                    })
                }
            };
        }
        if let Some(v) = get(Self::SUBSTITUTION) {
            options.substitution = parse_bool(Self::SUBSTITUTION, v)?;
        }
        if let Some(v) = get(Self::SESSION_ROLE) {
            options.session_role = v;
        }
        Ok(options)
    }
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, HarnessError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(HarnessError::Config {
            key,
            value,
            message: "expected a boolean".to_string(),
        }),
    }
}

/// Cancels a run between fixtures.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives fixture runs against connections made by `M`.
pub struct Orchestrator<M: MakeConnection> {
    registry: Arc<Registry>,
    make_conn: M,
    options: RunOptions,
    comparator: Comparator,
    cancel: CancelHandle,
}

impl<M: MakeConnection> Orchestrator<M> {
    pub fn new(registry: Arc<Registry>, make_conn: M) -> Self {
        Orchestrator {
            registry,
            make_conn,
            options: RunOptions::default(),
            comparator: Comparator::default(),
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_options(&mut self, options: RunOptions) {
        self.options = options;
    }

    pub fn with_error_matcher(&mut self, error_matcher: ErrorMatcher) {
        self.comparator = Comparator::new(error_matcher);
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// A handle that stops the run before the next fixture starts.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run a fixture after its dependencies.
    pub async fn run_fixture_async(&mut self, name: &str) -> Result<RunReport, HarnessError> {
        self.run_fixtures_async([name]).await
    }

    /// Run a fixture after its dependencies.
    pub fn run_fixture(&mut self, name: &str) -> Result<RunReport, HarnessError> {
        block_on(self.run_fixture_async(name))
    }

    /// Run several fixtures on one combined plan, in which each fixture runs once.
    pub async fn run_fixtures_async(
        &mut self,
        names: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<RunReport, HarnessError> {
        let roots = names
            .into_iter()
            .map(|n| FixtureName::from(n.as_ref()))
            .collect_vec();
        let plan = Resolver::new(&self.registry).resolve_many(&roots)?;
        tracing::info!(%plan, "starting run");

        let halted = AtomicBool::new(false);
        let executor = PlanExecutor {
            registry: &self.registry,
            options: &self.options,
            comparator: self.comparator,
            runner: session_runner(&self.options),
            cancel: &self.cancel,
            halted: &halted,
        };
        executor.execute(&mut self.make_conn, &plan, &roots).await
    }

    /// sync version of `run_fixtures_async`
    pub fn run_fixtures(
        &mut self,
        names: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<RunReport, HarnessError> {
        block_on(self.run_fixtures_async(names))
    }

    /// Run every registered fixture.
    pub async fn run_all_async(&mut self) -> Result<RunReport, HarnessError> {
        let names = self.registry.names().cloned().collect_vec();
        self.run_fixtures_async(names).await
    }

    /// sync version of `run_all_async`
    pub fn run_all(&mut self) -> Result<RunReport, HarnessError> {
        block_on(self.run_all_async())
    }
}

impl<M: MakeConnection + Clone> Orchestrator<M> {
    /// Runs independent roots concurrently, `jobs` at a time.
    ///
    /// Every root gets its own plan and its own connection, so dependencies
    /// shared between roots run once per root. Reports are merged in root
    /// order. All plans are resolved before any statement runs.
    pub async fn run_parallel_async(
        &self,
        names: impl IntoIterator<Item = impl AsRef<str>>,
        jobs: usize,
    ) -> Result<RunReport, HarnessError> {
        let resolver = Resolver::new(&self.registry);
        let roots = names
            .into_iter()
            .map(|n| FixtureName::from(n.as_ref()))
            .collect_vec();
        let plans: Vec<ExecutionPlan> = roots
            .iter()
            .map(|root| resolver.resolve(root.as_str()))
            .try_collect()?;
        tracing::info!(roots = roots.len(), jobs, "starting parallel run");

        let halted = AtomicBool::new(false);
        let executor = PlanExecutor {
            registry: &self.registry,
            options: &self.options,
            comparator: self.comparator,
            runner: session_runner(&self.options),
            cancel: &self.cancel,
            halted: &halted,
        };

        let tasks = roots.iter().zip(&plans).map(|(root, plan)| {
            let mut make_conn = self.make_conn.clone();
            let executor = &executor;
            async move {
                let result = executor
                    .execute(&mut make_conn, plan, std::slice::from_ref(root))
                    .await;
                if result.is_err() {
                    executor.halted.store(true, Ordering::SeqCst);
                }
                result
            }
        });
        let results: Vec<_> = stream::iter(tasks).buffered(jobs.max(1)).collect().await;

        let mut report = RunReport::default();
        for result in results {
            report.merge(result?);
        }
        Ok(report)
    }

    /// sync version of `run_parallel_async`
    pub fn run_parallel(
        &self,
        names: impl IntoIterator<Item = impl AsRef<str>>,
        jobs: usize,
    ) -> Result<RunReport, HarnessError> {
        block_on(self.run_parallel_async(names, jobs))
    }
}

fn session_runner(options: &RunOptions) -> SessionRunner {
    let mut runner = SessionRunner::new();
    runner.with_strict_session(options.strict_session);
    if options.substitution {
        runner.enable_substitution();
    }
    if let Some(timeout) = options.timeout {
        runner.with_deadline(Deadline::after(timeout));
    }
    runner
}

/// Everything a plan run needs, borrowed from the orchestrator.
struct PlanExecutor<'a> {
    registry: &'a Registry,
    options: &'a RunOptions,
    comparator: Comparator,
    runner: SessionRunner,
    cancel: &'a CancelHandle,
    /// Set by fail-fast or a fatal error in a concurrent plan.
    halted: &'a AtomicBool,
}

impl PlanExecutor<'_> {
    async fn execute<M: MakeConnection>(
        &self,
        make_conn: &mut M,
        plan: &ExecutionPlan,
        roots: &[FixtureName],
    ) -> Result<RunReport, HarnessError> {
        let mut connections = Connections::new(make_conn, &self.options.session_role);
        let mut report = RunReport::default();

        for name in plan {
            if self.cancel.is_cancelled() {
                tracing::warn!(fixture = %name, "run cancelled");
                report.cancelled = true;
                break;
            }
            if self.halted.load(Ordering::SeqCst) {
                break;
            }

            let fixture = self.registry.lookup(name.as_str())?;
            if self.options.session_scope == SessionScope::PerFixture {
                connections.reset();
            }
            let (conn, session) = connections.get().await?;

            tracing::info!(fixture = %name, statements = fixture.statements().len(), "running fixture");
            let outcomes = self.runner.run_async(fixture, session, conn).await?;

            if !self.options.verify_dependencies && !roots.contains(name) {
                tracing::debug!(fixture = %name, "dependency ran for side effects only");
                continue;
            }
            let fixture_report = self.judge(fixture, outcomes);
            tracing::info!(
                fixture = %name,
                passed = fixture_report.passed.len(),
                skipped = fixture_report.skipped.len(),
                failed = fixture_report.failures.len(),
                "fixture finished"
            );
            let failed = !fixture_report.is_success();
            report.fixtures.push(fixture_report);

            if failed && self.options.fail_fast {
                tracing::warn!(fixture = %name, "stopping after first failing fixture");
                self.halted.store(true, Ordering::SeqCst);
                break;
            }
        }
        Ok(report)
    }

    fn judge(&self, fixture: &Fixture, outcomes: Vec<StatementOutcome>) -> FixtureReport {
        let mut report = FixtureReport::new(fixture.name().clone());
        for outcome in outcomes {
            let Some(actual) = &outcome.actual else {
                report.skipped.push(outcome.index);
                continue;
            };
            match self.comparator.compare(&outcome.statement, actual) {
                Verdict::Pass => report.passed.push(outcome.index),
                Verdict::Fail(mismatch) => {
                    tracing::warn!(
                        fixture = %fixture.name(),
                        index = outcome.index,
                        sql = %outcome.statement.sql,
                        "{mismatch}"
                    );
                    report.failures.push(StatementFailure {
                        fixture: fixture.name().clone(),
                        index: outcome.index,
                        sql: outcome.statement.sql,
                        expected: outcome.statement.expected,
                        aborted: outcome.aborted,
                        mismatch,
                        loc: outcome.statement.loc,
                    });
                }
            }
        }
        report
    }
}
