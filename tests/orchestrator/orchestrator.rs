use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fake_engine::{init_tracing, FakeEngine, FakeError, FakeServer};
use pretty_assertions::assert_eq;
use sqlregress::{
    exact_error_matcher, row, AsyncEngine, EngineOutput, Fixture, FixtureName, HarnessError,
    MakeWith, Orchestrator, Registry, RunOptions, SessionScope, Statement, Totals,
};

/// `create_t` <- `fill_t` <- `check_t`, plus a failing fixture and an
/// independent one.
fn registry() -> Arc<Registry> {
    let mut builder = Registry::builder();
    for fixture in [
        Fixture::new("create_t").statement(Statement::new("CREATE TABLE t(x int)")),
        Fixture::new("fill_t")
            .depends_on(["create_t"])
            .statement(Statement::new("INSERT INTO t VALUES (1), (2)")),
        Fixture::new("check_t").depends_on(["fill_t"]).statement(
            Statement::new("SELECT * FROM t")
                .expect_rows([row![2], row![1]])
                .unordered(),
        ),
        Fixture::new("broken").with_statements([
            Statement::new("SELECT 1").expect_rows([row![2]]),
            Statement::new("SELECT 1/0").expect_error("division by zero"),
        ]),
        Fixture::new("standalone").statement(Statement::new("SELECT 'x'").expect_rows([row!["x"]])),
    ] {
        builder.register(fixture).unwrap();
    }
    Arc::new(builder.build())
}

fn fixture_names(report: &sqlregress::RunReport) -> Vec<&str> {
    report.fixtures.iter().map(|f| f.name.as_str()).collect()
}

#[test]
fn run_reports_every_fixture_of_the_plan() {
    init_tracing();
    let mut orchestrator = Orchestrator::new(registry(), MakeWith(FakeEngine::new));
    let report = orchestrator.run_fixture("check_t").unwrap();
    assert!(report.is_success(), "{}", report.display(false));
    assert_eq!(fixture_names(&report), vec!["create_t", "fill_t", "check_t"]);
    assert_eq!(
        report.totals(),
        Totals {
            fixtures: 3,
            passed: 3,
            skipped: 0,
            failed: 0,
        }
    );
}

#[test]
fn failures_do_not_stop_the_fixture() {
    init_tracing();
    let mut orchestrator = Orchestrator::new(registry(), MakeWith(FakeEngine::new));
    let report = orchestrator.run_fixtures(["broken", "standalone"]).unwrap();

    assert!(!report.is_success());
    let broken = report.fixture("broken").unwrap();
    assert_eq!(broken.failed().collect::<Vec<_>>(), vec![0]);
    assert_eq!(broken.passed, vec![1]);
    assert!(report.fixture("standalone").unwrap().is_success());

    let output = report.display(false).to_string();
    assert!(output.contains("fixture `broken` statement #0 failed"), "{output}");
    assert!(output.contains("[SQL] SELECT 1"), "{output}");
    assert!(output.contains("2 fixtures: 2 passed, 0 skipped, 1 failed"), "{output}");
}

#[test]
fn fail_fast_stops_after_failing_fixture() {
    let mut orchestrator = Orchestrator::new(registry(), MakeWith(FakeEngine::new));
    orchestrator.with_options(RunOptions {
        fail_fast: true,
        ..RunOptions::default()
    });
    let report = orchestrator.run_fixtures(["broken", "standalone"]).unwrap();
    assert_eq!(fixture_names(&report), vec!["broken"]);
    assert_eq!(report.fixture("broken").unwrap().failures.len(), 1);
}

#[test]
fn cancelled_run_executes_nothing() {
    let server = FakeServer::new();
    let mut orchestrator = Orchestrator::new(registry(), MakeWith(|| server.connect()));
    orchestrator.cancel_handle().cancel();

    let report = orchestrator.run_fixture("check_t").unwrap();
    assert!(report.cancelled);
    assert!(report.fixtures.is_empty());
    assert!(!report.is_success());
    assert_eq!(server.connections(), 0);
}

#[test]
fn unverified_dependencies_are_not_reported() {
    let mut builder = Registry::builder();
    builder
        .register(Fixture::new("setup").with_statements([
            Statement::new("CREATE TABLE t(x int)"),
            // Stale expectation in a dependency.
            Statement::new("SELECT * FROM t").expect_rows([row![42]]),
        ]))
        .unwrap();
    builder
        .register(
            Fixture::new("root")
                .depends_on(["setup"])
                .statement(Statement::new("SELECT * FROM t").expect_rows([])),
        )
        .unwrap();
    let registry = Arc::new(builder.build());

    let mut orchestrator = Orchestrator::new(registry.clone(), MakeWith(FakeEngine::new));
    assert!(!orchestrator.run_fixture("root").unwrap().is_success());

    orchestrator.with_options(RunOptions {
        verify_dependencies: false,
        ..RunOptions::default()
    });
    let report = orchestrator.run_fixture("root").unwrap();
    assert!(report.is_success(), "{}", report.display(false));
    assert_eq!(fixture_names(&report), vec!["root"]);
}

#[test]
fn expired_deadline_times_out() {
    let mut orchestrator = Orchestrator::new(registry(), MakeWith(FakeEngine::new));
    orchestrator.with_options(RunOptions {
        timeout: Some(Duration::ZERO),
        ..RunOptions::default()
    });
    let err = orchestrator.run_fixture("check_t").unwrap_err();
    assert!(
        matches!(&err, HarnessError::Timeout { fixture, index: 0, .. } if fixture.as_str() == "create_t"),
        "{err}"
    );
}

/// An engine on which `SLOW` never completes.
struct SlowEngine;

#[derive(Debug)]
struct SlowError;

impl std::fmt::Display for SlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slow engine error")
    }
}

impl std::error::Error for SlowError {}

#[async_trait]
impl AsyncEngine for SlowEngine {
    type Error = SlowError;

    async fn run(&mut self, sql: &str) -> Result<EngineOutput, Self::Error> {
        if sql == "SLOW" {
            std::future::pending::<()>().await;
        }
        Ok(EngineOutput::StatementComplete(0))
    }

    async fn sleep(dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

#[tokio::test]
async fn runaway_statement_times_out() {
    let mut builder = Registry::builder();
    builder
        .register(Fixture::new("f").with_statements([
            Statement::new("SELECT 1"),
            Statement::new("SLOW"),
            Statement::new("SELECT 2"),
        ]))
        .unwrap();
    let registry = Arc::new(builder.build());

    let mut orchestrator = Orchestrator::new(registry, || async { Ok::<_, SlowError>(SlowEngine) });
    orchestrator.with_options(RunOptions {
        timeout: Some(Duration::from_millis(200)),
        ..RunOptions::default()
    });
    let err = orchestrator.run_fixture_async("f").await.unwrap_err();
    assert!(
        matches!(&err, HarnessError::Timeout { fixture, index: 1, sql, .. } if fixture.as_str() == "f" && sql == "SLOW"),
        "{err}"
    );
}

#[test]
fn session_scope_controls_connections() {
    let server = FakeServer::new();
    let mut orchestrator = Orchestrator::new(registry(), MakeWith(|| server.connect()));
    assert!(orchestrator.run_fixture("fill_t").unwrap().is_success());
    assert_eq!(server.connections(), 1);

    let server = FakeServer::new();
    let mut orchestrator = Orchestrator::new(registry(), MakeWith(|| server.connect()));
    orchestrator.with_options(RunOptions {
        session_scope: SessionScope::PerFixture,
        ..RunOptions::default()
    });
    let report = orchestrator.run_fixture("check_t").unwrap();
    // Tables outlive the session, so later fixtures still see them.
    assert!(report.is_success(), "{}", report.display(false));
    assert_eq!(server.connections(), 3);
}

#[test]
fn per_fixture_scope_resets_session_state() {
    let mut builder = Registry::builder();
    builder
        .register(Fixture::new("open").with_statements([
            Statement::new("CREATE ROLE carol"),
            Statement::new("SET ROLE carol"),
        ]))
        .unwrap();
    builder
        .register(
            Fixture::new("check")
                .depends_on(["open"])
                .statement(Statement::new("SELECT current_user").expect_rows([row!["postgres"]])),
        )
        .unwrap();
    let registry = Arc::new(builder.build());

    let server = FakeServer::new();
    let mut orchestrator = Orchestrator::new(registry.clone(), MakeWith(|| server.connect()));
    assert!(!orchestrator.run_fixture("check").unwrap().is_success());

    let server = FakeServer::new();
    let mut orchestrator = Orchestrator::new(registry, MakeWith(|| server.connect()));
    orchestrator.with_options(RunOptions {
        session_scope: SessionScope::PerFixture,
        ..RunOptions::default()
    });
    assert!(orchestrator.run_fixture("check").unwrap().is_success());
}

#[test]
fn parallel_roots_get_their_own_session() {
    init_tracing();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    let orchestrator = Orchestrator::new(
        registry(),
        MakeWith(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            FakeEngine::new()
        }),
    );

    let report = orchestrator
        .run_parallel(["check_t", "fill_t", "standalone"], 2)
        .unwrap();
    assert!(report.is_success(), "{}", report.display(false));
    assert_eq!(
        fixture_names(&report),
        vec!["create_t", "fill_t", "check_t", "create_t", "fill_t", "standalone"]
    );
    assert_eq!(connections.load(Ordering::SeqCst), 3);
}

#[test]
fn connection_fault_halts_pending_roots() {
    let mut builder = Registry::builder();
    builder
        .register(Fixture::new("fatal").statement(Statement::new("DISCONNECT")))
        .unwrap();
    for fixture in ["create_t", "fill_t", "check_t", "standalone"] {
        builder
            .register(registry().lookup(fixture).unwrap().clone())
            .unwrap();
    }
    let registry = Arc::new(builder.build());

    let server = FakeServer::new();
    let s = server.clone();
    let orchestrator = Orchestrator::new(registry, MakeWith(move || s.connect()));
    let err = orchestrator
        .run_parallel(["fatal", "check_t", "standalone"], 1)
        .unwrap_err();
    assert!(matches!(err, HarnessError::ConnectionFault { .. }), "{err}");

    // Roots queued behind the fault never connect.
    assert_eq!(server.history(), vec!["DISCONNECT"]);
    assert_eq!(server.connections(), 1);
}

#[test]
fn unknown_root_is_fatal() {
    let orchestrator = Orchestrator::new(registry(), MakeWith(FakeEngine::new));
    let err = orchestrator
        .run_parallel(["standalone", "nope"], 4)
        .unwrap_err();
    assert!(
        matches!(&err, HarnessError::UnknownFixture { name, referenced_by: None } if name == &FixtureName::from("nope")),
        "{err}"
    );
}

#[test]
fn error_matcher_is_pluggable() {
    let mut builder = Registry::builder();
    builder
        .register(Fixture::new("div").statement(
            Statement::new("SELECT 1/0").expect_error("ERROR:  division by zero (SQLSTATE 22012)"),
        ))
        .unwrap();
    let registry = Arc::new(builder.build());

    let mut orchestrator = Orchestrator::new(registry, MakeWith(FakeEngine::new));
    assert!(orchestrator.run_fixture("div").unwrap().is_success());

    orchestrator.with_error_matcher(exact_error_matcher);
    let report = orchestrator.run_fixture("div").unwrap();
    assert_eq!(report.failures().count(), 1);
}

#[tokio::test]
async fn async_connections() {
    init_tracing();
    let mut orchestrator = Orchestrator::new(registry(), || async {
        Ok::<_, FakeError>(FakeEngine::new())
    });
    let report = orchestrator.run_all_async().await.unwrap();

    // `broken` fails; the rest of the registry shares one session.
    assert_eq!(
        fixture_names(&report),
        vec!["broken", "create_t", "fill_t", "check_t", "standalone"]
    );
    assert_eq!(report.failures().count(), 1);
}
