use std::io::Write;
use std::sync::Arc;

use fake_engine::{init_tracing, FakeEngine, FakeServer};
use pretty_assertions::assert_eq;
use sqlregress::{
    parse_file, HarnessError, MakeWith, Orchestrator, ParseErrorKind, Registry, RowOrder,
};

const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/*.fixture");

fn load() -> Registry {
    let mut builder = Registry::builder();
    assert_eq!(builder.load_glob(FIXTURES).unwrap(), 6);
    builder.build()
}

#[test]
fn fixture_files_are_registered_by_name() {
    let registry = load();
    assert_eq!(
        registry.names().map(|n| n.as_str()).collect::<Vec<_>>(),
        vec!["broken", "create_t", "fill_t", "query_t", "roles", "transactions"]
    );

    let query_t = registry.lookup("query_t").unwrap();
    assert_eq!(query_t.dependencies().len(), 1);
    assert_eq!(query_t.statements().len(), 4);
    assert_eq!(query_t.statements()[1].order, RowOrder::Unordered);
    let loc = query_t.statements()[0].loc.as_ref().unwrap();
    assert!(loc.file().ends_with("query_t.fixture"));
    assert_eq!(loc.line(), 3);
}

#[test]
fn file_chain_runs_in_dependency_order() {
    init_tracing();
    let registry = Arc::new(load());
    assert_eq!(
        registry.resolve("query_t").unwrap().to_string(),
        "[create_t, fill_t, query_t]"
    );

    let server = FakeServer::new();
    let mut orchestrator = Orchestrator::new(registry, MakeWith(|| server.connect()));
    let report = orchestrator.run_fixture("query_t").unwrap();
    assert!(report.is_success(), "{}", report.display(false));
    assert_eq!(server.rows("t").map(|rows| rows.len()), Some(4));
}

#[test]
fn failing_file_points_at_its_location() {
    let registry = Arc::new(load());
    let mut orchestrator = Orchestrator::new(registry, MakeWith(FakeEngine::new));
    let report = orchestrator.run_fixture("broken").unwrap();

    let failure = report.failures().next().unwrap();
    let output = failure.to_string();
    assert!(output.contains("broken.fixture:4"), "{output}");
    assert!(output.contains("[Diff] (-expected|+actual)"), "{output}");
}

#[test]
fn duplicate_file_fixture_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    for file in ["a.fixture", "b.fixture"] {
        let mut f = std::fs::File::create(dir.path().join(file)).unwrap();
        writeln!(f, "fixture same\n\nstatement ok\nSELECT 1").unwrap();
    }

    let mut builder = Registry::builder();
    let pattern = format!("{}/*.fixture", dir.path().display());
    let err = builder.load_glob(&pattern).unwrap_err();
    assert!(
        matches!(&err, HarnessError::DuplicateFixture { name } if name.as_str() == "same"),
        "{err}"
    );
}

#[test]
fn malformed_file_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.fixture");
    std::fs::write(&path, "statement ok\nSELECT 1\n\nquery sorted\nSELECT 1\n").unwrap();

    let err = parse_file(&path).unwrap_err();
    assert_eq!(err.kind(), ParseErrorKind::InvalidLine("query sorted".to_string()));
    assert_eq!(err.location().line(), 4);

    let mut builder = Registry::builder();
    assert!(matches!(
        builder.load_file(&path).unwrap_err(),
        HarnessError::Parse(_)
    ));
}
