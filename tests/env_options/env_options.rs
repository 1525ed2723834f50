use std::sync::Arc;
use std::time::Duration;

use fake_engine::{FakeEngine, FakeServer};
use rusty_fork::rusty_fork_test;
use sqlregress::{
    row, Fixture, HarnessError, MakeWith, Orchestrator, Registry, RunOptions, SessionScope,
    Statement,
};

fn registry(fixture: Fixture) -> Arc<Registry> {
    let mut builder = Registry::builder();
    builder.register(fixture).unwrap();
    Arc::new(builder.build())
}

rusty_fork_test! {
    #[test]
    fn options_from_environment() {
        std::env::set_var("SQLREGRESS_FAIL_FAST", "yes");
        std::env::set_var("SQLREGRESS_TIMEOUT", "250ms");
        std::env::set_var("SQLREGRESS_SESSION_SCOPE", "per-fixture");
        std::env::set_var("SQLREGRESS_SESSION_ROLE", "tester");

        let options = RunOptions::from_env().unwrap();
        assert!(options.fail_fast);
        assert_eq!(options.timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.session_scope, SessionScope::PerFixture);
        assert_eq!(options.session_role, "tester");
        assert!(options.verify_dependencies);
        assert!(!options.substitution);
    }

    #[test]
    fn invalid_environment_is_reported() {
        std::env::set_var("SQLREGRESS_SESSION_SCOPE", "global");
        let err = RunOptions::from_env().unwrap_err();
        assert!(matches!(err, HarnessError::Config { key: "SQLREGRESS_SESSION_SCOPE", .. }), "{err}");
    }

    #[test]
    fn substitution_expands_variables() {
        std::env::set_var("GREETING", "hello");
        let fixture = Fixture::new("subst").with_statements([
            Statement::new("SELECT '$GREETING'").expect_rows([row!["hello"]]),
            Statement::new("SELECT '${GREETING}, $__TEST_DIR__'"),
        ]);

        let server = FakeServer::new();
        let mut orchestrator = Orchestrator::new(registry(fixture), MakeWith(|| server.connect()));
        orchestrator.with_options(RunOptions {
            substitution: true,
            ..RunOptions::default()
        });
        let report = orchestrator.run_fixture("subst").unwrap();
        assert!(report.is_success(), "{}", report.display(false));

        let history = server.history();
        assert_eq!(history[0], "SELECT 'hello'");
        assert!(history[1].starts_with("SELECT 'hello, /"), "{}", history[1]);
        assert!(!history[1].contains("__TEST_DIR__"));
    }

    #[test]
    fn undefined_variable_is_an_invalid_fixture() {
        std::env::remove_var("NOT_DEFINED_ANYWHERE");
        let fixture = Fixture::new("subst")
            .statement(Statement::new("SELECT '$NOT_DEFINED_ANYWHERE'"));

        let mut orchestrator = Orchestrator::new(registry(fixture), MakeWith(FakeEngine::new));
        orchestrator.with_options(RunOptions {
            substitution: true,
            ..RunOptions::default()
        });
        let err = orchestrator.run_fixture("subst").unwrap_err();
        assert!(matches!(err, HarnessError::InvalidFixture { .. }), "{err}");

        // Without substitution the text is sent as is.
        orchestrator.with_options(RunOptions::default());
        assert!(orchestrator.run_fixture("subst").unwrap().is_success());
    }
}
