//! Dependency-aware SQL regression fixture harness.
//!
//! A fixture is a named, ordered list of SQL statements, each with an
//! optional expectation (rows or an error), plus the names of the fixtures it
//! depends on. Fixtures are registered once, resolved into an execution plan,
//! and replayed against an engine session while the harness tracks the
//! session's transaction state.
//!
//! # Usage
//!
//! Implement [`Engine`] (or [`AsyncEngine`]) for your database connection:
//!
//! ```ignore
//! struct Database {...}
//!
//! impl sqlregress::Engine for Database {
//!     type Error = ...;
//!     fn run(&mut self, sql: &str) -> Result<sqlregress::EngineOutput, Self::Error> {
//!         ...
//!     }
//! }
//! ```
//!
//! Register fixtures, then run one of them after its dependencies:
//!
//! ```ignore
//! let mut builder = sqlregress::Registry::builder();
//! builder.register(
//!     Fixture::new("create_t").statement(Statement::new("CREATE TABLE t(x int)")),
//! )?;
//! builder.register(
//!     Fixture::new("select_t")
//!         .depends_on(["create_t"])
//!         .statement(Statement::new("SELECT * FROM t").expect_rows([])),
//! )?;
//! builder.load_glob("fixtures/**/*.fixture")?;
//!
//! let registry = Arc::new(builder.build());
//! let mut orchestrator = Orchestrator::new(registry, MakeWith(Database::new));
//! let report = orchestrator.run_fixture("select_t")?;
//! assert!(report.is_success(), "{}", report.display(true));
//! ```

pub mod compare;
pub mod connection;
pub mod error;
pub mod fixture;
pub mod orchestrator;
pub mod parser;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod runner;
pub mod session;
mod substitution;
pub mod value;

pub use self::compare::*;
pub use self::connection::*;
pub use self::error::*;
pub use self::fixture::*;
pub use self::orchestrator::*;
pub use self::parser::*;
pub use self::registry::*;
pub use self::report::*;
pub use self::resolver::*;
pub use self::runner::*;
pub use self::session::*;
pub use self::value::*;

pub mod harness;
