use std::sync::Arc;

pub use glob::glob;
pub use libtest_mimic::{run, Arguments, Failed, Trial};

use crate::{AsyncEngine, MakeConnection, MakeWith, Orchestrator, Registry, RunOptions};

/// * `registry_fn`: `fn() -> Result<sqlregress::Registry, sqlregress::HarnessError>`
/// * `engine_fn`: `fn() -> impl sqlregress::Engine`, called once per session
/// * `ignored`: optional list of fixture names to report as ignored
///
/// Every registered fixture becomes one test, named after the fixture.
#[macro_export]
macro_rules! harness {
    ($registry_fn:path, $engine_fn:path) => {
        $crate::harness!($registry_fn, $engine_fn, []);
    };
    ($registry_fn:path, $engine_fn:path, [$($ignored:expr),* $(,)?]) => {
        fn main() {
            let registry = $registry_fn().expect("failed to build fixture registry");
            let registry = ::std::sync::Arc::new(registry);
            let tests = $crate::harness::trials(&registry, $engine_fn, &[$($ignored),*]);

            if tests.is_empty() {
                panic!("no fixture registered");
            }

            $crate::harness::run(&$crate::harness::Arguments::from_args(), tests).exit();
        }
    };
}

/// Builds one [`Trial`] per registered fixture, in name order.
pub fn trials<D, F>(registry: &Arc<Registry>, engine_fn: F, ignored: &[&str]) -> Vec<Trial>
where
    D: AsyncEngine,
    F: Fn() -> D + Clone + Send + 'static,
{
    registry
        .names()
        .map(|name| {
            let registry = registry.clone();
            let engine_fn = engine_fn.clone();
            let fixture = name.clone();
            Trial::test(name.to_string(), move || {
                test(registry, fixture.as_str(), MakeWith(engine_fn))
            })
            .with_ignored_flag(ignored.contains(&name.as_str()))
        })
        .collect()
}

/// Runs one fixture after its dependencies, with options read from the environment.
pub fn test<M: MakeConnection>(
    registry: Arc<Registry>,
    name: &str,
    make_conn: M,
) -> Result<(), Failed> {
    let mut orchestrator = Orchestrator::new(registry, make_conn);
    orchestrator.with_options(RunOptions::from_env()?);
    let report = orchestrator.run_fixture(name)?;
    if report.is_success() {
        Ok(())
    } else {
        Err(report.display(false).to_string().into())
    }
}
