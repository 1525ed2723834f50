use std::sync::OnceLock;

use subst::Env;
use tempfile::{tempdir, TempDir};

/// Variables available to fixture SQL: `$__TEST_DIR__` (a temporary
/// directory that lives as long as the run) and environment variables.
#[derive(Default)]
pub(crate) struct Substitution {
    test_dir: OnceLock<Result<TempDir, String>>,
}

impl Substitution {
    /// Expands `$NAME` and `${NAME}` references in `sql`.
    pub fn substitute(&self, sql: &str) -> Result<String, String> {
        if let Err(e) = self.test_dir() {
            return Err(format!("failed to create test directory: {e}"));
        }
        subst::substitute(sql, self).map_err(|e| e.to_string())
    }

    fn test_dir(&self) -> &Result<TempDir, String> {
        self.test_dir
            .get_or_init(|| tempdir().map_err(|e| e.to_string()))
    }
}

impl<'a> subst::VariableMap<'a> for Substitution {
    type Value = String;

    fn get(&'a self, key: &str) -> Option<Self::Value> {
        match key {
            "__TEST_DIR__" => match self.test_dir() {
                Ok(dir) => dir.path().to_string_lossy().into_owned().into(),
                Err(_) => None,
            },
            key => Env.get(key),
        }
    }
}
