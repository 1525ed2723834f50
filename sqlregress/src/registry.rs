//! The fixture registry.
//!
//! A registry is filled through a [`RegistryBuilder`] during initialization
//! and frozen by [`RegistryBuilder::build`]. The frozen [`Registry`] is
//! read-only, so it can be shared between concurrent runs as an
//! `Arc<Registry>`.

use std::collections::BTreeMap;
use std::path::Path;

use crate::parser::parse_file;
use crate::resolver::{ExecutionPlan, Resolver};
use crate::{Fixture, FixtureName, HarnessError, StatementRecord};

/// The write phase of a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    fixtures: BTreeMap<FixtureName, Fixture>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fixture. Fails if the name is already taken.
    pub fn register(&mut self, fixture: Fixture) -> Result<(), HarnessError> {
        use std::collections::btree_map::Entry;

        if fixture.name().as_str().trim().is_empty() {
            return Err(HarnessError::InvalidFixture {
                name: fixture.name().clone(),
                reason: "fixture name is empty".to_string(),
            });
        }
        match self.fixtures.entry(fixture.name().clone()) {
            Entry::Occupied(o) => Err(HarnessError::DuplicateFixture {
                name: o.key().clone(),
            }),
            Entry::Vacant(v) => {
                tracing::trace!(fixture = %v.key(), "registered fixture");
                v.insert(fixture);
                Ok(())
            }
        }
    }

    /// Registers a fixture from its persisted statement records.
    pub fn register_records(
        &mut self,
        name: impl Into<FixtureName>,
        depends_on: impl IntoIterator<Item = impl Into<FixtureName>>,
        records: impl IntoIterator<Item = StatementRecord>,
    ) -> Result<(), HarnessError> {
        self.register(Fixture::from_records(name, depends_on, records)?)
    }

    /// Parses and registers a `.fixture` file.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), HarnessError> {
        self.register(parse_file(path)?)
    }

    /// Parses and registers every file matching `pattern`. Returns the number of
    /// fixtures loaded.
    pub fn load_glob(&mut self, pattern: &str) -> Result<usize, HarnessError> {
        let paths = glob::glob(pattern).map_err(|e| HarnessError::Load {
            path: pattern.to_string(),
            message: e.to_string(),
        })?;
        let mut count = 0;
        for entry in paths {
            let path = entry.map_err(|e| HarnessError::Load {
                path: e.path().display().to_string(),
                message: e.error().to_string(),
            })?;
            self.load_file(&path)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fixtures.contains_key(name)
    }

    /// Freezes the registry.
    pub fn build(self) -> Registry {
        tracing::debug!(fixtures = self.fixtures.len(), "fixture registry built");
        Registry {
            fixtures: self.fixtures,
        }
    }
}

/// A frozen set of fixtures, keyed by name.
#[derive(Debug, Default)]
pub struct Registry {
    fixtures: BTreeMap<FixtureName, Fixture>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Looks up a fixture. Fails with [`HarnessError::UnknownFixture`] if absent.
    pub fn lookup(&self, name: &str) -> Result<&Fixture, HarnessError> {
        self.get(name).ok_or_else(|| HarnessError::UnknownFixture {
            name: name.into(),
            referenced_by: None,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Fixture> {
        self.fixtures.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fixtures.contains_key(name)
    }

    /// Fixture names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &FixtureName> {
        self.fixtures.keys()
    }

    pub fn fixtures(&self) -> impl Iterator<Item = &Fixture> {
        self.fixtures.values()
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }

    /// Shortcut for [`Resolver::resolve`].
    pub fn resolve(&self, root: &str) -> Result<ExecutionPlan, HarnessError> {
        Resolver::new(self).resolve(root)
    }
}
