//! Dependency resolution.

use std::collections::HashMap;
use std::fmt;

use itertools::Itertools;

use crate::{FixtureName, HarnessError, Registry};

/// An ordered list of fixtures in which every fixture comes after all of its
/// dependencies, and no fixture appears twice.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionPlan {
    fixtures: Vec<FixtureName>,
}

impl ExecutionPlan {
    pub fn iter(&self) -> std::slice::Iter<'_, FixtureName> {
        self.fixtures.iter()
    }

    pub fn as_slice(&self) -> &[FixtureName] {
        &self.fixtures
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fixtures.iter().position(|f| f.as_str() == name)
    }
}

impl<'a> IntoIterator for &'a ExecutionPlan {
    type Item = &'a FixtureName;
    type IntoIter = std::slice::Iter<'a, FixtureName>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.fixtures.iter().join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// On the active DFS stack.
    Visiting,
    /// Appended to the plan.
    Done,
}

/// Computes execution plans against a frozen registry.
///
/// Resolution is a depth-first walk over `depends_on` edges in declaration
/// order, emitting each fixture after its dependencies. The same registry and
/// roots always yield the same plan.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    registry: &'a Registry,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Resolver { registry }
    }

    /// Resolves `root` and its transitive dependencies.
    pub fn resolve(&self, root: &str) -> Result<ExecutionPlan, HarnessError> {
        self.resolve_many([root])
    }

    /// Resolves a combined plan for several roots, in the given order.
    pub fn resolve_many(
        &self,
        roots: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<ExecutionPlan, HarnessError> {
        let mut walk = Walk {
            registry: self.registry,
            marks: HashMap::new(),
            stack: vec![],
            order: vec![],
        };
        for root in roots {
            walk.visit(&FixtureName::from(root.as_ref()), None)?;
        }
        tracing::debug!(fixtures = walk.order.len(), "resolved execution plan");
        Ok(ExecutionPlan {
            fixtures: walk.order,
        })
    }

    /// Resolves every registered fixture, visiting roots by name.
    pub fn resolve_all(&self) -> Result<ExecutionPlan, HarnessError> {
        self.resolve_many(self.registry.names())
    }
}

struct Walk<'a> {
    registry: &'a Registry,
    marks: HashMap<FixtureName, Mark>,
    stack: Vec<FixtureName>,
    order: Vec<FixtureName>,
}

impl Walk<'_> {
    fn visit(
        &mut self,
        name: &FixtureName,
        referenced_by: Option<&FixtureName>,
    ) -> Result<(), HarnessError> {
        match self.marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = self.stack.iter().position(|n| n == name).unwrap_or(0);
                return Err(HarnessError::CycleDetected {
                    cycle: self.stack[start..].to_vec(),
                });
            }
            None => {}
        }

        let registry = self.registry;
        let fixture = registry
            .get(name.as_str())
            .ok_or_else(|| HarnessError::UnknownFixture {
                name: name.clone(),
                referenced_by: referenced_by.cloned(),
            })?;

        self.marks.insert(name.clone(), Mark::Visiting);
        self.stack.push(name.clone());
        for dep in fixture.dependencies() {
            self.visit(dep, Some(name))?;
        }
        self.stack.pop();
        self.marks.insert(name.clone(), Mark::Done);
        self.order.push(name.clone());
        Ok(())
    }
}
