//! In-process loader backed by a name → unit table.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::{CodeUnit, ExecError, LoadError, ModuleLoader};

/// Adapts an async closure into a [`CodeUnit`].
pub struct FnUnit<F>(F);

impl<F> FnUnit<F> {
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> CodeUnit for FnUnit<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ExecError>> + Send,
{
    async fn run(&self) -> Result<String, ExecError> {
        (self.0)().await
    }
}

/// Loader for units registered up front, e.g. when embedding the worker in a
/// Rust program.
#[derive(Default, Clone)]
pub struct RegistryLoader {
    units: HashMap<String, Arc<dyn CodeUnit>>,
}

impl RegistryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, specifier: impl Into<String>, unit: impl CodeUnit + 'static) {
        self.units.insert(specifier.into(), Arc::new(unit));
    }

    /// Builder-style registration of an async closure.
    #[must_use]
    pub fn with_fn<F, Fut>(mut self, specifier: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ExecError>> + Send + 'static,
    {
        self.register(specifier, FnUnit::new(f));
        self
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[async_trait]
impl ModuleLoader for RegistryLoader {
    async fn load(&self, specifier: &str) -> Result<Arc<dyn CodeUnit>, LoadError> {
        self.units
            .get(specifier)
            .cloned()
            .ok_or_else(|| LoadError::not_found(specifier))
    }
}
