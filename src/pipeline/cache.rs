//! Compiled-module cache
//!
//! Toolchain modules are large and slow to compile, so each logical name is
//! compiled at most once for the lifetime of the orchestrator that owns the
//! cache. There is no eviction.

use crate::console_log;
use crate::error::RuntimeResult;
use crate::guest::Engine;
use std::collections::HashMap;

pub struct ModuleCache<E: Engine> {
    modules: HashMap<String, E::Module>,
}

impl<E: Engine> ModuleCache<E> {
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Cached module for `name`, compiling it on first use
    pub async fn get_or_compile(&mut self, engine: &E, name: &str) -> RuntimeResult<E::Module> {
        if let Some(module) = self.modules.get(name) {
            return Ok(module.clone());
        }

        console_log!("[pipeline] compiling module {}", name);
        let module = engine.compile_named(name).await?;
        self.modules.insert(name.to_string(), module.clone());
        Ok(module)
    }
}

impl<E: Engine> Default for ModuleCache<E> {
    fn default() -> Self {
        Self::new()
    }
}
