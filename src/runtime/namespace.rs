//! Namespace: the registry of live instances, keyed by instantiation name.
//!
//! Imports resolve against this registry, and a name stays taken until its
//! instance closes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::InstantiationError;
use crate::runtime::instances::ModuleInstance;

#[derive(Default)]
pub struct Namespace {
    modules: Mutex<HashMap<String, Arc<ModuleInstance>>>,
}

impl Namespace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The live instance registered under `name`.
    pub fn module(&self, name: &str) -> Option<Arc<ModuleInstance>> {
        self.modules.lock().expect("namespace poisoned").get(name).cloned()
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.lock().expect("namespace poisoned").keys().cloned().collect()
    }

    /// Registers an instance, rejecting duplicate names.
    pub(crate) fn register(&self, instance: Arc<ModuleInstance>) -> Result<(), InstantiationError> {
        let mut modules = self.modules.lock().expect("namespace poisoned");
        let name = instance.name().to_string();
        if modules.contains_key(&name) {
            return Err(InstantiationError::AlreadyInstantiated(name));
        }
        modules.insert(name, instance);
        Ok(())
    }

    /// Frees a name. Called when its instance closes.
    pub(crate) fn remove(&self, name: &str) {
        self.modules.lock().expect("namespace poisoned").remove(name);
    }
}
