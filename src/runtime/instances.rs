//! Module and function instances: the runtime state of one instantiation.
//!
//! The instance is the arena: it owns memory, tables, globals, the function
//! vector (imports first, then locals), per-instance segment copies, and the
//! module engine. Functions refer back to their defining instance through a
//! weak handle plus an index, which keeps the instance graph acyclic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use crate::context::Context;
use crate::core::{FunctionIndex, FunctionType, FunctionTypeId, Module};
use crate::engine::{CallEngine as _, Engine, ModuleEngine};
use crate::error::CallError;
use crate::runtime::global::GlobalInstance;
use crate::runtime::memory::MemoryInstance;
use crate::runtime::namespace::Namespace;
use crate::runtime::table::TableInstance;

/// One function in an instance's index space.
///
/// The handle always names the defining instance, so an imported function
/// still resolves against the module that declared it.
#[derive(Debug, Clone)]
pub struct FunctionInstance {
    pub(crate) module: Weak<ModuleInstance>,
    pub(crate) index: FunctionIndex,
    pub(crate) ty: FunctionType,
    pub(crate) type_id: FunctionTypeId,
    pub(crate) debug_name: String,
}

impl FunctionInstance {
    pub fn index(&self) -> FunctionIndex {
        self.index
    }

    pub fn ty(&self) -> &FunctionType {
        &self.ty
    }

    pub fn type_id(&self) -> FunctionTypeId {
        self.type_id
    }

    /// Dot-delimited `<module>.<name>` used in stack traces.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub fn defining_module(&self) -> Option<Arc<ModuleInstance>> {
        self.module.upgrade()
    }
}

/// Export binding inside one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportTarget {
    Func(u32),
    Table(u32),
    Memory,
    Global(u32),
}

/// Runtime state of one instantiation.
pub struct ModuleInstance {
    pub(crate) name: String,
    pub(crate) module: Arc<Module>,
    pub(crate) memory: Option<Arc<MemoryInstance>>,
    pub(crate) tables: Vec<Arc<TableInstance>>,
    pub(crate) globals: Vec<Arc<GlobalInstance>>,
    pub(crate) functions: Vec<FunctionInstance>,
    pub(crate) type_ids: Vec<FunctionTypeId>,
    pub(crate) exports: HashMap<String, ExportTarget>,
    /// Per-instance copies of passive data segments; `data.drop` empties one.
    pub(crate) data_instances: Vec<RwLock<Vec<u8>>>,
    /// Per-instance copies of passive element segments.
    pub(crate) elem_instances: Vec<RwLock<Vec<Option<FunctionIndex>>>>,
    pub(crate) engine: OnceLock<Box<dyn ModuleEngine>>,
    pub(crate) engine_impl: Arc<dyn Engine>,
    pub(crate) ns: Weak<Namespace>,
    /// Bit 0: closed. Upper 32 bits: exit code.
    pub(crate) closed: AtomicU64,
    /// Whether closing this instance also evicts the compiled artifact.
    pub(crate) owns_artifact: AtomicBool,
    /// Serializes close so teardown runs once.
    pub(crate) close_lock: Mutex<()>,
}

impl ModuleInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    pub fn memory(&self) -> Option<&Arc<MemoryInstance>> {
        self.memory.as_ref()
    }

    pub fn table(&self, index: u32) -> Option<&Arc<TableInstance>> {
        self.tables.get(index as usize)
    }

    pub fn tables(&self) -> &[Arc<TableInstance>] {
        &self.tables
    }

    pub fn global(&self, index: u32) -> Option<&Arc<GlobalInstance>> {
        self.globals.get(index as usize)
    }

    pub fn globals(&self) -> &[Arc<GlobalInstance>] {
        &self.globals
    }

    pub fn function(&self, index: FunctionIndex) -> Option<&FunctionInstance> {
        self.functions.get(index as usize)
    }

    pub fn functions(&self) -> &[FunctionInstance] {
        &self.functions
    }

    pub fn type_id(&self, type_index: u32) -> Option<FunctionTypeId> {
        self.type_ids.get(type_index as usize).copied()
    }

    pub fn type_ids(&self) -> &[FunctionTypeId] {
        &self.type_ids
    }

    /// The module engine attached at instantiation.
    pub fn engine(&self) -> &dyn ModuleEngine {
        self.engine
            .get()
            .expect("module engine is attached during instantiation")
            .as_ref()
    }

    pub(crate) fn set_engine(&self, engine: Box<dyn ModuleEngine>) {
        if self.engine.set(engine).is_err() {
            unreachable!("module engine attached twice");
        }
    }

    pub(crate) fn data_instance(&self, index: u32) -> Option<&RwLock<Vec<u8>>> {
        self.data_instances.get(index as usize)
    }

    pub(crate) fn elem_instance(
        &self,
        index: u32,
    ) -> Option<&RwLock<Vec<Option<FunctionIndex>>>> {
        self.elem_instances.get(index as usize)
    }

    /// A function exported under `name`, or `None` when there is no such
    /// function export.
    pub fn exported_function(self: &Arc<Self>, name: &str) -> Option<Function> {
        match self.exports.get(name)? {
            ExportTarget::Func(index) => Some(Function { instance: self.clone(), index: *index }),
            _ => None,
        }
    }

    pub fn exported_memory(&self, name: &str) -> Option<&Arc<MemoryInstance>> {
        match self.exports.get(name)? {
            ExportTarget::Memory => self.memory.as_ref(),
            _ => None,
        }
    }

    pub fn exported_global(&self, name: &str) -> Option<&Arc<GlobalInstance>> {
        match self.exports.get(name)? {
            ExportTarget::Global(index) => self.globals.get(*index as usize),
            _ => None,
        }
    }

    pub fn exported_table(&self, name: &str) -> Option<&Arc<TableInstance>> {
        match self.exports.get(name)? {
            ExportTarget::Table(index) => self.tables.get(*index as usize),
            _ => None,
        }
    }

    /// Releases this instance: frees its name in the namespace and makes any
    /// in-flight or later call observe `module closed with exit_code(code)`.
    pub fn close_with_exit_code(&self, code: u32) {
        let _guard = self.close_lock.lock().expect("close lock poisoned");
        let word = ((code as u64) << 32) | 1;
        if self
            .closed
            .compare_exchange(0, word, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Some(ns) = self.ns.upgrade() {
                ns.remove(&self.name);
            }
            if self.owns_artifact.load(Ordering::Relaxed) {
                self.engine_impl.delete_compiled_module(&self.module);
            }
        }
    }

    /// Closes with exit code zero.
    pub fn close(&self) {
        self.close_with_exit_code(0);
    }

    pub(crate) fn mark_owns_artifact(&self) {
        self.owns_artifact.store(true, Ordering::Relaxed);
    }

    pub(crate) fn check_closed(&self) -> Result<(), CallError> {
        let word = self.closed.load(Ordering::SeqCst);
        if word & 1 == 1 {
            Err(CallError::Exit((word >> 32) as u32))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.name)
            .field("functions", &self.functions.len())
            .field("tables", &self.tables.len())
            .field("memory", &self.memory.is_some())
            .finish_non_exhaustive()
    }
}

/// The calling module handed to host functions and call engines. Host code
/// uses it to reach the caller's memory and exported functions.
#[derive(Clone)]
pub struct CallContext {
    instance: Arc<ModuleInstance>,
}

impl CallContext {
    pub fn new(instance: Arc<ModuleInstance>) -> Self {
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<ModuleInstance> {
        &self.instance
    }

    pub fn name(&self) -> &str {
        self.instance.name()
    }

    pub fn memory(&self) -> Option<&Arc<MemoryInstance>> {
        self.instance.memory()
    }

    pub fn exported_function(&self, name: &str) -> Option<Function> {
        self.instance.exported_function(name)
    }
}

/// An exported function bound to its instance.
///
/// `call` allocates a fresh call engine per invocation, so a `Function` is
/// safe to share; callers needing to amortize that allocation can hold a
/// [`crate::engine::CallEngine`] directly.
#[derive(Clone)]
pub struct Function {
    instance: Arc<ModuleInstance>,
    index: FunctionIndex,
}

impl Function {
    pub fn ty(&self) -> &FunctionType {
        &self.instance.functions[self.index as usize].ty
    }

    pub fn instance(&self) -> &Arc<ModuleInstance> {
        &self.instance
    }

    pub fn call(&self, ctx: &Context, params: &[u64]) -> Result<Vec<u64>, CallError> {
        let function = &self.instance.functions[self.index as usize];
        let mut engine = self.instance.engine().new_call_engine(function);
        engine.call(ctx, &CallContext::new(self.instance.clone()), params)
    }
}
