//! The interpreter engine: compiles function bodies to decoded operator
//! tables, caches them per module id, and executes them on a slot stack.

mod call;
mod compile;
mod instr;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::debug;

use crate::core::{FunctionBody, FunctionIndex, FunctionType, FunctionTypeId, Module, ModuleId, ValType};
use crate::error::{CompileError, InstantiationError, Trap};
use crate::host::func::HostCode;
use crate::runtime::global::{GlobalInstance, NULL_FUNCREF_VALUE};
use crate::runtime::instances::{FunctionInstance, ModuleInstance};
use crate::runtime::table::{Reference, TableInstance, NULL_REF};

use super::{CallEngine, Engine, ModuleEngine, TableInitEntry};
use call::InterpreterCallEngine;
use instr::Instr;

/// Compiled form of one function body.
pub(crate) enum CompiledBody {
    Wasm { ops: Vec<Instr>, locals: Vec<ValType> },
    Host(HostCode),
}

/// Engine-private compiled artifact for one function, shared read-only across
/// every instantiation of its module.
pub(crate) struct CompiledFunction {
    pub(crate) ty: FunctionType,
    pub(crate) debug_name: String,
    /// Host functions execute against the caller's instance and attribute
    /// native faults to the host side.
    pub(crate) is_host: bool,
    pub(crate) body: CompiledBody,
}

/// Compiled artifact for one module: its locally-defined functions.
pub(crate) struct CompiledModule {
    pub(crate) functions: Vec<Arc<CompiledFunction>>,
}

/// A dispatchable function: compiled code plus its defining instance and the
/// engine's opaque reference for it.
#[derive(Clone)]
pub(crate) struct FunctionHandle {
    pub(crate) compiled: Arc<CompiledFunction>,
    pub(crate) instance: Weak<ModuleInstance>,
    pub(crate) index: FunctionIndex,
    pub(crate) type_id: FunctionTypeId,
    pub(crate) ref_value: Reference,
}

/// Shared arena mapping opaque references back to dispatchable functions.
/// A reference is its arena position plus one, so zero stays the null
/// reference.
pub(crate) type FuncRefArena = Arc<RwLock<Vec<FunctionHandle>>>;

pub(crate) fn arena_lookup(arena: &FuncRefArena, reference: Reference) -> Option<FunctionHandle> {
    if reference == NULL_REF {
        return None;
    }
    arena
        .read()
        .expect("funcref arena poisoned")
        .get((reference - 1) as usize)
        .cloned()
}

/// Interpreter implementation of [`Engine`].
pub struct InterpreterEngine {
    cache: Mutex<HashMap<ModuleId, Arc<CompiledModule>>>,
    func_refs: FuncRefArena,
}

impl InterpreterEngine {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            func_refs: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for InterpreterEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for InterpreterEngine {
    fn compile_module(&self, module: &Module) -> Result<(), CompileError> {
        let mut cache = self.cache.lock().expect("compiled-module cache poisoned");
        if cache.contains_key(&module.id) {
            return Ok(());
        }
        if module.functions.len() != module.codes.len() {
            return Err(CompileError::SectionMismatch {
                functions: module.functions.len(),
                codes: module.codes.len(),
            });
        }
        let import_count = module.import_func_count();
        let mut functions = Vec::with_capacity(module.codes.len());
        for (i, (type_index, code)) in module.functions.iter().zip(&module.codes).enumerate() {
            let ty = module
                .types
                .get(*type_index as usize)
                .ok_or(CompileError::UnknownTypeIndex(*type_index))?;
            let index = import_count + i as u32;
            let body = match &code.body {
                FunctionBody::Wasm { bytes, locals } => {
                    let ops = compile::compile_body(
                        module,
                        ty,
                        bytes,
                        locals,
                        code.is_host_function,
                    )
                    .map_err(|e| {
                        CompileError::invalid_function(
                            i as u32,
                            module.export_name_of_func(index),
                            e,
                        )
                    })?;
                    CompiledBody::Wasm { ops, locals: locals.clone() }
                }
                FunctionBody::Host(host) => CompiledBody::Host(host.clone()),
            };
            functions.push(Arc::new(CompiledFunction {
                ty: ty.clone(),
                debug_name: module.debug_name(index),
                is_host: code.is_host_function,
                body,
            }));
        }
        debug!(module = module.id.0, functions = functions.len(), "compiled module");
        cache.insert(module.id, Arc::new(CompiledModule { functions }));
        Ok(())
    }

    fn new_module_engine(
        &self,
        name: &str,
        module: &Module,
        imported_functions: &[FunctionInstance],
        local_functions: &[FunctionInstance],
        tables: &[Arc<TableInstance>],
        table_inits: &[TableInitEntry],
    ) -> Result<Box<dyn ModuleEngine>, InstantiationError> {
        let artifact = self
            .cache
            .lock()
            .expect("compiled-module cache poisoned")
            .get(&module.id)
            .cloned()
            .ok_or_else(|| InstantiationError::NotCompiled(name.to_string()))?;

        let mut functions: Vec<FunctionHandle> =
            Vec::with_capacity(imported_functions.len() + local_functions.len());

        // Imported functions reuse the handles of their defining engine, so
        // their references and compiled code stay those of the definer.
        for function in imported_functions {
            let defining = function
                .defining_module()
                .ok_or(InstantiationError::EngineMismatch)?;
            let engine = defining
                .engine()
                .as_any()
                .downcast_ref::<InterpreterModuleEngine>()
                .ok_or(InstantiationError::EngineMismatch)?;
            let handle = engine
                .functions
                .get(function.index() as usize)
                .cloned()
                .ok_or(InstantiationError::EngineMismatch)?;
            functions.push(handle);
        }

        for (i, function) in local_functions.iter().enumerate() {
            let compiled = artifact
                .functions
                .get(i)
                .cloned()
                .ok_or(InstantiationError::EngineMismatch)?;
            let mut arena = self.func_refs.write().expect("funcref arena poisoned");
            let handle = FunctionHandle {
                compiled,
                instance: function.module.clone(),
                index: function.index(),
                type_id: function.type_id(),
                ref_value: arena.len() as Reference + 1,
            };
            arena.push(handle.clone());
            drop(arena);
            functions.push(handle);
        }

        for entry in table_inits {
            let table = tables
                .get(entry.table_index as usize)
                .ok_or(InstantiationError::ElementOutOfBounds(entry.table_index as usize))?;
            let mut refs = Vec::with_capacity(entry.function_indexes.len());
            for function_index in &entry.function_indexes {
                let reference = match function_index {
                    Some(index) => {
                        functions
                            .get(*index as usize)
                            .ok_or(InstantiationError::ElementUnknownFunction(
                                *index as usize,
                            ))?
                            .ref_value
                    }
                    None => NULL_REF,
                };
                refs.push(reference);
            }
            if !table.init(entry.offset, &refs) {
                return Err(InstantiationError::ElementOutOfBounds(entry.table_index as usize));
            }
        }

        Ok(Box::new(InterpreterModuleEngine {
            name: name.to_string(),
            functions,
            func_refs: self.func_refs.clone(),
        }))
    }

    fn delete_compiled_module(&self, module: &Module) {
        let evicted = self
            .cache
            .lock()
            .expect("compiled-module cache poisoned")
            .remove(&module.id)
            .is_some();
        if evicted {
            debug!(module = module.id.0, "evicted compiled module");
        }
    }

    fn compiled_module_count(&self) -> u32 {
        self.cache.lock().expect("compiled-module cache poisoned").len() as u32
    }
}

/// Interpreter implementation of [`ModuleEngine`].
pub struct InterpreterModuleEngine {
    name: String,
    /// Imports first, then locally-defined functions; the index namespace.
    pub(crate) functions: Vec<FunctionHandle>,
    func_refs: FuncRefArena,
}

impl ModuleEngine for InterpreterModuleEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_call_engine(&self, function: &FunctionInstance) -> Box<dyn CallEngine> {
        // The function belongs to this engine's instance by contract.
        let handle = self.functions[function.index() as usize].clone();
        Box::new(InterpreterCallEngine::new(handle, self.func_refs.clone()))
    }

    fn lookup_function(
        &self,
        table: &TableInstance,
        expected_type_id: FunctionTypeId,
        offset: u32,
    ) -> Result<FunctionIndex, Trap> {
        let reference = table.get(offset).ok_or(Trap::InvalidTableAccess)?;
        let handle =
            arena_lookup(&self.func_refs, reference).ok_or(Trap::InvalidTableAccess)?;
        if handle.type_id != expected_type_id {
            return Err(Trap::IndirectCallTypeMismatch);
        }
        Ok(handle.index)
    }

    fn initialize_funcref_globals(&self, globals: &[Arc<GlobalInstance>]) {
        for global in globals {
            if global.ty().val_type != ValType::FuncRef {
                continue;
            }
            let value = global.get();
            if value == NULL_FUNCREF_VALUE {
                global.replace(NULL_REF);
            } else if let Some(handle) = self.functions.get(value as usize) {
                global.replace(handle.ref_value);
            }
        }
    }

    fn function_ref(&self, index: FunctionIndex) -> Option<Reference> {
        self.functions.get(index as usize).map(|h| h.ref_value)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
