//! Instantiation: builds a live [`ModuleInstance`] from a compiled module.
//!
//! Instantiation is atomic. Imports resolve first, then globals evaluate,
//! active segment bounds are checked before anything is written, the module
//! engine is created, and only a fully initialized instance is registered in
//! the namespace. A trap in the start function tears everything down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use tracing::trace;

use crate::context::Context;
use crate::core::{
    encode_i32, encode_i64, intern, ConstExpr, ExportDesc, FunctionIndex, FunctionTypeId,
    ImportDesc, Module, ValType,
};
use crate::engine::{CallEngine as _, Engine, ModuleEngine as _, TableInitEntry};
use crate::error::InstantiationError;
use crate::runtime::global::{GlobalInstance, NULL_FUNCREF_VALUE};
use crate::runtime::instances::{CallContext, ExportTarget, FunctionInstance, ModuleInstance};
use crate::runtime::memory::MemoryInstance;
use crate::runtime::namespace::Namespace;
use crate::runtime::table::TableInstance;

/// Instantiates `module` under `name`, resolving imports from `ns`.
pub fn instantiate(
    ns: &Arc<Namespace>,
    engine: &Arc<dyn Engine>,
    module: &Arc<Module>,
    name: &str,
    ctx: &Context,
) -> Result<Arc<ModuleInstance>, InstantiationError> {
    if ns.module(name).is_some() {
        return Err(InstantiationError::AlreadyInstantiated(name.to_string()));
    }
    trace!(module = name, "instantiating");

    // 1. Resolve imports from the namespace, checking declared types.
    let mut imported_functions: Vec<FunctionInstance> = Vec::new();
    let mut tables: Vec<Arc<TableInstance>> = Vec::new();
    let mut memory: Option<Arc<MemoryInstance>> = None;
    let mut globals: Vec<Arc<GlobalInstance>> = Vec::new();

    for imp in &module.imports {
        let source = ns
            .module(&imp.module)
            .ok_or_else(|| unresolved(imp))?;
        let target = source.exports.get(&imp.name).copied().ok_or_else(|| unresolved(imp))?;
        match (&imp.desc, target) {
            (ImportDesc::Func(type_index), ExportTarget::Func(index)) => {
                let want = module.types.get(*type_index as usize).ok_or(
                    InstantiationError::ImportTypeMismatch {
                        context: "function type index",
                        expected: "a declared type".to_string(),
                        found: format!("type index {type_index}"),
                    },
                )?;
                let function = source
                    .function(index)
                    .ok_or_else(|| unresolved(imp))?
                    .clone();
                if function.ty() != want {
                    return Err(InstantiationError::ImportTypeMismatch {
                        context: "function signature",
                        expected: want.render(),
                        found: function.ty().render(),
                    });
                }
                imported_functions.push(function);
            }
            (ImportDesc::Table(tt), ExportTarget::Table(index)) => {
                let table = source.table(index).ok_or_else(|| unresolved(imp))?.clone();
                if table.size() < tt.limits.min {
                    return Err(InstantiationError::ImportTypeMismatch {
                        context: "table limits",
                        expected: format!("min >= {}", tt.limits.min),
                        found: format!("size {}", table.size()),
                    });
                }
                tables.push(table);
            }
            (ImportDesc::Memory(mt), ExportTarget::Memory) => {
                let mem = source
                    .memory()
                    .ok_or_else(|| unresolved(imp))?
                    .clone();
                if mem.size_pages() < mt.limits.min {
                    return Err(InstantiationError::ImportTypeMismatch {
                        context: "memory limits",
                        expected: format!("min >= {}", mt.limits.min),
                        found: format!("{} pages", mem.size_pages()),
                    });
                }
                memory = Some(mem);
            }
            (ImportDesc::Global(gt), ExportTarget::Global(index)) => {
                let global = source.global(index).ok_or_else(|| unresolved(imp))?.clone();
                if global.ty() != *gt {
                    return Err(InstantiationError::ImportTypeMismatch {
                        context: "global type",
                        expected: format!("{gt:?}"),
                        found: format!("{:?}", global.ty()),
                    });
                }
                globals.push(global);
            }
            _ => return Err(unresolved(imp)),
        }
    }

    let import_func_count = imported_functions.len() as u32;
    let import_global_count = globals.len();

    // 2. Intern type ids and pre-validate local function type indices.
    let type_ids: Vec<FunctionTypeId> = module.types.iter().map(intern).collect();
    for type_index in &module.functions {
        if *type_index as usize >= module.types.len() {
            return Err(InstantiationError::Compile(
                crate::error::CompileError::UnknownTypeIndex(*type_index),
            ));
        }
    }

    // 3. Define tables, memory, and globals declared by this module.
    for tt in &module.tables {
        tables.push(Arc::new(TableInstance::new(tt)));
    }
    if let Some(mt) = &module.memory {
        memory = Some(Arc::new(MemoryInstance::new(mt)));
    }
    for global in &module.globals {
        let value = eval_global_init(module, &globals[..import_global_count], global)?;
        globals.push(Arc::new(GlobalInstance::new(global.ty, value)));
    }

    // 4. Per-instance copies of passive segments. Active segments are applied
    //    below and start out dropped.
    let data_instances: Vec<RwLock<Vec<u8>>> = module
        .data
        .iter()
        .map(|seg| {
            RwLock::new(if seg.active.is_none() { seg.init.clone() } else { Vec::new() })
        })
        .collect();
    let elem_instances: Vec<RwLock<Vec<Option<FunctionIndex>>>> = module
        .elements
        .iter()
        .map(|seg| {
            RwLock::new(if seg.active.is_none() { seg.init.clone() } else { Vec::new() })
        })
        .collect();

    // 5. Pre-check every active segment before any write happens, so a
    //    failing segment aborts instantiation with no partial state.
    let total_funcs = import_func_count + module.functions.len() as u32;
    let mut table_inits: Vec<TableInitEntry> = Vec::new();
    for (i, seg) in module.elements.iter().enumerate() {
        let Some((table_index, offset)) = &seg.active else { continue };
        let table = tables
            .get(*table_index as usize)
            .ok_or(InstantiationError::ElementOutOfBounds(i))?;
        let offset = eval_offset(&globals[..import_global_count], offset)?;
        let end = offset
            .checked_add(seg.init.len() as u32)
            .ok_or(InstantiationError::ElementOutOfBounds(i))?;
        if end > table.size() {
            return Err(InstantiationError::ElementOutOfBounds(i));
        }
        for entry in seg.init.iter().flatten() {
            if *entry >= total_funcs {
                return Err(InstantiationError::ElementUnknownFunction(i));
            }
        }
        table_inits.push(TableInitEntry {
            table_index: *table_index,
            offset,
            function_indexes: seg.init.clone(),
        });
    }
    let mut data_writes: Vec<(u32, &[u8])> = Vec::new();
    for (i, seg) in module.data.iter().enumerate() {
        let Some(offset) = &seg.active else { continue };
        let mem = memory.as_ref().ok_or(InstantiationError::DataOutOfBounds(i))?;
        let offset = eval_offset(&globals[..import_global_count], offset)?;
        let end = offset
            .checked_add(seg.init.len() as u32)
            .ok_or(InstantiationError::DataOutOfBounds(i))?;
        if end > mem.size() {
            return Err(InstantiationError::DataOutOfBounds(i));
        }
        data_writes.push((offset, &seg.init));
    }

    // 6. Build the instance. Locals refer back through the cyclic weak handle.
    let exports: HashMap<String, ExportTarget> = module
        .exports
        .iter()
        .map(|e| {
            let target = match e.desc {
                ExportDesc::Func(i) => ExportTarget::Func(i),
                ExportDesc::Table(i) => ExportTarget::Table(i),
                ExportDesc::Memory(_) => ExportTarget::Memory,
                ExportDesc::Global(i) => ExportTarget::Global(i),
            };
            (e.name.clone(), target)
        })
        .collect();

    let instance = Arc::new_cyclic(|weak: &Weak<ModuleInstance>| {
        let mut functions = imported_functions.clone();
        for (i, type_index) in module.functions.iter().enumerate() {
            let index = import_func_count + i as u32;
            functions.push(FunctionInstance {
                module: weak.clone(),
                index,
                ty: module.types[*type_index as usize].clone(),
                type_id: type_ids[*type_index as usize],
                debug_name: module.debug_name(index),
            });
        }
        ModuleInstance {
            name: name.to_string(),
            module: module.clone(),
            memory: memory.clone(),
            tables: tables.clone(),
            globals: globals.clone(),
            functions,
            type_ids: type_ids.clone(),
            exports,
            data_instances,
            elem_instances,
            engine: OnceLock::new(),
            engine_impl: engine.clone(),
            ns: Arc::downgrade(ns),
            closed: AtomicU64::new(0),
            owns_artifact: AtomicBool::new(false),
            close_lock: Mutex::new(()),
        }
    });

    // 7. Attach the module engine; it wires table slots from `table_inits`.
    let module_engine = engine.new_module_engine(
        name,
        module,
        &instance.functions[..import_func_count as usize],
        &instance.functions[import_func_count as usize..],
        &tables,
        &table_inits,
    )?;
    instance.set_engine(module_engine);

    // 8. Apply active data segments (bounds already proven).
    for (offset, bytes) in data_writes {
        if !instance
            .memory()
            .map(|m| m.write(offset, bytes))
            .unwrap_or(false)
        {
            return Err(InstantiationError::DataOutOfBounds(0));
        }
    }

    // 9. Translate funcref globals defined by this module into opaque
    //    references. Imported ones were translated by their defining engine.
    instance
        .engine()
        .initialize_funcref_globals(&instance.globals[import_global_count..]);

    // 10. Run the start function; a trap tears the instance down.
    if let Some(start) = module.start {
        let function = instance
            .function(start)
            .ok_or(InstantiationError::UnknownStartFunction(start))?;
        if !function.ty().params.is_empty() || !function.ty().results.is_empty() {
            return Err(InstantiationError::InvalidStartFunction);
        }
        let mut call_engine = instance.engine().new_call_engine(function);
        call_engine
            .call(ctx, &CallContext::new(instance.clone()), &[])
            .map_err(InstantiationError::Start)?;
    }

    ns.register(instance.clone())?;
    trace!(module = name, "instantiated");
    Ok(instance)
}

fn unresolved(imp: &crate::core::Import) -> InstantiationError {
    InstantiationError::UnresolvedImport {
        module: imp.module.clone(),
        name: imp.name.clone(),
    }
}

/// Evaluates a global initializer to its slot value, checking that the
/// expression kind matches the declared value type.
fn eval_global_init(
    module: &Module,
    imported_globals: &[Arc<GlobalInstance>],
    global: &crate::core::Global,
) -> Result<u64, InstantiationError> {
    let declared = global.ty.val_type;
    let value = match (&global.init, declared) {
        (ConstExpr::I32(v), ValType::I32) => encode_i32(*v),
        (ConstExpr::I64(v), ValType::I64) => encode_i64(*v),
        (ConstExpr::F32(bits), ValType::F32) => *bits as u64,
        (ConstExpr::F64(bits), ValType::F64) => *bits,
        (ConstExpr::RefNull, t) if t.is_ref() => NULL_FUNCREF_VALUE,
        (ConstExpr::RefFunc(index), ValType::FuncRef) => {
            if *index >= module.total_funcs() {
                return Err(InstantiationError::InvalidGlobalInit(
                    "ref.func index out of range",
                ));
            }
            *index as u64
        }
        (ConstExpr::GlobalGet(index), _) => {
            let source = imported_globals.get(*index as usize).ok_or(
                InstantiationError::InvalidGlobalInit(
                    "global.get must reference an imported global",
                ),
            )?;
            if source.ty().mutable {
                return Err(InstantiationError::InvalidGlobalInit(
                    "global.get must reference an immutable global",
                ));
            }
            if source.ty().val_type != declared {
                return Err(InstantiationError::InvalidGlobalInit(
                    "global.get type mismatch",
                ));
            }
            source.get()
        }
        _ => {
            return Err(InstantiationError::InvalidGlobalInit(
                "initializer type mismatch",
            ))
        }
    };
    Ok(value)
}

/// Evaluates an active segment offset, which must be an i32 expression.
fn eval_offset(
    imported_globals: &[Arc<GlobalInstance>],
    expr: &ConstExpr,
) -> Result<u32, InstantiationError> {
    match expr {
        ConstExpr::I32(v) => Ok(*v as u32),
        ConstExpr::GlobalGet(index) => {
            let source = imported_globals.get(*index as usize).ok_or(
                InstantiationError::InvalidGlobalInit(
                    "offset global.get must reference an imported global",
                ),
            )?;
            if source.ty().val_type != ValType::I32 || source.ty().mutable {
                return Err(InstantiationError::InvalidGlobalInit(
                    "offset must be an immutable i32 global",
                ));
            }
            Ok(source.get() as u32)
        }
        _ => Err(InstantiationError::InvalidGlobalInit("offset must be an i32 expression")),
    }
}
