//! Host module builder: assembles module IR whose functions are host-function
//! descriptors.
//!
//! Emission rules are deterministic: a later `export` under an existing name
//! overwrites the earlier function, distinct export names are emitted sorted
//! by name, types are deduplicated in emission order, function names default
//! to the export name, and parameter names land in the name section.

use std::sync::Arc;

use crate::context::Context;
use crate::core::{
    Code, Export, ExportDesc, FunctionType, Module, ModuleId, NameSection, ValType,
};
use crate::engine::Engine;
use crate::error::{CompileError, InstantiationError};
use crate::host::func::{HostCode, IntoHostFunc};
use crate::runtime::instances::{CallContext, ModuleInstance};
use crate::runtime::namespace::Namespace;

struct HostFuncEntry {
    export: String,
    name: Option<String>,
    param_names: Vec<String>,
    ty: FunctionType,
    code: Code,
}

/// Builder for one host module.
pub struct HostModuleBuilder {
    name: String,
    functions: Vec<HostFuncEntry>,
}

impl HostModuleBuilder {
    /// An empty name produces a module with no module name in its name
    /// section; a wholly empty builder produces a module with no name section
    /// at all.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), functions: Vec::new() }
    }

    /// Starts one function. Finish it with [`HostFunctionBuilder::export`].
    pub fn function(self) -> HostFunctionBuilder {
        HostFunctionBuilder {
            parent: self,
            name: None,
            param_names: Vec::new(),
            func: None,
        }
    }

    /// Builds the module IR and compiles it with `engine`.
    pub fn compile(&self, engine: &Arc<dyn Engine>) -> Result<CompiledHostModule, CompileError> {
        let module = Arc::new(self.build_module());
        engine.compile_module(&module)?;
        Ok(CompiledHostModule { module, engine: engine.clone() })
    }

    /// Compiles and instantiates under the builder's module name. The
    /// resulting instance owns the compiled artifact: closing it evicts the
    /// engine cache entry.
    pub fn instantiate(
        &self,
        ns: &Arc<Namespace>,
        engine: &Arc<dyn Engine>,
        ctx: &Context,
    ) -> Result<Arc<ModuleInstance>, InstantiationError> {
        let compiled = self.compile(engine)?;
        let instance = compiled.instantiate(ns, ctx)?;
        instance.mark_owns_artifact();
        Ok(instance)
    }

    fn build_module(&self) -> Module {
        let mut entries: Vec<&HostFuncEntry> = self.functions.iter().collect();
        entries.sort_by(|a, b| a.export.cmp(&b.export));

        let mut module = Module { id: ModuleId::fresh(), ..Default::default() };
        let mut function_names = Vec::with_capacity(entries.len());
        let mut local_names = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let index = i as u32;
            let type_index = match module.types.iter().position(|t| *t == entry.ty) {
                Some(existing) => existing as u32,
                None => {
                    module.types.push(entry.ty.clone());
                    module.types.len() as u32 - 1
                }
            };
            module.functions.push(type_index);
            module.codes.push(entry.code.clone());
            module.exports.push(Export {
                name: entry.export.clone(),
                desc: ExportDesc::Func(index),
            });
            function_names
                .push((index, entry.name.clone().unwrap_or_else(|| entry.export.clone())));
            if !entry.param_names.is_empty() {
                local_names.push((
                    index,
                    entry
                        .param_names
                        .iter()
                        .enumerate()
                        .map(|(p, n)| (p as u32, n.clone()))
                        .collect(),
                ));
            }
        }
        if !self.name.is_empty() || !entries.is_empty() {
            module.names = Some(NameSection {
                module_name: self.name.clone(),
                function_names,
                local_names,
            });
        }
        module
    }
}

/// Builder for one function of a host module.
pub struct HostFunctionBuilder {
    parent: HostModuleBuilder,
    name: Option<String>,
    param_names: Vec<String>,
    func: Option<(FunctionType, Code)>,
}

impl HostFunctionBuilder {
    /// Typed convention: the signature is inferred from the closure.
    pub fn with_func<P, F: IntoHostFunc<P>>(mut self, f: F) -> Self {
        let (ty, code) = f.into_host_func();
        self.func = Some((ty, Code::host(code)));
        self
    }

    /// Stack convention with explicit types.
    pub fn with_host_fn(
        mut self,
        params: Vec<ValType>,
        results: Vec<ValType>,
        f: impl Fn(&Context, &mut [u64]) + Send + Sync + 'static,
    ) -> Self {
        let ty = FunctionType::new(params, results);
        self.func = Some((ty, Code::host(HostCode::Fn(Arc::new(f)))));
        self
    }

    /// Stack convention receiving the calling module, for hosts that read the
    /// caller's memory or exported functions.
    pub fn with_host_module_fn(
        mut self,
        params: Vec<ValType>,
        results: Vec<ValType>,
        f: impl Fn(&Context, &CallContext, &mut [u64]) + Send + Sync + 'static,
    ) -> Self {
        let ty = FunctionType::new(params, results);
        self.func = Some((ty, Code::host(HostCode::ModuleFn(Arc::new(f)))));
        self
    }

    /// A wasm-bodied host thunk: runs on the engine against the caller's
    /// instance.
    pub fn with_wasm_thunk(
        mut self,
        params: Vec<ValType>,
        results: Vec<ValType>,
        locals: Vec<ValType>,
        body: Vec<u8>,
    ) -> Self {
        let ty = FunctionType::new(params, results);
        let mut code = Code::wasm(body, locals);
        code.is_host_function = true;
        self.func = Some((ty, code));
        self
    }

    /// Overrides the function name recorded in the name section; the export
    /// name is the default.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Records parameter names in the name section's local-names table.
    pub fn with_param_names(mut self, names: &[&str]) -> Self {
        self.param_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Finishes this function under `name`, overwriting any earlier function
    /// exported under the same name.
    pub fn export(self, name: impl Into<String>) -> HostModuleBuilder {
        let mut parent = self.parent;
        let Some((ty, code)) = self.func else {
            return parent;
        };
        let entry = HostFuncEntry {
            export: name.into(),
            name: self.name,
            param_names: self.param_names,
            ty,
            code,
        };
        match parent.functions.iter().position(|f| f.export == entry.export) {
            Some(existing) => parent.functions[existing] = entry,
            None => parent.functions.push(entry),
        }
        parent
    }
}

/// A compiled host module, ready to instantiate.
pub struct CompiledHostModule {
    module: Arc<Module>,
    engine: Arc<dyn Engine>,
}

impl std::fmt::Debug for CompiledHostModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledHostModule")
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

impl CompiledHostModule {
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Instantiates under the module's name-section name.
    pub fn instantiate(
        &self,
        ns: &Arc<Namespace>,
        ctx: &Context,
    ) -> Result<Arc<ModuleInstance>, InstantiationError> {
        let name = self
            .module
            .names
            .as_ref()
            .map(|n| n.module_name.clone())
            .unwrap_or_default();
        self.instantiate_as(ns, &name, ctx)
    }

    pub fn instantiate_as(
        &self,
        ns: &Arc<Namespace>,
        name: &str,
        ctx: &Context,
    ) -> Result<Arc<ModuleInstance>, InstantiationError> {
        crate::runtime::instantiate(ns, &self.engine, &self.module, name, ctx)
    }
}
