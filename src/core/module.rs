//! Module IR: the validated, decoded representation of one module.
//!
//! A `Module` is immutable after construction and shared by `Arc` across
//! instantiations. Function bodies are either raw opcode streams with local
//! types, or host-function descriptors (a callable thunk plus a declared
//! signature).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::host::func::HostCode;

use super::types::{
    Export, ExportDesc, FunctionIndex, FunctionType, GlobalIndex, GlobalType, Import, ImportDesc,
    MemoryType, TableType, TypeIndex, ValType,
};

/// Identity of one module, used to key the engine's compiled-artifact cache.
/// Distinct modules carry distinct ids; recompiling the same id is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ModuleId(pub u64);

impl ModuleId {
    /// Allocates a fresh process-unique id. Used by the host module builder;
    /// decoders may derive ids from content instead.
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ModuleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Constant expression used by global initializers and active segment offsets.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    RefNull,
    RefFunc(FunctionIndex),
    /// Reads an imported immutable global.
    GlobalGet(GlobalIndex),
}

/// Body of one function.
#[derive(Clone)]
pub enum FunctionBody {
    /// Raw opcode stream terminated by `end`, plus declared local types.
    Wasm { bytes: Vec<u8>, locals: Vec<ValType> },
    /// Embedder-provided callable.
    Host(HostCode),
}

impl std::fmt::Debug for FunctionBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionBody::Wasm { bytes, locals } => f
                .debug_struct("Wasm")
                .field("bytes", &bytes.len())
                .field("locals", locals)
                .finish(),
            FunctionBody::Host(_) => f.debug_struct("Host").finish_non_exhaustive(),
        }
    }
}

/// Code entry for one locally-defined function.
///
/// `is_host_function` marks functions that belong to a host module. Host
/// functions may still carry a wasm body (a thunk executed against the
/// caller's instance); traps raised while running native host code are
/// attributed to the host side.
#[derive(Debug, Clone)]
pub struct Code {
    pub is_host_function: bool,
    pub body: FunctionBody,
}

impl Code {
    pub fn wasm(bytes: Vec<u8>, locals: Vec<ValType>) -> Self {
        Self { is_host_function: false, body: FunctionBody::Wasm { bytes, locals } }
    }

    pub fn host(code: HostCode) -> Self {
        Self { is_host_function: true, body: FunctionBody::Host(code) }
    }
}

/// Global declaration: type plus initializer expression.
#[derive(Debug, Clone)]
pub struct Global {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

/// Element segment. Active segments initialize a table at instantiation;
/// passive segments become per-instance droppable copies used by `table.init`.
#[derive(Debug, Clone)]
pub struct ElementSegment {
    /// `Some((table, offset))` for active segments, `None` for passive ones.
    pub active: Option<(u32, ConstExpr)>,
    /// Function indices; `None` entries leave the slot null.
    pub init: Vec<Option<FunctionIndex>>,
}

/// Data segment. Active segments initialize memory at instantiation; passive
/// segments become per-instance droppable copies used by `memory.init`.
#[derive(Debug, Clone)]
pub struct DataSegment {
    /// `Some(offset)` for active segments, `None` for passive ones.
    pub active: Option<ConstExpr>,
    pub init: Vec<u8>,
}

/// Advisory name section. Contents never influence execution semantics; they
/// only shape stack traces and debug names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NameSection {
    pub module_name: String,
    /// Function names by absolute function index.
    pub function_names: Vec<(FunctionIndex, String)>,
    /// Parameter names per function index.
    pub local_names: Vec<(FunctionIndex, Vec<(u32, String)>)>,
}

/// One validated module, shared by reference across instantiations.
#[derive(Debug, Default)]
pub struct Module {
    pub id: ModuleId,
    pub types: Vec<FunctionType>,
    pub imports: Vec<Import>,
    /// Type index per locally-defined function, in declaration order.
    pub functions: Vec<TypeIndex>,
    /// Code entry per locally-defined function; same length as `functions`.
    pub codes: Vec<Code>,
    pub tables: Vec<TableType>,
    pub memory: Option<MemoryType>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<FunctionIndex>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
    pub names: Option<NameSection>,
}

impl Module {
    pub fn import_func_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.desc, ImportDesc::Func(_)))
            .count() as u32
    }

    pub fn import_table_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.desc, ImportDesc::Table(_)))
            .count() as u32
    }

    pub fn import_memory_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.desc, ImportDesc::Memory(_)))
            .count() as u32
    }

    pub fn import_global_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.desc, ImportDesc::Global(_)))
            .count() as u32
    }

    pub fn total_funcs(&self) -> u32 {
        self.import_func_count() + self.functions.len() as u32
    }

    pub fn total_tables(&self) -> u32 {
        self.import_table_count() + self.tables.len() as u32
    }

    pub fn total_globals(&self) -> u32 {
        self.import_global_count() + self.globals.len() as u32
    }

    pub fn has_memory(&self) -> bool {
        self.memory.is_some() || self.import_memory_count() > 0
    }

    /// Type index declared for an absolute function index, imports first.
    pub fn func_type_index(&self, index: FunctionIndex) -> Option<TypeIndex> {
        let imported = self.import_func_count();
        if index < imported {
            self.imports
                .iter()
                .filter_map(|i| match i.desc {
                    ImportDesc::Func(t) => Some(t),
                    _ => None,
                })
                .nth(index as usize)
        } else {
            self.functions.get((index - imported) as usize).copied()
        }
    }

    /// Signature of an absolute function index.
    pub fn func_type(&self, index: FunctionIndex) -> Option<&FunctionType> {
        self.types.get(self.func_type_index(index)? as usize)
    }

    /// Name-section name for a function, if present.
    pub fn function_name(&self, index: FunctionIndex) -> Option<&str> {
        let names = self.names.as_ref()?;
        names
            .function_names
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, n)| n.as_str())
    }

    /// Dot-delimited debug name for one function, used in stack traces:
    /// `<module>.<name>`, with `$<index>` substituted when the function has no
    /// name-section entry and the module part empty when the module is unnamed.
    pub fn debug_name(&self, index: FunctionIndex) -> String {
        let module = self
            .names
            .as_ref()
            .map(|n| n.module_name.as_str())
            .unwrap_or("");
        match self.function_name(index) {
            Some(name) => format!("{module}.{name}"),
            None => format!("{module}.${index}"),
        }
    }

    /// First export name of a function index, used in compile diagnostics.
    pub fn export_name_of_func(&self, index: FunctionIndex) -> Option<&str> {
        self.exports.iter().find_map(|e| match e.desc {
            ExportDesc::Func(i) if i == index => Some(e.name.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ValType;

    #[test]
    fn debug_names() {
        let mut m = Module::default();
        m.types.push(FunctionType::default());
        m.functions.push(0);
        m.codes.push(Code::wasm(vec![crate::core::opcodes::END], vec![]));
        assert_eq!(m.debug_name(0), ".$0");

        m.names = Some(NameSection {
            module_name: "host".to_string(),
            function_names: vec![(0, "div_by.go".to_string())],
            local_names: vec![],
        });
        assert_eq!(m.debug_name(0), "host.div_by.go");
    }

    #[test]
    fn absolute_function_index_spans_imports() {
        let mut m = Module::default();
        m.types.push(FunctionType::new(vec![ValType::I32], vec![]));
        m.types.push(FunctionType::new(vec![], vec![ValType::I64]));
        m.imports.push(Import {
            module: "env".to_string(),
            name: "f".to_string(),
            desc: ImportDesc::Func(1),
        });
        m.functions.push(0);
        assert_eq!(m.func_type_index(0), Some(1));
        assert_eq!(m.func_type_index(1), Some(0));
        assert_eq!(m.func_type_index(2), None);
    }
}
