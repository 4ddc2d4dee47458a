//! Engine abstraction: the capability seam between the module instance model
//! and an execution strategy.
//!
//! An [`Engine`] turns module IR into cached engine-private artifacts and
//! hands out per-instance [`ModuleEngine`]s; a [`CallEngine`] executes one
//! invocation at a time. The interpreter in [`interpreter`] is the in-tree
//! implementation; a native-code compiler would implement the same traits and
//! must honor the same execution contract: the value stack is a contiguous
//! array of 64-bit slots, call frames are linked through a frame pointer, and
//! the current instance is reachable without lookup on every memory or table
//! access.

pub mod interpreter;

use std::any::Any;
use std::sync::Arc;

use crate::context::Context;
use crate::core::{FunctionIndex, FunctionTypeId, Module};
use crate::error::{CallError, CompileError, InstantiationError, Trap};
use crate::runtime::global::GlobalInstance;
use crate::runtime::instances::{CallContext, FunctionInstance};
use crate::runtime::table::{Reference, TableInstance};

/// One run of table slots to fill with function references at instantiation.
/// Offsets are absolute; `None` entries leave the slot null.
#[derive(Debug, Clone)]
pub struct TableInitEntry {
    pub table_index: u32,
    pub offset: u32,
    pub function_indexes: Vec<Option<FunctionIndex>>,
}

/// Compiles module IR into engine-private artifacts and wires instances to
/// them.
pub trait Engine: Send + Sync {
    /// Validates operator-level well-formedness and emits the engine's
    /// internal form. Idempotent per [`Module::id`]; a successful compile is
    /// cached and counted once.
    fn compile_module(&self, module: &Module) -> Result<(), CompileError>;

    /// Builds the per-instance engine state: the compiled-function vector
    /// (imports first, then locals) and initialized table slots. Requires a
    /// prior successful [`Engine::compile_module`] for the module.
    fn new_module_engine(
        &self,
        name: &str,
        module: &Module,
        imported_functions: &[FunctionInstance],
        local_functions: &[FunctionInstance],
        tables: &[Arc<TableInstance>],
        table_inits: &[TableInitEntry],
    ) -> Result<Box<dyn ModuleEngine>, InstantiationError>;

    /// Evicts the cached artifact. Safe while instances live: they retain
    /// their own references to the compiled code.
    fn delete_compiled_module(&self, module: &Module);

    /// Number of cached compiled modules, for monitoring.
    fn compiled_module_count(&self) -> u32;
}

/// Per-instance gateway from the engine to execution. Stateless after
/// construction apart from holding compiled-code handles; it does not own the
/// value stack.
pub trait ModuleEngine: Send + Sync {
    /// Instantiation-time name, for diagnostics.
    fn name(&self) -> &str;

    /// Allocates per-invocation execution state for one function of this
    /// module engine. The function must belong to this engine's instance.
    fn new_call_engine(&self, function: &FunctionInstance) -> Box<dyn CallEngine>;

    /// Resolves an indirect call through a table slot. Traps
    /// `invalid table access` when the slot is out of range or null, and
    /// `indirect call type mismatch` when the referenced function's type id
    /// differs from the call site's expectation.
    fn lookup_function(
        &self,
        table: &TableInstance,
        expected_type_id: FunctionTypeId,
        offset: u32,
    ) -> Result<FunctionIndex, Trap>;

    /// Rewrites funcref globals in place: the null-funcref sentinel becomes
    /// the null reference, any other value is taken as a function index and
    /// replaced with this engine's opaque reference for it. Non-funcref
    /// globals are left intact.
    fn initialize_funcref_globals(&self, globals: &[Arc<GlobalInstance>]);

    /// The engine's opaque reference for one of its functions, as stored in
    /// table slots and funcref globals.
    fn function_ref(&self, index: FunctionIndex) -> Option<Reference>;

    /// Downcast support, used when one module engine imports functions
    /// defined by another.
    fn as_any(&self) -> &dyn Any;
}

/// Per-invocation execution state: value stack, frame stack, trap handler.
/// Not shareable across concurrent callers; one invocation runs at a time.
pub trait CallEngine: Send {
    /// Runs the function. `params` length must equal the signature's
    /// parameter width in 64-bit slots. Results are returned in freshly
    /// allocated storage. Traps are recovered here and returned as errors
    /// whose text starts with the trap's human phrase followed by the stack
    /// trace. The engine remains usable after an error.
    fn call(
        &mut self,
        ctx: &Context,
        module: &CallContext,
        params: &[u64],
    ) -> Result<Vec<u64>, CallError>;
}
