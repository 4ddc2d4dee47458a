//! Runtime instance model: memories, tables, globals, module instances, the
//! namespace registry, and instantiation.

pub mod global;
pub mod instances;
pub mod instantiate;
pub mod memory;
pub mod namespace;
pub mod table;

pub use global::{GlobalInstance, NULL_FUNCREF_VALUE};
pub use instances::{CallContext, ExportTarget, Function, FunctionInstance, ModuleInstance};
pub use instantiate::instantiate;
pub use memory::{MemoryInstance, MemoryView, PAGE_SIZE};
pub use namespace::Namespace;
pub use table::{Reference, TableInstance, NULL_REF};
