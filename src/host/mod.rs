//! Host functions: typed and stack-convention callables, and the builder that
//! packages them as a module.

pub mod builder;
pub mod func;

pub use builder::{CompiledHostModule, HostFunctionBuilder, HostModuleBuilder};
pub use func::{HostCode, HostFn, HostModuleFn, IntoHostFunc, WasmResults, WasmValue};
