//! driftwasm: a WebAssembly core execution engine.
//!
//! The crate covers the execution path of a wasm runtime: a validated,
//! immutable [`crate::core::Module`] IR; an [`engine::Engine`] that compiles
//! it to cached artifacts (the in-tree implementation interprets a decoded
//! operator table); per-instantiation [`engine::ModuleEngine`] state; the
//! [`runtime::ModuleInstance`] model with linear memory, reference tables,
//! globals, and an imports-first function index space; and per-invocation
//! [`engine::CallEngine`]s that execute exported functions, crossing the
//! wasm/host boundary in either direction with deterministic trap semantics
//! and reconstructible stack traces.
//!
//! Decoding wasm binaries is not part of this crate: module IR arrives from a
//! decoder or from the [`host::HostModuleBuilder`].
//!
//! ```
//! use std::sync::Arc;
//! use driftwasm::{Context, Engine, HostModuleBuilder, InterpreterEngine, Namespace};
//!
//! let engine: Arc<dyn Engine> = Arc::new(InterpreterEngine::new());
//! let ns = Namespace::new();
//! let ctx = Context::new();
//!
//! let env = HostModuleBuilder::new("env")
//!     .function()
//!     .with_func(|a: u32, b: u32| -> u32 { a + b })
//!     .export("add")
//!     .instantiate(&ns, &engine, &ctx)
//!     .unwrap();
//!
//! let add = env.exported_function("add").unwrap();
//! assert_eq!(add.call(&ctx, &[2, 3]).unwrap(), vec![5]);
//! ```

pub mod binary;
pub mod context;
pub mod core;
pub mod engine;
pub mod error;
pub mod host;
pub mod runtime;

pub use context::Context;
pub use crate::core::{FunctionType, Module, ModuleId, ValType};
pub use engine::interpreter::InterpreterEngine;
pub use engine::{CallEngine, Engine, ModuleEngine, TableInitEntry};
pub use error::{CallError, CompileError, InstantiationError, Trap};
pub use host::{HostModuleBuilder, WasmValue};
pub use runtime::{
    instantiate, CallContext, Function, GlobalInstance, MemoryInstance, MemoryView,
    ModuleInstance, Namespace, TableInstance,
};
