//! Host function callables and the typed adapter that infers signatures from
//! plain Rust closures.
//!
//! Two calling conventions exist. The stack convention hands the host a slot
//! array: parameters occupy `stack[0..param_slots]` and results are written
//! back to `stack[0..result_slots]`; the module variant also receives the
//! calling module so the host can reach its memory and exports. The typed
//! convention wraps an ordinary closure; the engine-generated thunk unpacks
//! slots into typed arguments and repacks results.
//!
//! Host functions signal failure by panicking. The engine installs a recovery
//! boundary around every host call and converts the panic into a trap error.

use std::sync::Arc;

use crate::context::Context;
use crate::core::types::{FunctionType, ValType};
use crate::runtime::instances::CallContext;

/// Stack-convention host function.
pub type HostFn = Arc<dyn Fn(&Context, &mut [u64]) + Send + Sync>;

/// Stack-convention host function that also receives the calling module.
pub type HostModuleFn = Arc<dyn Fn(&Context, &CallContext, &mut [u64]) + Send + Sync>;

/// The callable carried by a host-function descriptor in the module IR.
#[derive(Clone)]
pub enum HostCode {
    Fn(HostFn),
    ModuleFn(HostModuleFn),
}

/// A value type that can cross the slot boundary in a typed host function.
pub trait WasmValue: Sized {
    const TYPE: ValType;
    fn from_slot(slot: u64) -> Self;
    fn into_slot(self) -> u64;
}

impl WasmValue for u32 {
    const TYPE: ValType = ValType::I32;
    fn from_slot(slot: u64) -> Self {
        slot as u32
    }
    fn into_slot(self) -> u64 {
        self as u64
    }
}

impl WasmValue for i32 {
    const TYPE: ValType = ValType::I32;
    fn from_slot(slot: u64) -> Self {
        slot as u32 as i32
    }
    fn into_slot(self) -> u64 {
        self as u32 as u64
    }
}

impl WasmValue for u64 {
    const TYPE: ValType = ValType::I64;
    fn from_slot(slot: u64) -> Self {
        slot
    }
    fn into_slot(self) -> u64 {
        self
    }
}

impl WasmValue for i64 {
    const TYPE: ValType = ValType::I64;
    fn from_slot(slot: u64) -> Self {
        slot as i64
    }
    fn into_slot(self) -> u64 {
        self as u64
    }
}

impl WasmValue for f32 {
    const TYPE: ValType = ValType::F32;
    fn from_slot(slot: u64) -> Self {
        f32::from_bits(slot as u32)
    }
    fn into_slot(self) -> u64 {
        self.to_bits() as u64
    }
}

impl WasmValue for f64 {
    const TYPE: ValType = ValType::F64;
    fn from_slot(slot: u64) -> Self {
        f64::from_bits(slot)
    }
    fn into_slot(self) -> u64 {
        self.to_bits()
    }
}

/// Result shape of a typed host function: nothing, one value, or a pair.
pub trait WasmResults {
    fn result_types() -> Vec<ValType>;
    fn write(self, stack: &mut [u64]);
}

impl WasmResults for () {
    fn result_types() -> Vec<ValType> {
        Vec::new()
    }
    fn write(self, _stack: &mut [u64]) {}
}

impl<T: WasmValue> WasmResults for T {
    fn result_types() -> Vec<ValType> {
        vec![T::TYPE]
    }
    fn write(self, stack: &mut [u64]) {
        stack[0] = self.into_slot();
    }
}

impl<A: WasmValue, B: WasmValue> WasmResults for (A, B) {
    fn result_types() -> Vec<ValType> {
        vec![A::TYPE, B::TYPE]
    }
    fn write(self, stack: &mut [u64]) {
        stack[0] = self.0.into_slot();
        stack[1] = self.1.into_slot();
    }
}

/// Adapter from a plain closure to a host-function descriptor. The signature
/// is inferred from the closure's argument and result types.
pub trait IntoHostFunc<Params> {
    fn into_host_func(self) -> (FunctionType, HostCode);
}

macro_rules! impl_into_host_func {
    ($($param:ident),*) => {
        impl<Func, $($param,)* Ret> IntoHostFunc<($($param,)*)> for Func
        where
            Func: Fn($($param),*) -> Ret + Send + Sync + 'static,
            $($param: WasmValue,)*
            Ret: WasmResults,
        {
            fn into_host_func(self) -> (FunctionType, HostCode) {
                let ty = FunctionType::new(vec![$($param::TYPE),*], Ret::result_types());
                let code = HostCode::Fn(Arc::new(move |_ctx: &Context, stack: &mut [u64]| {
                    let mut slots = stack.iter().copied();
                    let _ = &mut slots;
                    // Arguments evaluate left to right; the engine sized the
                    // stack to hold all parameters.
                    let out = self($($param::from_slot(
                        slots.next().expect("host stack holds all parameters"),
                    )),*);
                    drop(slots);
                    out.write(stack);
                }));
                (ty, code)
            }
        }
    };
}

impl_into_host_func!();
impl_into_host_func!(A);
impl_into_host_func!(A, B);
impl_into_host_func!(A, B, C);
impl_into_host_func!(A, B, C, D);
impl_into_host_func!(A, B, C, D, E);
