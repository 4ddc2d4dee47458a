//! Per-invocation execution: the slot stack, the frame stack, the operator
//! dispatch loop, and trap recovery.
//!
//! Values live on a single `u64` stack shared by all frames: i32 results
//! occupy the low 32 bits zero-extended, floats are raw bits. Compile-time
//! validation makes the stack shape deterministic, so execution never
//! type-checks operands.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::trace;

use crate::context::Context;
use crate::core::FunctionIndex;
use crate::error::{CallError, Trap, TrapError, TrapOrigin};
use crate::host::func::HostCode;
use crate::runtime::instances::{CallContext, ModuleInstance};
use crate::runtime::table::NULL_REF;

use super::instr::{
    Conversion, FBinOp, FRelOp, FUnOp, IBinOp, IRelOp, IUnOp, Instr, LoadKind, StoreKind,
};
use super::{arena_lookup, CompiledBody, FuncRefArena, FunctionHandle};
use crate::engine::{CallEngine, ModuleEngine as _};

/// Frame depth limit; exceeding it traps `call stack exhausted`.
const CALL_STACK_DEPTH: usize = 2000;

/// Internal failure while running; converted to a [`CallError`] with the
/// captured trace at the call boundary.
enum Exec {
    Trap(Trap),
    HostRuntime(Trap),
    HostPanic(String),
    Interrupt(Trap),
    Exit(u32),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CtrlKind {
    Func,
    Block,
    Loop,
    If,
}

/// Runtime control frame. `target` is the operator index a branch to this
/// label jumps to: past the `end` for blocks and ifs, the body start for
/// loops.
#[derive(Clone, Copy)]
struct CtrlEntry {
    kind: CtrlKind,
    height: usize,
    params: u16,
    results: u16,
    target: usize,
}

struct WasmFrame {
    handle: FunctionHandle,
    /// Execution environment: the defining instance, or the caller's instance
    /// for host-owned thunks.
    env: Arc<ModuleInstance>,
    pc: usize,
    locals: Vec<u64>,
    /// Value stack height at function entry, after parameters moved to locals.
    base: usize,
    ctrl: Vec<CtrlEntry>,
}

enum Frame {
    Wasm(WasmFrame),
    /// Present only while a native host call is on the stack, so traps raised
    /// there render the host frame innermost.
    Host { handle: FunctionHandle },
}

impl Frame {
    fn handle(&self) -> &FunctionHandle {
        match self {
            Frame::Wasm(f) => &f.handle,
            Frame::Host { handle } => handle,
        }
    }
}

pub(crate) struct InterpreterCallEngine {
    root: FunctionHandle,
    func_refs: FuncRefArena,
    stack: Vec<u64>,
    frames: Vec<Frame>,
}

impl CallEngine for InterpreterCallEngine {
    fn call(
        &mut self,
        ctx: &Context,
        module: &CallContext,
        params: &[u64],
    ) -> Result<Vec<u64>, CallError> {
        module.instance().check_closed()?;
        let expected = self.root.compiled.ty.param_slots();
        if params.len() as u32 != expected {
            return Err(CallError::ParamArity { expected, actual: params.len() as u32 });
        }
        trace!(function = %self.root.compiled.debug_name, "call");
        self.stack.clear();
        self.frames.clear();
        self.stack.extend_from_slice(params);
        match self.run(ctx, module) {
            Ok(()) => {
                let results = self.root.compiled.ty.result_slots() as usize;
                let start = self.stack.len().saturating_sub(results);
                // Each call hands back distinct storage.
                let out = self.stack[start..].to_vec();
                self.stack.clear();
                Ok(out)
            }
            Err(exec) => {
                let err = self.recover(exec);
                self.stack.clear();
                self.frames.clear();
                Err(err)
            }
        }
    }
}

impl InterpreterCallEngine {
    pub(crate) fn new(root: FunctionHandle, func_refs: FuncRefArena) -> Self {
        Self { root, func_refs, stack: Vec::new(), frames: Vec::new() }
    }

    /// Converts an execution failure into the returned error, rendering the
    /// stack trace innermost first before the frames unwind.
    fn recover(&self, exec: Exec) -> CallError {
        let origin = match exec {
            Exec::Trap(t) => TrapOrigin::Wasm(t),
            Exec::HostRuntime(t) => TrapOrigin::HostRuntime(t),
            Exec::HostPanic(msg) => TrapOrigin::HostPanic(msg),
            Exec::Interrupt(t) => TrapOrigin::Interrupted(t),
            Exec::Exit(code) => return CallError::Exit(code),
        };
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|f| {
                let h = f.handle();
                format!("{}{}", h.compiled.debug_name, h.compiled.ty.render())
            })
            .collect();
        CallError::Trapped(TrapError { origin, trace })
    }

    fn run(&mut self, ctx: &Context, module: &CallContext) -> Result<(), Exec> {
        let root = self.root.clone();
        let caller_env = module.instance().clone();
        self.dispatch(ctx, module, root, caller_env)?;
        while !self.frames.is_empty() {
            self.step(ctx, module)?;
        }
        Ok(())
    }

    fn top(&mut self) -> &mut WasmFrame {
        match self.frames.last_mut().expect("frame stack is non-empty while running") {
            Frame::Wasm(f) => f,
            Frame::Host { .. } => unreachable!("host frames are transient"),
        }
    }

    /* ===== dispatch ===== */

    /// Invokes one function: native host code runs to completion here, wasm
    /// code pushes a frame for the main loop.
    fn dispatch(
        &mut self,
        ctx: &Context,
        module: &CallContext,
        handle: FunctionHandle,
        caller_env: Arc<ModuleInstance>,
    ) -> Result<(), Exec> {
        if self.frames.len() >= CALL_STACK_DEPTH {
            return Err(Exec::Trap(Trap::CallStackExhausted));
        }
        if let Err(CallError::Exit(code)) = module.instance().check_closed() {
            return Err(Exec::Exit(code));
        }
        match &handle.compiled.body {
            CompiledBody::Host(code) => {
                let code = code.clone();
                self.call_host(ctx, handle, code, caller_env)
            }
            CompiledBody::Wasm { ops, locals } => {
                let param_slots = handle.compiled.ty.param_slots() as usize;
                let result_slots = handle.compiled.ty.result_slots();
                let ops_len = ops.len();
                let start = self
                    .stack
                    .len()
                    .checked_sub(param_slots)
                    .expect("validation keeps parameters on the stack");
                let mut frame_locals = self.stack.split_off(start);
                frame_locals.resize(param_slots + locals.len(), 0);
                let base = self.stack.len();
                let env = if handle.compiled.is_host {
                    // Host-owned thunks run against the caller's instance.
                    caller_env
                } else {
                    handle.instance.upgrade().ok_or(Exec::Exit(0))?
                };
                self.frames.push(Frame::Wasm(WasmFrame {
                    handle,
                    env,
                    pc: 0,
                    locals: frame_locals,
                    base,
                    ctrl: vec![CtrlEntry {
                        kind: CtrlKind::Func,
                        height: base,
                        params: param_slots as u16,
                        results: result_slots as u16,
                        target: ops_len,
                    }],
                }));
                Ok(())
            }
        }
    }

    /// Runs a native host function under a recovery boundary, mapping an
    /// unwind into a structured trap failure.
    fn call_host(
        &mut self,
        ctx: &Context,
        handle: FunctionHandle,
        code: HostCode,
        caller_env: Arc<ModuleInstance>,
    ) -> Result<(), Exec> {
        ctx.check().map_err(Exec::Interrupt)?;
        let param_slots = handle.compiled.ty.param_slots() as usize;
        let result_slots = handle.compiled.ty.result_slots() as usize;
        let start = self
            .stack
            .len()
            .checked_sub(param_slots)
            .expect("validation keeps parameters on the stack");
        let mut host_stack = self.stack.split_off(start);
        host_stack.resize(param_slots.max(result_slots), 0);
        self.frames.push(Frame::Host { handle });
        let caller = CallContext::new(caller_env);
        let outcome = catch_unwind(AssertUnwindSafe(|| match &code {
            HostCode::Fn(f) => f(ctx, &mut host_stack),
            HostCode::ModuleFn(f) => f(ctx, &caller, &mut host_stack),
        }));
        match outcome {
            Ok(()) => {
                self.frames.pop();
                host_stack.truncate(result_slots);
                self.stack.extend_from_slice(&host_stack);
                Ok(())
            }
            Err(payload) => Err(classify_panic(payload)),
        }
    }

    fn resolve_call(&mut self, index: FunctionIndex) -> Result<FunctionHandle, Exec> {
        // Function indices resolve in the module that owns the executing code,
        // which for host-owned thunks differs from the execution environment.
        let defining = self
            .top()
            .handle
            .instance
            .upgrade()
            .ok_or(Exec::Exit(0))?;
        let engine = defining
            .engine()
            .as_any()
            .downcast_ref::<super::InterpreterModuleEngine>()
            .expect("instances of one engine implementation interoperate");
        Ok(engine.functions[index as usize].clone())
    }

    /* ===== stack helpers ===== */

    fn push(&mut self, v: u64) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> u64 {
        self.stack.pop().expect("validation keeps operands on the stack")
    }

    fn pop_u32(&mut self) -> u32 {
        self.pop() as u32
    }

    fn push_bool(&mut self, b: bool) {
        self.stack.push(b as u64);
    }

    /// Drops the region between `to_height` and the kept top `keep` slots.
    fn unwind_stack(&mut self, to_height: usize, keep: usize) {
        let keep_from = self.stack.len() - keep;
        if to_height < keep_from {
            self.stack.drain(to_height..keep_from);
        }
    }

    /// Pops the current function frame, moving its results down to its base.
    fn finish_function(&mut self) {
        let frame = match self.frames.pop().expect("a function frame is being finished") {
            Frame::Wasm(f) => f,
            Frame::Host { .. } => unreachable!("host frames are transient"),
        };
        let results = frame.handle.compiled.ty.result_slots() as usize;
        self.unwind_stack(frame.base, results);
    }

    /// Takes a branch of relative `depth` in the current frame.
    fn branch(&mut self, ctx: &Context, module: &CallContext, depth: u32) -> Result<(), Exec> {
        let entry = {
            let frame = self.top();
            let index = frame.ctrl.len() - 1 - depth as usize;
            let entry = frame.ctrl[index];
            if entry.kind != CtrlKind::Func {
                let keep_ctrl = if entry.kind == CtrlKind::Loop { index + 1 } else { index };
                frame.ctrl.truncate(keep_ctrl);
                frame.pc = entry.target;
            }
            entry
        };
        match entry.kind {
            CtrlKind::Func => {
                self.finish_function();
                Ok(())
            }
            CtrlKind::Loop => {
                // Backward edge: the only wasm-side suspension point.
                ctx.check().map_err(Exec::Interrupt)?;
                if let Err(CallError::Exit(code)) = module.instance().check_closed() {
                    return Err(Exec::Exit(code));
                }
                self.unwind_stack(entry.height, entry.params as usize);
                Ok(())
            }
            CtrlKind::Block | CtrlKind::If => {
                self.unwind_stack(entry.height, entry.results as usize);
                Ok(())
            }
        }
    }

    /* ===== the main loop ===== */

    fn step(&mut self, ctx: &Context, module: &CallContext) -> Result<(), Exec> {
        let instr = {
            let frame = self.top();
            let ops = match &frame.handle.compiled.body {
                CompiledBody::Wasm { ops, .. } => ops,
                CompiledBody::Host(_) => unreachable!("host functions never push wasm frames"),
            };
            let instr = ops[frame.pc].clone();
            frame.pc += 1;
            instr
        };

        match instr {
            Instr::Unreachable => return Err(Exec::Trap(Trap::Unreachable)),
            Instr::Nop => {}

            Instr::Block { end, params, results } => {
                let height = self.stack.len() - params as usize;
                self.top().ctrl.push(CtrlEntry {
                    kind: CtrlKind::Block,
                    height,
                    params,
                    results,
                    target: end as usize,
                });
            }
            Instr::Loop { start, params, results } => {
                let height = self.stack.len() - params as usize;
                self.top().ctrl.push(CtrlEntry {
                    kind: CtrlKind::Loop,
                    height,
                    params,
                    results,
                    target: start as usize,
                });
            }
            Instr::If { else_or_end, end, params, results } => {
                let cond = self.pop_u32();
                let height = self.stack.len() - params as usize;
                let frame = self.top();
                frame.ctrl.push(CtrlEntry {
                    kind: CtrlKind::If,
                    height,
                    params,
                    results,
                    target: end as usize,
                });
                if cond == 0 {
                    frame.pc = else_or_end as usize;
                }
            }
            Instr::Else { end } => {
                // Reaching here means the then arm finished; the End operator
                // pops the frame.
                self.top().pc = end as usize;
            }
            Instr::End => {
                let frame = self.top();
                let entry = frame.ctrl.pop().expect("control frame is open at end");
                if entry.kind == CtrlKind::Func {
                    self.finish_function();
                }
            }

            Instr::Br { depth } => self.branch(ctx, module, depth)?,
            Instr::BrIf { depth } => {
                if self.pop_u32() != 0 {
                    self.branch(ctx, module, depth)?;
                }
            }
            Instr::BrTable { targets, default } => {
                let index = self.pop_u32() as usize;
                let depth = targets.get(index).copied().unwrap_or(default);
                self.branch(ctx, module, depth)?;
            }
            Instr::Return => self.finish_function(),

            Instr::Call { function } => {
                let callee = self.resolve_call(function)?;
                let env = self.top().env.clone();
                self.dispatch(ctx, module, callee, env)?;
            }
            Instr::CallIndirect { type_index, table } => {
                let element = self.pop_u32();
                let (expected, table) = {
                    let frame = self.top();
                    let defining = frame.handle.instance.upgrade().ok_or(Exec::Exit(0))?;
                    let expected = defining
                        .type_id(type_index)
                        .expect("validated type index");
                    let table = frame
                        .env
                        .table(table)
                        .cloned()
                        .ok_or(Exec::Trap(Trap::InvalidTableAccess))?;
                    (expected, table)
                };
                let reference = table.get(element).ok_or(Exec::Trap(Trap::InvalidTableAccess))?;
                let callee = arena_lookup(&self.func_refs, reference)
                    .ok_or(Exec::Trap(Trap::InvalidTableAccess))?;
                if callee.type_id != expected {
                    return Err(Exec::Trap(Trap::IndirectCallTypeMismatch));
                }
                let env = self.top().env.clone();
                self.dispatch(ctx, module, callee, env)?;
            }

            Instr::Drop => {
                self.pop();
            }
            Instr::Select => {
                let cond = self.pop_u32();
                let b = self.pop();
                let a = self.pop();
                self.push(if cond != 0 { a } else { b });
            }

            Instr::LocalGet { index } => {
                let v = self.top().locals[index as usize];
                self.push(v);
            }
            Instr::LocalSet { index } => {
                let v = self.pop();
                self.top().locals[index as usize] = v;
            }
            Instr::LocalTee { index } => {
                let v = *self.stack.last().expect("validation keeps operands on the stack");
                self.top().locals[index as usize] = v;
            }
            Instr::GlobalGet { index } => {
                let v = self
                    .top()
                    .env
                    .global(index)
                    .expect("validated global index")
                    .get();
                self.push(v);
            }
            Instr::GlobalSet { index } => {
                let v = self.pop();
                self.top()
                    .env
                    .global(index)
                    .expect("validated global index")
                    .replace(v);
            }

            Instr::TableGet { table } => {
                let i = self.pop_u32();
                let v = self
                    .table(table)?
                    .get(i)
                    .ok_or(Exec::Trap(Trap::TableOutOfBounds))?;
                self.push(v);
            }
            Instr::TableSet { table } => {
                let v = self.pop();
                let i = self.pop_u32();
                if !self.table(table)?.set(i, v) {
                    return Err(Exec::Trap(Trap::TableOutOfBounds));
                }
            }

            Instr::Load { kind, offset } => self.load(kind, offset)?,
            Instr::Store { kind, offset } => self.store(kind, offset)?,

            Instr::MemorySize => {
                let pages = self.memory()?.size_pages();
                self.push(pages as u64);
            }
            Instr::MemoryGrow => {
                let delta = self.pop_u32();
                let result = match self.memory()?.grow(delta) {
                    Some(prev) => prev as u64,
                    None => u32::MAX as u64,
                };
                self.push(result);
            }
            Instr::MemoryInit { segment } => {
                let n = self.pop_u32();
                let src = self.pop_u32();
                let dst = self.pop_u32();
                let env = self.top().env.clone();
                let data = env
                    .data_instance(segment)
                    .expect("validated data segment")
                    .read()
                    .expect("data instance poisoned");
                let end = src.checked_add(n).ok_or(Exec::Trap(Trap::MemoryOutOfBounds))?;
                if end as usize > data.len() {
                    return Err(Exec::Trap(Trap::MemoryOutOfBounds));
                }
                let bytes = &data[src as usize..end as usize];
                if !self.memory()?.write(dst, bytes) {
                    return Err(Exec::Trap(Trap::MemoryOutOfBounds));
                }
            }
            Instr::DataDrop { segment } => {
                self.top()
                    .env
                    .data_instance(segment)
                    .expect("validated data segment")
                    .write()
                    .expect("data instance poisoned")
                    .clear();
            }
            Instr::MemoryCopy => {
                let n = self.pop_u32();
                let src = self.pop_u32();
                let dst = self.pop_u32();
                if !self.memory()?.copy_within(dst, src, n) {
                    return Err(Exec::Trap(Trap::MemoryOutOfBounds));
                }
            }
            Instr::MemoryFill => {
                let n = self.pop_u32();
                let val = self.pop_u32() as u8;
                let dst = self.pop_u32();
                if !self.memory()?.fill(dst, val, n) {
                    return Err(Exec::Trap(Trap::MemoryOutOfBounds));
                }
            }

            Instr::TableInit { segment, table } => {
                let n = self.pop_u32();
                let src = self.pop_u32();
                let dst = self.pop_u32();
                let env = self.top().env.clone();
                let elems = env
                    .elem_instance(segment)
                    .expect("validated element segment")
                    .read()
                    .expect("element instance poisoned");
                let end = src.checked_add(n).ok_or(Exec::Trap(Trap::TableOutOfBounds))?;
                if end as usize > elems.len() {
                    return Err(Exec::Trap(Trap::TableOutOfBounds));
                }
                let refs: Vec<u64> = elems[src as usize..end as usize]
                    .iter()
                    .map(|f| {
                        f.and_then(|i| env.engine().function_ref(i)).unwrap_or(NULL_REF)
                    })
                    .collect();
                drop(elems);
                if !self.table(table)?.init(dst, &refs) {
                    return Err(Exec::Trap(Trap::TableOutOfBounds));
                }
            }
            Instr::ElemDrop { segment } => {
                self.top()
                    .env
                    .elem_instance(segment)
                    .expect("validated element segment")
                    .write()
                    .expect("element instance poisoned")
                    .clear();
            }
            Instr::TableCopy { dst, src } => {
                let n = self.pop_u32();
                let s = self.pop_u32();
                let d = self.pop_u32();
                let dst_table = self.table(dst)?;
                let src_table = self.table(src)?;
                if !crate::runtime::table::TableInstance::copy(&dst_table, d, &src_table, s, n) {
                    return Err(Exec::Trap(Trap::TableOutOfBounds));
                }
            }
            Instr::TableGrow { table } => {
                let delta = self.pop_u32();
                let init = self.pop();
                let result = match self.table(table)?.grow(delta, init) {
                    Some(prev) => prev as u64,
                    None => u32::MAX as u64,
                };
                self.push(result);
            }
            Instr::TableSize { table } => {
                let size = self.table(table)?.size();
                self.push(size as u64);
            }
            Instr::TableFill { table } => {
                let n = self.pop_u32();
                let val = self.pop();
                let dst = self.pop_u32();
                if !self.table(table)?.fill(dst, val, n) {
                    return Err(Exec::Trap(Trap::TableOutOfBounds));
                }
            }

            Instr::RefNull => self.push(NULL_REF),
            Instr::RefIsNull => {
                let v = self.pop();
                self.push_bool(v == NULL_REF);
            }
            Instr::RefFunc { function } => {
                let frame = self.top();
                let defining = frame.handle.instance.upgrade().ok_or(Exec::Exit(0))?;
                let reference = defining
                    .engine()
                    .function_ref(function)
                    .unwrap_or(NULL_REF);
                self.push(reference);
            }

            Instr::I32Const(v) => self.push(v as u32 as u64),
            Instr::I64Const(v) => self.push(v as u64),
            Instr::F32Const(bits) => self.push(bits as u64),
            Instr::F64Const(bits) => self.push(bits),

            Instr::I32Eqz => {
                let v = self.pop_u32();
                self.push_bool(v == 0);
            }
            Instr::I64Eqz => {
                let v = self.pop();
                self.push_bool(v == 0);
            }

            Instr::I32UnOp(op) => {
                let v = self.pop_u32();
                let r = match op {
                    IUnOp::Clz => v.leading_zeros(),
                    IUnOp::Ctz => v.trailing_zeros(),
                    IUnOp::Popcnt => v.count_ones(),
                };
                self.push(r as u64);
            }
            Instr::I64UnOp(op) => {
                let v = self.pop();
                let r = match op {
                    IUnOp::Clz => v.leading_zeros(),
                    IUnOp::Ctz => v.trailing_zeros(),
                    IUnOp::Popcnt => v.count_ones(),
                };
                self.push(r as u64);
            }
            Instr::I32BinOp(op) => {
                let rhs = self.pop_u32();
                let lhs = self.pop_u32();
                let r = i32_binop(lhs, rhs, op).map_err(Exec::Trap)?;
                self.push(r as u64);
            }
            Instr::I64BinOp(op) => {
                let rhs = self.pop();
                let lhs = self.pop();
                let r = i64_binop(lhs, rhs, op).map_err(Exec::Trap)?;
                self.push(r);
            }
            Instr::I32RelOp(op) => {
                let rhs = self.pop_u32();
                let lhs = self.pop_u32();
                self.push_bool(irelop_u32(lhs, rhs, op));
            }
            Instr::I64RelOp(op) => {
                let rhs = self.pop();
                let lhs = self.pop();
                self.push_bool(irelop_u64(lhs, rhs, op));
            }

            Instr::F32UnOp(op) => {
                let v = f32::from_bits(self.pop_u32());
                self.push(f32_unop(v, op).to_bits() as u64);
            }
            Instr::F64UnOp(op) => {
                let v = f64::from_bits(self.pop());
                self.push(f64_unop(v, op).to_bits());
            }
            Instr::F32BinOp(op) => {
                let rhs = f32::from_bits(self.pop_u32());
                let lhs = f32::from_bits(self.pop_u32());
                self.push(f32_binop(lhs, rhs, op).to_bits() as u64);
            }
            Instr::F64BinOp(op) => {
                let rhs = f64::from_bits(self.pop());
                let lhs = f64::from_bits(self.pop());
                self.push(f64_binop(lhs, rhs, op).to_bits());
            }
            Instr::F32RelOp(op) => {
                let rhs = f32::from_bits(self.pop_u32());
                let lhs = f32::from_bits(self.pop_u32());
                self.push_bool(frelop(lhs.partial_cmp(&rhs), lhs == rhs, op));
            }
            Instr::F64RelOp(op) => {
                let rhs = f64::from_bits(self.pop());
                let lhs = f64::from_bits(self.pop());
                self.push_bool(frelop(lhs.partial_cmp(&rhs), lhs == rhs, op));
            }

            Instr::Convert(conversion) => self.convert(conversion)?,
        }
        Ok(())
    }

    /// The execution environment's memory. Host thunks may run against a
    /// caller without one, which surfaces as an out-of-bounds access.
    fn memory(&mut self) -> Result<Arc<crate::runtime::memory::MemoryInstance>, Exec> {
        self.top()
            .env
            .memory()
            .cloned()
            .ok_or(Exec::Trap(Trap::MemoryOutOfBounds))
    }

    fn table(&mut self, index: u32) -> Result<Arc<crate::runtime::table::TableInstance>, Exec> {
        self.top()
            .env
            .table(index)
            .cloned()
            .ok_or(Exec::Trap(Trap::InvalidTableAccess))
    }

    fn load(&mut self, kind: LoadKind, offset: u32) -> Result<(), Exec> {
        let addr = self.pop_u32() as u64 + offset as u64;
        if addr > u32::MAX as u64 {
            return Err(Exec::Trap(Trap::MemoryOutOfBounds));
        }
        let addr = addr as u32;
        let mem = self.memory()?;
        let value = match kind {
            LoadKind::I32 | LoadKind::F32 => mem.read_u32_le(addr).map(|v| v as u64),
            LoadKind::I64 | LoadKind::F64 => mem.read_u64_le(addr),
            LoadKind::I32U8 => mem.read_byte(addr).map(|v| v as u64),
            LoadKind::I32S8 => mem.read_byte(addr).map(|v| v as i8 as i32 as u32 as u64),
            LoadKind::I32U16 => mem.read_u16_le(addr).map(|v| v as u64),
            LoadKind::I32S16 => mem.read_u16_le(addr).map(|v| v as i16 as i32 as u32 as u64),
            LoadKind::I64U8 => mem.read_byte(addr).map(|v| v as u64),
            LoadKind::I64S8 => mem.read_byte(addr).map(|v| v as i8 as i64 as u64),
            LoadKind::I64U16 => mem.read_u16_le(addr).map(|v| v as u64),
            LoadKind::I64S16 => mem.read_u16_le(addr).map(|v| v as i16 as i64 as u64),
            LoadKind::I64U32 => mem.read_u32_le(addr).map(|v| v as u64),
            LoadKind::I64S32 => mem.read_u32_le(addr).map(|v| v as i32 as i64 as u64),
        };
        let value = value.ok_or(Exec::Trap(Trap::MemoryOutOfBounds))?;
        self.push(value);
        Ok(())
    }

    fn store(&mut self, kind: StoreKind, offset: u32) -> Result<(), Exec> {
        let value = self.pop();
        let addr = self.pop_u32() as u64 + offset as u64;
        if addr > u32::MAX as u64 {
            return Err(Exec::Trap(Trap::MemoryOutOfBounds));
        }
        let addr = addr as u32;
        let mem = self.memory()?;
        let ok = match kind {
            StoreKind::I32 | StoreKind::F32 => mem.write_u32_le(addr, value as u32),
            StoreKind::I64 | StoreKind::F64 => mem.write_u64_le(addr, value),
            StoreKind::I32Narrow8 | StoreKind::I64Narrow8 => mem.write_byte(addr, value as u8),
            StoreKind::I32Narrow16 | StoreKind::I64Narrow16 => {
                mem.write_u16_le(addr, value as u16)
            }
            StoreKind::I64Narrow32 => mem.write_u32_le(addr, value as u32),
        };
        if ok {
            Ok(())
        } else {
            Err(Exec::Trap(Trap::MemoryOutOfBounds))
        }
    }

    fn convert(&mut self, conversion: Conversion) -> Result<(), Exec> {
        use Conversion::*;
        let r = match conversion {
            I32WrapI64 => self.pop() as u32 as u64,
            I64ExtendI32S => self.pop_u32() as i32 as i64 as u64,
            I64ExtendI32U => self.pop_u32() as u64,
            I32TruncF32S => {
                let v = f32::from_bits(self.pop_u32()) as f64;
                trunc_to_i32(v).map_err(Exec::Trap)? as u32 as u64
            }
            I32TruncF32U => {
                let v = f32::from_bits(self.pop_u32()) as f64;
                trunc_to_u32(v).map_err(Exec::Trap)? as u64
            }
            I32TruncF64S => {
                let v = f64::from_bits(self.pop());
                trunc_to_i32(v).map_err(Exec::Trap)? as u32 as u64
            }
            I32TruncF64U => {
                let v = f64::from_bits(self.pop());
                trunc_to_u32(v).map_err(Exec::Trap)? as u64
            }
            I64TruncF32S => {
                let v = f32::from_bits(self.pop_u32()) as f64;
                trunc_to_i64(v).map_err(Exec::Trap)? as u64
            }
            I64TruncF32U => {
                let v = f32::from_bits(self.pop_u32()) as f64;
                trunc_to_u64(v).map_err(Exec::Trap)?
            }
            I64TruncF64S => {
                let v = f64::from_bits(self.pop());
                trunc_to_i64(v).map_err(Exec::Trap)? as u64
            }
            I64TruncF64U => {
                let v = f64::from_bits(self.pop());
                trunc_to_u64(v).map_err(Exec::Trap)?
            }
            F32ConvertI32S => ((self.pop_u32() as i32 as f32).to_bits()) as u64,
            F32ConvertI32U => ((self.pop_u32() as f32).to_bits()) as u64,
            F32ConvertI64S => ((self.pop() as i64 as f32).to_bits()) as u64,
            F32ConvertI64U => ((self.pop() as f32).to_bits()) as u64,
            F64ConvertI32S => (self.pop_u32() as i32 as f64).to_bits(),
            F64ConvertI32U => (self.pop_u32() as f64).to_bits(),
            F64ConvertI64S => (self.pop() as i64 as f64).to_bits(),
            F64ConvertI64U => (self.pop() as f64).to_bits(),
            F32DemoteF64 => ((f64::from_bits(self.pop()) as f32).to_bits()) as u64,
            F64PromoteF32 => (f32::from_bits(self.pop_u32()) as f64).to_bits(),
            // Reinterprets are identities on the slot representation.
            I32ReinterpretF32 | F32ReinterpretI32 => self.pop_u32() as u64,
            I64ReinterpretF64 | F64ReinterpretI64 => self.pop(),
            I32Extend8S => self.pop_u32() as u8 as i8 as i32 as u32 as u64,
            I32Extend16S => self.pop_u32() as u16 as i16 as i32 as u32 as u64,
            I64Extend8S => self.pop() as u8 as i8 as i64 as u64,
            I64Extend16S => self.pop() as u16 as i16 as i64 as u64,
            I64Extend32S => self.pop() as u32 as i32 as i64 as u64,
        };
        self.push(r);
        Ok(())
    }
}

/* ===== panic classification ===== */

/// Maps a recovered host unwind to its failure kind. Payloads carrying a
/// [`Trap`] propagate as wasm traps; the standard library's arithmetic fault
/// messages surface as runtime errors; everything else is a host panic.
fn classify_panic(payload: Box<dyn std::any::Any + Send>) -> Exec {
    if let Some(trap) = payload.downcast_ref::<Trap>() {
        return Exec::Trap(*trap);
    }
    let message = payload
        .downcast_ref::<&'static str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    match runtime_fault(&message) {
        Some(trap) => Exec::HostRuntime(trap),
        None => Exec::HostPanic(message),
    }
}

fn runtime_fault(message: &str) -> Option<Trap> {
    match message {
        "attempt to divide by zero"
        | "attempt to calculate the remainder with a divisor of zero" => {
            Some(Trap::IntegerDivideByZero)
        }
        m if m.starts_with("attempt to") && m.ends_with("with overflow") => {
            Some(Trap::IntegerOverflow)
        }
        _ => None,
    }
}

/* ===== numeric helpers ===== */

fn i32_binop(lhs: u32, rhs: u32, op: IBinOp) -> Result<u32, Trap> {
    let (l, r) = (lhs as i32, rhs as i32);
    Ok(match op {
        IBinOp::Add => lhs.wrapping_add(rhs),
        IBinOp::Sub => lhs.wrapping_sub(rhs),
        IBinOp::Mul => lhs.wrapping_mul(rhs),
        IBinOp::DivS => {
            if r == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            if l == i32::MIN && r == -1 {
                return Err(Trap::IntegerOverflow);
            }
            l.wrapping_div(r) as u32
        }
        IBinOp::DivU => {
            if rhs == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            lhs / rhs
        }
        IBinOp::RemS => {
            if r == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            l.wrapping_rem(r) as u32
        }
        IBinOp::RemU => {
            if rhs == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            lhs % rhs
        }
        IBinOp::And => lhs & rhs,
        IBinOp::Or => lhs | rhs,
        IBinOp::Xor => lhs ^ rhs,
        IBinOp::Shl => lhs.wrapping_shl(rhs),
        IBinOp::ShrS => (l.wrapping_shr(rhs)) as u32,
        IBinOp::ShrU => lhs.wrapping_shr(rhs),
        IBinOp::Rotl => lhs.rotate_left(rhs % 32),
        IBinOp::Rotr => lhs.rotate_right(rhs % 32),
    })
}

fn i64_binop(lhs: u64, rhs: u64, op: IBinOp) -> Result<u64, Trap> {
    let (l, r) = (lhs as i64, rhs as i64);
    Ok(match op {
        IBinOp::Add => lhs.wrapping_add(rhs),
        IBinOp::Sub => lhs.wrapping_sub(rhs),
        IBinOp::Mul => lhs.wrapping_mul(rhs),
        IBinOp::DivS => {
            if r == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            if l == i64::MIN && r == -1 {
                return Err(Trap::IntegerOverflow);
            }
            l.wrapping_div(r) as u64
        }
        IBinOp::DivU => {
            if rhs == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            lhs / rhs
        }
        IBinOp::RemS => {
            if r == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            l.wrapping_rem(r) as u64
        }
        IBinOp::RemU => {
            if rhs == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            lhs % rhs
        }
        IBinOp::And => lhs & rhs,
        IBinOp::Or => lhs | rhs,
        IBinOp::Xor => lhs ^ rhs,
        IBinOp::Shl => lhs.wrapping_shl(rhs as u32),
        IBinOp::ShrS => (l.wrapping_shr(rhs as u32)) as u64,
        IBinOp::ShrU => lhs.wrapping_shr(rhs as u32),
        IBinOp::Rotl => lhs.rotate_left((rhs % 64) as u32),
        IBinOp::Rotr => lhs.rotate_right((rhs % 64) as u32),
    })
}

fn irelop_u32(lhs: u32, rhs: u32, op: IRelOp) -> bool {
    let (l, r) = (lhs as i32, rhs as i32);
    match op {
        IRelOp::Eq => lhs == rhs,
        IRelOp::Ne => lhs != rhs,
        IRelOp::LtS => l < r,
        IRelOp::LtU => lhs < rhs,
        IRelOp::GtS => l > r,
        IRelOp::GtU => lhs > rhs,
        IRelOp::LeS => l <= r,
        IRelOp::LeU => lhs <= rhs,
        IRelOp::GeS => l >= r,
        IRelOp::GeU => lhs >= rhs,
    }
}

fn irelop_u64(lhs: u64, rhs: u64, op: IRelOp) -> bool {
    let (l, r) = (lhs as i64, rhs as i64);
    match op {
        IRelOp::Eq => lhs == rhs,
        IRelOp::Ne => lhs != rhs,
        IRelOp::LtS => l < r,
        IRelOp::LtU => lhs < rhs,
        IRelOp::GtS => l > r,
        IRelOp::GtU => lhs > rhs,
        IRelOp::LeS => l <= r,
        IRelOp::LeU => lhs <= rhs,
        IRelOp::GeS => l >= r,
        IRelOp::GeU => lhs >= rhs,
    }
}

fn frelop(ord: Option<std::cmp::Ordering>, eq: bool, op: FRelOp) -> bool {
    use std::cmp::Ordering::*;
    match op {
        FRelOp::Eq => eq,
        FRelOp::Ne => !eq,
        FRelOp::Lt => ord == Some(Less),
        FRelOp::Gt => ord == Some(Greater),
        FRelOp::Le => matches!(ord, Some(Less) | Some(Equal)),
        FRelOp::Ge => matches!(ord, Some(Greater) | Some(Equal)),
    }
}

fn f32_unop(v: f32, op: FUnOp) -> f32 {
    match op {
        FUnOp::Abs => v.abs(),
        FUnOp::Neg => -v,
        FUnOp::Ceil => v.ceil(),
        FUnOp::Floor => v.floor(),
        FUnOp::Trunc => v.trunc(),
        FUnOp::Nearest => v.round_ties_even(),
        FUnOp::Sqrt => v.sqrt(),
    }
}

fn f64_unop(v: f64, op: FUnOp) -> f64 {
    match op {
        FUnOp::Abs => v.abs(),
        FUnOp::Neg => -v,
        FUnOp::Ceil => v.ceil(),
        FUnOp::Floor => v.floor(),
        FUnOp::Trunc => v.trunc(),
        FUnOp::Nearest => v.round_ties_even(),
        FUnOp::Sqrt => v.sqrt(),
    }
}

fn f32_binop(lhs: f32, rhs: f32, op: FBinOp) -> f32 {
    match op {
        FBinOp::Add => lhs + rhs,
        FBinOp::Sub => lhs - rhs,
        FBinOp::Mul => lhs * rhs,
        FBinOp::Div => lhs / rhs,
        FBinOp::Min => wasm_min_f32(lhs, rhs),
        FBinOp::Max => wasm_max_f32(lhs, rhs),
        FBinOp::Copysign => lhs.copysign(rhs),
    }
}

fn f64_binop(lhs: f64, rhs: f64, op: FBinOp) -> f64 {
    match op {
        FBinOp::Add => lhs + rhs,
        FBinOp::Sub => lhs - rhs,
        FBinOp::Mul => lhs * rhs,
        FBinOp::Div => lhs / rhs,
        FBinOp::Min => wasm_min_f64(lhs, rhs),
        FBinOp::Max => wasm_max_f64(lhs, rhs),
        FBinOp::Copysign => lhs.copysign(rhs),
    }
}

// min/max propagate NaN and order negative zero below positive zero.

fn wasm_min_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_negative() || b.is_sign_negative() {
            -0.0
        } else {
            0.0
        }
    } else {
        a.min(b)
    }
}

fn wasm_max_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_positive() || b.is_sign_positive() {
            0.0
        } else {
            -0.0
        }
    } else {
        a.max(b)
    }
}

fn wasm_min_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_negative() || b.is_sign_negative() {
            -0.0
        } else {
            0.0
        }
    } else {
        a.min(b)
    }
}

fn wasm_max_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_positive() || b.is_sign_positive() {
            0.0
        } else {
            -0.0
        }
    } else {
        a.max(b)
    }
}

fn trunc_to_i32(v: f64) -> Result<i32, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    let t = v.trunc();
    if t < -2147483648.0 || t > 2147483647.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t as i32)
}

fn trunc_to_u32(v: f64) -> Result<u32, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    let t = v.trunc();
    if t < 0.0 || t > 4294967295.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t as u32)
}

fn trunc_to_i64(v: f64) -> Result<i64, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    let t = v.trunc();
    if t >= 9223372036854775808.0 || t < -9223372036854775808.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t as i64)
}

fn trunc_to_u64(v: f64) -> Result<u64, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    let t = v.trunc();
    if t >= 18446744073709551616.0 || t < 0.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t as u64)
}
