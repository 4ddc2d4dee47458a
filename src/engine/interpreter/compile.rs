//! Single-pass validation and lowering of one function body.
//!
//! The pass abstractly interprets the operand stack against each operator's
//! typing rule while emitting the decoded operator table. Control structure is
//! resolved here: block frames record where their `end` lands, so branch
//! targets in the output are absolute operator indices.

use crate::binary::Cursor;
use crate::core::{opcodes as op, render_types, FunctionType, GlobalType, ImportDesc, Module, ValType};
use crate::error::FunctionError;

use super::instr::{
    Conversion, FBinOp, FRelOp, FUnOp, IBinOp, IRelOp, IUnOp, Instr, LoadKind, StoreKind,
};

/// Abstract operand: a concrete type, or the unknown produced after an
/// unconditional transfer of control.
type Abstract = Option<ValType>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Func,
    Block,
    Loop,
    If,
}

#[derive(Debug, Clone)]
struct CtrlFrame {
    kind: BlockKind,
    params: Vec<ValType>,
    results: Vec<ValType>,
    /// Stack height at block entry, below the block's parameters.
    height: usize,
    unreachable: bool,
    /// Index of the emitted Block/Loop/If operator, for target patching.
    emit_index: usize,
    /// Index of the emitted Else operator, when one was seen.
    else_emit: Option<usize>,
}

impl CtrlFrame {
    /// Types a branch to this label must provide.
    fn label_types(&self) -> &[ValType] {
        if self.kind == BlockKind::Loop {
            &self.params
        } else {
            &self.results
        }
    }
}

pub(super) struct FunctionCompiler<'a> {
    module: &'a Module,
    /// Host-owned thunks execute against the caller's instance, so their
    /// memory and table uses cannot be resolved against the defining module.
    host: bool,
    locals: Vec<ValType>,
    stack: Vec<Abstract>,
    ctrl: Vec<CtrlFrame>,
    out: Vec<Instr>,
    /// Count of operators decoded so far, for diagnostics.
    opnum: usize,
}

/// Validates `bytes` against `ty` and lowers it to the operator table.
pub(super) fn compile_body(
    module: &Module,
    ty: &FunctionType,
    bytes: &[u8],
    local_types: &[ValType],
    host: bool,
) -> Result<Vec<Instr>, FunctionError> {
    let mut locals = ty.params.clone();
    locals.extend_from_slice(local_types);
    let mut compiler = FunctionCompiler {
        module,
        host,
        locals,
        stack: Vec::new(),
        ctrl: vec![CtrlFrame {
            kind: BlockKind::Func,
            params: Vec::new(),
            results: ty.results.clone(),
            height: 0,
            unreachable: false,
            emit_index: 0,
            else_emit: None,
        }],
        out: Vec::new(),
        opnum: 0,
    };
    compiler.run(bytes)?;
    Ok(compiler.out)
}

impl<'a> FunctionCompiler<'a> {
    fn run(&mut self, bytes: &[u8]) -> Result<(), FunctionError> {
        let mut cur = Cursor::new(bytes);
        while !self.ctrl.is_empty() {
            if cur.is_eof() {
                return Err(FunctionError::TruncatedBody { operator: self.opnum });
            }
            let opcode = cur
                .read_u8()
                .map_err(|_| FunctionError::TruncatedBody { operator: self.opnum })?;
            self.step(opcode, &mut cur)?;
            self.opnum += 1;
        }
        if !cur.is_eof() {
            return Err(FunctionError::UnbalancedControl);
        }
        Ok(())
    }

    /* ===== immediates ===== */

    fn truncated(&self) -> FunctionError {
        FunctionError::TruncatedBody { operator: self.opnum }
    }

    fn read_u32(&self, cur: &mut Cursor<'_>) -> Result<u32, FunctionError> {
        cur.read_uleb_u32().map_err(|_| self.truncated())
    }

    /// Blocktype immediate: empty, one value type, or a type-table index.
    fn read_block_type(
        &self,
        cur: &mut Cursor<'_>,
    ) -> Result<(Vec<ValType>, Vec<ValType>), FunctionError> {
        let peek = cur.peek_u8().map_err(|_| self.truncated())?;
        match peek {
            0x40 => {
                cur.read_u8().map_err(|_| self.truncated())?;
                Ok((Vec::new(), Vec::new()))
            }
            0x7F | 0x7E | 0x7D | 0x7C | 0x70 | 0x6F => {
                let byte = cur.read_u8().map_err(|_| self.truncated())?;
                Ok((Vec::new(), vec![val_type_from_byte(byte)]))
            }
            _ => {
                let index = cur.read_sleb_i33().map_err(|_| self.truncated())?;
                let ty = u32::try_from(index)
                    .ok()
                    .and_then(|i| self.module.types.get(i as usize))
                    .ok_or(FunctionError::UnknownType {
                        operator: self.opnum,
                        index: index as u32,
                    })?;
                Ok((ty.params.clone(), ty.results.clone()))
            }
        }
    }

    fn read_memarg(&self, cur: &mut Cursor<'_>, natural: u32) -> Result<u32, FunctionError> {
        let align = self.read_u32(cur)?;
        let offset = self.read_u32(cur)?;
        if align > natural {
            return Err(FunctionError::InvalidAlignment { operator: self.opnum, align });
        }
        Ok(offset)
    }

    /* ===== abstract stack ===== */

    fn push(&mut self, t: ValType) {
        self.stack.push(Some(t));
    }

    fn push_all(&mut self, types: &[ValType]) {
        for t in types {
            self.stack.push(Some(*t));
        }
    }

    fn frame(&self) -> &CtrlFrame {
        self.ctrl.last().expect("control stack holds the function frame")
    }

    fn have_above_frame(&self) -> String {
        let height = self.frame().height;
        render_abstract(&self.stack[height..])
    }

    fn pop_any(&mut self) -> Result<Abstract, FunctionError> {
        let frame = self.frame();
        if self.stack.len() == frame.height {
            if frame.unreachable {
                return Ok(None);
            }
            return Err(FunctionError::StackUnderflow {
                operator: self.opnum,
                have: "()".to_string(),
                want: "(1 more operand)".to_string(),
            });
        }
        Ok(self.stack.pop().expect("stack is above the frame height"))
    }

    fn pop_expect(&mut self, want: ValType) -> Result<(), FunctionError> {
        match self.pop_any()? {
            None => Ok(()),
            Some(t) if t == want => Ok(()),
            Some(t) => Err(FunctionError::TypeMismatch {
                operator: self.opnum,
                have: render_types(&[t]),
                want: render_types(&[want]),
            }),
        }
    }

    fn pop_all(&mut self, want: &[ValType]) -> Result<(), FunctionError> {
        for t in want.iter().rev() {
            self.pop_expect(*t)?;
        }
        Ok(())
    }

    fn set_unreachable(&mut self) {
        let frame = self.ctrl.last_mut().expect("control stack holds the function frame");
        frame.unreachable = true;
        let height = frame.height;
        self.stack.truncate(height);
    }

    /* ===== control ===== */

    fn push_frame(&mut self, kind: BlockKind, params: Vec<ValType>, results: Vec<ValType>) {
        let height = self.stack.len();
        self.push_all(&params);
        // Height excludes the block parameters; they belong to the new frame.
        self.ctrl.push(CtrlFrame {
            kind,
            params,
            results,
            height,
            unreachable: false,
            emit_index: self.out.len(),
            else_emit: None,
        });
    }

    /// Checks that the current frame produced exactly its results.
    fn check_frame_results(&mut self) -> Result<(), FunctionError> {
        let frame = self.frame().clone();
        let have_len = self.stack.len() - frame.height;
        if !frame.unreachable && have_len < frame.results.len() {
            return Err(FunctionError::NotEnoughResults {
                have: self.have_above_frame(),
                want: render_types(&frame.results),
            });
        }
        if have_len > frame.results.len() {
            return Err(FunctionError::TooManyResults {
                have: self.have_above_frame(),
                want: render_types(&frame.results),
            });
        }
        self.pop_all(&frame.results)?;
        Ok(())
    }

    fn branch_target(&self, depth: u32) -> Result<&CtrlFrame, FunctionError> {
        let depth = depth as usize;
        if depth >= self.ctrl.len() {
            return Err(FunctionError::InvalidBranchTarget {
                operator: self.opnum,
                depth: depth as u32,
            });
        }
        Ok(&self.ctrl[self.ctrl.len() - 1 - depth])
    }

    /* ===== shared typing rules ===== */

    fn unop(&mut self, t: ValType) -> Result<(), FunctionError> {
        self.pop_expect(t)?;
        self.push(t);
        Ok(())
    }

    fn binop(&mut self, t: ValType) -> Result<(), FunctionError> {
        self.pop_expect(t)?;
        self.pop_expect(t)?;
        self.push(t);
        Ok(())
    }

    fn relop(&mut self, t: ValType) -> Result<(), FunctionError> {
        self.pop_expect(t)?;
        self.pop_expect(t)?;
        self.push(ValType::I32);
        Ok(())
    }

    fn cvtop(&mut self, from: ValType, to: ValType) -> Result<(), FunctionError> {
        self.pop_expect(from)?;
        self.push(to);
        Ok(())
    }

    fn load(&mut self, cur: &mut Cursor<'_>, kind: LoadKind, natural: u32, result: ValType) -> Result<(), FunctionError> {
        self.require_memory()?;
        let offset = self.read_memarg(cur, natural)?;
        self.pop_expect(ValType::I32)?;
        self.push(result);
        self.out.push(Instr::Load { kind, offset });
        Ok(())
    }

    fn store(&mut self, cur: &mut Cursor<'_>, kind: StoreKind, natural: u32, value: ValType) -> Result<(), FunctionError> {
        self.require_memory()?;
        let offset = self.read_memarg(cur, natural)?;
        self.pop_expect(value)?;
        self.pop_expect(ValType::I32)?;
        self.out.push(Instr::Store { kind, offset });
        Ok(())
    }

    fn require_memory(&self) -> Result<(), FunctionError> {
        if self.module.has_memory() || self.host {
            Ok(())
        } else {
            Err(FunctionError::UnknownMemory { operator: self.opnum })
        }
    }

    fn require_table(&self, index: u32) -> Result<ValType, FunctionError> {
        if self.host {
            return Ok(ValType::FuncRef);
        }
        let imported = self.module.import_table_count();
        let tt = if index < imported {
            self.module
                .imports
                .iter()
                .filter_map(|i| match &i.desc {
                    ImportDesc::Table(t) => Some(t),
                    _ => None,
                })
                .nth(index as usize)
        } else {
            self.module.tables.get((index - imported) as usize)
        };
        tt.map(|t| t.elem)
            .ok_or(FunctionError::UnknownTable { operator: self.opnum, index })
    }

    fn global_type(&self, index: u32) -> Result<GlobalType, FunctionError> {
        let imported = self.module.import_global_count();
        let gt = if index < imported {
            self.module
                .imports
                .iter()
                .filter_map(|i| match &i.desc {
                    ImportDesc::Global(g) => Some(*g),
                    _ => None,
                })
                .nth(index as usize)
        } else {
            self.module.globals.get((index - imported) as usize).map(|g| g.ty)
        };
        gt.ok_or(FunctionError::UnknownGlobal { operator: self.opnum, index })
    }

    fn func_type_of(&self, index: u32) -> Result<FunctionType, FunctionError> {
        self.module
            .func_type(index)
            .cloned()
            .ok_or(FunctionError::UnknownFunction { operator: self.opnum, index })
    }

    /* ===== the operator table ===== */

    fn step(&mut self, opcode: u8, cur: &mut Cursor<'_>) -> Result<(), FunctionError> {
        use ValType::{ExternRef, FuncRef, F32, F64, I32, I64};
        match opcode {
            op::UNREACHABLE => {
                self.set_unreachable();
                self.out.push(Instr::Unreachable);
            }
            op::NOP => self.out.push(Instr::Nop),

            op::BLOCK => {
                let (params, results) = self.read_block_type(cur)?;
                self.pop_all(&params)?;
                let p = params.len() as u16;
                let r = results.len() as u16;
                self.push_frame(BlockKind::Block, params, results);
                self.out.push(Instr::Block { end: 0, params: p, results: r });
            }
            op::LOOP => {
                let (params, results) = self.read_block_type(cur)?;
                self.pop_all(&params)?;
                let p = params.len() as u16;
                let r = results.len() as u16;
                let start = self.out.len() as u32 + 1;
                self.push_frame(BlockKind::Loop, params, results);
                self.out.push(Instr::Loop { start, params: p, results: r });
            }
            op::IF => {
                let (params, results) = self.read_block_type(cur)?;
                self.pop_expect(I32)?;
                self.pop_all(&params)?;
                let p = params.len() as u16;
                let r = results.len() as u16;
                self.push_frame(BlockKind::If, params, results);
                self.out.push(Instr::If { else_or_end: 0, end: 0, params: p, results: r });
            }
            op::ELSE => {
                if self.frame().kind != BlockKind::If || self.frame().else_emit.is_some() {
                    return Err(FunctionError::UnbalancedControl);
                }
                // The then arm ends here and must have produced the results.
                self.check_frame_results()?;
                let frame = self.ctrl.last_mut().expect("if frame on top");
                frame.unreachable = false;
                frame.else_emit = Some(self.out.len());
                let params = frame.params.clone();
                let height = frame.height;
                self.stack.truncate(height);
                self.push_all(&params);
                self.out.push(Instr::Else { end: 0 });
            }
            op::END => {
                self.check_frame_results()?;
                let frame = self.ctrl.pop().expect("control stack holds a frame");
                if frame.kind == BlockKind::If
                    && frame.else_emit.is_none()
                    && frame.params != frame.results
                {
                    return Err(FunctionError::TypeMismatch {
                        operator: self.opnum,
                        have: render_types(&frame.params),
                        want: render_types(&frame.results),
                    });
                }
                let end_index = self.out.len() as u32;
                self.out.push(Instr::End);
                match frame.kind {
                    BlockKind::Block => {
                        if let Instr::Block { end, .. } = &mut self.out[frame.emit_index] {
                            *end = end_index + 1;
                        }
                    }
                    BlockKind::If => {
                        let else_target =
                            frame.else_emit.map(|e| e as u32 + 1).unwrap_or(end_index);
                        if let Instr::If { else_or_end, end, .. } = &mut self.out[frame.emit_index]
                        {
                            *else_or_end = else_target;
                            *end = end_index + 1;
                        }
                        if let Some(else_emit) = frame.else_emit {
                            if let Instr::Else { end } = &mut self.out[else_emit] {
                                *end = end_index;
                            }
                        }
                    }
                    BlockKind::Loop | BlockKind::Func => {}
                }
                // Continue in the enclosing frame with the block results.
                self.stack.truncate(frame.height);
                self.push_all(&frame.results);
            }

            op::BR => {
                let depth = self.read_u32(cur)?;
                let label = self.branch_target(depth)?.label_types().to_vec();
                self.pop_all(&label)?;
                self.set_unreachable();
                self.out.push(Instr::Br { depth });
            }
            op::BR_IF => {
                let depth = self.read_u32(cur)?;
                self.pop_expect(I32)?;
                let label = self.branch_target(depth)?.label_types().to_vec();
                self.pop_all(&label)?;
                self.push_all(&label);
                self.out.push(Instr::BrIf { depth });
            }
            op::BR_TABLE => {
                let count = self.read_u32(cur)?;
                let mut targets = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    targets.push(self.read_u32(cur)?);
                }
                let default = self.read_u32(cur)?;
                self.pop_expect(I32)?;
                let label = self.branch_target(default)?.label_types().to_vec();
                for target in &targets {
                    let target_label = self.branch_target(*target)?.label_types();
                    if target_label != label.as_slice() {
                        return Err(FunctionError::TypeMismatch {
                            operator: self.opnum,
                            have: render_types(target_label),
                            want: render_types(&label),
                        });
                    }
                }
                self.pop_all(&label)?;
                self.set_unreachable();
                self.out.push(Instr::BrTable { targets: targets.into_boxed_slice(), default });
            }
            op::RETURN => {
                let results = self.ctrl[0].results.clone();
                self.pop_all(&results)?;
                self.set_unreachable();
                self.out.push(Instr::Return);
            }

            op::CALL => {
                let index = self.read_u32(cur)?;
                let ty = self.func_type_of(index)?;
                self.pop_all(&ty.params)?;
                self.push_all(&ty.results);
                self.out.push(Instr::Call { function: index });
            }
            op::CALL_INDIRECT => {
                let type_index = self.read_u32(cur)?;
                let table = self.read_u32(cur)?;
                let ty = self
                    .module
                    .types
                    .get(type_index as usize)
                    .cloned()
                    .ok_or(FunctionError::UnknownType { operator: self.opnum, index: type_index })?;
                self.require_table(table)?;
                self.pop_expect(I32)?;
                self.pop_all(&ty.params)?;
                self.push_all(&ty.results);
                self.out.push(Instr::CallIndirect { type_index, table });
            }

            op::DROP => {
                self.pop_any()?;
                self.out.push(Instr::Drop);
            }
            op::SELECT => {
                self.pop_expect(I32)?;
                let b = self.pop_any()?;
                let a = self.pop_any()?;
                let result = match (a, b) {
                    (Some(x), Some(y)) if x == y => Some(x),
                    (Some(x), None) | (None, Some(x)) => Some(x),
                    (None, None) => None,
                    (Some(x), Some(y)) => {
                        return Err(FunctionError::TypeMismatch {
                            operator: self.opnum,
                            have: render_types(&[y]),
                            want: render_types(&[x]),
                        })
                    }
                };
                match result {
                    Some(t) => self.push(t),
                    None => self.stack.push(None),
                }
                self.out.push(Instr::Select);
            }

            op::LOCAL_GET => {
                let index = self.read_u32(cur)?;
                let t = *self
                    .locals
                    .get(index as usize)
                    .ok_or(FunctionError::UnknownLocal { operator: self.opnum, index })?;
                self.push(t);
                self.out.push(Instr::LocalGet { index });
            }
            op::LOCAL_SET => {
                let index = self.read_u32(cur)?;
                let t = *self
                    .locals
                    .get(index as usize)
                    .ok_or(FunctionError::UnknownLocal { operator: self.opnum, index })?;
                self.pop_expect(t)?;
                self.out.push(Instr::LocalSet { index });
            }
            op::LOCAL_TEE => {
                let index = self.read_u32(cur)?;
                let t = *self
                    .locals
                    .get(index as usize)
                    .ok_or(FunctionError::UnknownLocal { operator: self.opnum, index })?;
                self.pop_expect(t)?;
                self.push(t);
                self.out.push(Instr::LocalTee { index });
            }
            op::GLOBAL_GET => {
                let index = self.read_u32(cur)?;
                let gt = self.global_type(index)?;
                self.push(gt.val_type);
                self.out.push(Instr::GlobalGet { index });
            }
            op::GLOBAL_SET => {
                let index = self.read_u32(cur)?;
                let gt = self.global_type(index)?;
                if !gt.mutable {
                    return Err(FunctionError::ImmutableGlobal { operator: self.opnum, index });
                }
                self.pop_expect(gt.val_type)?;
                self.out.push(Instr::GlobalSet { index });
            }

            op::TABLE_GET => {
                let table = self.read_u32(cur)?;
                let elem = self.require_table(table)?;
                self.pop_expect(I32)?;
                self.push(elem);
                self.out.push(Instr::TableGet { table });
            }
            op::TABLE_SET => {
                let table = self.read_u32(cur)?;
                let elem = self.require_table(table)?;
                self.pop_expect(elem)?;
                self.pop_expect(I32)?;
                self.out.push(Instr::TableSet { table });
            }

            op::I32_LOAD => self.load(cur, LoadKind::I32, 2, I32)?,
            op::I64_LOAD => self.load(cur, LoadKind::I64, 3, I64)?,
            op::F32_LOAD => self.load(cur, LoadKind::F32, 2, F32)?,
            op::F64_LOAD => self.load(cur, LoadKind::F64, 3, F64)?,
            op::I32_LOAD8_S => self.load(cur, LoadKind::I32S8, 0, I32)?,
            op::I32_LOAD8_U => self.load(cur, LoadKind::I32U8, 0, I32)?,
            op::I32_LOAD16_S => self.load(cur, LoadKind::I32S16, 1, I32)?,
            op::I32_LOAD16_U => self.load(cur, LoadKind::I32U16, 1, I32)?,
            op::I64_LOAD8_S => self.load(cur, LoadKind::I64S8, 0, I64)?,
            op::I64_LOAD8_U => self.load(cur, LoadKind::I64U8, 0, I64)?,
            op::I64_LOAD16_S => self.load(cur, LoadKind::I64S16, 1, I64)?,
            op::I64_LOAD16_U => self.load(cur, LoadKind::I64U16, 1, I64)?,
            op::I64_LOAD32_S => self.load(cur, LoadKind::I64S32, 2, I64)?,
            op::I64_LOAD32_U => self.load(cur, LoadKind::I64U32, 2, I64)?,

            op::I32_STORE => self.store(cur, StoreKind::I32, 2, I32)?,
            op::I64_STORE => self.store(cur, StoreKind::I64, 3, I64)?,
            op::F32_STORE => self.store(cur, StoreKind::F32, 2, F32)?,
            op::F64_STORE => self.store(cur, StoreKind::F64, 3, F64)?,
            op::I32_STORE8 => self.store(cur, StoreKind::I32Narrow8, 0, I32)?,
            op::I32_STORE16 => self.store(cur, StoreKind::I32Narrow16, 1, I32)?,
            op::I64_STORE8 => self.store(cur, StoreKind::I64Narrow8, 0, I64)?,
            op::I64_STORE16 => self.store(cur, StoreKind::I64Narrow16, 1, I64)?,
            op::I64_STORE32 => self.store(cur, StoreKind::I64Narrow32, 2, I64)?,

            op::MEMORY_SIZE => {
                self.require_memory()?;
                self.read_u32(cur)?;
                self.push(I32);
                self.out.push(Instr::MemorySize);
            }
            op::MEMORY_GROW => {
                self.require_memory()?;
                self.read_u32(cur)?;
                self.pop_expect(I32)?;
                self.push(I32);
                self.out.push(Instr::MemoryGrow);
            }

            op::I32_CONST => {
                let v = cur.read_sleb_i32().map_err(|_| self.truncated())?;
                self.push(I32);
                self.out.push(Instr::I32Const(v));
            }
            op::I64_CONST => {
                let v = cur.read_sleb_i64().map_err(|_| self.truncated())?;
                self.push(I64);
                self.out.push(Instr::I64Const(v));
            }
            op::F32_CONST => {
                let bits = cur.read_f32_bits().map_err(|_| self.truncated())?;
                self.push(F32);
                self.out.push(Instr::F32Const(bits));
            }
            op::F64_CONST => {
                let bits = cur.read_f64_bits().map_err(|_| self.truncated())?;
                self.push(F64);
                self.out.push(Instr::F64Const(bits));
            }

            op::I32_EQZ => {
                self.pop_expect(I32)?;
                self.push(I32);
                self.out.push(Instr::I32Eqz);
            }
            op::I64_EQZ => {
                self.pop_expect(I64)?;
                self.push(I32);
                self.out.push(Instr::I64Eqz);
            }

            op::I32_EQ..=op::I32_GE_U => {
                self.relop(I32)?;
                self.out.push(Instr::I32RelOp(irelop(opcode - op::I32_EQ)));
            }
            op::I64_EQ..=op::I64_GE_U => {
                self.relop(I64)?;
                self.out.push(Instr::I64RelOp(irelop(opcode - op::I64_EQ)));
            }
            op::F32_EQ..=op::F32_GE => {
                self.relop(F32)?;
                self.out.push(Instr::F32RelOp(frelop(opcode - op::F32_EQ)));
            }
            op::F64_EQ..=op::F64_GE => {
                self.relop(F64)?;
                self.out.push(Instr::F64RelOp(frelop(opcode - op::F64_EQ)));
            }

            op::I32_CLZ => {
                self.unop(I32)?;
                self.out.push(Instr::I32UnOp(IUnOp::Clz));
            }
            op::I32_CTZ => {
                self.unop(I32)?;
                self.out.push(Instr::I32UnOp(IUnOp::Ctz));
            }
            op::I32_POPCNT => {
                self.unop(I32)?;
                self.out.push(Instr::I32UnOp(IUnOp::Popcnt));
            }
            op::I32_ADD..=op::I32_ROTR => {
                self.binop(I32)?;
                self.out.push(Instr::I32BinOp(ibinop(opcode - op::I32_ADD)));
            }
            op::I64_CLZ => {
                self.unop(I64)?;
                self.out.push(Instr::I64UnOp(IUnOp::Clz));
            }
            op::I64_CTZ => {
                self.unop(I64)?;
                self.out.push(Instr::I64UnOp(IUnOp::Ctz));
            }
            op::I64_POPCNT => {
                self.unop(I64)?;
                self.out.push(Instr::I64UnOp(IUnOp::Popcnt));
            }
            op::I64_ADD..=op::I64_ROTR => {
                self.binop(I64)?;
                self.out.push(Instr::I64BinOp(ibinop(opcode - op::I64_ADD)));
            }

            op::F32_ABS..=op::F32_SQRT => {
                self.unop(F32)?;
                self.out.push(Instr::F32UnOp(funop(opcode - op::F32_ABS)));
            }
            op::F32_ADD..=op::F32_COPYSIGN => {
                self.binop(F32)?;
                self.out.push(Instr::F32BinOp(fbinop(opcode - op::F32_ADD)));
            }
            op::F64_ABS..=op::F64_SQRT => {
                self.unop(F64)?;
                self.out.push(Instr::F64UnOp(funop(opcode - op::F64_ABS)));
            }
            op::F64_ADD..=op::F64_COPYSIGN => {
                self.binop(F64)?;
                self.out.push(Instr::F64BinOp(fbinop(opcode - op::F64_ADD)));
            }

            op::I32_WRAP_I64..=op::F64_REINTERPRET_I64 => {
                let (conversion, from, to) = conversion_of(opcode);
                self.cvtop(from, to)?;
                self.out.push(Instr::Convert(conversion));
            }
            op::I32_EXTEND8_S | op::I32_EXTEND16_S => {
                self.unop(I32)?;
                let c = if opcode == op::I32_EXTEND8_S {
                    Conversion::I32Extend8S
                } else {
                    Conversion::I32Extend16S
                };
                self.out.push(Instr::Convert(c));
            }
            op::I64_EXTEND8_S | op::I64_EXTEND16_S | op::I64_EXTEND32_S => {
                self.unop(I64)?;
                let c = match opcode {
                    op::I64_EXTEND8_S => Conversion::I64Extend8S,
                    op::I64_EXTEND16_S => Conversion::I64Extend16S,
                    _ => Conversion::I64Extend32S,
                };
                self.out.push(Instr::Convert(c));
            }

            op::REF_NULL => {
                let byte = cur.read_u8().map_err(|_| self.truncated())?;
                let t = match byte {
                    0x70 => FuncRef,
                    0x6F => ExternRef,
                    _ => {
                        return Err(FunctionError::UnknownOpcode {
                            operator: self.opnum,
                            opcode: byte,
                        })
                    }
                };
                self.push(t);
                self.out.push(Instr::RefNull);
            }
            op::REF_IS_NULL => {
                match self.pop_any()? {
                    None => {}
                    Some(t) if t.is_ref() => {}
                    Some(t) => {
                        return Err(FunctionError::TypeMismatch {
                            operator: self.opnum,
                            have: render_types(&[t]),
                            want: "(funcref)".to_string(),
                        })
                    }
                }
                self.push(I32);
                self.out.push(Instr::RefIsNull);
            }
            op::REF_FUNC => {
                let function = self.read_u32(cur)?;
                if function >= self.module.total_funcs() {
                    return Err(FunctionError::UnknownFunction {
                        operator: self.opnum,
                        index: function,
                    });
                }
                self.push(FuncRef);
                self.out.push(Instr::RefFunc { function });
            }

            op::MISC_PREFIX => self.step_misc(cur)?,

            _ => {
                return Err(FunctionError::UnknownOpcode { operator: self.opnum, opcode })
            }
        }
        Ok(())
    }

    fn step_misc(&mut self, cur: &mut Cursor<'_>) -> Result<(), FunctionError> {
        use ValType::I32;
        let sub = self.read_u32(cur)?;
        match sub {
            op::MISC_MEMORY_INIT => {
                let segment = self.read_u32(cur)?;
                self.read_u32(cur)?; // memory index, single-memory
                self.require_memory()?;
                if segment as usize >= self.module.data.len() {
                    return Err(FunctionError::UnknownDataSegment {
                        operator: self.opnum,
                        index: segment,
                    });
                }
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.out.push(Instr::MemoryInit { segment });
            }
            op::MISC_DATA_DROP => {
                let segment = self.read_u32(cur)?;
                if segment as usize >= self.module.data.len() {
                    return Err(FunctionError::UnknownDataSegment {
                        operator: self.opnum,
                        index: segment,
                    });
                }
                self.out.push(Instr::DataDrop { segment });
            }
            op::MISC_MEMORY_COPY => {
                self.read_u32(cur)?;
                self.read_u32(cur)?;
                self.require_memory()?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.out.push(Instr::MemoryCopy);
            }
            op::MISC_MEMORY_FILL => {
                self.read_u32(cur)?;
                self.require_memory()?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.out.push(Instr::MemoryFill);
            }
            op::MISC_TABLE_INIT => {
                let segment = self.read_u32(cur)?;
                let table = self.read_u32(cur)?;
                self.require_table(table)?;
                if segment as usize >= self.module.elements.len() {
                    return Err(FunctionError::UnknownElemSegment {
                        operator: self.opnum,
                        index: segment,
                    });
                }
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.out.push(Instr::TableInit { segment, table });
            }
            op::MISC_ELEM_DROP => {
                let segment = self.read_u32(cur)?;
                if segment as usize >= self.module.elements.len() {
                    return Err(FunctionError::UnknownElemSegment {
                        operator: self.opnum,
                        index: segment,
                    });
                }
                self.out.push(Instr::ElemDrop { segment });
            }
            op::MISC_TABLE_COPY => {
                let dst = self.read_u32(cur)?;
                let src = self.read_u32(cur)?;
                self.require_table(dst)?;
                self.require_table(src)?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.out.push(Instr::TableCopy { dst, src });
            }
            op::MISC_TABLE_GROW => {
                let table = self.read_u32(cur)?;
                let elem = self.require_table(table)?;
                self.pop_expect(I32)?;
                self.pop_expect(elem)?;
                self.push(I32);
                self.out.push(Instr::TableGrow { table });
            }
            op::MISC_TABLE_SIZE => {
                let table = self.read_u32(cur)?;
                self.require_table(table)?;
                self.push(I32);
                self.out.push(Instr::TableSize { table });
            }
            op::MISC_TABLE_FILL => {
                let table = self.read_u32(cur)?;
                let elem = self.require_table(table)?;
                self.pop_expect(I32)?;
                self.pop_expect(elem)?;
                self.pop_expect(I32)?;
                self.out.push(Instr::TableFill { table });
            }
            _ => {
                return Err(FunctionError::UnknownMiscOpcode { operator: self.opnum, opcode: sub })
            }
        }
        Ok(())
    }
}

fn render_abstract(stack: &[Abstract]) -> String {
    let inner = stack
        .iter()
        .map(|t| t.map(|t| t.name()).unwrap_or("?"))
        .collect::<Vec<_>>()
        .join(",");
    format!("({inner})")
}

fn val_type_from_byte(byte: u8) -> ValType {
    match byte {
        0x7F => ValType::I32,
        0x7E => ValType::I64,
        0x7D => ValType::F32,
        0x7C => ValType::F64,
        0x70 => ValType::FuncRef,
        _ => ValType::ExternRef,
    }
}

fn irelop(offset: u8) -> IRelOp {
    match offset {
        0 => IRelOp::Eq,
        1 => IRelOp::Ne,
        2 => IRelOp::LtS,
        3 => IRelOp::LtU,
        4 => IRelOp::GtS,
        5 => IRelOp::GtU,
        6 => IRelOp::LeS,
        7 => IRelOp::LeU,
        8 => IRelOp::GeS,
        _ => IRelOp::GeU,
    }
}

fn frelop(offset: u8) -> FRelOp {
    match offset {
        0 => FRelOp::Eq,
        1 => FRelOp::Ne,
        2 => FRelOp::Lt,
        3 => FRelOp::Gt,
        4 => FRelOp::Le,
        _ => FRelOp::Ge,
    }
}

fn ibinop(offset: u8) -> IBinOp {
    match offset {
        0 => IBinOp::Add,
        1 => IBinOp::Sub,
        2 => IBinOp::Mul,
        3 => IBinOp::DivS,
        4 => IBinOp::DivU,
        5 => IBinOp::RemS,
        6 => IBinOp::RemU,
        7 => IBinOp::And,
        8 => IBinOp::Or,
        9 => IBinOp::Xor,
        10 => IBinOp::Shl,
        11 => IBinOp::ShrS,
        12 => IBinOp::ShrU,
        13 => IBinOp::Rotl,
        _ => IBinOp::Rotr,
    }
}

fn funop(offset: u8) -> FUnOp {
    match offset {
        0 => FUnOp::Abs,
        1 => FUnOp::Neg,
        2 => FUnOp::Ceil,
        3 => FUnOp::Floor,
        4 => FUnOp::Trunc,
        5 => FUnOp::Nearest,
        _ => FUnOp::Sqrt,
    }
}

fn fbinop(offset: u8) -> FBinOp {
    match offset {
        0 => FBinOp::Add,
        1 => FBinOp::Sub,
        2 => FBinOp::Mul,
        3 => FBinOp::Div,
        4 => FBinOp::Min,
        5 => FBinOp::Max,
        _ => FBinOp::Copysign,
    }
}

fn conversion_of(opcode: u8) -> (Conversion, ValType, ValType) {
    use ValType::{F32, F64, I32, I64};
    match opcode {
        op::I32_WRAP_I64 => (Conversion::I32WrapI64, I64, I32),
        op::I32_TRUNC_F32_S => (Conversion::I32TruncF32S, F32, I32),
        op::I32_TRUNC_F32_U => (Conversion::I32TruncF32U, F32, I32),
        op::I32_TRUNC_F64_S => (Conversion::I32TruncF64S, F64, I32),
        op::I32_TRUNC_F64_U => (Conversion::I32TruncF64U, F64, I32),
        op::I64_EXTEND_I32_S => (Conversion::I64ExtendI32S, I32, I64),
        op::I64_EXTEND_I32_U => (Conversion::I64ExtendI32U, I32, I64),
        op::I64_TRUNC_F32_S => (Conversion::I64TruncF32S, F32, I64),
        op::I64_TRUNC_F32_U => (Conversion::I64TruncF32U, F32, I64),
        op::I64_TRUNC_F64_S => (Conversion::I64TruncF64S, F64, I64),
        op::I64_TRUNC_F64_U => (Conversion::I64TruncF64U, F64, I64),
        op::F32_CONVERT_I32_S => (Conversion::F32ConvertI32S, I32, F32),
        op::F32_CONVERT_I32_U => (Conversion::F32ConvertI32U, I32, F32),
        op::F32_CONVERT_I64_S => (Conversion::F32ConvertI64S, I64, F32),
        op::F32_CONVERT_I64_U => (Conversion::F32ConvertI64U, I64, F32),
        op::F32_DEMOTE_F64 => (Conversion::F32DemoteF64, F64, F32),
        op::F64_CONVERT_I32_S => (Conversion::F64ConvertI32S, I32, F64),
        op::F64_CONVERT_I32_U => (Conversion::F64ConvertI32U, I32, F64),
        op::F64_CONVERT_I64_S => (Conversion::F64ConvertI64S, I64, F64),
        op::F64_CONVERT_I64_U => (Conversion::F64ConvertI64U, I64, F64),
        op::F64_PROMOTE_F32 => (Conversion::F64PromoteF32, F32, F64),
        op::I32_REINTERPRET_F32 => (Conversion::I32ReinterpretF32, F32, I32),
        op::I64_REINTERPRET_F64 => (Conversion::I64ReinterpretF64, F64, I64),
        op::F32_REINTERPRET_I32 => (Conversion::F32ReinterpretI32, I32, F32),
        _ => (Conversion::F64ReinterpretI64, I64, F64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::opcodes;

    fn module_with_type(ty: FunctionType) -> Module {
        let mut m = Module::default();
        m.types.push(ty);
        m
    }

    #[test]
    fn missing_result_is_reported() {
        let ty = FunctionType::new(vec![], vec![ValType::I32]);
        let m = module_with_type(ty.clone());
        let err = compile_body(&m, &ty, &[opcodes::END], &[], false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "not enough results\n\thave ()\n\twant (i32)"
        );
    }

    #[test]
    fn branch_targets_resolve_to_absolute_offsets() {
        // block (result i32) i32.const 7 end
        let ty = FunctionType::new(vec![], vec![ValType::I32]);
        let m = module_with_type(ty.clone());
        let body = [
            opcodes::BLOCK,
            0x7F,
            opcodes::I32_CONST,
            7,
            opcodes::END,
            opcodes::END,
        ];
        let ops = compile_body(&m, &ty, &body, &[], false).unwrap();
        match &ops[0] {
            Instr::Block { end, results, .. } => {
                assert_eq!(*end, 3);
                assert_eq!(*results, 1);
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let ty = FunctionType::new(vec![], vec![]);
        let m = module_with_type(ty.clone());
        let err = compile_body(&m, &ty, &[0xC5, opcodes::END], &[], false).unwrap_err();
        assert!(matches!(err, FunctionError::UnknownOpcode { opcode: 0xC5, .. }));
    }

    #[test]
    fn branch_depth_is_checked() {
        let ty = FunctionType::new(vec![], vec![]);
        let m = module_with_type(ty.clone());
        let err = compile_body(&m, &ty, &[opcodes::BR, 2, opcodes::END], &[], false).unwrap_err();
        assert!(matches!(err, FunctionError::InvalidBranchTarget { depth: 2, .. }));
    }
}
