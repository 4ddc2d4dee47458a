//! Core type definitions shared by the module IR and the engines: value types,
//! function signatures (with 64-bit slot widths), limits, table/memory/global
//! types, import/export descriptors, and index aliases.

pub type TypeIndex = u32;
pub type FunctionIndex = u32;
pub type TableIndex = u32;
pub type MemoryIndex = u32;
pub type GlobalIndex = u32;
pub type DataIndex = u32;
pub type ElemIndex = u32;

/// Value type of one stack slot or storage cell.
///
/// Every value crosses the embedder boundary as one 64-bit slot: i32 occupies
/// the low 32 bits, i64 the whole slot, f32/f64 their raw IEEE-754 bits, and
/// references an opaque pointer-sized integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    FuncRef,
    ExternRef,
}

impl ValType {
    /// Text-format name, used in stack traces and `have (...) want (...)` output.
    pub fn name(self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::FuncRef => "funcref",
            ValType::ExternRef => "externref",
        }
    }

    /// Number of 64-bit slots one value of this type occupies. Slot widths come
    /// from the declared type table, never from inference.
    pub fn slot_width(self) -> u32 {
        1
    }

    pub fn is_ref(self) -> bool {
        matches!(self, ValType::FuncRef | ValType::ExternRef)
    }
}

impl Default for ValType {
    fn default() -> Self {
        ValType::I32
    }
}

/// Function signature: parameter and result value types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FunctionType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FunctionType {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> Self {
        Self { params, results }
    }

    /// Parameter width in 64-bit slots.
    pub fn param_slots(&self) -> u32 {
        self.params.iter().map(|t| t.slot_width()).sum()
    }

    /// Result width in 64-bit slots.
    pub fn result_slots(&self) -> u32 {
        self.results.iter().map(|t| t.slot_width()).sum()
    }

    /// Renders the signature the way stack traces expect it:
    /// `(i32,i32)` followed by ` i32` for one result or ` (i32,i32)` for more.
    pub fn render(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|t| t.name())
            .collect::<Vec<_>>()
            .join(",");
        match self.results.len() {
            0 => format!("({params})"),
            1 => format!("({params}) {}", self.results[0].name()),
            _ => {
                let results = self
                    .results
                    .iter()
                    .map(|t| t.name())
                    .collect::<Vec<_>>()
                    .join(",");
                format!("({params}) ({results})")
            }
        }
    }
}

/// Renders a list of value types as `(i32,i64)` for compile diagnostics.
pub fn render_types(types: &[ValType]) -> String {
    let inner = types.iter().map(|t| t.name()).collect::<Vec<_>>().join(",");
    format!("({inner})")
}

/// Min/max limits. Units are elements for tables and 64 KiB pages for memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
}

impl Limits {
    pub const fn new(min: u32, max: Option<u32>) -> Self {
        Self { min, max }
    }
}

/// Table type: reference element type plus limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableType {
    pub elem: ValType,
    pub limits: Limits,
}

impl Default for TableType {
    fn default() -> Self {
        Self { elem: ValType::FuncRef, limits: Limits::default() }
    }
}

/// Memory type. At most one linear memory per module.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryType {
    pub limits: Limits,
}

/// Global type: content value type and mutability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub val_type: ValType,
    pub mutable: bool,
}

impl GlobalType {
    pub const fn new(val_type: ValType, mutable: bool) -> Self {
        Self { val_type, mutable }
    }
}

/// Import descriptor kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportDesc {
    Func(TypeIndex),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

/// Import: source module name, item name, and descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub desc: ImportDesc,
}

/// Kind of an exported or imported item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternKind {
    Func,
    Table,
    Memory,
    Global,
}

impl ExternKind {
    pub fn name(self) -> &'static str {
        match self {
            ExternKind::Func => "func",
            ExternKind::Table => "table",
            ExternKind::Memory => "memory",
            ExternKind::Global => "global",
        }
    }
}

/// Export descriptor: kind plus index into the respective index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportDesc {
    Func(FunctionIndex),
    Table(TableIndex),
    Memory(MemoryIndex),
    Global(GlobalIndex),
}

impl ExportDesc {
    pub fn kind(self) -> ExternKind {
        match self {
            ExportDesc::Func(_) => ExternKind::Func,
            ExportDesc::Table(_) => ExternKind::Table,
            ExportDesc::Memory(_) => ExternKind::Memory,
            ExportDesc::Global(_) => ExternKind::Global,
        }
    }
}

/// Export: name and descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub name: String,
    pub desc: ExportDesc,
}

/* ===== Slot encoding helpers (embedder boundary) ===== */

/// Encodes an i32 into the low 32 bits of a slot.
pub fn encode_i32(v: i32) -> u64 {
    v as u32 as u64
}

/// Encodes an i64 into a whole slot.
pub fn encode_i64(v: i64) -> u64 {
    v as u64
}

/// Encodes an f32 as its raw bits in the low 32 bits of a slot.
pub fn encode_f32(v: f32) -> u64 {
    v.to_bits() as u64
}

pub fn decode_f32(slot: u64) -> f32 {
    f32::from_bits(slot as u32)
}

/// Encodes an f64 as its raw bits.
pub fn encode_f64(v: f64) -> u64 {
    v.to_bits()
}

pub fn decode_f64(slot: u64) -> f64 {
    f64::from_bits(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_rendering() {
        let ft = FunctionType::new(vec![ValType::I32], vec![ValType::I32]);
        assert_eq!(ft.render(), "(i32) i32");

        let ft = FunctionType::new(vec![ValType::I64, ValType::I64], vec![]);
        assert_eq!(ft.render(), "(i64,i64)");

        let ft = FunctionType::new(vec![], vec![ValType::I32, ValType::F64]);
        assert_eq!(ft.render(), "() (i32,f64)");
    }

    #[test]
    fn slot_encoding() {
        assert_eq!(encode_i32(-1), 0xFFFF_FFFF);
        assert_eq!(encode_i64(-1), u64::MAX);
        assert_eq!(decode_f32(encode_f32(1.5)), 1.5);
        assert_eq!(decode_f64(encode_f64(-0.0)).to_bits(), (-0.0f64).to_bits());
    }
}
