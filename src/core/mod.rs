//! Module IR and the type vocabulary shared by the engines and the runtime.

pub mod module;
pub mod opcodes;
pub mod typeid;
pub mod types;

pub use module::{
    Code, ConstExpr, DataSegment, ElementSegment, FunctionBody, Global, Module, ModuleId,
    NameSection,
};
pub use typeid::{intern, FunctionTypeId};
pub use types::{
    encode_f32, encode_f64, encode_i32, encode_i64, decode_f32, decode_f64, render_types, Export,
    ExportDesc, ExternKind, FunctionIndex, FunctionType, GlobalIndex, GlobalType, Import,
    ImportDesc, Limits, MemoryType, TableIndex, TableType, TypeIndex, ValType,
};
