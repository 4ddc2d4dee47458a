//! Crate-level error types: traps, call failures, compilation and
//! instantiation errors.
//!
//! The human phrases rendered here are observable output. Embedders match on
//! them, so they are kept stable.

use thiserror::Error;

/// A trap: abrupt termination of execution with a kind.
///
/// The display string is the stable human phrase for the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Trap {
    #[error("integer divide by zero")]
    IntegerDivideByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid conversion to integer")]
    InvalidConversionToInteger,
    #[error("out of bounds memory access")]
    MemoryOutOfBounds,
    #[error("out of bounds table access")]
    TableOutOfBounds,
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,
    #[error("invalid table access")]
    InvalidTableAccess,
    #[error("unreachable")]
    Unreachable,
    #[error("call stack exhausted")]
    CallStackExhausted,
    #[error("canceled")]
    Canceled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Where a trap was raised, which decides the rendered prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum TrapOrigin {
    /// Raised by a wasm operator: `wasm error: <phrase>`.
    Wasm(Trap),
    /// A runtime-level fault surfaced while running native host code:
    /// `runtime error: <phrase> (recovered by driftwasm)`.
    HostRuntime(Trap),
    /// An arbitrary error raised by native host code:
    /// `host-function panic (recovered by driftwasm)`.
    HostPanic(String),
    /// Cooperative cancellation or deadline expiry; rendered as the bare
    /// phrase.
    Interrupted(Trap),
}

/// A trap recovered at the call-engine boundary, with the wasm stack trace
/// captured before unwinding. Frames render innermost first as
/// `<module>.<debug-name>(<param-types>) <result-types>`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrapError {
    pub origin: TrapOrigin,
    pub trace: Vec<String>,
}

impl std::fmt::Display for TrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.origin {
            TrapOrigin::Wasm(trap) => write!(f, "wasm error: {trap}")?,
            TrapOrigin::HostRuntime(trap) => {
                write!(f, "runtime error: {trap} (recovered by driftwasm)")?
            }
            TrapOrigin::HostPanic(_) => write!(f, "host-function panic (recovered by driftwasm)")?,
            TrapOrigin::Interrupted(trap) => write!(f, "{trap}")?,
        }
        if !self.trace.is_empty() {
            write!(f, "\nwasm stack trace:")?;
            for frame in &self.trace {
                write!(f, "\n\t{frame}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for TrapError {}

/// Failure of one invocation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// Parameter arity is counted in 64-bit slots, not parameter count.
    #[error("expected {expected} params, but passed {actual}")]
    ParamArity { expected: u32, actual: u32 },
    /// The module was closed; terminal and not retryable.
    #[error("module closed with exit_code({0})")]
    Exit(u32),
    #[error(transparent)]
    Trapped(#[from] TrapError),
}

impl CallError {
    /// The trap kind, when this failure is a recovered trap.
    pub fn trap(&self) -> Option<Trap> {
        match self {
            CallError::Trapped(e) => match e.origin {
                TrapOrigin::Wasm(t)
                | TrapOrigin::HostRuntime(t)
                | TrapOrigin::Interrupted(t) => Some(t),
                TrapOrigin::HostPanic(_) => None,
            },
            _ => None,
        }
    }
}

/// Operator-level validation failure inside one function body.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FunctionError {
    #[error("not enough results\n\thave {have}\n\twant {want}")]
    NotEnoughResults { have: String, want: String },
    #[error("too many results\n\thave {have}\n\twant {want}")]
    TooManyResults { have: String, want: String },
    #[error("type mismatch at operator {operator}\n\thave {have}\n\twant {want}")]
    TypeMismatch { operator: usize, have: String, want: String },
    #[error("not enough operands at operator {operator}\n\thave {have}\n\twant {want}")]
    StackUnderflow { operator: usize, have: String, want: String },
    #[error("unknown branch target {depth} at operator {operator}")]
    InvalidBranchTarget { operator: usize, depth: u32 },
    #[error("unknown opcode 0x{opcode:02x} at operator {operator}")]
    UnknownOpcode { operator: usize, opcode: u8 },
    #[error("unknown misc opcode 0x{opcode:02x} at operator {operator}")]
    UnknownMiscOpcode { operator: usize, opcode: u32 },
    #[error("unknown type {index} at operator {operator}")]
    UnknownType { operator: usize, index: u32 },
    #[error("unknown function {index} at operator {operator}")]
    UnknownFunction { operator: usize, index: u32 },
    #[error("unknown local {index} at operator {operator}")]
    UnknownLocal { operator: usize, index: u32 },
    #[error("unknown global {index} at operator {operator}")]
    UnknownGlobal { operator: usize, index: u32 },
    #[error("global {index} is immutable at operator {operator}")]
    ImmutableGlobal { operator: usize, index: u32 },
    #[error("unknown table {index} at operator {operator}")]
    UnknownTable { operator: usize, index: u32 },
    #[error("unknown memory at operator {operator}")]
    UnknownMemory { operator: usize },
    #[error("unknown data segment {index} at operator {operator}")]
    UnknownDataSegment { operator: usize, index: u32 },
    #[error("unknown element segment {index} at operator {operator}")]
    UnknownElemSegment { operator: usize, index: u32 },
    #[error("alignment {align} is larger than natural for operator {operator}")]
    InvalidAlignment { operator: usize, align: u32 },
    #[error("truncated function body at operator {operator}")]
    TruncatedBody { operator: usize },
    #[error("unbalanced control frames at end of body")]
    UnbalancedControl,
}

/// Compilation failure reported synchronously from `Engine::compile_module`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// `export` is preformatted as ` export["name"]` or empty, so the message
    /// reads `invalid function[0] export["fn"]: ...`.
    #[error("invalid function[{index}]{export}: {error}")]
    InvalidFunction {
        index: u32,
        export: String,
        error: FunctionError,
    },
    #[error("unknown type index {0} in function section")]
    UnknownTypeIndex(u32),
    #[error("code section length {codes} does not match function section length {functions}")]
    SectionMismatch { functions: usize, codes: usize },
}

impl CompileError {
    pub(crate) fn invalid_function(
        index: u32,
        export_name: Option<&str>,
        error: FunctionError,
    ) -> Self {
        let export = match export_name {
            Some(name) => format!(" export[\"{name}\"]"),
            None => String::new(),
        };
        CompileError::InvalidFunction { index, export, error }
    }
}

/// Instantiation failure. Instantiation is atomic: on any failure no partial
/// module instance is observable and already-allocated state is released.
#[derive(Debug, Error)]
pub enum InstantiationError {
    #[error("module[{0}] has already been instantiated")]
    AlreadyInstantiated(String),
    #[error("source module for {0} must be compiled before instantiation")]
    NotCompiled(String),
    #[error("unresolved import: {module}.{name}")]
    UnresolvedImport { module: String, name: String },
    #[error("import type mismatch ({context}): expected {expected}, found {found}")]
    ImportTypeMismatch {
        context: &'static str,
        expected: String,
        found: String,
    },
    #[error("element segment {0} initialization out of bounds")]
    ElementOutOfBounds(usize),
    #[error("data segment {0} initialization out of bounds")]
    DataOutOfBounds(usize),
    #[error("invalid global initializer: {0}")]
    InvalidGlobalInit(&'static str),
    #[error("element segment {0} references an unknown function")]
    ElementUnknownFunction(usize),
    #[error("start function index {0} is out of range")]
    UnknownStartFunction(u32),
    #[error("start function must have an empty signature")]
    InvalidStartFunction,
    #[error("start function failed: {0}")]
    Start(#[source] CallError),
    #[error("functions cannot be shared across engine implementations")]
    EngineMismatch,
    #[error(transparent)]
    Compile(#[from] CompileError),
}
