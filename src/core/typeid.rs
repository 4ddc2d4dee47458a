//! Process-wide interning of function signatures.
//!
//! Indirect-call type checks compare interned integers instead of structural
//! signatures. Two modules observe equal ids if and only if their declared
//! function types are structurally equal.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use super::types::FunctionType;

/// Interned identifier of one function signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionTypeId(pub u32);

static REGISTRY: Lazy<Mutex<HashMap<FunctionType, FunctionTypeId>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the process-wide id for a signature, interning it on first use.
pub fn intern(ty: &FunctionType) -> FunctionTypeId {
    let mut registry = REGISTRY.lock().expect("type id registry poisoned");
    if let Some(id) = registry.get(ty) {
        return *id;
    }
    let id = FunctionTypeId(registry.len() as u32);
    registry.insert(ty.clone(), id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ValType;

    #[test]
    fn structural_equality() {
        let a = FunctionType::new(vec![ValType::I32], vec![ValType::I64]);
        let b = FunctionType::new(vec![ValType::I32], vec![ValType::I64]);
        let c = FunctionType::new(vec![ValType::I64], vec![ValType::I32]);
        assert_eq!(intern(&a), intern(&b));
        assert_ne!(intern(&a), intern(&c));
    }
}
