//! Global instance: one 64-bit slot plus its declared type.
//!
//! Reads and writes are atomic at the operator level; distinct instances
//! never share globals unless one was imported from the other.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::GlobalType;

/// Initial value of a funcref global declared with a null initializer. The
/// engine rewrites it to the null reference (zero) when it initializes
/// funcref globals; any other initial value is a function index awaiting
/// translation into an opaque reference.
pub const NULL_FUNCREF_VALUE: u64 = u64::MAX;

#[derive(Debug)]
pub struct GlobalInstance {
    ty: GlobalType,
    val: AtomicU64,
}

impl GlobalInstance {
    pub fn new(ty: GlobalType, init: u64) -> Self {
        Self { ty, val: AtomicU64::new(init) }
    }

    pub fn ty(&self) -> GlobalType {
        self.ty
    }

    pub fn get(&self) -> u64 {
        self.val.load(Ordering::Relaxed)
    }

    /// Embedder-facing write; refused for immutable globals.
    pub fn set(&self, v: u64) -> bool {
        if !self.ty.mutable {
            return false;
        }
        self.val.store(v, Ordering::Relaxed);
        true
    }

    /// Engine-internal write that bypasses mutability, used for initializer
    /// evaluation and funcref translation.
    pub(crate) fn replace(&self, v: u64) {
        self.val.store(v, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ValType;

    #[test]
    fn immutable_rejects_set() {
        let g = GlobalInstance::new(GlobalType::new(ValType::I32, false), 7);
        assert!(!g.set(9));
        assert_eq!(g.get(), 7);

        let g = GlobalInstance::new(GlobalType::new(ValType::I32, true), 7);
        assert!(g.set(9));
        assert_eq!(g.get(), 9);
    }
}
