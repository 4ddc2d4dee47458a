//! Property tests over the leaf runtime structures.

use driftwasm::core::{intern, FunctionType, Limits, MemoryType, ValType};
use driftwasm::MemoryInstance;
use proptest::prelude::*;

fn val_type() -> impl Strategy<Value = ValType> {
    prop_oneof![
        Just(ValType::I32),
        Just(ValType::I64),
        Just(ValType::F32),
        Just(ValType::F64),
    ]
}

proptest! {
    // Reads entirely within the current size succeed; any read crossing the
    // end fails without side effects.
    #[test]
    fn memory_bounds_are_exact(offset in 0u32..70_000, len in 0u32..70_000) {
        let memory = MemoryInstance::new(&MemoryType { limits: Limits::new(1, Some(1)) });
        let size = memory.size();
        let view = memory.read(offset, len);
        let in_bounds = (offset as u64) + (len as u64) <= size as u64;
        prop_assert_eq!(view.is_some(), in_bounds);
        if let Some(view) = view {
            prop_assert_eq!(view.len(), len as usize);
        }
    }

    // Little-endian round trip at arbitrary in-bounds offsets.
    #[test]
    fn memory_u64_round_trips(offset in 0u32..65_528, value: u64) {
        let memory = MemoryInstance::new(&MemoryType { limits: Limits::new(1, Some(1)) });
        prop_assert!(memory.write_u64_le(offset, value));
        prop_assert_eq!(memory.read_u64_le(offset), Some(value));
    }

    // Interned ids agree exactly when the signatures agree structurally.
    #[test]
    fn type_ids_match_structural_equality(
        params_a in proptest::collection::vec(val_type(), 0..4),
        results_a in proptest::collection::vec(val_type(), 0..3),
        params_b in proptest::collection::vec(val_type(), 0..4),
        results_b in proptest::collection::vec(val_type(), 0..3),
    ) {
        let a = FunctionType::new(params_a, results_a);
        let b = FunctionType::new(params_b, results_b);
        prop_assert_eq!(a == b, intern(&a) == intern(&b));
    }

    // Growth preserves previously written contents.
    #[test]
    fn grow_preserves_contents(value: u64) {
        let memory = MemoryInstance::new(&MemoryType { limits: Limits::new(1, Some(4)) });
        prop_assert!(memory.write_u64_le(100, value));
        prop_assert_eq!(memory.grow(2), Some(1));
        prop_assert_eq!(memory.size_pages(), 3);
        prop_assert_eq!(memory.read_u64_le(100), Some(value));
    }
}
