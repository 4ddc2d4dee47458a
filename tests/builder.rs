//! Host module builder contract: deterministic emission of the module IR,
//! compile-time error text, and instantiation lifecycle.

use std::sync::Arc;

use driftwasm::core::{ExportDesc, FunctionType, ValType};
use driftwasm::{Context, Engine, HostModuleBuilder, InterpreterEngine, Namespace};

fn new_engine() -> Arc<dyn Engine> {
    Arc::new(InterpreterEngine::new())
}

fn u32_u32(_: u32) -> u32 {
    0
}

fn u64_u32(_: u64) -> u32 {
    0
}

#[test]
fn empty_builder_emits_no_name_section() {
    let engine = new_engine();
    let compiled = HostModuleBuilder::new("").compile(&engine).unwrap();
    let module = compiled.module();
    assert!(module.names.is_none());
    assert!(module.types.is_empty());
    assert!(module.exports.is_empty());
}

#[test]
fn named_builder_emits_module_name_only() {
    let engine = new_engine();
    let compiled = HostModuleBuilder::new("env").compile(&engine).unwrap();
    let names = compiled.module().names.as_ref().unwrap();
    assert_eq!(names.module_name, "env");
    assert!(names.function_names.is_empty());
}

#[test]
fn with_func_emits_signature_code_export_and_name() {
    let engine = new_engine();
    let compiled = HostModuleBuilder::new("")
        .function()
        .with_func(u32_u32)
        .export("1")
        .compile(&engine)
        .unwrap();
    let module = compiled.module();

    assert_eq!(
        module.types,
        vec![FunctionType::new(vec![ValType::I32], vec![ValType::I32])]
    );
    assert_eq!(module.functions, vec![0]);
    assert_eq!(module.codes.len(), 1);
    assert!(module.codes[0].is_host_function);
    assert_eq!(module.exports.len(), 1);
    assert_eq!(module.exports[0].name, "1");
    assert_eq!(module.exports[0].desc, ExportDesc::Func(0));

    // The function name defaults to the export name; no module name.
    let names = module.names.as_ref().unwrap();
    assert_eq!(names.module_name, "");
    assert_eq!(names.function_names, vec![(0, "1".to_string())]);
    assert!(names.local_names.is_empty());
}

#[test]
fn with_name_and_param_names_land_in_the_name_section() {
    let engine = new_engine();
    let compiled = HostModuleBuilder::new("")
        .function()
        .with_func(u32_u32)
        .with_name("get")
        .with_param_names(&["x"])
        .export("1")
        .compile(&engine)
        .unwrap();
    let names = compiled.module().names.as_ref().unwrap();
    assert_eq!(names.function_names, vec![(0, "get".to_string())]);
    assert_eq!(names.local_names, vec![(0, vec![(0, "x".to_string())])]);
}

#[test]
fn later_export_overwrites_same_name() {
    let engine = new_engine();
    let compiled = HostModuleBuilder::new("")
        .function()
        .with_func(u32_u32)
        .export("1")
        .function()
        .with_func(u64_u32)
        .export("1")
        .compile(&engine)
        .unwrap();
    let module = compiled.module();

    // Only the survivor remains, and the type table compacts to its type.
    assert_eq!(
        module.types,
        vec![FunctionType::new(vec![ValType::I64], vec![ValType::I32])]
    );
    assert_eq!(module.functions, vec![0]);
    assert_eq!(module.exports.len(), 1);
    assert_eq!(module.exports[0].name, "1");
}

#[test]
fn distinct_exports_emit_sorted_by_name_with_deduplicated_types() {
    let engine = new_engine();
    // Intentionally inserted out of order.
    let compiled = HostModuleBuilder::new("")
        .function()
        .with_func(u64_u32)
        .export("2")
        .function()
        .with_func(u32_u32)
        .export("1")
        .compile(&engine)
        .unwrap();
    let module = compiled.module();

    assert_eq!(
        module.types,
        vec![
            FunctionType::new(vec![ValType::I32], vec![ValType::I32]),
            FunctionType::new(vec![ValType::I64], vec![ValType::I32]),
        ]
    );
    assert_eq!(module.functions, vec![0, 1]);
    assert_eq!(module.exports[0].name, "1");
    assert_eq!(module.exports[0].desc, ExportDesc::Func(0));
    assert_eq!(module.exports[1].name, "2");
    assert_eq!(module.exports[1].desc, ExportDesc::Func(1));
    let names = compiled.module().names.as_ref().unwrap();
    assert_eq!(
        names.function_names,
        vec![(0, "1".to_string()), (1, "2".to_string())]
    );
}

#[test]
fn shared_signatures_share_one_type_entry() {
    let engine = new_engine();
    let compiled = HostModuleBuilder::new("")
        .function()
        .with_func(u32_u32)
        .export("a")
        .function()
        .with_func(u32_u32)
        .export("b")
        .compile(&engine)
        .unwrap();
    let module = compiled.module();
    assert_eq!(module.types.len(), 1);
    assert_eq!(module.functions, vec![0, 0]);
}

#[test]
fn missing_result_fails_compilation_with_have_want() {
    let engine = new_engine();
    let err = HostModuleBuilder::new("")
        .function()
        .with_wasm_thunk(vec![], vec![ValType::I32], vec![], vec![0x0B])
        .export("fn")
        .compile(&engine)
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid function[0] export[\"fn\"]: not enough results\n\thave ()\n\twant (i32)"
    );
}

#[test]
fn instantiate_registers_under_builder_name() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let module = HostModuleBuilder::new("env")
        .function()
        .with_func(u32_u32)
        .export("f")
        .instantiate(&ns, &engine, &ctx)
        .unwrap();
    assert!(Arc::ptr_eq(&ns.module("env").unwrap(), &module));
}

#[test]
fn duplicate_host_instantiation_fails() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    HostModuleBuilder::new("env").instantiate(&ns, &engine, &ctx).unwrap();
    let err = HostModuleBuilder::new("env")
        .instantiate(&ns, &engine, &ctx)
        .unwrap_err();
    assert_eq!(err.to_string(), "module[env] has already been instantiated");
}

#[test]
fn closing_an_owned_instance_evicts_the_compiled_module() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();

    // instantiate() hands ownership of the artifact to the instance.
    let module = HostModuleBuilder::new("env").instantiate(&ns, &engine, &ctx).unwrap();
    assert_eq!(engine.compiled_module_count(), 1);
    module.close();
    assert_eq!(engine.compiled_module_count(), 0);
}

#[test]
fn closing_a_separately_compiled_module_keeps_the_cache() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();

    let builder = HostModuleBuilder::new("env");
    let compiled = builder.compile(&engine).unwrap();
    let module = compiled.instantiate(&ns, &ctx).unwrap();
    assert_eq!(engine.compiled_module_count(), 1);
    module.close();
    assert_eq!(engine.compiled_module_count(), 1);
}

#[test]
fn typed_host_functions_execute() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let module = HostModuleBuilder::new("math")
        .function()
        .with_func(|a: u32, b: u32| -> u32 { a.wrapping_mul(b) })
        .export("mul")
        .function()
        .with_func(|v: f64| -> f64 { v.sqrt() })
        .export("sqrt")
        .instantiate(&ns, &engine, &ctx)
        .unwrap();

    let mul = module.exported_function("mul").unwrap();
    assert_eq!(mul.call(&ctx, &[6, 7]).unwrap(), vec![42]);

    let sqrt = module.exported_function("sqrt").unwrap();
    let out = sqrt.call(&ctx, &[9.0f64.to_bits()]).unwrap();
    assert_eq!(f64::from_bits(out[0]), 3.0);
}
