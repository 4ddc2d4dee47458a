//! Engine and call-engine behavior: compilation caching, arity, traps and
//! stack traces across the host boundary, funcref globals, table wiring with
//! indirect lookup, and memory aliasing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use driftwasm::core::{
    opcodes as op, Code, DataSegment, ElementSegment, Export, ExportDesc, FunctionType, Import,
    ImportDesc, Limits, MemoryType, Module, ModuleId, NameSection, TableType, ValType,
};
use driftwasm::error::Trap;
use driftwasm::{
    instantiate, CallEngine as _, CallError, Context, Engine, HostModuleBuilder,
    InterpreterEngine, ModuleEngine as _, Namespace,
};

fn new_engine() -> Arc<dyn Engine> {
    Arc::new(InterpreterEngine::new())
}

fn i32_i32() -> FunctionType {
    FunctionType::new(vec![ValType::I32], vec![ValType::I32])
}

fn named(module: &mut Module, module_name: &str, functions: Vec<(u32, &str)>) {
    module.names = Some(NameSection {
        module_name: module_name.to_string(),
        function_names: functions.into_iter().map(|(i, n)| (i, n.to_string())).collect(),
        local_names: vec![],
    });
}

#[test]
fn module_engine_requires_compilation() {
    let engine = new_engine();
    let module = Module { id: ModuleId::fresh(), ..Default::default() };
    let err = engine
        .new_module_engine("mymod", &module, &[], &[], &[], &[])
        .err()
        .expect("must fail before compilation");
    assert_eq!(
        err.to_string(),
        "source module for mymod must be compiled before instantiation"
    );
}

#[test]
fn compile_is_idempotent_per_module() {
    let engine = new_engine();
    let module = Module { id: ModuleId::fresh(), ..Default::default() };
    engine.compile_module(&module).unwrap();
    engine.compile_module(&module).unwrap();
    assert_eq!(engine.compiled_module_count(), 1);

    engine.delete_compiled_module(&module);
    assert_eq!(engine.compiled_module_count(), 0);
}

#[test]
fn module_engine_takes_instantiation_name() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let module = Arc::new(Module { id: ModuleId::fresh(), ..Default::default() });
    engine.compile_module(&module).unwrap();
    let instance = instantiate(&ns, &engine, &module, "mymod", &ctx).unwrap();
    assert_eq!(instance.engine().name(), "mymod");
}

#[test]
fn duplicate_instantiation_is_rejected() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let module = Arc::new(Module { id: ModuleId::fresh(), ..Default::default() });
    engine.compile_module(&module).unwrap();
    instantiate(&ns, &engine, &module, "env", &ctx).unwrap();
    let err = instantiate(&ns, &engine, &module, "env", &ctx).unwrap_err();
    assert_eq!(err.to_string(), "module[env] has already been instantiated");
}

/// Two i64 parameters in, the same two back out.
fn identity_module() -> Arc<Module> {
    let mut m = Module {
        id: ModuleId::fresh(),
        types: vec![FunctionType::new(
            vec![ValType::I64, ValType::I64],
            vec![ValType::I64, ValType::I64],
        )],
        functions: vec![0],
        codes: vec![Code::wasm(
            vec![op::LOCAL_GET, 0, op::LOCAL_GET, 1, op::END],
            vec![],
        )],
        exports: vec![Export { name: "identity".to_string(), desc: ExportDesc::Func(0) }],
        ..Default::default()
    };
    named(&mut m, "identity", vec![(0, "identity")]);
    Arc::new(m)
}

#[test]
fn call_checks_param_arity_in_slots() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let module = identity_module();
    engine.compile_module(&module).unwrap();
    let instance = instantiate(&ns, &engine, &module, "m", &ctx).unwrap();
    let f = instance.exported_function("identity").unwrap();

    assert_eq!(f.call(&ctx, &[1, 2]).unwrap(), vec![1, 2]);

    let err = f.call(&ctx, &[]).unwrap_err();
    assert_eq!(err.to_string(), "expected 2 params, but passed 0");

    let err = f.call(&ctx, &[1, 2, 3]).unwrap_err();
    assert_eq!(err.to_string(), "expected 2 params, but passed 3");
}

#[test]
fn results_have_distinct_backing_storage() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let module = identity_module();
    engine.compile_module(&module).unwrap();
    let instance = instantiate(&ns, &engine, &module, "m", &ctx).unwrap();

    let function = instance.function(0).unwrap().clone();
    let mut ce = instance.engine().new_call_engine(&function);
    let call_ctx = driftwasm::CallContext::new(instance.clone());

    let mut first = ce.call(&ctx, &call_ctx, &[7, 8]).unwrap();
    let second = ce.call(&ctx, &call_ctx, &[7, 8]).unwrap();
    assert_eq!(first, second);

    first[0] = 255;
    assert_eq!(second, vec![7, 8]);
}

/// The three-module call chain: a host module whose div panics on MAX and
/// faults on zero, an importing wasm wrapper, and a second wrapper importing
/// the first.
fn setup_div_chain(
    engine: &Arc<dyn Engine>,
    ns: &Arc<Namespace>,
    ctx: &Context,
) -> (Arc<driftwasm::ModuleInstance>, Arc<driftwasm::ModuleInstance>) {
    HostModuleBuilder::new("host")
        .function()
        .with_func(|d: u32| -> u32 {
            if d == u32::MAX {
                panic!("host-function panic");
            }
            1 / d
        })
        .export("div_by.go")
        .instantiate(ns, engine, ctx)
        .unwrap();

    let mut imported = Module {
        id: ModuleId::fresh(),
        types: vec![i32_i32()],
        imports: vec![Import {
            module: "host".to_string(),
            name: "div_by.go".to_string(),
            desc: ImportDesc::Func(0),
        }],
        functions: vec![0, 0],
        codes: vec![
            // (i32.div_u (i32.const 1) (local.get 0))
            Code::wasm(
                vec![op::I32_CONST, 1, op::LOCAL_GET, 0, op::I32_DIV_U, op::END],
                vec![],
            ),
            // calls the imported host function
            Code::wasm(vec![op::LOCAL_GET, 0, op::CALL, 0, op::END], vec![]),
        ],
        exports: vec![
            Export { name: "div_by.wasm".to_string(), desc: ExportDesc::Func(1) },
            Export { name: "call->div_by.go".to_string(), desc: ExportDesc::Func(2) },
        ],
        ..Default::default()
    };
    named(&mut imported, "imported", vec![(1, "div_by.wasm"), (2, "call->div_by.go")]);
    let imported = Arc::new(imported);
    engine.compile_module(&imported).unwrap();
    let imported = instantiate(ns, engine, &imported, "imported", ctx).unwrap();

    let mut importing = Module {
        id: ModuleId::fresh(),
        types: vec![i32_i32()],
        imports: vec![Import {
            module: "imported".to_string(),
            name: "call->div_by.go".to_string(),
            desc: ImportDesc::Func(0),
        }],
        functions: vec![0],
        codes: vec![Code::wasm(vec![op::LOCAL_GET, 0, op::CALL, 0, op::END], vec![])],
        exports: vec![Export {
            name: "call_import->call->div_by.go".to_string(),
            desc: ExportDesc::Func(1),
        }],
        ..Default::default()
    };
    named(&mut importing, "importing", vec![(1, "call_import->call->div_by.go")]);
    let importing = Arc::new(importing);
    engine.compile_module(&importing).unwrap();
    let importing = instantiate(ns, engine, &importing, "importing", ctx).unwrap();

    (imported, importing)
}

#[test]
fn host_call_chain_returns_results() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let (imported, importing) = setup_div_chain(&engine, &ns, &ctx);

    for (instance, name) in [
        (&imported, "div_by.wasm"),
        (&imported, "call->div_by.go"),
        (&importing, "call_import->call->div_by.go"),
    ] {
        let f = instance.exported_function(name).unwrap();
        let results = f.call(&ctx, &[1]).unwrap();
        assert_eq!(results, vec![1], "export {name}");

        let results2 = f.call(&ctx, &[1]).unwrap();
        assert_eq!(results, results2);
    }
}

#[test]
fn wasm_trap_renders_kind_and_trace() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let (imported, _) = setup_div_chain(&engine, &ns, &ctx);

    let f = imported.exported_function("div_by.wasm").unwrap();
    let err = f.call(&ctx, &[0]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "wasm error: integer divide by zero\n\
         wasm stack trace:\n\
         \timported.div_by.wasm(i32) i32"
    );

    // The engine stays usable after a trap.
    assert_eq!(f.call(&ctx, &[1]).unwrap(), vec![1]);
}

#[test]
fn host_panic_renders_three_frame_trace() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let (_, importing) = setup_div_chain(&engine, &ns, &ctx);

    let f = importing.exported_function("call_import->call->div_by.go").unwrap();
    let err = f.call(&ctx, &[u32::MAX as u64]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "host-function panic (recovered by driftwasm)\n\
         wasm stack trace:\n\
         \thost.div_by.go(i32) i32\n\
         \timported.call->div_by.go(i32) i32\n\
         \timporting.call_import->call->div_by.go(i32) i32"
    );
}

#[test]
fn host_runtime_fault_renders_as_runtime_error() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let (_, importing) = setup_div_chain(&engine, &ns, &ctx);

    let f = importing.exported_function("call_import->call->div_by.go").unwrap();
    let err = f.call(&ctx, &[0]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "runtime error: integer divide by zero (recovered by driftwasm)\n\
         wasm stack trace:\n\
         \thost.div_by.go(i32) i32\n\
         \timported.call->div_by.go(i32) i32\n\
         \timporting.call_import->call->div_by.go(i32) i32"
    );

    // Still usable afterwards.
    assert_eq!(f.call(&ctx, &[1]).unwrap(), vec![1]);
}

#[test]
fn funcref_globals_translate_to_opaque_references() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();

    let i64_i64 = FunctionType::new(vec![ValType::I64], vec![ValType::I64]);
    let body = || Code::wasm(vec![op::LOCAL_GET, 0, op::END], vec![ValType::I64]);
    let module = Arc::new(Module {
        id: ModuleId::fresh(),
        types: vec![i64_i64],
        functions: vec![0, 0, 0],
        codes: vec![body(), body(), body()],
        ..Default::default()
    });
    engine.compile_module(&module).unwrap();
    let instance = instantiate(&ns, &engine, &module, "m", &ctx).unwrap();
    let me = instance.engine();

    use driftwasm::core::GlobalType;
    use driftwasm::runtime::NULL_FUNCREF_VALUE;
    let globals = vec![
        Arc::new(driftwasm::GlobalInstance::new(GlobalType::new(ValType::I32, false), 10)),
        Arc::new(driftwasm::GlobalInstance::new(
            GlobalType::new(ValType::FuncRef, false),
            NULL_FUNCREF_VALUE,
        )),
        Arc::new(driftwasm::GlobalInstance::new(GlobalType::new(ValType::FuncRef, false), 2)),
        Arc::new(driftwasm::GlobalInstance::new(GlobalType::new(ValType::FuncRef, false), 1)),
        Arc::new(driftwasm::GlobalInstance::new(GlobalType::new(ValType::FuncRef, false), 0)),
    ];
    me.initialize_funcref_globals(&globals);

    // Non-funcref globals stay intact; the null sentinel becomes the null
    // reference; indices become the engine's references.
    assert_eq!(globals[0].get(), 10);
    assert_eq!(globals[1].get(), 0);
    assert_eq!(globals[2].get(), me.function_ref(2).unwrap());
    assert_eq!(globals[3].get(), me.function_ref(1).unwrap());
    assert_eq!(globals[4].get(), me.function_ref(0).unwrap());
    assert_ne!(globals[2].get(), 0);
}

/// Four trivial functions and two tables wired by active element segments:
/// table0[0] = func 2, table1[5] = func 1.
fn multi_table_module() -> Arc<Module> {
    let v_v = FunctionType::default();
    let empty = || Code::wasm(vec![op::END], vec![]);
    Arc::new(Module {
        id: ModuleId::fresh(),
        types: vec![v_v],
        functions: vec![0, 0, 0, 0],
        codes: vec![empty(), empty(), empty(), empty()],
        tables: vec![
            TableType { elem: ValType::FuncRef, limits: Limits::new(2, None) },
            TableType { elem: ValType::FuncRef, limits: Limits::new(10, None) },
        ],
        elements: vec![
            ElementSegment {
                active: Some((0, driftwasm::core::ConstExpr::I32(0))),
                init: vec![Some(2)],
            },
            ElementSegment {
                active: Some((1, driftwasm::core::ConstExpr::I32(5))),
                init: vec![Some(1)],
            },
        ],
        ..Default::default()
    })
}

#[test]
fn lookup_function_resolves_table_slots() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let module = multi_table_module();
    engine.compile_module(&module).unwrap();
    let instance = instantiate(&ns, &engine, &module, "m", &ctx).unwrap();
    let me = instance.engine();
    let type_id = instance.type_id(0).unwrap();

    let table0 = instance.table(0).unwrap();
    let table1 = instance.table(1).unwrap();

    assert_eq!(me.lookup_function(table0, type_id, 0).unwrap(), 2);
    assert_eq!(me.lookup_function(table1, type_id, 5).unwrap(), 1);

    // Uninitialized and out-of-range slots trap the same way.
    assert_eq!(me.lookup_function(table0, type_id, 1).unwrap_err(), Trap::InvalidTableAccess);
    assert_eq!(me.lookup_function(table0, type_id, 9).unwrap_err(), Trap::InvalidTableAccess);

    // A structurally different expected type is rejected.
    let other = driftwasm::core::intern(&FunctionType::new(vec![ValType::F64], vec![]));
    assert_eq!(
        me.lookup_function(table0, other, 0).unwrap_err(),
        Trap::IndirectCallTypeMismatch
    );
}

#[test]
fn indirect_calls_check_type_ids() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();

    // Two callees of different signatures in one table, called indirectly
    // with the first signature expected.
    let t_i32 = FunctionType::new(vec![], vec![ValType::I32]);
    let t_i64 = FunctionType::new(vec![], vec![ValType::I64]);
    let caller = FunctionType::new(vec![ValType::I32], vec![ValType::I32]);
    let module = Arc::new(Module {
        id: ModuleId::fresh(),
        types: vec![t_i32, t_i64, caller],
        functions: vec![0, 1, 2],
        codes: vec![
            Code::wasm(vec![op::I32_CONST, 42, op::END], vec![]),
            Code::wasm(vec![op::I64_CONST, 7, op::END], vec![]),
            // (call_indirect (type 0) (local.get 0))
            Code::wasm(
                vec![op::LOCAL_GET, 0, op::CALL_INDIRECT, 0, 0, op::END],
                vec![],
            ),
        ],
        tables: vec![TableType { elem: ValType::FuncRef, limits: Limits::new(3, None) }],
        elements: vec![ElementSegment {
            active: Some((0, driftwasm::core::ConstExpr::I32(0))),
            init: vec![Some(0), Some(1)],
        }],
        exports: vec![Export { name: "dispatch".to_string(), desc: ExportDesc::Func(2) }],
        ..Default::default()
    });
    engine.compile_module(&module).unwrap();
    let instance = instantiate(&ns, &engine, &module, "m", &ctx).unwrap();
    let f = instance.exported_function("dispatch").unwrap();

    assert_eq!(f.call(&ctx, &[0]).unwrap(), vec![42]);

    let err = f.call(&ctx, &[1]).unwrap_err();
    assert_eq!(err.trap(), Some(Trap::IndirectCallTypeMismatch));

    let err = f.call(&ctx, &[2]).unwrap_err();
    assert_eq!(err.trap(), Some(Trap::InvalidTableAccess));
}

const WASM_PHRASE: &str = "Well, that'll be the day when you say goodbye.";

/// One page of memory, a passive copy of the phrase, and exports to grow the
/// memory and to `memory.init` the phrase at offset zero.
fn memory_module() -> Arc<Module> {
    let grow_ty = FunctionType::new(vec![ValType::I32], vec![]);
    let init_ty = FunctionType::default();
    Arc::new(Module {
        id: ModuleId::fresh(),
        types: vec![grow_ty, init_ty],
        functions: vec![0, 1],
        codes: vec![
            Code::wasm(
                vec![op::LOCAL_GET, 0, op::MEMORY_GROW, 0, op::DROP, op::END],
                vec![],
            ),
            Code::wasm(
                vec![
                    op::I32_CONST,
                    0,
                    op::I32_CONST,
                    0,
                    op::I32_CONST,
                    WASM_PHRASE.len() as u8,
                    op::MISC_PREFIX,
                    op::MISC_MEMORY_INIT as u8,
                    0,
                    0,
                    op::END,
                ],
                vec![],
            ),
        ],
        memory: Some(MemoryType { limits: Limits::new(1, Some(2)) }),
        data: vec![DataSegment { active: None, init: WASM_PHRASE.as_bytes().to_vec() }],
        exports: vec![
            Export { name: "grow".to_string(), desc: ExportDesc::Func(0) },
            Export { name: "init".to_string(), desc: ExportDesc::Func(1) },
        ],
        ..Default::default()
    })
}

#[test]
fn memory_reads_alias_until_capacity_changes() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let module = memory_module();
    engine.compile_module(&module).unwrap();
    let instance = instantiate(&ns, &engine, &module, "m", &ctx).unwrap();
    let memory = instance.memory().unwrap().clone();
    let grow = instance.exported_function("grow").unwrap();
    let init = instance.exported_function("init").unwrap();

    let phrase_len = WASM_PHRASE.len() as u32;
    let view = memory.read(0, phrase_len).unwrap();
    assert_eq!(view.to_vec(), vec![0u8; WASM_PHRASE.len()]);

    // Wasm writes the phrase; the previously returned view observes it.
    init.call(&ctx, &[]).unwrap();
    assert_eq!(view.to_vec(), WASM_PHRASE.as_bytes());

    // Host writes through the view; wasm-visible memory observes them.
    assert!(view.write(0, b"Goodbye"));
    assert_eq!(memory.read(0, 7).unwrap().to_vec(), b"Goodbye");

    // Growing swaps the backing buffer: the old view goes stale.
    grow.call(&ctx, &[1]).unwrap();
    init.call(&ctx, &[]).unwrap();
    assert_eq!(&view.to_vec()[..7], b"Goodbye");

    // A fresh view sees the re-initialized bytes.
    assert_eq!(memory.read(0, phrase_len).unwrap().to_vec(), WASM_PHRASE.as_bytes());
}

#[test]
fn close_with_exit_code_fails_later_calls() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let module = identity_module();
    engine.compile_module(&module).unwrap();
    let instance = instantiate(&ns, &engine, &module, "m", &ctx).unwrap();
    let f = instance.exported_function("identity").unwrap();

    instance.close_with_exit_code(2);
    let err = f.call(&ctx, &[1, 2]).unwrap_err();
    assert_eq!(err.to_string(), "module closed with exit_code(2)");
    assert!(matches!(err, CallError::Exit(2)));

    // The name is free again.
    assert!(ns.module("m").is_none());
    instantiate(&ns, &engine, &module, "m", &ctx).unwrap();
}

#[test]
fn cancellation_traps_at_host_entry() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let (imported, _) = setup_div_chain(&engine, &ns, &ctx);

    let flag = Arc::new(AtomicBool::new(true));
    let canceled = Context::new().with_cancel(flag.clone());

    let f = imported.exported_function("call->div_by.go").unwrap();
    let err = f.call(&canceled, &[1]).unwrap_err();
    assert!(err.to_string().starts_with("canceled"), "got: {err}");
    assert_eq!(err.trap(), Some(Trap::Canceled));

    // Un-canceled contexts keep working.
    flag.store(false, Ordering::Relaxed);
    assert_eq!(f.call(&canceled, &[1]).unwrap(), vec![1]);
}

#[test]
fn start_function_trap_aborts_instantiation() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let module = Arc::new(Module {
        id: ModuleId::fresh(),
        types: vec![FunctionType::default()],
        functions: vec![0],
        codes: vec![Code::wasm(vec![op::UNREACHABLE, op::END], vec![])],
        start: Some(0),
        ..Default::default()
    });
    engine.compile_module(&module).unwrap();
    let err = instantiate(&ns, &engine, &module, "m", &ctx).unwrap_err();
    assert!(err.to_string().contains("unreachable"), "got: {err}");
    // No partial instance is observable.
    assert!(ns.module("m").is_none());
}

#[test]
fn active_segment_out_of_bounds_aborts_instantiation() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    let module = Arc::new(Module {
        id: ModuleId::fresh(),
        memory: Some(MemoryType { limits: Limits::new(1, Some(1)) }),
        data: vec![DataSegment {
            active: Some(driftwasm::core::ConstExpr::I32(65530)),
            init: vec![0; 16],
        }],
        ..Default::default()
    });
    engine.compile_module(&module).unwrap();
    let err = instantiate(&ns, &engine, &module, "m", &ctx).unwrap_err();
    assert!(err.to_string().contains("out of bounds"), "got: {err}");
    assert!(ns.module("m").is_none());
}

#[test]
fn deep_recursion_exhausts_the_call_stack() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();
    // A function that calls itself unconditionally.
    let module = Arc::new(Module {
        id: ModuleId::fresh(),
        types: vec![FunctionType::default()],
        functions: vec![0],
        codes: vec![Code::wasm(vec![op::CALL, 0, op::END], vec![])],
        exports: vec![Export { name: "loop".to_string(), desc: ExportDesc::Func(0) }],
        ..Default::default()
    });
    engine.compile_module(&module).unwrap();
    let instance = instantiate(&ns, &engine, &module, "m", &ctx).unwrap();
    let f = instance.exported_function("loop").unwrap();
    let err = f.call(&ctx, &[]).unwrap_err();
    assert_eq!(err.trap(), Some(Trap::CallStackExhausted));
    assert!(err.to_string().starts_with("wasm error: call stack exhausted"));
}

#[test]
fn host_module_fn_reads_caller_memory() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();

    HostModuleBuilder::new("host")
        .function()
        .with_host_module_fn(vec![], vec![ValType::I64], |_ctx, caller, stack| {
            let memory = caller.memory().expect("caller has a memory");
            stack[0] = memory.read_u64_le(0).expect("in bounds");
        })
        .export("read_mem")
        .instantiate(&ns, &engine, &ctx)
        .unwrap();

    let mut importing = Module {
        id: ModuleId::fresh(),
        types: vec![FunctionType::new(vec![], vec![ValType::I64])],
        imports: vec![Import {
            module: "host".to_string(),
            name: "read_mem".to_string(),
            desc: ImportDesc::Func(0),
        }],
        functions: vec![0],
        codes: vec![Code::wasm(vec![op::CALL, 0, op::END], vec![])],
        memory: Some(MemoryType { limits: Limits::new(1, Some(1)) }),
        data: vec![DataSegment {
            active: Some(driftwasm::core::ConstExpr::I32(0)),
            init: 6u64.to_le_bytes().to_vec(),
        }],
        exports: vec![Export {
            name: "call_import->read_mem".to_string(),
            desc: ExportDesc::Func(1),
        }],
        ..Default::default()
    };
    named(&mut importing, "importing", vec![(1, "call_import->read_mem")]);
    let importing = Arc::new(importing);
    engine.compile_module(&importing).unwrap();
    let importing = instantiate(&ns, &engine, &importing, "importing", &ctx).unwrap();

    let f = importing.exported_function("call_import->read_mem").unwrap();
    assert_eq!(f.call(&ctx, &[]).unwrap(), vec![6]);
}

#[test]
fn host_wasm_thunk_runs_against_caller_instance() {
    let engine = new_engine();
    let ns = Namespace::new();
    let ctx = Context::new();

    // A host-owned thunk with a wasm body reading the caller's memory.
    HostModuleBuilder::new("host")
        .function()
        .with_wasm_thunk(
            vec![],
            vec![ValType::I64],
            vec![],
            vec![op::I32_CONST, 0, op::I64_LOAD, 0x3, 0x0, op::END],
        )
        .export("read_mem")
        .instantiate(&ns, &engine, &ctx)
        .unwrap();

    let importing = Arc::new(Module {
        id: ModuleId::fresh(),
        types: vec![FunctionType::new(vec![], vec![ValType::I64])],
        imports: vec![Import {
            module: "host".to_string(),
            name: "read_mem".to_string(),
            desc: ImportDesc::Func(0),
        }],
        functions: vec![0],
        codes: vec![Code::wasm(vec![op::CALL, 0, op::END], vec![])],
        memory: Some(MemoryType { limits: Limits::new(1, Some(1)) }),
        data: vec![DataSegment {
            active: Some(driftwasm::core::ConstExpr::I32(0)),
            init: 9u64.to_le_bytes().to_vec(),
        }],
        exports: vec![Export { name: "read".to_string(), desc: ExportDesc::Func(1) }],
        ..Default::default()
    });
    engine.compile_module(&importing).unwrap();
    let importing = instantiate(&ns, &engine, &importing, "importing", &ctx).unwrap();

    let f = importing.exported_function("read").unwrap();
    assert_eq!(f.call(&ctx, &[]).unwrap(), vec![9]);
}
