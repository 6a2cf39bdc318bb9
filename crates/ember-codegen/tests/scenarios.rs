// Whole-scenario tests for the IR-construction core.
//
// Scenarios that depend on the out-of-scope lowering pass (type asserts,
// signature-tagged calls) are checked at the IR level: the constructed
// globals and the dumped function IR. Defer dispatch and doubleword
// function values execute without lowering, so those scenarios JIT-compile
// and run for real, with the collector entry points and a trace hook
// registered as host symbols.

use std::sync::Mutex;

use ember_codegen::{Compiler, Config, FuncValueMode, JitContext, RuntimeFn};
use ember_ssa::{
    BasicKind, Callee, CallSite, Const, Field, Function, FunctionId, Instr, Method, MethodSig,
    Pos, Program, Signature, Type, ValueId,
};

fn int64() -> Type {
    Type::basic(BasicKind::Int64)
}

fn dump_config() -> Config {
    Config {
        dump_ir: true,
        ..Config::default()
    }
}

/// Build a compiler over a fresh JIT module and run construction.
fn construct(program: &Program, config: Config, check: impl FnOnce(&Compiler<'_, cranelift_jit::JITModule>)) {
    let mut jit = JitContext::new(&[]);
    let mut compiler = Compiler::new(&mut jit.module, program, config).expect("declare");
    compiler.compile().expect("construct");
    check(&compiler);
}

// ---------------------------------------------------------------------------
// S1 / S2: boxing and type asserts
// ---------------------------------------------------------------------------

/// Box an int8 into the empty interface and assert it back out, comma-ok.
fn box_and_assert_program(asserted: Type) -> Program {
    let mut program = Program::new();
    program.add_function(Function::new(
        "main.roundtrip",
        Signature::new(vec![Type::basic(BasicKind::Int8)], vec![
            asserted.clone(),
            Type::basic(BasicKind::Bool),
        ]),
        vec![
            Instr::Param { index: 0 },
            Instr::MakeInterface {
                value: ValueId(0),
                ty: Type::Interface(vec![]),
            },
            Instr::TypeAssert {
                value: ValueId(1),
                asserted,
                comma_ok: true,
            },
            Instr::Extract {
                tuple: ValueId(2),
                index: 0,
            },
            Instr::Extract {
                tuple: ValueId(2),
                index: 1,
            },
            Instr::Return {
                values: vec![ValueId(3), ValueId(4)],
            },
        ],
    ));
    program
}

#[test]
fn s1_boxing_creates_typecode_and_descriptor_globals() {
    let program = box_and_assert_program(Type::basic(BasicKind::Int8));
    construct(&program, dump_config(), |compiler| {
        assert!(compiler.has_global("type:basic:int8"));
        assert!(compiler.has_global("typeInInterface:type:basic:int8"));
        // No method set for a methodless type.
        assert!(!compiler.has_global("basic:int8$methodset"));
        assert!(compiler.runtime_declared(RuntimeFn::TypeAssert));
    });
}

#[test]
fn s1_boxing_twice_interns_one_descriptor() {
    let mut program = Program::new();
    program.add_function(Function::new(
        "main.box_twice",
        Signature::new(vec![Type::basic(BasicKind::Int8)], vec![]),
        vec![
            Instr::Param { index: 0 },
            Instr::MakeInterface {
                value: ValueId(0),
                ty: Type::Interface(vec![]),
            },
            Instr::MakeInterface {
                value: ValueId(0),
                ty: Type::Interface(vec![]),
            },
            Instr::Return { values: vec![] },
        ],
    ));
    construct(&program, Config::default(), |compiler| {
        let descriptors = compiler
            .global_names()
            .filter(|name| name.starts_with("typeInInterface:"))
            .count();
        assert_eq!(descriptors, 1);
    });
}

#[test]
fn s2_failed_assert_unboxes_only_after_the_check() {
    // Assert an interface holding an int8 to int32; the unboxing narrow
    // must sit on the success path, after the branch on the check.
    let program = box_and_assert_program(Type::basic(BasicKind::Int32));
    construct(&program, dump_config(), |compiler| {
        assert!(compiler.has_global("type:basic:int32"));
        assert!(compiler.runtime_declared(RuntimeFn::TypeAssert));

        let ir = compiler.function_ir("main.roundtrip").expect("dumped IR");
        let check = ir.find("call ").expect("assert call in IR");
        let branch = ir.find("brif").expect("branch in IR");
        let narrow = ir.find("ireduce.i32").expect("unboxing narrow in IR");
        assert!(check < branch, "check must precede the branch");
        assert!(branch < narrow, "unboxing must follow the branch");
    });
}

#[test]
fn assert_to_interface_keeps_value_and_queries_shape() {
    let printer = Type::named(
        "main.Printer",
        Type::Interface(vec![MethodSig {
            name: "Print".to_string(),
            sig: Signature::default(),
        }]),
        vec![],
    );
    let mut program = Program::new();
    program.add_function(Function::new(
        "main.to_printer",
        Signature::new(
            vec![Type::basic(BasicKind::Int8)],
            vec![printer.clone(), Type::basic(BasicKind::Bool)],
        ),
        vec![
            Instr::Param { index: 0 },
            Instr::MakeInterface {
                value: ValueId(0),
                ty: Type::Interface(vec![]),
            },
            Instr::TypeAssert {
                value: ValueId(1),
                asserted: printer.clone(),
                comma_ok: true,
            },
            Instr::Extract {
                tuple: ValueId(2),
                index: 0,
            },
            Instr::Extract {
                tuple: ValueId(2),
                index: 1,
            },
            Instr::Return {
                values: vec![ValueId(3), ValueId(4)],
            },
        ],
    ));
    construct(&program, dump_config(), |compiler| {
        let shape_name =
            format!("{}$interface", ember_codegen::type_code_name(&printer).unwrap());
        assert!(compiler.has_global(&shape_name));
        assert!(compiler.runtime_declared(RuntimeFn::InterfaceImplements));
        // No unboxing on the interface-assert path.
        let ir = compiler.function_ir("main.to_printer").expect("dumped IR");
        assert!(!ir.contains("ireduce"));
    });
}

#[test]
fn non_comma_ok_assert_traps_through_the_runtime() {
    let mut program = Program::new();
    program.add_function(Function::new(
        "main.must",
        Signature::new(
            vec![Type::basic(BasicKind::Int8)],
            vec![Type::basic(BasicKind::Int8)],
        ),
        vec![
            Instr::Param { index: 0 },
            Instr::MakeInterface {
                value: ValueId(0),
                ty: Type::Interface(vec![]),
            },
            Instr::TypeAssert {
                value: ValueId(1),
                asserted: Type::basic(BasicKind::Int8),
                comma_ok: false,
            },
            Instr::Return {
                values: vec![ValueId(2)],
            },
        ],
    ));
    construct(&program, dump_config(), |compiler| {
        assert!(compiler.runtime_declared(RuntimeFn::InterfaceAssert));
    });
}

// ---------------------------------------------------------------------------
// S4: structural identity vs. named wrapping
// ---------------------------------------------------------------------------

#[test]
fn s4_named_and_unnamed_struct_get_distinct_typecodes() {
    let pair_fields = || {
        vec![
            Field {
                name: "x".to_string(),
                ty: Type::basic(BasicKind::Int32),
            },
            Field {
                name: "y".to_string(),
                ty: Type::basic(BasicKind::Int32),
            },
        ]
    };
    let unnamed = Type::Struct(pair_fields());
    let named = Type::named("main.Point", Type::Struct(pair_fields()), vec![]);

    let mut program = Program::new();
    program.add_function(Function::new(
        "main.box_both",
        Signature::new(vec![unnamed.clone(), named.clone()], vec![]),
        vec![
            Instr::Param { index: 0 },
            Instr::Param { index: 1 },
            Instr::MakeInterface {
                value: ValueId(0),
                ty: Type::Interface(vec![]),
            },
            Instr::MakeInterface {
                value: ValueId(1),
                ty: Type::Interface(vec![]),
            },
            Instr::Return { values: vec![] },
        ],
    ));
    construct(&program, Config::default(), |compiler| {
        assert!(compiler.has_global("type:struct:{basic:int32,basic:int32}"));
        assert!(compiler.has_global("type:~main.Point:struct:{basic:int32,basic:int32}"));
        let typecodes = compiler
            .global_names()
            .filter(|name| name.starts_with("type:"))
            .count();
        assert_eq!(typecodes, 2);
    });
}

// ---------------------------------------------------------------------------
// S6: invocation wrappers
// ---------------------------------------------------------------------------

/// A named 16-byte struct with one value-receiver method, plus the
/// interface it satisfies.
fn pair_with_method(program: &mut Program) -> (Type, Type) {
    let fields = vec![
        Field {
            name: "a".to_string(),
            ty: int64(),
        },
        Field {
            name: "b".to_string(),
            ty: int64(),
        },
    ];
    // The method function is declared against the named type; tie the knot
    // by building the receiver type first without methods.
    let bare = Type::named("main.Pair", Type::Struct(fields.clone()), vec![]);
    let sum = program.add_function(Function::new(
        "main.Pair.Sum",
        Signature::with_recv(bare, vec![], vec![int64()]),
        vec![
            Instr::Const(Const::Int(BasicKind::Int64, 0)),
            Instr::Return {
                values: vec![ValueId(0)],
            },
        ],
    ));
    let pair = Type::named(
        "main.Pair",
        Type::Struct(fields),
        vec![Method {
            name: "Sum".to_string(),
            func: sum,
        }],
    );
    let summer = Type::named(
        "main.Summer",
        Type::Interface(vec![MethodSig {
            name: "Sum".to_string(),
            sig: Signature::new(vec![], vec![int64()]),
        }]),
        vec![],
    );
    (pair, summer)
}

#[test]
fn s6_wide_receiver_generates_one_wrapper() {
    let mut program = Program::new();
    let (pair, summer) = pair_with_method(&mut program);
    program.add_function(Function::new(
        "main.box_pair",
        Signature::new(vec![pair.clone()], vec![summer.clone()]),
        vec![
            Instr::Param { index: 0 },
            Instr::MakeInterface {
                value: ValueId(0),
                ty: summer.clone(),
            },
            Instr::Return {
                values: vec![ValueId(1)],
            },
        ],
    ));
    construct(&program, dump_config(), |compiler| {
        assert!(compiler.has_wrapper("main.Pair.Sum$invoke"));
        let methodset = format!(
            "{}$methodset",
            ember_codegen::type_code_name(&pair).unwrap()
        );
        assert!(compiler.has_global(&methodset));

        // The wrapper reads both struct halves through the opaque pointer
        // and forwards them to the real method.
        let ir = compiler.function_ir("main.Pair.Sum$invoke").expect("wrapper IR");
        assert_eq!(ir.matches("load.i64").count(), 2);
        assert!(ir.contains("call"));
    });
}

#[test]
fn wrapper_elided_for_pointer_receiver() {
    let mut program = Program::new();
    let bare = Type::named("main.Counter", Type::Struct(vec![]), vec![]);
    let inc = program.add_function(Function::new(
        "main.Counter.Inc",
        Signature::with_recv(Type::pointer(bare), vec![], vec![]),
        vec![Instr::Return { values: vec![] }],
    ));
    let counter = Type::named(
        "main.Counter",
        Type::Struct(vec![]),
        vec![Method {
            name: "Inc".to_string(),
            func: inc,
        }],
    );
    program.add_function(Function::new(
        "main.box_counter",
        Signature::new(vec![Type::pointer(counter.clone())], vec![]),
        vec![
            Instr::Param { index: 0 },
            Instr::MakeInterface {
                value: ValueId(0),
                ty: Type::Interface(vec![]),
            },
            Instr::Return { values: vec![] },
        ],
    ));
    construct(&program, Config::default(), |compiler| {
        // The method set exists but holds the raw function address.
        assert!(!compiler.has_wrapper("main.Counter.Inc$invoke"));
        let methodset = format!(
            "{}$methodset",
            ember_codegen::type_code_name(&Type::pointer(counter)).unwrap()
        );
        assert!(compiler.has_global(&methodset));
    });
}

#[test]
fn method_set_emits_an_entry_per_method() {
    let mut program = Program::new();
    let fields = vec![
        Field {
            name: "a".to_string(),
            ty: int64(),
        },
        Field {
            name: "b".to_string(),
            ty: int64(),
        },
    ];
    let bare = Type::named("main.Vec2", Type::Struct(fields.clone()), vec![]);
    let sum = program.add_function(Function::new(
        "main.Vec2.Sum",
        Signature::with_recv(bare.clone(), vec![], vec![int64()]),
        vec![
            Instr::Const(Const::Int(BasicKind::Int64, 0)),
            Instr::Return {
                values: vec![ValueId(0)],
            },
        ],
    ));
    let scale = program.add_function(Function::new(
        "main.Vec2.Scale",
        Signature::with_recv(bare, vec![int64()], vec![]),
        vec![Instr::Return { values: vec![] }],
    ));
    let vec2 = Type::named(
        "main.Vec2",
        Type::Struct(fields),
        vec![
            Method {
                name: "Sum".to_string(),
                func: sum,
            },
            Method {
                name: "Scale".to_string(),
                func: scale,
            },
        ],
    );
    program.add_function(Function::new(
        "main.box_vec2",
        Signature::new(vec![vec2.clone()], vec![]),
        vec![
            Instr::Param { index: 0 },
            Instr::MakeInterface {
                value: ValueId(0),
                ty: Type::Interface(vec![]),
            },
            Instr::Return { values: vec![] },
        ],
    ));
    construct(&program, Config::default(), |compiler| {
        // One signature placeholder per distinct method signature, one
        // wrapper per wide-receiver method.
        assert!(compiler.has_global("func Sum:{}{basic:int64}"));
        assert!(compiler.has_global("func Scale:{basic:int64}{}"));
        assert!(compiler.has_wrapper("main.Vec2.Sum$invoke"));
        assert!(compiler.has_wrapper("main.Vec2.Scale$invoke"));
        let methodset = format!(
            "{}$methodset",
            ember_codegen::type_code_name(&vec2).unwrap()
        );
        assert!(compiler.has_global(&methodset));
    });
}

#[test]
fn invoke_goes_through_the_dispatch_intrinsic() {
    let mut program = Program::new();
    let (pair, summer) = pair_with_method(&mut program);
    program.add_function(Function::new(
        "main.sum_of",
        Signature::new(vec![pair], vec![int64()]),
        vec![
            Instr::Param { index: 0 },
            Instr::MakeInterface {
                value: ValueId(0),
                ty: summer,
            },
            Instr::Call {
                call: CallSite {
                    callee: Callee::Invoke {
                        value: ValueId(1),
                        method: "Sum".to_string(),
                    },
                    args: vec![],
                },
            },
            Instr::Return {
                values: vec![ValueId(2)],
            },
        ],
    ));
    construct(&program, dump_config(), |compiler| {
        assert!(compiler.runtime_declared(RuntimeFn::InterfaceMethod));
        let ir = compiler.function_ir("main.sum_of").expect("dumped IR");
        assert!(ir.contains("call_indirect"));
        // The method signature placeholder is interned by identity.
        assert!(compiler.has_global("func Sum:{}{basic:int64}"));
    });
}

// ---------------------------------------------------------------------------
// S3 / S5: executable scenarios (defer LIFO, closures)
// ---------------------------------------------------------------------------

static RECORDED: Mutex<Vec<i64>> = Mutex::new(Vec::new());

/// Serializes the tests that observe `RECORDED`.
static EXEC_LOCK: Mutex<()> = Mutex::new(());

extern "C" fn record_host(value: i64) {
    RECORDED.lock().unwrap().push(value);
}

extern "C" fn gc_alloc_host(size: usize) -> *mut u8 {
    // Tests never free; leaking keeps the collector out of the picture.
    Box::leak(vec![0u8; size.max(1)].into_boxed_slice()).as_mut_ptr()
}

extern "C" fn gc_track_host(_ptr: *mut u8) {}

fn host_symbols() -> Vec<(&'static str, *const u8)> {
    vec![
        ("test.record", record_host as *const u8),
        ("ember_gc_alloc", gc_alloc_host as *const u8),
        ("ember_gc_track", gc_track_host as *const u8),
    ]
}

/// Compile, finalize, and run a no-argument, no-result program function.
fn run_unit(program: &Program, config: Config, entry: FunctionId) {
    let mut jit = JitContext::new(&host_symbols());
    let func_id = {
        let mut compiler = Compiler::new(&mut jit.module, program, config).expect("declare");
        compiler.compile().expect("construct");
        assert!(compiler.diagnostics().is_empty());
        compiler.function_id(entry).expect("entry declared")
    };
    jit.finalize().expect("finalize");
    let ptr = jit.function_ptr(func_id);
    let entry_fn: extern "C" fn(usize, usize) =
        unsafe { std::mem::transmute::<*const u8, extern "C" fn(usize, usize)>(ptr) };
    entry_fn(0, 0);
}

/// Compile, finalize, and run an (i64, i64, i64) -> i64 program function.
fn run_i64x3(program: &Program, config: Config, entry: FunctionId, args: (i64, i64, i64)) -> i64 {
    let mut jit = JitContext::new(&host_symbols());
    let func_id = {
        let mut compiler = Compiler::new(&mut jit.module, program, config).expect("declare");
        compiler.compile().expect("construct");
        assert!(compiler.diagnostics().is_empty());
        compiler.function_id(entry).expect("entry declared")
    };
    jit.finalize().expect("finalize");
    let ptr = jit.function_ptr(func_id);
    let entry_fn: extern "C" fn(i64, i64, i64, usize, usize) -> i64 =
        unsafe { std::mem::transmute::<*const u8, extern "C" fn(i64, i64, i64, usize, usize) -> i64>(ptr) };
    entry_fn(args.0, args.1, args.2, 0, 0)
}

#[test]
fn s3_defers_run_in_lifo_order() {
    let mut program = Program::new();
    let record = program.add_function(Function::external(
        "test.record",
        Signature::new(vec![int64()], vec![]),
    ));
    let a = program.add_function(Function::new(
        "main.A",
        Signature::default(),
        vec![
            Instr::Const(Const::Int(BasicKind::Int64, 100)),
            Instr::Call {
                call: CallSite {
                    callee: Callee::Function(record),
                    args: vec![ValueId(0)],
                },
            },
            Instr::Return { values: vec![] },
        ],
    ));
    let b = program.add_function(Function::new(
        "main.B",
        Signature::new(vec![int64()], vec![]),
        vec![
            Instr::Param { index: 0 },
            Instr::Call {
                call: CallSite {
                    callee: Callee::Function(record),
                    args: vec![ValueId(0)],
                },
            },
            Instr::Return { values: vec![] },
        ],
    ));
    // func literal capturing x: records the capture when run.
    let c = {
        let mut body = Function::new(
            "main.run$1",
            Signature::default(),
            vec![
                Instr::Capture { index: 0 },
                Instr::Call {
                    call: CallSite {
                        callee: Callee::Function(record),
                        args: vec![ValueId(0)],
                    },
                },
                Instr::Return { values: vec![] },
            ],
        );
        body.captures = vec![int64()];
        program.add_function(body)
    };
    let run = program.add_function(Function::new(
        "main.run",
        Signature::default(),
        vec![
            Instr::Defer {
                call: CallSite {
                    callee: Callee::Function(a),
                    args: vec![],
                },
                pos: Pos(1),
            },
            Instr::Const(Const::Int(BasicKind::Int64, 7)),
            Instr::Defer {
                call: CallSite {
                    callee: Callee::Function(b),
                    args: vec![ValueId(1)],
                },
                pos: Pos(2),
            },
            Instr::Const(Const::Int(BasicKind::Int64, 9)),
            Instr::MakeClosure {
                func: c,
                bindings: vec![ValueId(3)],
            },
            Instr::Defer {
                call: CallSite {
                    callee: Callee::Value(ValueId(4)),
                    args: vec![],
                },
                pos: Pos(3),
            },
            Instr::Return { values: vec![] },
        ],
    ));

    let _exec = EXEC_LOCK.lock().unwrap();
    RECORDED.lock().unwrap().clear();
    run_unit(&program, Config::default(), run);
    assert_eq!(RECORDED.lock().unwrap().as_slice(), &[9, 7, 100]);
}

#[test]
fn defer_dedupes_callback_per_callee_and_still_runs_each_frame() {
    let mut program = Program::new();
    let record = program.add_function(Function::external(
        "test.record",
        Signature::new(vec![int64()], vec![]),
    ));
    let b = program.add_function(Function::new(
        "main.B",
        Signature::new(vec![int64()], vec![]),
        vec![
            Instr::Param { index: 0 },
            Instr::Call {
                call: CallSite {
                    callee: Callee::Function(record),
                    args: vec![ValueId(0)],
                },
            },
            Instr::Return { values: vec![] },
        ],
    ));
    let run = program.add_function(Function::new(
        "main.run",
        Signature::default(),
        vec![
            Instr::Const(Const::Int(BasicKind::Int64, 1)),
            Instr::Defer {
                call: CallSite {
                    callee: Callee::Function(b),
                    args: vec![ValueId(0)],
                },
                pos: Pos(1),
            },
            Instr::Const(Const::Int(BasicKind::Int64, 2)),
            Instr::Defer {
                call: CallSite {
                    callee: Callee::Function(b),
                    args: vec![ValueId(2)],
                },
                pos: Pos(2),
            },
            Instr::Return { values: vec![] },
        ],
    ));

    let _exec = EXEC_LOCK.lock().unwrap();
    RECORDED.lock().unwrap().clear();
    run_unit(&program, Config::default(), run);
    assert_eq!(RECORDED.lock().unwrap().as_slice(), &[2, 1]);
}

/// `adder` closure body: returns its argument plus the captured base.
fn add_adder(program: &mut Program) -> FunctionId {
    let mut body = Function::new(
        "main.adder$1",
        Signature::new(vec![int64()], vec![int64()]),
        vec![
            Instr::Param { index: 0 },
            Instr::Capture { index: 0 },
            Instr::BinOp {
                op: ember_ssa::BinOp::Add,
                lhs: ValueId(0),
                rhs: ValueId(1),
            },
            Instr::Return {
                values: vec![ValueId(2)],
            },
        ],
    );
    body.captures = vec![int64()];
    program.add_function(body)
}

#[test]
fn s5_closure_result_depends_on_capture_and_argument() {
    let mut program = Program::new();
    let adder = add_adder(&mut program);
    // run(base, x, y) = f(x) + 1000 * f(y) with f = adder(base)
    let run = program.add_function(Function::new(
        "main.run",
        Signature::new(vec![int64(), int64(), int64()], vec![int64()]),
        vec![
            Instr::Param { index: 0 },
            Instr::Param { index: 1 },
            Instr::Param { index: 2 },
            Instr::MakeClosure {
                func: adder,
                bindings: vec![ValueId(0)],
            },
            Instr::Call {
                call: CallSite {
                    callee: Callee::Value(ValueId(3)),
                    args: vec![ValueId(1)],
                },
            },
            Instr::Call {
                call: CallSite {
                    callee: Callee::Value(ValueId(3)),
                    args: vec![ValueId(2)],
                },
            },
            Instr::Const(Const::Int(BasicKind::Int64, 1000)),
            Instr::BinOp {
                op: ember_ssa::BinOp::Mul,
                lhs: ValueId(5),
                rhs: ValueId(6),
            },
            Instr::BinOp {
                op: ember_ssa::BinOp::Add,
                lhs: ValueId(4),
                rhs: ValueId(7),
            },
            Instr::Return {
                values: vec![ValueId(8)],
            },
        ],
    ));

    let config = Config {
        func_values: FuncValueMode::Doubleword,
        ..Config::default()
    };
    let result = run_i64x3(&program, config, run, (10, 1, 2));
    assert_eq!(result, 11 + 1000 * 12);
}

#[test]
fn s5_same_function_different_context_yields_other_capture() {
    let mut program = Program::new();
    let adder = add_adder(&mut program);
    // run(a, b, x) = g(x) + 1000 * f(x) with f = adder(a), g = adder(b)
    let run = program.add_function(Function::new(
        "main.run",
        Signature::new(vec![int64(), int64(), int64()], vec![int64()]),
        vec![
            Instr::Param { index: 0 },
            Instr::Param { index: 1 },
            Instr::Param { index: 2 },
            Instr::MakeClosure {
                func: adder,
                bindings: vec![ValueId(0)],
            },
            Instr::MakeClosure {
                func: adder,
                bindings: vec![ValueId(1)],
            },
            Instr::Call {
                call: CallSite {
                    callee: Callee::Value(ValueId(4)),
                    args: vec![ValueId(2)],
                },
            },
            Instr::Call {
                call: CallSite {
                    callee: Callee::Value(ValueId(3)),
                    args: vec![ValueId(2)],
                },
            },
            Instr::Const(Const::Int(BasicKind::Int64, 1000)),
            Instr::BinOp {
                op: ember_ssa::BinOp::Mul,
                lhs: ValueId(6),
                rhs: ValueId(7),
            },
            Instr::BinOp {
                op: ember_ssa::BinOp::Add,
                lhs: ValueId(5),
                rhs: ValueId(8),
            },
            Instr::Return {
                values: vec![ValueId(9)],
            },
        ],
    ));

    let config = Config {
        func_values: FuncValueMode::Doubleword,
        ..Config::default()
    };
    // f captures 10, g captures 20, both called with 5.
    let result = run_i64x3(&program, config, run, (10, 20, 5));
    assert_eq!(result, 25 + 1000 * 15);
}

#[test]
fn func_value_equality_scalar_ignores_context() {
    let mut program = Program::new();
    let adder = add_adder(&mut program);
    // Two closures over the same function: scalar difference is zero.
    let run = program.add_function(Function::new(
        "main.run",
        Signature::new(vec![int64(), int64(), int64()], vec![int64()]),
        vec![
            Instr::Param { index: 0 },
            Instr::Param { index: 1 },
            Instr::Param { index: 2 },
            Instr::MakeClosure {
                func: adder,
                bindings: vec![ValueId(0)],
            },
            Instr::MakeClosure {
                func: adder,
                bindings: vec![ValueId(1)],
            },
            Instr::FuncScalar { value: ValueId(3) },
            Instr::FuncScalar { value: ValueId(4) },
            Instr::BinOp {
                op: ember_ssa::BinOp::Sub,
                lhs: ValueId(5),
                rhs: ValueId(6),
            },
            Instr::Return {
                values: vec![ValueId(7)],
            },
        ],
    ));

    let config = Config {
        func_values: FuncValueMode::Doubleword,
        ..Config::default()
    };
    assert_eq!(run_i64x3(&program, config, run, (1, 2, 0)), 0);
}

// ---------------------------------------------------------------------------
// Defer through interfaces, and the unsupported-target diagnostic
// ---------------------------------------------------------------------------

#[test]
fn deferred_invoke_dispatches_in_the_epilogue() {
    let mut program = Program::new();
    let (pair, summer) = pair_with_method(&mut program);
    program.add_function(Function::new(
        "main.run",
        Signature::new(vec![pair], vec![]),
        vec![
            Instr::Param { index: 0 },
            Instr::MakeInterface {
                value: ValueId(0),
                ty: summer,
            },
            Instr::Defer {
                call: CallSite {
                    callee: Callee::Invoke {
                        value: ValueId(1),
                        method: "Sum".to_string(),
                    },
                    args: vec![],
                },
                pos: Pos(1),
            },
            Instr::Return { values: vec![] },
        ],
    ));
    construct(&program, dump_config(), |compiler| {
        assert!(compiler.diagnostics().is_empty());
        // The dispatcher resolves the method inside its case block.
        assert!(compiler.runtime_declared(RuntimeFn::InterfaceMethod));
        let ir = compiler.function_ir("main.run").expect("dumped IR");
        assert!(ir.contains("br_table") || ir.contains("icmp"));
    });
}

#[test]
fn defer_through_plain_function_value_is_diagnosed() {
    let mut program = Program::new();
    let a = program.add_function(Function::new(
        "main.A",
        Signature::default(),
        vec![Instr::Return { values: vec![] }],
    ));
    program.add_function(Function::new(
        "main.run",
        Signature::default(),
        vec![
            Instr::FuncConst { func: a },
            Instr::Defer {
                call: CallSite {
                    callee: Callee::Value(ValueId(0)),
                    args: vec![],
                },
                pos: Pos(7),
            },
            Instr::Return { values: vec![] },
        ],
    ));
    construct(&program, Config::default(), |compiler| {
        let diagnostics = compiler.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].pos, Pos(7));
        assert!(diagnostics[0].message.contains("unsupported defer"));
    });
}

// ---------------------------------------------------------------------------
// Function-value representations
// ---------------------------------------------------------------------------

#[test]
fn signature_tagged_values_intern_records_and_signatures() {
    let mut program = Program::new();
    let a = program.add_function(Function::new(
        "main.A",
        Signature::new(vec![int64()], vec![]),
        vec![Instr::Return { values: vec![] }],
    ));
    program.add_function(Function::new(
        "main.run",
        Signature::default(),
        vec![
            Instr::FuncConst { func: a },
            Instr::FuncConst { func: a },
            Instr::Return { values: vec![] },
        ],
    ));
    construct(&program, Config::default(), |compiler| {
        assert!(compiler.has_global("main.A$withSignature"));
        assert!(compiler.has_global("reflect/types.type:func:{basic:int64}{}"));
        let tagged = compiler
            .global_names()
            .filter(|name| name.ends_with("$withSignature"))
            .count();
        assert_eq!(tagged, 1);
    });
}

#[test]
fn signature_tagged_calls_use_the_get_func_ptr_helper() {
    let mut program = Program::new();
    let a = program.add_function(Function::new(
        "main.A",
        Signature::default(),
        vec![Instr::Return { values: vec![] }],
    ));
    program.add_function(Function::new(
        "main.run",
        Signature::default(),
        vec![
            Instr::FuncConst { func: a },
            Instr::Call {
                call: CallSite {
                    callee: Callee::Value(ValueId(0)),
                    args: vec![],
                },
            },
            Instr::Return { values: vec![] },
        ],
    ));
    construct(&program, dump_config(), |compiler| {
        assert!(compiler.runtime_declared(RuntimeFn::GetFuncPtr));
        let ir = compiler.function_ir("main.run").expect("dumped IR");
        assert!(ir.contains("call_indirect"));
    });
}
