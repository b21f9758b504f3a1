use std::rc::Rc;

use super::*;
use crate::bytecode::{
    aspec, op_abc, op_abx, op_abz, op_asbx, op_ax, scope_desc, Irep, OpCode, BC_VERSION,
    PROC_CAPTURE, PROC_STRICT, RET_BREAK, RET_NORMAL, RET_RETURN,
};
use crate::error::Raised;
use crate::procs::RProc;
use crate::value::{hash_get, Value};

fn make_irep(
    vm: &mut Vm,
    nlocals: usize,
    nregs: usize,
    code: Vec<u32>,
    pool: Vec<Value>,
    syms: &[&str],
    reps: Vec<usize>,
) -> Rc<Irep> {
    let syms = syms.iter().map(|s| vm.intern(s)).collect();
    Rc::new(Irep {
        nlocals,
        nregs,
        code,
        pool,
        syms,
        reps,
    })
}

fn top_proc(vm: &Vm, ir: Rc<Irep>) -> Rc<RProc> {
    let mut p = RProc::from_irep(ir, Some(vm.object_class()));
    p.strict = true;
    Rc::new(p)
}

fn run_top(vm: &mut Vm, ir: Rc<Irep>) -> Value {
    let p = top_proc(vm, ir);
    let top = vm.top_self();
    vm.run(&p, top)
}

fn define(vm: &mut Vm, name: &str, ir: Rc<Irep>, strict: bool) {
    let object = vm.object_class();
    let mut p = RProc::from_irep(ir, Some(object.clone()));
    p.strict = strict;
    let mid = vm.intern(name);
    vm.define_method(&object, mid, Rc::new(p));
}

fn int(v: &Value) -> i64 {
    match v {
        Value::Int(i) => *i,
        other => panic!("expected Int, got {:?}", other),
    }
}

fn ints(v: &Value) -> Vec<i64> {
    match v {
        Value::Array(a) => a.borrow().iter().map(int).collect(),
        other => panic!("expected Array, got {:?}", other),
    }
}

fn assert_clean(vm: &Vm) {
    assert_eq!(vm.frames.len(), 1, "frame stack must unwind to the sentinel");
    assert!(vm.rescues.is_empty(), "rescue stack must drain");
    assert!(vm.ensures.is_empty(), "ensure stack must drain");
    assert_eq!(vm.base(), 0);
}

#[test]
fn loadi_return_roundtrip() {
    let mut vm = Vm::new();
    for n in [0i32, 5, -7, 32000, -32000] {
        let ir = make_irep(
            &mut vm,
            2,
            3,
            vec![
                op_asbx(OpCode::LoadI, 1, n),
                op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
            ],
            vec![],
            &[],
            vec![],
        );
        let v = run_top(&mut vm, ir);
        assert_eq!(int(&v), n as i64);
    }
    assert_clean(&vm);
}

#[test]
fn integer_add() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_asbx(OpCode::LoadI, 1, 2),
            op_asbx(OpCode::LoadI, 2, 3),
            op_abc(OpCode::Add, 1, 0, 1),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["+"],
        vec![],
    );
    assert_eq!(int(&run_top(&mut vm, ir)), 5);
    assert!(vm.exception().is_none());
    assert_clean(&vm);
}

#[test]
fn mixed_numeric_arithmetic() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_abx(OpCode::LoadL, 1, 0),
            op_asbx(OpCode::LoadI, 2, 2),
            op_abc(OpCode::Mul, 1, 0, 1),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![Value::Float(2.5)],
        &["*"],
        vec![],
    );
    match run_top(&mut vm, ir) {
        Value::Float(f) => assert_eq!(f, 5.0),
        other => panic!("expected Float, got {:?}", other),
    }
}

#[test]
fn add_inlines_string_concat() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_abx(OpCode::String, 1, 0),
            op_abx(OpCode::String, 2, 1),
            op_abc(OpCode::Add, 1, 0, 1),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![Value::str("foo".into()), Value::str("bar".into())],
        &["+"],
        vec![],
    );
    match run_top(&mut vm, ir) {
        Value::Str(s) => assert_eq!(*s.borrow(), "foobar"),
        other => panic!("expected Str, got {:?}", other),
    }
}

#[test]
fn integer_division_by_zero_raises() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_asbx(OpCode::LoadI, 1, 1),
            op_asbx(OpCode::LoadI, 2, 0),
            op_abc(OpCode::Div, 1, 0, 1),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["/"],
        vec![],
    );
    let v = run_top(&mut vm, ir);
    assert!(v.is_nil());
    let exc = vm.exception().expect("exception slot must be set");
    let msg = vm.error_message(&exc);
    assert!(msg.contains("ZeroDivisionError"), "{}", msg);
    assert!(msg.contains("divided by 0"), "{}", msg);
    assert_clean(&vm);
}

#[test]
fn strict_arity_mismatch_raises_argument_error() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        3,
        5,
        vec![
            op_ax(OpCode::Enter, aspec(1, 0, false, 0)),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    define(&mut vm, "one_arg", ir, true);

    let top = vm.top_self();
    let ok = vm.funcall(top.clone(), "one_arg", &[Value::Int(5)]);
    assert_eq!(int(&ok), 5);
    assert!(vm.exception().is_none());

    let bad = vm.funcall(top, "one_arg", &[Value::Int(1), Value::Int(2)]);
    assert!(bad.is_nil());
    let exc = vm.exception().expect("exception slot must be set");
    let msg = vm.error_message(&exc);
    assert!(msg.contains("ArgumentError"), "{}", msg);
    assert!(msg.contains("wrong number of arguments (2 for 1)"), "{}", msg);
    assert_clean(&vm);
}

#[test]
fn optional_parameter_table_skips_satisfied_defaults() {
    let mut vm = Vm::new();
    // def opt(x = 5) = x, laid out as ENTER, two table JMPs, the default
    // initialiser, then the body.
    let ir = make_irep(
        &mut vm,
        3,
        5,
        vec![
            op_ax(OpCode::Enter, aspec(0, 1, false, 0)),
            op_asbx(OpCode::Jmp, 0, 1), // table[0] -> default init
            op_asbx(OpCode::Jmp, 0, 1), // table[1] -> body
            op_asbx(OpCode::LoadI, 1, 5),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    define(&mut vm, "opt", ir, true);

    let top = vm.top_self();
    let defaulted = vm.funcall(top.clone(), "opt", &[]);
    assert_eq!(int(&defaulted), 5);
    let supplied = vm.funcall(top, "opt", &[Value::Int(9)]);
    assert_eq!(int(&supplied), 9);
    assert!(vm.exception().is_none());
}

#[test]
fn rescue_catches_raise_in_same_frame() {
    let mut vm = Vm::new();
    // ONERR; RAISE r1; (skipped) LOADI r2, 42; handler: RESCUE r2; RETURN r2
    let ir = make_irep(
        &mut vm,
        3,
        5,
        vec![
            op_ax(OpCode::Enter, aspec(1, 0, false, 0)),
            op_asbx(OpCode::OnErr, 0, 2),
            op_abc(OpCode::Raise, 1, 0, 0),
            op_asbx(OpCode::LoadI, 2, 42),
            op_abc(OpCode::Rescue, 2, 0, 0),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    define(&mut vm, "catcher", ir, true);

    let runtime_error = {
        let sym = vm.intern("RuntimeError");
        match vm.object_class().borrow().consts.get(&sym) {
            Some(Value::Class(c)) => Rc::clone(c),
            _ => panic!("RuntimeError class missing"),
        }
    };
    let exc = vm.exc_new(&runtime_error, Value::str("kaboom".into()));
    let top = vm.top_self();
    let got = vm.funcall(top, "catcher", &[exc.clone()]);
    assert!(got.value_eq(&exc), "rescue must deliver the raised object");
    assert!(vm.exception().is_none(), "RESCUE clears the slot");
    assert_clean(&vm);
}

#[test]
fn poperr_discards_handler_on_normal_path() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_asbx(OpCode::OnErr, 0, 3),
            op_asbx(OpCode::LoadI, 2, 42),
            op_abc(OpCode::PopErr, 1, 0, 0),
            op_asbx(OpCode::Jmp, 0, 1),
            op_abc(OpCode::Rescue, 2, 0, 0),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    assert_eq!(int(&run_top(&mut vm, ir)), 42);
    assert_clean(&vm);
}

/// Build an ensure body that appends `mark` to the `$trace` global array.
fn trace_body(vm: &mut Vm, mark: i32) -> usize {
    let ir = make_irep(
        vm,
        3,
        5,
        vec![
            op_abx(OpCode::GetGlobal, 1, 0),
            op_asbx(OpCode::LoadI, 2, mark),
            op_abc(OpCode::AryPush, 1, 2, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["$trace"],
        vec![],
    );
    vm.add_irep(ir)
}

fn trace_of(vm: &mut Vm) -> Vec<i64> {
    let sym = vm.intern("$trace");
    ints(&vm.global_get(sym))
}

#[test]
fn epop_runs_ensures_in_reverse_order() {
    let mut vm = Vm::new();
    let sym = vm.intern("$trace");
    vm.global_set(sym, Value::array(vec![]));
    let b1 = trace_body(&mut vm, 1);
    let b2 = trace_body(&mut vm, 2);
    let ir = make_irep(
        &mut vm,
        2,
        4,
        vec![
            op_abx(OpCode::EPush, 0, 0),
            op_abx(OpCode::EPush, 0, 1),
            op_abc(OpCode::EPop, 2, 0, 0),
            op_asbx(OpCode::LoadI, 1, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![b1, b2],
    );
    run_top(&mut vm, ir);
    assert_eq!(trace_of(&mut vm), vec![2, 1], "LIFO: body2 before body1");
    assert_clean(&vm);
}

#[test]
fn ensure_runs_when_return_leaves_frame() {
    let mut vm = Vm::new();
    let sym = vm.intern("$trace");
    vm.global_set(sym, Value::array(vec![]));
    let body = trace_body(&mut vm, 7);
    // method registers an ensure and returns without EPOP
    let ir = make_irep(
        &mut vm,
        2,
        4,
        vec![
            op_ax(OpCode::Enter, aspec(0, 0, false, 0)),
            op_abx(OpCode::EPush, 0, 0),
            op_asbx(OpCode::LoadI, 1, 3),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![body],
    );
    define(&mut vm, "guarded", ir, true);
    let top = vm.top_self();
    let v = vm.funcall(top, "guarded", &[]);
    assert_eq!(int(&v), 3);
    assert_eq!(trace_of(&mut vm), vec![7]);
    assert_clean(&vm);
}

#[test]
fn ensure_runs_while_raise_unwinds_frames() {
    let mut vm = Vm::new();
    let sym = vm.intern("$trace");
    vm.global_set(sym, Value::array(vec![]));
    let body = trace_body(&mut vm, 9);
    // risky: EPUSH ensure, then raise via ERR
    let risky = make_irep(
        &mut vm,
        2,
        4,
        vec![
            op_ax(OpCode::Enter, aspec(0, 0, false, 0)),
            op_abx(OpCode::EPush, 0, 0),
            op_abx(OpCode::Err, 0, 0),
        ],
        vec![Value::str("boom".into())],
        &[],
        vec![body],
    );
    define(&mut vm, "risky", risky, true);
    // caller catches it one frame up
    let caller = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_asbx(OpCode::OnErr, 0, 3),
            op_abc(OpCode::LoadSelf, 1, 0, 0),
            op_abc(OpCode::Send, 1, 0, 0),
            op_asbx(OpCode::Jmp, 0, 1),
            op_abc(OpCode::Rescue, 1, 0, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["risky"],
        vec![],
    );
    let v = run_top(&mut vm, caller);
    match &v {
        Value::Exception(_) => {}
        other => panic!("handler should receive the exception, got {:?}", other),
    }
    let msg = vm.error_message(&v);
    assert!(msg.contains("RuntimeError"), "{}", msg);
    assert!(msg.contains("boom"), "{}", msg);
    assert_eq!(trace_of(&mut vm), vec![9], "ensure ran during unwinding");
    assert!(vm.exception().is_none());
    assert_clean(&vm);
}

#[test]
fn closure_reads_upvalue_after_creator_returned() {
    let mut vm = Vm::new();
    let inner = make_irep(
        &mut vm,
        2,
        3,
        vec![
            op_abc(OpCode::GetUpvar, 1, 1, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let inner_idx = vm.add_irep(inner);
    let outer = make_irep(
        &mut vm,
        2,
        4,
        vec![
            op_asbx(OpCode::LoadI, 1, 7),
            op_abz(OpCode::Lambda, 2, 0, PROC_CAPTURE as u32),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![inner_idx],
    );
    let block = run_top(&mut vm, outer);
    assert!(matches!(block, Value::Proc(_)));
    // the creating frame is gone; the environment must have been promoted
    let v = vm.funcall(block, "call", &[]);
    assert_eq!(int(&v), 7);
    assert!(vm.exception().is_none());
    assert_clean(&vm);
}

#[test]
fn shared_environment_aliases_the_live_frame() {
    fn probe(vm: &mut Vm, _slf: Value, args: &[Value]) -> Result<Value, Raised> {
        let p = match &args[0] {
            Value::Proc(p) => Rc::clone(p),
            other => panic!("expected Proc, got {:?}", other),
        };
        let env = p.env.clone().expect("capture flag was set");
        let cioff = env.cioff().expect("home frame is still live");
        let stackidx = env.stackidx().expect("home frame is still live");
        assert_eq!(vm.frames[cioff].stackidx, stackidx);
        Ok(Value::Bool(true))
    }

    let mut vm = Vm::new();
    let object = vm.object_class();
    vm.define_native(&object, "probe", probe);
    let inner = make_irep(
        &mut vm,
        2,
        3,
        vec![
            op_abc(OpCode::LoadNil, 1, 0, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let inner_idx = vm.add_irep(inner);
    let outer = make_irep(
        &mut vm,
        3,
        6,
        vec![
            op_abz(OpCode::Lambda, 1, 0, PROC_CAPTURE as u32),
            op_abc(OpCode::LoadSelf, 2, 0, 0),
            op_abc(OpCode::Move, 3, 1, 0),
            op_abc(OpCode::Send, 2, 0, 1),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["probe"],
        vec![inner_idx],
    );
    let v = run_top(&mut vm, outer);
    assert!(matches!(v, Value::Bool(true)));
    assert!(vm.exception().is_none());
}

#[test]
fn upvalue_store_writes_through_environment() {
    let mut vm = Vm::new();
    // inner sets upvar x = 41 then outer returns x + 1
    let inner = make_irep(
        &mut vm,
        2,
        3,
        vec![
            op_asbx(OpCode::LoadI, 1, 41),
            op_abc(OpCode::SetUpvar, 1, 1, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let inner_idx = vm.add_irep(inner);
    let outer = make_irep(
        &mut vm,
        2,
        5,
        vec![
            op_asbx(OpCode::LoadI, 1, 0),
            op_abz(OpCode::Lambda, 2, 0, PROC_CAPTURE as u32),
            op_abc(OpCode::Send, 2, 0, 0),
            op_abc(OpCode::AddI, 1, 1, 1),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["call", "+"],
        vec![inner_idx],
    );
    assert_eq!(int(&run_top(&mut vm, outer)), 42);
}

fn depth_probe(vm: &mut Vm, _slf: Value, _args: &[Value]) -> Result<Value, Raised> {
    Ok(Value::Int(vm.call_depth() as i64))
}

#[test]
fn tailcall_runs_in_constant_frame_depth() {
    let mut vm = Vm::new();
    let object = vm.object_class();
    vm.define_native(&object, "frame_depth", depth_probe);
    let ir = make_irep(
        &mut vm,
        3,
        6,
        vec![
            op_ax(OpCode::Enter, aspec(1, 0, false, 0)),
            op_abc(OpCode::Move, 2, 1, 0),
            op_asbx(OpCode::LoadI, 3, 0),
            op_abc(OpCode::Eq, 2, 0, 1),
            op_asbx(OpCode::JmpNot, 2, 3),
            op_abc(OpCode::LoadSelf, 2, 0, 0),
            op_abc(OpCode::Send, 2, 1, 0),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
            op_abc(OpCode::LoadSelf, 2, 0, 0),
            op_abc(OpCode::Move, 3, 1, 0),
            op_abc(OpCode::SubI, 3, 2, 1),
            op_abc(OpCode::TailCall, 2, 3, 1),
        ],
        vec![],
        &["==", "frame_depth", "-", "countdown"],
        vec![],
    );
    define(&mut vm, "countdown", ir, true);

    let top = vm.top_self();
    let base_depth = vm.funcall(top.clone(), "countdown", &[Value::Int(0)]);
    let deep_depth = vm.funcall(top, "countdown", &[Value::Int(10_000)]);
    assert!(vm.exception().is_none());
    assert_eq!(
        int(&base_depth),
        int(&deep_depth),
        "tailcall must not grow the frame stack"
    );
    assert_clean(&vm);
}

#[test]
fn missing_method_reports_no_method_error() {
    let mut vm = Vm::new();
    let top = vm.top_self();
    let v = vm.funcall(top, "nope", &[]);
    assert!(v.is_nil());
    let exc = vm.exception().expect("exception slot must be set");
    let msg = vm.error_message(&exc);
    assert!(msg.contains("NoMethodError"), "{}", msg);
    assert!(msg.contains("undefined method 'nope'"), "{}", msg);
}

#[test]
fn send_rewrites_to_method_missing_with_name_prepended() {
    let mut vm = Vm::new();
    let object = vm.object_class();
    // method_missing returning its first argument, the original symbol
    let mm = make_irep(
        &mut vm,
        3,
        6,
        vec![
            op_ax(OpCode::Enter, aspec(1, 0, true, 0)),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let catcher = vm.intern("Catcher");
    let c = vm
        .define_class_under(&object, catcher, None)
        .expect("class definition");
    let mm_sym = vm.intern("method_missing");
    let mut p = RProc::from_irep(mm, Some(Rc::clone(&c)));
    p.strict = true;
    vm.define_method(&c, mm_sym, Rc::new(p));

    let obj = vm.obj_new(&c);
    // exercise the SEND-side rewrite, not funcall's
    let ir = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_abc(OpCode::LoadSelf, 1, 0, 0),
            op_abc(OpCode::Send, 1, 0, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["vanish"],
        vec![],
    );
    let p = top_proc(&vm, ir);
    let v = vm.run(&p, obj);
    let expected = vm.intern("vanish");
    match v {
        Value::Sym(s) => assert_eq!(s, expected),
        other => panic!("expected Sym, got {:?}", other),
    }
    assert!(vm.exception().is_none());
}

#[test]
fn super_dispatches_above_defining_class() {
    let mut vm = Vm::new();
    let object = vm.object_class();
    let a_name = vm.intern("A");
    let a_cls = vm.define_class_under(&object, a_name, None).expect("A");
    let b_name = vm.intern("B");
    let b_cls = vm
        .define_class_under(&object, b_name, Some(Rc::clone(&a_cls)))
        .expect("B");

    let base_m = make_irep(
        &mut vm,
        2,
        4,
        vec![
            op_ax(OpCode::Enter, aspec(0, 0, false, 0)),
            op_asbx(OpCode::LoadI, 1, 41),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let m_sym = vm.intern("m");
    let mut pa = RProc::from_irep(base_m, Some(Rc::clone(&a_cls)));
    pa.strict = true;
    vm.define_method(&a_cls, m_sym, Rc::new(pa));

    let sub_m = make_irep(
        &mut vm,
        2,
        5,
        vec![
            op_ax(OpCode::Enter, aspec(0, 0, false, 0)),
            op_abc(OpCode::Super, 1, 0, 0),
            op_abc(OpCode::AddI, 1, 0, 1),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["+"],
        vec![],
    );
    let mut pb = RProc::from_irep(sub_m, Some(Rc::clone(&b_cls)));
    pb.strict = true;
    vm.define_method(&b_cls, m_sym, Rc::new(pb));

    let obj = vm.obj_new(&b_cls);
    let v = vm.funcall(obj, "m", &[]);
    assert_eq!(int(&v), 42);
    assert!(vm.exception().is_none());
}

/// Install a `runner` method that invokes its block and then returns 99.
fn define_runner(vm: &mut Vm) {
    let runner = make_irep(
        vm,
        3,
        5,
        vec![
            op_ax(OpCode::Enter, aspec(0, 0, false, 0)),
            op_abx(OpCode::BlkPush, 1, scope_desc(0, false, 0, 0)),
            op_abc(OpCode::Send, 1, 0, 0),
            op_asbx(OpCode::LoadI, 1, 99),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["call"],
        vec![],
    );
    let object = vm.object_class();
    let mut rp = RProc::from_irep(runner, Some(Rc::clone(&object)));
    rp.strict = true;
    let runner_sym = vm.intern("runner");
    vm.define_method(&object, runner_sym, Rc::new(rp));
}

/// Shared scaffold for the block tests: `runner` plus a toplevel that
/// passes the given block to it.
fn block_scaffold(vm: &mut Vm, block_idx: usize) -> Rc<Irep> {
    define_runner(vm);
    make_irep(
        vm,
        3,
        6,
        vec![
            op_abz(OpCode::Lambda, 2, 0, PROC_CAPTURE as u32),
            op_abc(OpCode::LoadSelf, 1, 0, 0),
            op_abc(OpCode::SendB, 1, 0, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["runner"],
        vec![block_idx],
    )
}

#[test]
fn break_returns_from_the_yielding_call() {
    let mut vm = Vm::new();
    let block = make_irep(
        &mut vm,
        2,
        3,
        vec![
            op_asbx(OpCode::LoadI, 1, 5),
            op_abc(OpCode::Return, 1, RET_BREAK as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let block_idx = vm.add_irep(block);
    let top = block_scaffold(&mut vm, block_idx);
    // break exits the runner call: its 99 is never produced
    assert_eq!(int(&run_top(&mut vm, top)), 5);
    assert!(vm.exception().is_none());
    assert_clean(&vm);
}

#[test]
fn block_return_exits_the_enclosing_method() {
    let mut vm = Vm::new();
    let block = make_irep(
        &mut vm,
        2,
        3,
        vec![
            op_asbx(OpCode::LoadI, 1, 5),
            op_abc(OpCode::Return, 1, RET_RETURN as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let block_idx = vm.add_irep(block);
    let top = block_scaffold(&mut vm, block_idx);
    // return unwinds past the runner AND the toplevel's own RETURN
    assert_eq!(int(&run_top(&mut vm, top)), 5);
    assert!(vm.exception().is_none());
    assert_clean(&vm);
}

#[test]
fn block_return_escapes_nested_blocks() {
    let mut vm = Vm::new();
    define_runner(&mut vm);
    let inner = make_irep(
        &mut vm,
        2,
        3,
        vec![
            op_asbx(OpCode::LoadI, 1, 5),
            op_abc(OpCode::Return, 1, RET_RETURN as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let inner_idx = vm.add_irep(inner);
    // outer block: creates the inner block in its own frame and yields it
    let outer_block = make_irep(
        &mut vm,
        3,
        6,
        vec![
            op_ax(OpCode::Enter, aspec(0, 0, false, 0)),
            op_abz(OpCode::Lambda, 2, 0, PROC_CAPTURE as u32),
            op_abc(OpCode::LoadSelf, 1, 0, 0),
            op_abc(OpCode::SendB, 1, 0, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["runner"],
        vec![inner_idx],
    );
    let outer_idx = vm.add_irep(outer_block);
    let top = make_irep(
        &mut vm,
        3,
        6,
        vec![
            op_abz(OpCode::Lambda, 2, 0, PROC_CAPTURE as u32),
            op_abc(OpCode::LoadSelf, 1, 0, 0),
            op_abc(OpCode::SendB, 1, 0, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["runner"],
        vec![outer_idx],
    );
    // the inner block's return exits the whole method chain, two nesting
    // levels deep: neither runner invocation ever produces its 99
    assert_eq!(int(&run_top(&mut vm, top)), 5);
    assert!(vm.exception().is_none());
    assert_clean(&vm);
}

#[test]
fn lambda_return_is_local() {
    let mut vm = Vm::new();
    let lam = make_irep(
        &mut vm,
        2,
        4,
        vec![
            op_ax(OpCode::Enter, aspec(0, 0, false, 0)),
            op_asbx(OpCode::LoadI, 1, 5),
            op_abc(OpCode::Return, 1, RET_RETURN as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let lam_idx = vm.add_irep(lam);
    let top = make_irep(
        &mut vm,
        3,
        5,
        vec![
            op_abz(
                OpCode::Lambda,
                1,
                0,
                (PROC_STRICT | PROC_CAPTURE) as u32,
            ),
            op_abc(OpCode::Send, 1, 0, 0),
            op_abc(OpCode::AddI, 1, 1, 1),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["call", "+"],
        vec![lam_idx],
    );
    // a lambda's return leaves the lambda itself; the caller resumes
    assert_eq!(int(&run_top(&mut vm, top)), 6);
    assert!(vm.exception().is_none());
}

#[test]
fn break_from_dead_home_scope_is_a_local_jump_error() {
    let mut vm = Vm::new();
    let block = make_irep(
        &mut vm,
        2,
        3,
        vec![
            op_asbx(OpCode::LoadI, 1, 5),
            op_abc(OpCode::Return, 1, RET_BREAK as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let block_idx = vm.add_irep(block);
    let outer = make_irep(
        &mut vm,
        2,
        4,
        vec![
            op_abz(OpCode::Lambda, 1, 0, PROC_CAPTURE as u32),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![block_idx],
    );
    let escaped = run_top(&mut vm, outer);
    let v = vm.funcall(escaped, "call", &[]);
    assert!(v.is_nil());
    let exc = vm.exception().expect("exception slot must be set");
    let msg = vm.error_message(&exc);
    assert!(msg.contains("LocalJumpError"), "{}", msg);
    assert_clean(&vm);
}

#[test]
fn deep_calls_grow_stack_and_preserve_registers() {
    let mut vm = Vm::new();
    let dig = make_irep(
        &mut vm,
        3,
        6,
        vec![
            op_ax(OpCode::Enter, aspec(1, 0, false, 0)),
            op_abc(OpCode::Move, 2, 1, 0),
            op_asbx(OpCode::LoadI, 3, 0),
            op_abc(OpCode::Eq, 2, 0, 1),
            op_asbx(OpCode::JmpNot, 2, 2),
            op_asbx(OpCode::LoadI, 2, 0),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
            op_abc(OpCode::LoadSelf, 2, 0, 0),
            op_abc(OpCode::Move, 3, 1, 0),
            op_abc(OpCode::SubI, 3, 1, 1),
            op_abc(OpCode::Send, 2, 2, 1),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["==", "-", "dig"],
        vec![],
    );
    define(&mut vm, "dig", dig, true);

    let before = vm.stack.len();
    let top = make_irep(
        &mut vm,
        8,
        12,
        vec![
            op_asbx(OpCode::LoadI, 1, 11),
            op_asbx(OpCode::LoadI, 2, 22),
            op_asbx(OpCode::LoadI, 3, 33),
            op_asbx(OpCode::LoadI, 4, 44),
            op_asbx(OpCode::LoadI, 5, 55),
            op_abc(OpCode::LoadSelf, 6, 0, 0),
            op_asbx(OpCode::LoadI, 7, 100),
            op_abc(OpCode::Send, 6, 0, 1),
            op_abc(OpCode::Array, 6, 1, 5),
            op_abc(OpCode::Return, 6, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["dig"],
        vec![],
    );
    let v = run_top(&mut vm, top);
    assert!(
        vm.stack.len() > before,
        "100 nested frames must outgrow the initial stack"
    );
    assert_eq!(ints(&v), vec![11, 22, 33, 44, 55]);
    assert_clean(&vm);
}

#[test]
fn checkstack_forces_capacity() {
    let mut vm = Vm::new();
    vm.checkstack(5000);
    assert!(vm.stack.len() >= 5000);
    // growth policy: a small request doubles instead
    let len = vm.stack.len();
    vm.checkstack(len + 1);
    assert!(vm.stack.len() >= 2 * len);
}

#[test]
fn enter_gathers_rest_and_post_arguments() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        5,
        9,
        vec![
            op_ax(OpCode::Enter, aspec(1, 0, true, 1)),
            op_abc(OpCode::Array, 5, 1, 3),
            op_abc(OpCode::Return, 5, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    define(&mut vm, "rest", ir, true);
    let top = vm.top_self();
    let args: Vec<Value> = (1..=5).map(Value::Int).collect();
    let v = vm.funcall(top, "rest", &args);
    let parts = match &v {
        Value::Array(a) => a.borrow().clone(),
        other => panic!("expected Array, got {:?}", other),
    };
    assert_eq!(int(&parts[0]), 1);
    assert_eq!(ints(&parts[1]), vec![2, 3, 4]);
    assert_eq!(int(&parts[2]), 5);
}

#[test]
fn lenient_block_auto_splats_single_array() {
    let mut vm = Vm::new();
    let block_ir = make_irep(
        &mut vm,
        4,
        7,
        vec![
            op_ax(OpCode::Enter, aspec(2, 0, false, 0)),
            op_abc(OpCode::Array, 3, 1, 2),
            op_abc(OpCode::Return, 3, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let block = Value::Proc(Rc::new(RProc::from_irep(block_ir, Some(vm.object_class()))));
    let top = vm.top_self();
    let arg = Value::array(vec![Value::Int(8), Value::Int(9)]);
    let v = vm.vm_yield(&block, &[arg], Some(top));
    assert_eq!(ints(&v), vec![8, 9]);
}

#[test]
fn oversized_argument_lists_are_packed() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        3,
        6,
        vec![
            op_ax(OpCode::Enter, aspec(0, 0, true, 0)),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    define(&mut vm, "many", ir, true);
    let top = vm.top_self();
    let args: Vec<Value> = (0..200).map(Value::Int).collect();
    let v = vm.funcall(top, "many", &args);
    let rest = ints(&v);
    assert_eq!(rest.len(), 200);
    assert_eq!(rest[0], 0);
    assert_eq!(rest[199], 199);
    assert_clean(&vm);
}

#[test]
fn apost_destructures_rest_and_tail() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        6,
        10,
        vec![
            op_asbx(OpCode::LoadI, 1, 1),
            op_asbx(OpCode::LoadI, 2, 2),
            op_asbx(OpCode::LoadI, 3, 3),
            op_asbx(OpCode::LoadI, 4, 4),
            op_asbx(OpCode::LoadI, 5, 5),
            op_abc(OpCode::Array, 1, 1, 5),
            op_abc(OpCode::APost, 1, 1, 2),
            op_abc(OpCode::Array, 4, 1, 3),
            op_abc(OpCode::Return, 4, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let v = run_top(&mut vm, ir);
    let parts = match &v {
        Value::Array(a) => a.borrow().clone(),
        other => panic!("expected Array, got {:?}", other),
    };
    assert_eq!(ints(&parts[0]), vec![2, 3]);
    assert_eq!(int(&parts[1]), 4);
    assert_eq!(int(&parts[2]), 5);
}

#[test]
fn array_concat_push_and_indexing() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        6,
        8,
        vec![
            op_asbx(OpCode::LoadI, 1, 1),
            op_abc(OpCode::Array, 2, 1, 1),
            op_asbx(OpCode::LoadI, 3, 2),
            op_asbx(OpCode::LoadI, 4, 3),
            op_abc(OpCode::Array, 3, 3, 2),
            op_abc(OpCode::AryCat, 2, 3, 0),
            op_asbx(OpCode::LoadI, 4, 4),
            op_abc(OpCode::AryPush, 2, 4, 0),
            op_asbx(OpCode::LoadI, 5, 7),
            op_abc(OpCode::ASet, 5, 2, 1),
            op_abc(OpCode::ARef, 5, 2, 1),
            op_abc(OpCode::Return, 5, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    // [1] ++ [2,3] << 4, then [1]=7 read back
    assert_eq!(int(&run_top(&mut vm, ir)), 7);
}

#[test]
fn hash_build_deduplicates_keys() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        6,
        8,
        vec![
            op_asbx(OpCode::LoadI, 1, 1),
            op_asbx(OpCode::LoadI, 2, 2),
            op_asbx(OpCode::LoadI, 3, 1),
            op_asbx(OpCode::LoadI, 4, 9),
            op_abc(OpCode::Hash, 5, 1, 2),
            op_abc(OpCode::Return, 5, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    match run_top(&mut vm, ir) {
        Value::Hash(h) => {
            assert_eq!(h.borrow().len(), 1);
            let v = hash_get(&h, &Value::Int(1)).expect("key 1");
            assert_eq!(int(&v), 9);
        }
        other => panic!("expected Hash, got {:?}", other),
    }
}

#[test]
fn range_construction() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        4,
        6,
        vec![
            op_asbx(OpCode::LoadI, 1, 1),
            op_asbx(OpCode::LoadI, 2, 5),
            op_abc(OpCode::Range, 3, 1, 1),
            op_abc(OpCode::Return, 3, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    match run_top(&mut vm, ir) {
        Value::Range(r) => {
            assert_eq!(int(&r.beg), 1);
            assert_eq!(int(&r.end), 5);
            assert!(r.excl);
        }
        other => panic!("expected Range, got {:?}", other),
    }
}

#[test]
fn globals_and_instance_variables() {
    let mut vm = Vm::new();
    let g = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_asbx(OpCode::LoadI, 1, 9),
            op_abx(OpCode::SetGlobal, 1, 0),
            op_abx(OpCode::GetGlobal, 2, 0),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["$g"],
        vec![],
    );
    assert_eq!(int(&run_top(&mut vm, g)), 9);

    let iv = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_asbx(OpCode::LoadI, 1, 3),
            op_abx(OpCode::SetIv, 1, 0),
            op_abx(OpCode::GetIv, 2, 0),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["@x"],
        vec![],
    );
    let object = vm.object_class();
    let obj = vm.obj_new(&object);
    let p = top_proc(&vm, iv);
    let v = vm.run(&p, obj);
    assert_eq!(int(&v), 3);
}

#[test]
fn class_definition_method_install_and_new() {
    let mut vm = Vm::new();
    // def Foo#m = 42, installed through CLASS/LAMBDA/METHOD opcodes
    let m_body = make_irep(
        &mut vm,
        2,
        4,
        vec![
            op_ax(OpCode::Enter, aspec(0, 0, false, 0)),
            op_asbx(OpCode::LoadI, 1, 42),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let m_idx = vm.add_irep(m_body);
    let top = make_irep(
        &mut vm,
        4,
        6,
        vec![
            op_abc(OpCode::LoadNil, 1, 0, 0),
            op_abc(OpCode::LoadNil, 2, 0, 0),
            op_abc(OpCode::Class, 1, 0, 0),
            op_abz(OpCode::Lambda, 2, 0, PROC_STRICT as u32),
            op_abc(OpCode::Method, 1, 1, 0),
            op_abx(OpCode::GetConst, 3, 0),
            op_abc(OpCode::Send, 3, 2, 0),
            op_abc(OpCode::Send, 3, 1, 0),
            op_abc(OpCode::Return, 3, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["Foo", "m", "new"],
        vec![m_idx],
    );
    assert_eq!(int(&run_top(&mut vm, top)), 42);
    assert!(vm.exception().is_none());
}

#[test]
fn exec_runs_class_body_with_target_class() {
    let mut vm = Vm::new();
    let m_body = make_irep(
        &mut vm,
        2,
        4,
        vec![
            op_ax(OpCode::Enter, aspec(0, 0, false, 0)),
            op_asbx(OpCode::LoadI, 1, 7),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let m_idx = vm.add_irep(m_body);
    // class body: TCLASS; LAMBDA m; METHOD
    let body = make_irep(
        &mut vm,
        3,
        5,
        vec![
            op_abc(OpCode::TClass, 1, 0, 0),
            op_abz(OpCode::Lambda, 2, 0, PROC_STRICT as u32),
            op_abc(OpCode::Method, 1, 0, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["m"],
        vec![m_idx],
    );
    let body_idx = vm.add_irep(body);
    let top = make_irep(
        &mut vm,
        4,
        6,
        vec![
            op_abc(OpCode::LoadNil, 1, 0, 0),
            op_abc(OpCode::LoadNil, 2, 0, 0),
            op_abc(OpCode::Class, 1, 0, 0),
            op_abx(OpCode::Exec, 1, 0),
            op_abx(OpCode::GetConst, 2, 0),
            op_abc(OpCode::Send, 2, 2, 0),
            op_abc(OpCode::Send, 2, 1, 0),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["Bar", "m", "new"],
        vec![body_idx],
    );
    assert_eq!(int(&run_top(&mut vm, top)), 7);
    assert!(vm.exception().is_none());
}

#[test]
fn argary_gathers_frame_and_upvalue_arguments() {
    let mut vm = Vm::new();
    let gather = make_irep(
        &mut vm,
        4,
        7,
        vec![
            op_ax(OpCode::Enter, aspec(2, 0, false, 0)),
            op_abx(OpCode::ArgAry, 3, scope_desc(2, false, 0, 0)),
            op_abc(OpCode::Return, 3, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    define(&mut vm, "gather", gather, true);
    let top_self = vm.top_self();
    let v = vm.funcall(top_self, "gather", &[Value::Int(10), Value::Int(20)]);
    assert_eq!(ints(&v), vec![10, 20]);

    // lv=1: a block reaching its enclosing method's arguments
    let block = make_irep(
        &mut vm,
        3,
        5,
        vec![
            op_abx(OpCode::ArgAry, 1, scope_desc(1, false, 0, 1)),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    let block_idx = vm.add_irep(block);
    let outer = make_irep(
        &mut vm,
        3,
        6,
        vec![
            op_ax(OpCode::Enter, aspec(1, 0, false, 0)),
            op_abz(OpCode::Lambda, 2, 0, PROC_CAPTURE as u32),
            op_abc(OpCode::Send, 2, 0, 0),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["call"],
        vec![block_idx],
    );
    define(&mut vm, "outer_args", outer, true);
    let top_self = vm.top_self();
    let v = vm.funcall(top_self, "outer_args", &[Value::Int(33)]);
    assert_eq!(ints(&v), vec![33]);
}

#[test]
fn comparison_fast_paths_and_send_fallback() {
    let mut vm = Vm::new();
    // 1 == 1.0 through the numeric cross path
    let numeric = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_asbx(OpCode::LoadI, 1, 1),
            op_abx(OpCode::LoadL, 2, 0),
            op_abc(OpCode::Eq, 1, 0, 1),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![Value::Float(1.0)],
        &["=="],
        vec![],
    );
    assert!(matches!(run_top(&mut vm, numeric), Value::Bool(true)));

    // string equality falls through to Object#==
    let strings = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_abx(OpCode::String, 1, 0),
            op_abx(OpCode::String, 2, 1),
            op_abc(OpCode::Eq, 1, 0, 1),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![Value::str("ab".into()), Value::str("ab".into())],
        &["=="],
        vec![],
    );
    assert!(matches!(run_top(&mut vm, strings), Value::Bool(true)));

    let lt = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_asbx(OpCode::LoadI, 1, 2),
            op_abx(OpCode::LoadL, 2, 0),
            op_abc(OpCode::Lt, 1, 0, 1),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![Value::Float(2.5)],
        &["<"],
        vec![],
    );
    assert!(matches!(run_top(&mut vm, lt), Value::Bool(true)));
}

#[test]
fn comparisons_stay_exact_for_large_integers() {
    let mut vm = Vm::new();
    // i64::MAX and i64::MAX - 1 collapse onto the same f64; the int×int
    // paths must still tell them apart
    let ir = make_irep(
        &mut vm,
        7,
        9,
        vec![
            op_abx(OpCode::LoadL, 1, 0),
            op_abx(OpCode::LoadL, 2, 1),
            op_abc(OpCode::Move, 3, 1, 0),
            op_abc(OpCode::Move, 4, 2, 0),
            op_abc(OpCode::Lt, 3, 0, 1),
            op_abc(OpCode::Move, 4, 1, 0),
            op_abc(OpCode::Move, 5, 2, 0),
            op_abc(OpCode::Gt, 4, 1, 1),
            op_abc(OpCode::Move, 5, 1, 0),
            op_abc(OpCode::Move, 6, 2, 0),
            op_abc(OpCode::Eq, 5, 2, 1),
            op_abc(OpCode::Array, 6, 3, 3),
            op_abc(OpCode::Return, 6, RET_NORMAL as u32, 0),
        ],
        vec![Value::Int(i64::MAX), Value::Int(i64::MAX - 1)],
        &["<", ">", "=="],
        vec![],
    );
    let parts = match run_top(&mut vm, ir) {
        Value::Array(a) => a.borrow().clone(),
        other => panic!("expected Array, got {:?}", other),
    };
    assert!(matches!(parts[0], Value::Bool(false)), "MAX < MAX-1");
    assert!(matches!(parts[1], Value::Bool(true)), "MAX > MAX-1");
    assert!(matches!(parts[2], Value::Bool(false)), "MAX == MAX-1");
}

#[test]
fn initialize_runs_through_class_new() {
    let mut vm = Vm::new();
    let object = vm.object_class();
    let box_name = vm.intern("Box");
    let box_cls = vm.define_class_under(&object, box_name, None).expect("Box");

    let init = make_irep(
        &mut vm,
        3,
        5,
        vec![
            op_ax(OpCode::Enter, aspec(1, 0, false, 0)),
            op_abx(OpCode::SetIv, 1, 0),
            op_abc(OpCode::Return, 0, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["@v"],
        vec![],
    );
    let init_sym = vm.intern("initialize");
    let mut ip = RProc::from_irep(init, Some(Rc::clone(&box_cls)));
    ip.strict = true;
    vm.define_method(&box_cls, init_sym, Rc::new(ip));

    let getter = make_irep(
        &mut vm,
        2,
        4,
        vec![
            op_ax(OpCode::Enter, aspec(0, 0, false, 0)),
            op_abx(OpCode::GetIv, 1, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["@v"],
        vec![],
    );
    let v_sym = vm.intern("v");
    let mut gp = RProc::from_irep(getter, Some(Rc::clone(&box_cls)));
    gp.strict = true;
    vm.define_method(&box_cls, v_sym, Rc::new(gp));

    let obj = vm.funcall(Value::Class(box_cls), "new", &[Value::Int(31)]);
    assert!(matches!(obj, Value::Object(_)));
    let v = vm.funcall(obj, "v", &[]);
    assert_eq!(int(&v), 31);
    assert!(vm.exception().is_none());
    assert_clean(&vm);
}

fn image_bytes(ireps: &[(u16, u16, Vec<u32>, Vec<(u8, Vec<u8>)>, Vec<&str>, Vec<u32>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"CARB");
    buf.extend_from_slice(&BC_VERSION.to_le_bytes());
    buf.extend_from_slice(&(ireps.len() as u32).to_le_bytes());
    for (nlocals, nregs, code, pool, syms, reps) in ireps {
        buf.extend_from_slice(&nlocals.to_le_bytes());
        buf.extend_from_slice(&nregs.to_le_bytes());
        buf.extend_from_slice(&(code.len() as u32).to_le_bytes());
        for w in code {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        buf.extend_from_slice(&(pool.len() as u32).to_le_bytes());
        for (tag, payload) in pool {
            buf.push(*tag);
            if *tag == 2 {
                buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            }
            buf.extend_from_slice(payload);
        }
        buf.extend_from_slice(&(syms.len() as u32).to_le_bytes());
        for s in syms {
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        buf.extend_from_slice(&(reps.len() as u32).to_le_bytes());
        for r in reps {
            buf.extend_from_slice(&r.to_le_bytes());
        }
    }
    buf
}

#[test]
fn image_loads_and_runs() {
    let mut vm = Vm::new();
    let code = vec![
        op_asbx(OpCode::LoadI, 1, 5),
        op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
    ];
    let data = image_bytes(&[(2, 3, code, vec![], vec![], vec![])]);
    let entry = crate::bytecode::load_image(&mut vm, &data).expect("well-formed image");
    let top = vm.top_self();
    let v = vm.run(&entry, top);
    assert_eq!(int(&v), 5);
}

#[test]
fn image_loader_rejects_malformed_input() {
    use crate::error::LoadError;
    let mut vm = Vm::new();

    assert!(matches!(
        crate::bytecode::load_image(&mut vm, b"NOPE0000"),
        Err(LoadError::BadMagic)
    ));

    let mut wrong_version = image_bytes(&[(2, 3, vec![], vec![], vec![], vec![])]);
    wrong_version[4] = 0xff;
    assert!(matches!(
        crate::bytecode::load_image(&mut vm, &wrong_version),
        Err(LoadError::Version { .. })
    ));

    let good = image_bytes(&[(
        2,
        3,
        vec![op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0)],
        vec![],
        vec![],
        vec![],
    )]);
    assert!(matches!(
        crate::bytecode::load_image(&mut vm, &good[..good.len() - 2]),
        Err(LoadError::Truncated { .. })
    ));

    let bad_op = image_bytes(&[(2, 3, vec![0x7f], vec![], vec![], vec![])]);
    assert!(matches!(
        crate::bytecode::load_image(&mut vm, &bad_op),
        Err(LoadError::BadOpcode { .. })
    ));
}

#[test]
fn stop_halts_with_toplevel_result() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        2,
        4,
        vec![
            op_asbx(OpCode::LoadI, 2, 8),
            op_abc(OpCode::Stop, 0, 0, 0),
            op_asbx(OpCode::LoadI, 2, 0),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    // STOP leaves with the result local; the code after it never runs
    assert_eq!(int(&run_top(&mut vm, ir)), 8);
    assert_clean(&vm);
}

#[test]
fn module_qualified_constants() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        4,
        6,
        vec![
            op_abc(OpCode::LoadNil, 1, 0, 0),
            op_abc(OpCode::LoadNil, 2, 0, 0),
            op_abc(OpCode::Class, 1, 0, 0),
            op_abc(OpCode::Move, 2, 1, 0),
            op_asbx(OpCode::LoadI, 1, 5),
            op_abx(OpCode::SetMCnst, 1, 1),
            op_abx(OpCode::GetConst, 3, 0),
            op_abx(OpCode::GetMCnst, 3, 1),
            op_abc(OpCode::Return, 3, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["Holder", "WIDTH"],
        vec![],
    );
    assert_eq!(int(&run_top(&mut vm, ir)), 5);
    assert!(vm.exception().is_none());
}

#[test]
fn class_variables_resolve_through_target_class() {
    let mut vm = Vm::new();
    let object = vm.object_class();
    let c_name = vm.intern("Counter");
    let c_cls = vm.define_class_under(&object, c_name, None).expect("Counter");
    let ir = make_irep(
        &mut vm,
        3,
        5,
        vec![
            op_ax(OpCode::Enter, aspec(1, 0, false, 0)),
            op_abx(OpCode::SetCv, 1, 0),
            op_abx(OpCode::GetCv, 2, 0),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
        ],
        vec![],
        &["@@count"],
        vec![],
    );
    let m_sym = vm.intern("store");
    let mut p = RProc::from_irep(ir, Some(Rc::clone(&c_cls)));
    p.strict = true;
    vm.define_method(&c_cls, m_sym, Rc::new(p));
    let obj = vm.obj_new(&c_cls);
    let v = vm.funcall(obj, "store", &[Value::Int(6)]);
    assert_eq!(int(&v), 6);
    assert!(vm.exception().is_none());
}

#[test]
fn special_variables_roundtrip() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        3,
        4,
        vec![
            op_asbx(OpCode::LoadI, 1, 4),
            op_abx(OpCode::SetSpecial, 1, 1),
            op_abx(OpCode::GetSpecial, 2, 1),
            op_abc(OpCode::Return, 2, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    assert_eq!(int(&run_top(&mut vm, ir)), 4);
}

#[test]
fn debug_opcode_reports_through_trace_sink() {
    use std::cell::RefCell;

    let mut vm = Vm::new();
    let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    vm.set_trace(Box::new(move |msg| sink.borrow_mut().push(msg.to_string())));
    let ir = make_irep(
        &mut vm,
        2,
        3,
        vec![
            op_abc(OpCode::Debug, 1, 2, 3),
            op_asbx(OpCode::LoadI, 1, 0),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    run_top(&mut vm, ir);
    let lines = seen.borrow();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0], "DEBUG 1 2 3");
}

#[test]
fn reserved_opcodes_are_inert() {
    let mut vm = Vm::new();
    let ir = make_irep(
        &mut vm,
        2,
        3,
        vec![
            op_abc(OpCode::FSend, 0, 0, 0),
            op_abc(OpCode::VSend, 0, 0, 0),
            op_abc(OpCode::KArg, 0, 0, 0),
            op_abc(OpCode::KDict, 0, 0, 0),
            op_asbx(OpCode::LoadI, 1, 1),
            op_abc(OpCode::Return, 1, RET_NORMAL as u32, 0),
        ],
        vec![],
        &[],
        vec![],
    );
    assert_eq!(int(&run_top(&mut vm, ir)), 1);
}
