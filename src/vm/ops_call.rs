//! # Call Protocol
//!
//! SEND/SENDB/SUPER/TAILCALL/CALL/EXEC, callee-side argument
//! reconciliation (ENTER), the enclosing-scope argument accessors
//! (ARGARY/BLKPUSH), procedure creation (LAMBDA) and the class-definition
//! opcodes.
//!
//! The calling convention: the callee's register window starts at the
//! caller's `A` register, so slot 0 of the callee is the receiver, slots
//! `1..=argc` are the arguments and slot `argc+1` is the block. When the
//! argument count reaches the inline maximum the caller packs everything
//! into one array in slot 1 (block in slot 2) and the frame records
//! `argc = -1`.
//!
//! Method resolution failure rewrites the call to `method_missing` with
//! the original name prepended to the arguments (unshifted into the packed
//! array when packed). Bootstrap guarantees `Object#method_missing`
//! exists, so the rewrite terminates.

use std::rc::Rc;

use crate::bytecode::{
    aspec_fields, scope_fields, Insn, CALL_MAXARGS, PROC_CAPTURE, PROC_STRICT, RET_NORMAL,
};
use crate::class::ClassRef;
use crate::error::{ExcKind, Raised};
use crate::procs::{ProcBody, RProc};
use crate::value::{Sym, Value};
use crate::vm::{CallInfo, Vm};

use super::ops_except;

/// Copy the callee's arguments out of its window (unpacking the packed
/// array form) for a native invocation.
fn collect_args(vm: &Vm, base: usize, argc: i32) -> Vec<Value> {
    if argc < 0 {
        match vm.stack.get(base + 1) {
            Some(Value::Array(a)) => a.borrow().clone(),
            _ => Vec::new(),
        }
    } else {
        let n = argc as usize;
        let end = (base + 1 + n).min(vm.stack.len());
        vm.stack[base + 1..end].to_vec()
    }
}

/// Resolve `mid` on `start`, falling back to the `method_missing` rewrite.
/// On rewrite the arguments at `R(a+1)..` are shifted right one slot (or
/// the packed array is unshifted) and `n` grows accordingly.
fn resolve_for_call(
    vm: &mut Vm,
    start: &ClassRef,
    mid: Sym,
    recv: &Value,
    a: usize,
    n: &mut usize,
) -> Result<(Rc<RProc>, ClassRef, Sym), Raised> {
    if let Some((m, defclass)) = vm.method_search(start, mid) {
        return Ok((m, defclass, mid));
    }
    let missing = vm.intern("method_missing");
    if mid != missing {
        if let Some((m, defclass)) = vm.method_search(start, missing) {
            let symv = Value::Sym(mid);
            if *n == CALL_MAXARGS {
                if let Value::Array(ary) = vm.rget(a + 1) {
                    ary.borrow_mut().insert(0, symv);
                }
            } else {
                // shift args and block right, prepend the original name
                vm.stack_extend(a + *n + 3, a + *n + 2);
                for i in (0..=*n).rev() {
                    let v = vm.rget(a + 1 + i);
                    vm.rset(a + 2 + i, v);
                }
                vm.rset(a + 1, symv);
                *n += 1;
            }
            return Ok((m, defclass, missing));
        }
    }
    let name = vm.sym_name(mid).to_string();
    let recv_s = recv.inspect(vm.symbols());
    Err(vm.raise(
        ExcKind::NoMethod,
        format!("undefined method '{}' for {}", name, recv_s),
    ))
}

/// SEND/SENDB A B C. Plain SEND guarantees the callee sees a nil block
/// slot; SENDB passes `R(A+C+1)` through.
pub(crate) fn op_send(
    vm: &mut Vm,
    a: usize,
    b: usize,
    n: usize,
    with_block: bool,
) -> Result<(), Raised> {
    let mid = vm.isym(b)?;
    let recv = vm.rget(a);
    let start = vm.class_of(&recv);
    if !with_block {
        let blk_at = if n == CALL_MAXARGS { a + 2 } else { a + n + 1 };
        vm.stack_extend(blk_at + 1, blk_at);
    }
    send_to(vm, a, mid, n, recv, start)
}

/// SUPER A C: lookup restarts above the defining class, reusing the
/// current frame's method name and receiver.
pub(crate) fn op_super(vm: &mut Vm, a: usize, n: usize) -> Result<(), Raised> {
    let mid = match vm.ci().mid {
        Some(m) => m,
        None => {
            return Err(vm.raise(
                ExcKind::Runtime,
                "super called outside of method".to_string(),
            ))
        }
    };
    let start = match vm
        .ci()
        .target_class
        .clone()
        .and_then(|c| c.borrow().sup.clone())
    {
        Some(c) => c,
        None => {
            let name = vm.sym_name(mid).to_string();
            return Err(vm.raise(
                ExcKind::NoMethod,
                format!("super: no superclass method '{}'", name),
            ));
        }
    };
    let recv = vm.rget(0);
    vm.rset(a, recv.clone());
    send_to(vm, a, mid, n, recv, start)
}

/// Shared tail of SEND/SENDB/SUPER: resolve, push the callee frame with
/// its window based at the caller's `A`, then either run the native or
/// rebind the working pointers to the bytecode callee.
fn send_to(
    vm: &mut Vm,
    a: usize,
    mid: Sym,
    mut n: usize,
    recv: Value,
    start: ClassRef,
) -> Result<(), Raised> {
    let (m, defclass, mid) = resolve_for_call(vm, &start, mid, &recv, a, &mut n)?;
    let base = vm.base();
    let argc: i32 = if n == CALL_MAXARGS { -1 } else { n as i32 };
    let used = if argc < 0 { 3 } else { n + 2 };
    let nregs = match m.irep() {
        Some(ir) => ir.nregs.max(used),
        None => used,
    };
    let tclass = m.target_class().unwrap_or(defclass);
    vm.frames.push(CallInfo {
        mid: Some(mid),
        proc: Some(Rc::clone(&m)),
        target_class: Some(tclass),
        stackidx: base + a,
        nregs,
        argc,
        acc: a as i32,
        pc: vm.pc,
        ridx: vm.rescues.len(),
        eidx: vm.ensures.len(),
        env: None,
    });
    match &m.body {
        ProcBody::Native(f) => {
            let f = *f;
            let args = collect_args(vm, base + a, argc);
            match f(vm, recv, &args) {
                // leave the frame for the unwinder so its watermarks hold
                Err(e) => Err(e),
                Ok(v) => {
                    if vm.exc.is_some() {
                        return Err(Raised);
                    }
                    vm.stack[base + a] = v;
                    vm.cipop();
                    Ok(())
                }
            }
        }
        ProcBody::Irep(ir) => {
            let ir = Rc::clone(ir);
            vm.cur_irep = ir;
            vm.pc = 0;
            vm.stack_extend(nregs, used);
            Ok(())
        }
    }
}

/// TAILCALL A B C: resolve like SEND but replace the current frame,
/// copying receiver, arguments and block down to the frame base. A native
/// callee flows directly into the return path.
pub(crate) fn op_tailcall(
    vm: &mut Vm,
    a: usize,
    b: usize,
    n: usize,
    entry: usize,
) -> Result<Option<Value>, Raised> {
    let mid = vm.isym(b)?;
    let recv = vm.rget(a);
    let start = vm.class_of(&recv);
    let mut n = n;
    let (m, defclass, mid) = resolve_for_call(vm, &start, mid, &recv, a, &mut n)?;
    let base = vm.base();
    let argc: i32 = if n == CALL_MAXARGS { -1 } else { n as i32 };
    let moved = if argc < 0 { 3 } else { n + 2 };
    for i in 0..moved {
        let v = vm.stack.get(base + a + i).cloned().unwrap_or(Value::Nil);
        vm.stack[base + i] = v;
    }
    let tclass = m.target_class().unwrap_or(defclass);
    {
        let ci = vm.ci_mut();
        ci.mid = Some(mid);
        ci.proc = Some(Rc::clone(&m));
        ci.target_class = Some(tclass);
        ci.argc = argc;
    }
    match &m.body {
        ProcBody::Irep(ir) => {
            let ir = Rc::clone(ir);
            let nregs = ir.nregs.max(moved);
            vm.ci_mut().nregs = nregs;
            vm.cur_irep = ir;
            vm.pc = 0;
            vm.stack_extend(nregs, moved);
            Ok(None)
        }
        ProcBody::Native(f) => {
            let f = *f;
            let args = collect_args(vm, base, argc);
            let v = f(vm, recv, &args)?;
            if vm.exc.is_some() {
                return Err(Raised);
            }
            vm.stack[base] = v.clone();
            ops_except::do_return(vm, v, RET_NORMAL, entry)
        }
    }
}

/// CALL: bare procedure re-entry (`proc.call`). The frame pushed for the
/// `call` send is rebound in place to the procedure held in slot 0; when
/// the procedure carries an environment, its slot 0 becomes the receiver
/// and its method name is re-adopted.
pub(crate) fn op_call(vm: &mut Vm, entry: usize) -> Result<Option<Value>, Raised> {
    let recv = vm.rget(0);
    let m = match &recv {
        Value::Proc(p) => Rc::clone(p),
        other => {
            let msg = format!("{} is not a proc", other.type_name());
            return Err(vm.raise(ExcKind::Type, msg));
        }
    };
    if let Some(e) = &m.env {
        if e.mid.is_some() {
            vm.ci_mut().mid = e.mid;
        }
        let self0 = vm.env_get(e, 0);
        vm.rset(0, self0);
    }
    {
        let ci = vm.ci_mut();
        ci.proc = Some(Rc::clone(&m));
        ci.target_class = m.target_class();
    }
    match &m.body {
        ProcBody::Irep(ir) => {
            let ir = Rc::clone(ir);
            let argc = vm.ci().argc;
            let keep = if argc < 0 { 3 } else { argc as usize + 2 };
            let nregs = ir.nregs.max(keep);
            vm.ci_mut().nregs = nregs;
            vm.cur_irep = ir;
            vm.pc = 0;
            vm.stack_extend(nregs, keep);
            Ok(None)
        }
        ProcBody::Native(f) => {
            let f = *f;
            let base = vm.base();
            let argc = vm.ci().argc;
            let args = collect_args(vm, base, argc);
            let slf = vm.rget(0);
            let v = f(vm, slf, &args)?;
            if vm.exc.is_some() {
                return Err(Raised);
            }
            ops_except::do_return(vm, v, RET_NORMAL, entry)
        }
    }
}

/// EXEC A Bx: run a child irep with `R(A)` (a class or module) as both
/// `self` and the target class. Used for class and module bodies.
pub(crate) fn op_exec(vm: &mut Vm, a: usize, bx: usize) -> Result<(), Raised> {
    let recv = vm.rget(a);
    let class = match &recv {
        Value::Class(c) => Rc::clone(c),
        other => {
            let msg = format!("{} is not a class or module", other.type_name());
            return Err(vm.raise(ExcKind::Type, msg));
        }
    };
    let ir = vm.irep_child(bx)?;
    let p = Rc::new(RProc::from_irep(Rc::clone(&ir), Some(Rc::clone(&class))));
    let base = vm.base();
    let nregs = ir.nregs.max(1);
    vm.frames.push(CallInfo {
        mid: None,
        proc: Some(p),
        target_class: Some(class),
        stackidx: base + a,
        nregs,
        argc: 0,
        acc: a as i32,
        pc: vm.pc,
        ridx: vm.rescues.len(),
        eidx: vm.ensures.len(),
        env: None,
    });
    vm.cur_irep = ir;
    vm.pc = 0;
    vm.stack_extend(nregs, 1);
    Ok(())
}

/// ENTER Ax: reconcile the caller's actual argument shape with the
/// declared `m1/o/r/m2` descriptor, laying out the window as
/// `self, m1.., o.., rest, m2.., block` and skipping one default-init
/// table slot per satisfied optional.
pub(crate) fn op_enter(vm: &mut Vm, ax: u32) -> Result<(), Raised> {
    let (m1, o, r, m2) = aspec_fields(ax);
    let rslots = r as usize;
    let len = m1 + o + rslots + m2;
    let base = vm.base();
    let ci_argc = vm.ci().argc;
    let strict = vm.ci().proc.as_ref().map(|p| p.strict).unwrap_or(false);

    let mut packed: Option<Value> = None;
    let (mut argv, blk) = if ci_argc < 0 {
        let ary = vm.stack.get(base + 1).cloned().unwrap_or(Value::Nil);
        let blk = vm.stack.get(base + 2).cloned().unwrap_or(Value::Nil);
        let items = match &ary {
            Value::Array(a) => a.borrow().clone(),
            _ => Vec::new(),
        };
        vm.gc_protect(ary.clone());
        packed = Some(ary);
        (items, blk)
    } else {
        let n = ci_argc as usize;
        let end = (base + 1 + n).min(vm.stack.len());
        let argv = vm.stack[base + 1..end].to_vec();
        let blk = vm.stack.get(base + 1 + n).cloned().unwrap_or(Value::Nil);
        (argv, blk)
    };
    let mut argc = argv.len();

    if strict {
        if argc < m1 + m2 || (!r && argc > len) {
            let msg = format!("wrong number of arguments ({} for {})", argc, m1 + m2);
            return Err(vm.raise(ExcKind::Argument, msg));
        }
    } else if len > 1 && argc == 1 {
        // a lone array auto-splats into a multi-parameter block
        if let Value::Array(a) = &argv[0] {
            let items = a.borrow().clone();
            vm.gc_protect(argv[0].clone());
            argv = items;
            argc = argv.len();
        }
    }

    vm.ci_mut().argc = len as i32;
    let room = vm.ci().nregs.max(len + 3);
    vm.ci_mut().nregs = room;
    vm.stack_extend(room, room);
    for i in 1..=len + 2 {
        vm.rset(i, Value::Nil);
    }

    if argc < len {
        let mlen = if argc < m1 + m2 {
            if m1 < argc {
                argc - m1
            } else {
                0
            }
        } else {
            m2
        };
        let front = argc - mlen;
        for (i, v) in argv.iter().take(front).enumerate() {
            vm.rset(1 + i, v.clone());
        }
        for i in 0..mlen {
            vm.rset(len - m2 + 1 + i, argv[front + i].clone());
        }
        if r {
            vm.rset(m1 + o + 1, Value::array(Vec::new()));
        }
        vm.rset(len + 1, blk);
        if let Some(p) = packed {
            vm.rset(len + 2, p);
        }
        // skip the default-init table slots already satisfied
        if o > 0 && argc >= m1 + m2 {
            vm.pc += argc - m1 - m2;
        }
    } else {
        for (i, v) in argv.iter().take(m1 + o).enumerate() {
            vm.rset(1 + i, v.clone());
        }
        let rnum = if r { argc - m1 - o - m2 } else { 0 };
        if r {
            vm.rset(
                m1 + o + 1,
                Value::array(argv[m1 + o..m1 + o + rnum].to_vec()),
            );
        }
        for i in 0..m2 {
            vm.rset(m1 + o + rslots + 1 + i, argv[m1 + o + rnum + i].clone());
        }
        vm.rset(len + 1, blk);
        if let Some(p) = packed {
            vm.rset(len + 2, p);
        }
        vm.pc += o;
    }
    Ok(())
}

/// ARGARY A Bx: gather an argument array (and the block) from the scope
/// the descriptor names, reaching through the environment chain when
/// `lv > 0`.
pub(crate) fn op_argary(vm: &mut Vm, a: usize, bx: usize) -> Result<(), Raised> {
    let (m1, r, m2, lv) = scope_fields(bx);
    let rslots = r as usize;
    let total = m1 + rslots + m2 + 1;
    let slots = match scope_slots(vm, lv, total) {
        Some(s) => s,
        None => {
            return Err(vm.raise(ExcKind::LocalJump, "unexpected yield".to_string()));
        }
    };
    let ary = if !r {
        Value::array(slots[0..m1 + m2].to_vec())
    } else {
        let mut out = slots[0..m1].to_vec();
        if let Value::Array(mid) = &slots[m1] {
            out.extend(mid.borrow().iter().cloned());
        }
        out.extend(slots[m1 + 1..m1 + 1 + m2].iter().cloned());
        Value::array(out)
    };
    vm.rset(a, ary);
    vm.rset(a + 1, slots[m1 + rslots + m2].clone());
    Ok(())
}

/// BLKPUSH A Bx: fetch the block argument of the described scope.
pub(crate) fn op_blkpush(vm: &mut Vm, a: usize, bx: usize) -> Result<(), Raised> {
    let (m1, r, m2, lv) = scope_fields(bx);
    let idx = m1 + (r as usize) + m2;
    let slots = match scope_slots(vm, lv, idx + 1) {
        Some(s) => s,
        None => {
            return Err(vm.raise(ExcKind::LocalJump, "unexpected yield".to_string()));
        }
    };
    vm.rset(a, slots[idx].clone());
    Ok(())
}

/// Read `count` argument slots (register 1 upward) from the current frame
/// (`lv == 0`) or from the environment `lv - 1` levels up the chain.
fn scope_slots(vm: &Vm, lv: usize, count: usize) -> Option<Vec<Value>> {
    if lv == 0 {
        Some((0..count).map(|i| vm.rget(1 + i)).collect())
    } else {
        let e = vm.uvenv(lv - 1)?;
        Some((0..count).map(|i| vm.env_get(&e, 1 + i)).collect())
    }
}

/// LAMBDA A b c: procedure over child irep `b`; `c` selects strict arity
/// and environment capture.
pub(crate) fn op_lambda(vm: &mut Vm, insn: Insn) -> Result<(), Raised> {
    let a = insn.a();
    let ir = vm.irep_child(insn.bz())?;
    let flags = insn.cz();
    let mut p = RProc::from_irep(ir, vm.ci().target_class.clone());
    if flags & PROC_STRICT != 0 {
        p.strict = true;
    }
    if flags & PROC_CAPTURE != 0 {
        p.env = Some(vm.frame_env());
    }
    vm.rset(a, Value::Proc(Rc::new(p)));
    Ok(())
}

/// CLASS A B: define or reopen class `syms[B]` with base `R(A)` (nil means
/// the current target class) and superclass `R(A+1)`.
pub(crate) fn op_class(vm: &mut Vm, a: usize, b: usize) -> Result<(), Raised> {
    let name = vm.isym(b)?;
    let base_v = vm.rget(a);
    let sup_v = vm.rget(a + 1);
    let outer = match base_v {
        Value::Nil => match vm.ci().target_class.clone() {
            Some(c) => c,
            None => vm.object_class(),
        },
        Value::Class(c) => c,
        other => {
            let msg = format!("{} is not a class or module", other.type_name());
            return Err(vm.raise(ExcKind::Type, msg));
        }
    };
    let sup = match sup_v {
        Value::Nil => None,
        Value::Class(c) => Some(c),
        other => {
            let msg = format!("superclass must be a Class ({} given)", other.type_name());
            return Err(vm.raise(ExcKind::Type, msg));
        }
    };
    let class = vm.define_class_under(&outer, name, sup)?;
    vm.rset(a, Value::Class(class));
    Ok(())
}

/// MODULE A B: define or reopen module `syms[B]` under `R(A)`.
pub(crate) fn op_module(vm: &mut Vm, a: usize, b: usize) -> Result<(), Raised> {
    let name = vm.isym(b)?;
    let base_v = vm.rget(a);
    let outer = match base_v {
        Value::Nil => match vm.ci().target_class.clone() {
            Some(c) => c,
            None => vm.object_class(),
        },
        Value::Class(c) => c,
        other => {
            let msg = format!("{} is not a class or module", other.type_name());
            return Err(vm.raise(ExcKind::Type, msg));
        }
    };
    let module = vm.define_module_under(&outer, name)?;
    vm.rset(a, Value::Class(module));
    Ok(())
}

/// METHOD A B: install the procedure in `R(A+1)` as method `syms[B]` of
/// the class in `R(A)`.
pub(crate) fn op_method(vm: &mut Vm, a: usize, b: usize) -> Result<(), Raised> {
    let mid = vm.isym(b)?;
    let cls_v = vm.rget(a);
    let p_v = vm.rget(a + 1);
    let class = match cls_v {
        Value::Class(c) => c,
        other => {
            let msg = format!("{} is not a class or module", other.type_name());
            return Err(vm.raise(ExcKind::Type, msg));
        }
    };
    let p = match p_v {
        Value::Proc(p) => p,
        other => {
            let msg = format!("{} is not a proc", other.type_name());
            return Err(vm.raise(ExcKind::Type, msg));
        }
    };
    vm.define_method(&class, mid, p);
    Ok(())
}

/// SCLASS A B: singleton class of `R(B)`.
pub(crate) fn op_sclass(vm: &mut Vm, a: usize, b: usize) -> Result<(), Raised> {
    let v = vm.rget(b);
    let sc = vm.singleton_class(&v)?;
    vm.rset(a, Value::Class(sc));
    Ok(())
}

/// TCLASS A: the class the current method was defined in.
pub(crate) fn op_tclass(vm: &mut Vm, a: usize) -> Result<(), Raised> {
    match vm.ci().target_class.clone() {
        Some(c) => {
            vm.rset(a, Value::Class(c));
            Ok(())
        }
        None => Err(vm.raise(ExcKind::Type, "no target class".to_string())),
    }
}
