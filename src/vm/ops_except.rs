//! # Exceptions, Ensures and Return Modes
//!
//! The two-tier non-local control machinery: the rescue stack of saved
//! handler pcs, the ensure stack of exit procedures, the raise-unwind
//! loop, and RETURN with its three modes.
//!
//! Frame watermarks drive everything. A frame holds a live handler
//! exactly when the rescue stack has grown past the frame's entry
//! watermark; unwinding pops handler-less frames (running their ensures,
//! promoting their environments) until a watermark shows a handler or the
//! invocation's entry frame is reached. Ensure procedures are invoked
//! through the ordinary interpreter re-entry path with the frame's own
//! `self`, and the pending exception is parked while they run.

use std::rc::Rc;

use crate::bytecode::{RET_BREAK, RET_RETURN};
use crate::error::{ExcKind, Raised};
use crate::procs::RProc;
use crate::value::Value;
use crate::vm::{Vm, ACC_HOST};

/// Outcome of the raise-unwind loop.
pub(crate) enum Unwound {
    /// A handler took over; the working pointers are rebound and the
    /// dispatch loop continues.
    Resumed,
    /// No handler inside this invocation; the exception slot stays set.
    Fatal,
}

/// Walk frames toward `entry` until a rescue watermark shows a live
/// handler. Each popped frame runs its registered ensures first.
pub(crate) fn raise_unwind(vm: &mut Vm, entry: usize) -> Unwound {
    loop {
        let top = vm.frames.len() - 1;
        if vm.rescues.len() > vm.frames[top].ridx {
            let Some(pc) = vm.rescues.pop() else {
                return Unwound::Fatal;
            };
            vm.pc = pc;
            if let Some(ir) = vm.frames[top].proc.as_ref().and_then(|p| p.irep().cloned()) {
                vm.cur_irep = ir;
            }
            return Unwound::Resumed;
        }
        let eidx = vm.frames[top].eidx;
        while vm.ensures.len() > eidx {
            // an ensure that raises replaces the pending exception
            let _ = ecall_top(vm);
        }
        vm.cipop();
        if top == entry {
            return Unwound::Fatal;
        }
    }
}

/// Pop and invoke the top ensure procedure with the current frame's
/// `self`. The pending exception is parked across the body and restored
/// unless the body raised one of its own.
pub(crate) fn ecall_top(vm: &mut Vm) -> Result<(), Raised> {
    let Some(p) = vm.ensures.pop() else {
        return Ok(());
    };
    let self_v = vm.rget(0);
    let mid = vm.ci().mid;
    let saved = vm.exc.take();
    let t = p.target_class();
    vm.call_entry(&p, self_v, &[], None, mid, t);
    if vm.exc.is_none() {
        vm.exc = saved;
        Ok(())
    } else {
        Err(Raised)
    }
}

/// EPUSH Bx: closure over a child irep, registered on the ensure stack.
pub(crate) fn op_epush(vm: &mut Vm, bx: usize) -> Result<(), Raised> {
    let ir = vm.irep_child(bx)?;
    let t = vm.ci().target_class.clone();
    let mut p = RProc::from_irep(ir, t);
    p.env = Some(vm.frame_env());
    vm.ensures.push(Rc::new(p));
    Ok(())
}

/// EPOP A: pop and invoke A ensure procedures, most recent first, never
/// reaching below the current frame's watermark.
pub(crate) fn op_epop(vm: &mut Vm, a: usize) -> Result<(), Raised> {
    let floor = vm.ci().eidx;
    for _ in 0..a {
        if vm.ensures.len() <= floor {
            break;
        }
        ecall_top(vm)?;
    }
    Ok(())
}

/// ERR A Bx: raise the pool string at Bx as a RuntimeError (or a
/// LocalJumpError when A is non-zero).
pub(crate) fn op_err(vm: &mut Vm, a: usize, bx: usize) -> Result<(), Raised> {
    let msg = vm.ipool(bx)?;
    let text = msg.display(vm.symbols());
    let kind = if a == 0 {
        ExcKind::Runtime
    } else {
        ExcKind::LocalJump
    };
    Err(vm.raise(kind, text))
}

/// RETURN A B. Normal mode pops one frame; break unwinds to the frame
/// above the block's home; return unwinds to the home itself. A dead home
/// scope (detached environment) raises LocalJumpError. Ensures registered
/// above the target's entry watermark run between the unwind and the
/// caller's resumption.
///
/// `Ok(Some(v))` means the invocation's entry frame returned and the
/// dispatch loop must hand `v` to the host.
pub(crate) fn do_return(
    vm: &mut Vm,
    v: Value,
    mode: usize,
    entry: usize,
) -> Result<Option<Value>, Raised> {
    let cur = vm.frames.len() - 1;
    let cur_proc = vm.ci().proc.clone();
    let target = match mode {
        RET_BREAK => {
            let env = cur_proc.as_ref().and_then(|p| p.env.clone());
            match env.and_then(|e| e.cioff()) {
                Some(cioff) => cioff + 1,
                None => {
                    return Err(vm.raise(
                        ExcKind::LocalJump,
                        "break from proc-closure".to_string(),
                    ))
                }
            }
        }
        RET_RETURN => match cur_proc.as_ref() {
            // strict procedures (lambdas) return from themselves; only a
            // block's `return` unwinds to the method the block chain was
            // born in, found at the outermost environment of the chain
            Some(p) if !p.strict && p.env.is_some() => {
                let mut top = match &p.env {
                    Some(e) => Rc::clone(e),
                    None => return Err(vm.raise(ExcKind::LocalJump, "unexpected return".to_string())),
                };
                while let Some(parent) = top.parent.clone() {
                    top = parent;
                }
                match top.cioff() {
                    Some(cioff) => cioff,
                    None => {
                        return Err(
                            vm.raise(ExcKind::LocalJump, "unexpected return".to_string())
                        )
                    }
                }
            }
            _ => cur,
        },
        _ => cur,
    };
    if target > cur || target < entry || target == 0 {
        return Err(vm.raise(ExcKind::LocalJump, "unexpected return".to_string()));
    }
    // frames between the leaving one and the target are discarded; cipop
    // promotes their environments and restores rescue watermarks
    while vm.frames.len() - 1 > target {
        vm.cipop();
    }
    let eidx = vm.frames[target].eidx;
    while vm.ensures.len() > eidx {
        ecall_top(vm)?;
    }
    let ci = vm.cipop();
    if ci.acc == ACC_HOST {
        return Ok(Some(v));
    }
    vm.pc = ci.pc;
    if let Some(ir) = vm.ci().proc.as_ref().and_then(|p| p.irep().cloned()) {
        vm.cur_irep = ir;
    }
    vm.rset(ci.acc as usize, v);
    Ok(None)
}

/// STOP: run every ensure this invocation registered, innermost first,
/// then leave the interpreter with the toplevel result (nil when an
/// exception is pending).
pub(crate) fn op_stop(vm: &mut Vm, entry: usize) -> Value {
    while vm.frames.len() - 1 > entry {
        let eidx = vm.frames[vm.frames.len() - 1].eidx;
        while vm.ensures.len() > eidx {
            let _ = ecall_top(vm);
        }
        vm.cipop();
    }
    let eidx = vm.frames[entry].eidx;
    while vm.ensures.len() > eidx {
        let _ = ecall_top(vm);
    }
    let v = if vm.exc.is_some() {
        Value::Nil
    } else {
        let nlocals = vm.frames[entry]
            .proc
            .as_ref()
            .and_then(|p| p.irep())
            .map(|ir| ir.nlocals)
            .unwrap_or(0);
        vm.stack
            .get(vm.frames[entry].stackidx + nlocals)
            .cloned()
            .unwrap_or(Value::Nil)
    };
    vm.cipop();
    v
}
