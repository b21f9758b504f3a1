//! # Arithmetic and Comparison Fast Paths
//!
//! Handlers for ADD/SUB/MUL/DIV, their immediate forms, and the comparison
//! opcodes. Each inspects the operand type pair and takes an inline path
//! for int×int, int×float, float×int and float×float (ADD additionally
//! inlines string concatenation). Any other pairing is not an error: the
//! opcode degenerates into an ordinary method send on the first operand,
//! carrying the operator symbol from the instruction's B field.
//!
//! Integer arithmetic wraps with host `i64` semantics; integer division
//! and the division fast path raise ZeroDivisionError on a zero divisor,
//! while float division follows IEEE.

use crate::bytecode::Insn;
use crate::error::{ExcKind, Raised};
use crate::value::Value;
use crate::vm::Vm;

use super::ops_call;

/// Fall through to a regular SEND using the operator symbol in B with
/// `argc` arguments.
fn send_op(vm: &mut Vm, insn: Insn, argc: usize) -> Result<(), Raised> {
    ops_call::op_send(vm, insn.a(), insn.b(), argc, false)
}

pub(crate) fn op_add(vm: &mut Vm, insn: Insn) -> Result<(), Raised> {
    let a = insn.a();
    let x = vm.rget(a);
    let y = vm.rget(a + 1);
    let r = match (&x, &y) {
        (Value::Int(i), Value::Int(j)) => Value::Int(i.wrapping_add(*j)),
        (Value::Int(i), Value::Float(f)) => Value::Float(*i as f64 + f),
        (Value::Float(f), Value::Int(i)) => Value::Float(f + *i as f64),
        (Value::Float(f), Value::Float(g)) => Value::Float(f + g),
        (Value::Str(s1), Value::Str(s2)) => {
            let mut out = s1.borrow().clone();
            out.push_str(&s2.borrow());
            Value::str(out)
        }
        _ => return send_op(vm, insn, insn.c()),
    };
    vm.rset(a, r);
    Ok(())
}

pub(crate) fn op_sub(vm: &mut Vm, insn: Insn) -> Result<(), Raised> {
    let a = insn.a();
    let x = vm.rget(a);
    let y = vm.rget(a + 1);
    let r = match (&x, &y) {
        (Value::Int(i), Value::Int(j)) => Value::Int(i.wrapping_sub(*j)),
        (Value::Int(i), Value::Float(f)) => Value::Float(*i as f64 - f),
        (Value::Float(f), Value::Int(i)) => Value::Float(f - *i as f64),
        (Value::Float(f), Value::Float(g)) => Value::Float(f - g),
        _ => return send_op(vm, insn, insn.c()),
    };
    vm.rset(a, r);
    Ok(())
}

pub(crate) fn op_mul(vm: &mut Vm, insn: Insn) -> Result<(), Raised> {
    let a = insn.a();
    let x = vm.rget(a);
    let y = vm.rget(a + 1);
    let r = match (&x, &y) {
        (Value::Int(i), Value::Int(j)) => Value::Int(i.wrapping_mul(*j)),
        (Value::Int(i), Value::Float(f)) => Value::Float(*i as f64 * f),
        (Value::Float(f), Value::Int(i)) => Value::Float(f * *i as f64),
        (Value::Float(f), Value::Float(g)) => Value::Float(f * g),
        _ => return send_op(vm, insn, insn.c()),
    };
    vm.rset(a, r);
    Ok(())
}

pub(crate) fn op_div(vm: &mut Vm, insn: Insn) -> Result<(), Raised> {
    let a = insn.a();
    let x = vm.rget(a);
    let y = vm.rget(a + 1);
    let r = match (&x, &y) {
        (Value::Int(i), Value::Int(j)) => {
            if *j == 0 {
                return Err(vm.raise(ExcKind::ZeroDivision, "divided by 0".to_string()));
            }
            Value::Int(i.wrapping_div(*j))
        }
        (Value::Int(i), Value::Float(f)) => Value::Float(*i as f64 / f),
        (Value::Float(f), Value::Int(i)) => Value::Float(f / *i as f64),
        (Value::Float(f), Value::Float(g)) => Value::Float(f / g),
        _ => return send_op(vm, insn, insn.c()),
    };
    vm.rset(a, r);
    Ok(())
}

/// ADDI: `R(A) += C` with the immediate taken from the C field. The send
/// fallback materialises the immediate into `R(A+1)` first.
pub(crate) fn op_addi(vm: &mut Vm, insn: Insn) -> Result<(), Raised> {
    let a = insn.a();
    let c = insn.c() as i64;
    match vm.rget(a) {
        Value::Int(i) => {
            vm.rset(a, Value::Int(i.wrapping_add(c)));
            Ok(())
        }
        Value::Float(f) => {
            vm.rset(a, Value::Float(f + c as f64));
            Ok(())
        }
        _ => {
            vm.rset(a + 1, Value::Int(c));
            ops_call::op_send(vm, a, insn.b(), 1, false)
        }
    }
}

pub(crate) fn op_subi(vm: &mut Vm, insn: Insn) -> Result<(), Raised> {
    let a = insn.a();
    let c = insn.c() as i64;
    match vm.rget(a) {
        Value::Int(i) => {
            vm.rset(a, Value::Int(i.wrapping_sub(c)));
            Ok(())
        }
        Value::Float(f) => {
            vm.rset(a, Value::Float(f - c as f64));
            Ok(())
        }
        _ => {
            vm.rset(a + 1, Value::Int(c));
            ops_call::op_send(vm, a, insn.b(), 1, false)
        }
    }
}

/// Mixed and float comparison pairings through f64. Exact int×int is
/// handled by each caller first: values past 2^53 collapse onto one f64,
/// so integers never take this path against each other. `None` requests
/// the send fallback.
fn num_pair(x: &Value, y: &Value) -> Option<(f64, f64)> {
    match (x, y) {
        (Value::Int(i), Value::Float(f)) => Some((*i as f64, *f)),
        (Value::Float(f), Value::Int(i)) => Some((*f, *i as f64)),
        (Value::Float(f), Value::Float(g)) => Some((*f, *g)),
        _ => None,
    }
}

pub(crate) fn op_eq(vm: &mut Vm, insn: Insn) -> Result<(), Raised> {
    let a = insn.a();
    let x = vm.rget(a);
    let y = vm.rget(a + 1);
    // int×int must stay exact; other numeric pairs go through f64
    let r = match (&x, &y) {
        (Value::Int(i), Value::Int(j)) => Some(i == j),
        (Value::Nil, Value::Nil) => Some(true),
        (Value::Bool(p), Value::Bool(q)) => Some(p == q),
        (Value::Sym(p), Value::Sym(q)) => Some(p == q),
        _ => num_pair(&x, &y).map(|(p, q)| p == q),
    };
    match r {
        Some(b) => {
            vm.rset(a, Value::Bool(b));
            Ok(())
        }
        None => send_op(vm, insn, insn.c()),
    }
}

pub(crate) fn op_lt(vm: &mut Vm, insn: Insn) -> Result<(), Raised> {
    let a = insn.a();
    let x = vm.rget(a);
    let y = vm.rget(a + 1);
    let r = match (&x, &y) {
        (Value::Int(i), Value::Int(j)) => Some(i < j),
        _ => num_pair(&x, &y).map(|(p, q)| p < q),
    };
    match r {
        Some(b) => {
            vm.rset(a, Value::Bool(b));
            Ok(())
        }
        None => send_op(vm, insn, insn.c()),
    }
}

pub(crate) fn op_le(vm: &mut Vm, insn: Insn) -> Result<(), Raised> {
    let a = insn.a();
    let x = vm.rget(a);
    let y = vm.rget(a + 1);
    let r = match (&x, &y) {
        (Value::Int(i), Value::Int(j)) => Some(i <= j),
        _ => num_pair(&x, &y).map(|(p, q)| p <= q),
    };
    match r {
        Some(b) => {
            vm.rset(a, Value::Bool(b));
            Ok(())
        }
        None => send_op(vm, insn, insn.c()),
    }
}

pub(crate) fn op_gt(vm: &mut Vm, insn: Insn) -> Result<(), Raised> {
    let a = insn.a();
    let x = vm.rget(a);
    let y = vm.rget(a + 1);
    let r = match (&x, &y) {
        (Value::Int(i), Value::Int(j)) => Some(i > j),
        _ => num_pair(&x, &y).map(|(p, q)| p > q),
    };
    match r {
        Some(b) => {
            vm.rset(a, Value::Bool(b));
            Ok(())
        }
        None => send_op(vm, insn, insn.c()),
    }
}

pub(crate) fn op_ge(vm: &mut Vm, insn: Insn) -> Result<(), Raised> {
    let a = insn.a();
    let x = vm.rget(a);
    let y = vm.rget(a + 1);
    let r = match (&x, &y) {
        (Value::Int(i), Value::Int(j)) => Some(i >= j),
        _ => num_pair(&x, &y).map(|(p, q)| p >= q),
    };
    match r {
        Some(b) => {
            vm.rset(a, Value::Bool(b));
            Ok(())
        }
        None => send_op(vm, insn, insn.c()),
    }
}
