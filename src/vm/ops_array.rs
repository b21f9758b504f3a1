//! # Aggregate Construction Opcodes
//!
//! Handlers for the array, string, hash and range opcodes. Aggregates are
//! `Rc<RefCell<_>>` cells, so concatenation and pushes mutate in place and
//! preserve the identity other registers may share.
//!
//! Error conventions: wrong base types raise TypeError; reads past the end
//! of an array yield nil and writes grow the array, as the source-language
//! semantics dictate.

use std::rc::Rc;

use crate::error::{ExcKind, Raised};
use crate::value::{RRange, Value};
use crate::vm::Vm;

/// ARRAY A B C: `R(A) = [R(B), ..., R(B+C-1)]`.
pub(crate) fn op_array(vm: &mut Vm, a: usize, b: usize, c: usize) -> Result<(), Raised> {
    let base = vm.base();
    let mut elems = Vec::with_capacity(c);
    for i in 0..c {
        elems.push(vm.stack.get(base + b + i).cloned().unwrap_or(Value::Nil));
    }
    vm.rset(a, Value::array(elems));
    Ok(())
}

/// ARYCAT A B: append the splat of `R(B)` onto the array in `R(A)`.
pub(crate) fn op_arycat(vm: &mut Vm, a: usize, b: usize) -> Result<(), Raised> {
    let addend = vm.rget(b);
    let items = match &addend {
        Value::Array(x) => x.borrow().clone(),
        v => vec![v.clone()],
    };
    let target = vm.rget(a);
    match target {
        Value::Array(t) => {
            t.borrow_mut().extend(items);
            vm.write_barrier(&Value::Array(t));
            Ok(())
        }
        Value::Nil => {
            vm.rset(a, Value::array(items));
            Ok(())
        }
        other => {
            let msg = format!("cannot concatenate onto {}", other.type_name());
            Err(vm.raise(ExcKind::Type, msg))
        }
    }
}

/// ARYPUSH A B: `R(A) << R(B)`.
pub(crate) fn op_arypush(vm: &mut Vm, a: usize, b: usize) -> Result<(), Raised> {
    let v = vm.rget(b);
    let target = vm.rget(a);
    match target {
        Value::Array(t) => {
            t.borrow_mut().push(v);
            vm.write_barrier(&Value::Array(t));
            Ok(())
        }
        other => {
            let msg = format!("cannot push onto {}", other.type_name());
            Err(vm.raise(ExcKind::Type, msg))
        }
    }
}

/// AREF A B C: `R(A) = R(B)[C]`. A non-array base destructures as a
/// one-element sequence.
pub(crate) fn op_aref(vm: &mut Vm, a: usize, b: usize, c: usize) -> Result<(), Raised> {
    let v = vm.rget(b);
    match v {
        Value::Array(ar) => {
            let item = ar.borrow().get(c).cloned().unwrap_or(Value::Nil);
            vm.rset(a, item);
        }
        other => {
            if c == 0 {
                vm.rset(a, other);
            } else {
                vm.rset(a, Value::Nil);
            }
        }
    }
    Ok(())
}

/// ASET A B C: `R(B)[C] = R(A)`, growing the array with nils if needed.
pub(crate) fn op_aset(vm: &mut Vm, a: usize, b: usize, c: usize) -> Result<(), Raised> {
    let v = vm.rget(a);
    let target = vm.rget(b);
    match target {
        Value::Array(ar) => {
            {
                let mut items = ar.borrow_mut();
                if c >= items.len() {
                    items.resize(c + 1, Value::Nil);
                }
                items[c] = v;
            }
            vm.write_barrier(&Value::Array(ar));
            Ok(())
        }
        other => {
            let msg = format!("cannot index-assign {}", other.type_name());
            Err(vm.raise(ExcKind::Type, msg))
        }
    }
}

/// APOST A B C: destructure `R(A)` with B leading elements already taken,
/// writing the rest array and then C trailing elements into consecutive
/// registers starting at A.
pub(crate) fn op_apost(vm: &mut Vm, a: usize, pre: usize, post: usize) -> Result<(), Raised> {
    let v = vm.rget(a);
    match v {
        Value::Array(ar) => {
            let items = ar.borrow().clone();
            let len = items.len();
            if len > pre + post {
                vm.rset(a, Value::array(items[pre..len - post].to_vec()));
                for i in 0..post {
                    vm.rset(a + 1 + i, items[len - post + i].clone());
                }
            } else {
                vm.rset(a, Value::array(Vec::new()));
                for i in 0..post {
                    vm.rset(
                        a + 1 + i,
                        items.get(pre + i).cloned().unwrap_or(Value::Nil),
                    );
                }
            }
        }
        _ => {
            vm.rset(a, Value::array(Vec::new()));
            for i in 0..post {
                vm.rset(a + 1 + i, Value::Nil);
            }
        }
    }
    Ok(())
}

/// STRING A Bx: fresh copy of the pool string.
pub(crate) fn op_string(vm: &mut Vm, a: usize, bx: usize) -> Result<(), Raised> {
    let v = vm.ipool(bx)?;
    let text = match &v {
        Value::Str(s) => s.borrow().clone(),
        other => other.display(vm.symbols()),
    };
    vm.rset(a, Value::str(text));
    Ok(())
}

/// STRCAT A B: append `R(B)` (stringified if needed) onto the string in
/// `R(A)` in place.
pub(crate) fn op_strcat(vm: &mut Vm, a: usize, b: usize) -> Result<(), Raised> {
    let src = vm.rget(b);
    let text = match &src {
        Value::Str(s) => s.borrow().clone(),
        other => other.display(vm.symbols()),
    };
    let dst = vm.rget(a);
    match dst {
        Value::Str(d) => {
            d.borrow_mut().push_str(&text);
            Ok(())
        }
        other => {
            let msg = format!("cannot concatenate string onto {}", other.type_name());
            Err(vm.raise(ExcKind::Type, msg))
        }
    }
}

/// HASH A B C: build from 2C consecutive registers at B as key/value
/// pairs.
pub(crate) fn op_hash(vm: &mut Vm, a: usize, b: usize, c: usize) -> Result<(), Raised> {
    let base = vm.base();
    let mut pairs = Vec::with_capacity(c);
    for i in 0..c {
        let k = vm.stack.get(base + b + 2 * i).cloned().unwrap_or(Value::Nil);
        let v = vm
            .stack
            .get(base + b + 2 * i + 1)
            .cloned()
            .unwrap_or(Value::Nil);
        pairs.push((k, v));
    }
    vm.rset(a, Value::hash(pairs));
    Ok(())
}

/// RANGE A B C: `R(A) = R(B)..R(B+1)`, exclusive when C is set.
pub(crate) fn op_range(vm: &mut Vm, a: usize, b: usize, c: usize) -> Result<(), Raised> {
    let beg = vm.rget(b);
    let end = vm.rget(b + 1);
    vm.rset(
        a,
        Value::Range(Rc::new(RRange {
            beg,
            end,
            excl: c != 0,
        })),
    );
    Ok(())
}
