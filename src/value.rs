//! # Value Representation for the Carmine VM
//!
//! This module defines [`Value`], the universal runtime cell used in the
//! VM's register windows, environments, and data structures, plus the
//! per-state symbol table.
//!
//! ## Supported types
//! - `Nil` / `Bool(bool)` — nil and the two boolean singletons
//! - `Int(i64)` — fixed-width signed integer
//! - `Float(f64)` — IEEE double
//! - `Sym(Sym)` — interned name, a small integer id into the symbol table
//! - `Str(Rc<RefCell<String>>)` — mutable, reference-counted string
//! - `Array(Rc<RefCell<Vec<Value>>>)` — mutable, reference-counted array
//! - `Hash(Rc<RefCell<Vec<(Value, Value)>>>)` — insertion-ordered hash,
//!   keys compared with [`Value::value_eq`]
//! - `Range(Rc<RRange>)` — begin/end pair with an exclusive flag
//! - `Class(ClassRef)` — classes and modules
//! - `Proc(Rc<RProc>)` — bytecode or native procedure
//! - `Object(Rc<RefCell<RObject>>)` — plain instance with a class and ivars
//! - `Exception(Rc<RefCell<RException>>)` — exception instance
//!
//! ## Design
//! - Heap citizens sit behind `Rc<RefCell<_>>` so register moves are cheap
//!   pointer copies and aggregates stay shared across registers, the
//!   operand stack and captured environments.
//! - `nil` and `false` share the falsy discipline; every other value is
//!   truthy (see [`Value::truthy`]).
//! - Symbols are dense `u32` ids because irep symbol tables address them by
//!   index; the interner lives on the VM state, never in a global.
//! - Formatting needs the symbol table to print symbols and class names, so
//!   [`Value::display`] takes the table instead of implementing `Display`.
//!   Self-referencing aggregates print as `[...]` / `{...}` rather than
//!   recursing forever.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::class::{ClassRef, RClass};
use crate::procs::RProc;

/// Interned name id. Dense and small so irep symbol sections can address
/// names with a 16-bit operand.
pub type Sym = u32;

/// The per-state symbol interner.
///
/// Interning the same name twice yields the same id; names live as long as
/// the state does.
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: Vec<String>,
    ids: HashMap<String, Sym>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    /// Intern `name`, returning its stable id.
    pub fn intern(&mut self, name: &str) -> Sym {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as Sym;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    /// Resolve an id back to its name.
    pub fn name(&self, sym: Sym) -> &str {
        self.names
            .get(sym as usize)
            .map(String::as_str)
            .unwrap_or("?")
    }

    /// Number of interned names.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// An inclusive-or-exclusive range over two values.
#[derive(Debug, Clone)]
pub struct RRange {
    pub beg: Value,
    pub end: Value,
    pub excl: bool,
}

/// A generic instance: a class pointer plus instance variables.
#[derive(Debug)]
pub struct RObject {
    pub class: ClassRef,
    pub ivars: HashMap<Sym, Value>,
}

impl RObject {
    pub fn new(class: ClassRef) -> RObject {
        RObject {
            class,
            ivars: HashMap::new(),
        }
    }
}

/// An exception instance. Kept apart from [`RObject`] so the unwind
/// machinery can reach the message without a method send.
#[derive(Debug)]
pub struct RException {
    pub class: ClassRef,
    pub message: Value,
    pub ivars: HashMap<Sym, Value>,
}

/// Value cell for registers, environments and aggregates.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Sym(Sym),
    Str(Rc<RefCell<String>>),
    Array(Rc<RefCell<Vec<Value>>>),
    Hash(Rc<RefCell<Vec<(Value, Value)>>>),
    Range(Rc<RRange>),
    Class(ClassRef),
    Proc(Rc<RProc>),
    Object(Rc<RefCell<RObject>>),
    Exception(Rc<RefCell<RException>>),
}

impl Value {
    /// Build a string value from owned text.
    pub fn str(s: String) -> Value {
        Value::Str(Rc::new(RefCell::new(s)))
    }

    /// Build an array value from a vector of elements.
    pub fn array(elems: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(elems)))
    }

    /// Build a hash value from key/value pairs (later duplicates win).
    pub fn hash(pairs: Vec<(Value, Value)>) -> Value {
        let h = Rc::new(RefCell::new(Vec::new()));
        for (k, v) in pairs {
            hash_set(&h, k, v);
        }
        Value::Hash(h)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Truthiness: everything except `nil` and `false`.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Short tag name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(true) => "true",
            Value::Bool(false) => "false",
            Value::Int(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Sym(_) => "Symbol",
            Value::Str(_) => "String",
            Value::Array(_) => "Array",
            Value::Hash(_) => "Hash",
            Value::Range(_) => "Range",
            Value::Class(_) => "Class",
            Value::Proc(_) => "Proc",
            Value::Object(_) => "Object",
            Value::Exception(_) => "Exception",
        }
    }

    /// Structural equality as the core sees it: immediates by value (with
    /// int/float cross-comparison), strings by content, aggregates by
    /// identity of the shared cell.
    pub fn value_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Sym(a), Value::Sym(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Hash(a), Value::Hash(b)) => Rc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => {
                Rc::ptr_eq(a, b)
                    || (a.excl == b.excl
                        && a.beg.value_eq(&b.beg)
                        && a.end.value_eq(&b.end))
            }
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Proc(a), Value::Proc(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Human-readable rendering, `to_s` flavour.
    ///
    /// Cyclic aggregates are cut off by pointer identity so self-containing
    /// arrays print as `[...]` instead of recursing.
    pub fn display(&self, syms: &SymbolTable) -> String {
        let mut seen = HashSet::new();
        render(self, syms, &mut seen, false)
    }

    /// `inspect` flavour: strings quoted, nil spelled out.
    pub fn inspect(&self, syms: &SymbolTable) -> String {
        let mut seen = HashSet::new();
        render(self, syms, &mut seen, true)
    }
}

/// Look a key up in a hash cell.
pub fn hash_get(h: &Rc<RefCell<Vec<(Value, Value)>>>, key: &Value) -> Option<Value> {
    h.borrow()
        .iter()
        .find(|(k, _)| k.value_eq(key))
        .map(|(_, v)| v.clone())
}

/// Insert or update a key in a hash cell, preserving insertion order.
pub fn hash_set(h: &Rc<RefCell<Vec<(Value, Value)>>>, key: Value, val: Value) {
    let mut entries = h.borrow_mut();
    for (k, v) in entries.iter_mut() {
        if k.value_eq(&key) {
            *v = val;
            return;
        }
    }
    entries.push((key, val));
}

/// Format a float the way scripts expect: integral values keep a trailing
/// `.0` so `7.0` does not read as an integer.
pub fn format_float(f: f64) -> String {
    if f.is_finite() && f == f.trunc() && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

/// Canonical human-readable form of an exception: `ClassName: message`
/// (the bare class name when the message is empty). Shared by value
/// rendering and the host's uncaught-exception report so the two never
/// drift apart.
pub fn exception_text(e: &RException, syms: &SymbolTable) -> String {
    let mut seen = HashSet::new();
    exception_line(e, syms, &mut seen)
}

fn exception_line(e: &RException, syms: &SymbolTable, seen: &mut HashSet<usize>) -> String {
    let class = RClass::display_name(&e.class, syms);
    let msg = render(&e.message, syms, seen, false);
    if msg.is_empty() {
        class
    } else {
        format!("{}: {}", class, msg)
    }
}

fn render(v: &Value, syms: &SymbolTable, seen: &mut HashSet<usize>, inspect: bool) -> String {
    match v {
        Value::Nil => {
            if inspect {
                "nil".to_string()
            } else {
                String::new()
            }
        }
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format_float(*f),
        Value::Sym(s) => format!(":{}", syms.name(*s)),
        Value::Str(s) => {
            if inspect {
                format!("{:?}", s.borrow())
            } else {
                s.borrow().clone()
            }
        }
        Value::Array(a) => {
            let ptr = Rc::as_ptr(a) as usize;
            if !seen.insert(ptr) {
                return "[...]".to_string();
            }
            let inner: Vec<String> = a
                .borrow()
                .iter()
                .map(|e| render(e, syms, seen, true))
                .collect();
            seen.remove(&ptr);
            format!("[{}]", inner.join(", "))
        }
        Value::Hash(h) => {
            let ptr = Rc::as_ptr(h) as usize;
            if !seen.insert(ptr) {
                return "{...}".to_string();
            }
            let inner: Vec<String> = h
                .borrow()
                .iter()
                .map(|(k, val)| {
                    format!(
                        "{} => {}",
                        render(k, syms, seen, true),
                        render(val, syms, seen, true)
                    )
                })
                .collect();
            seen.remove(&ptr);
            format!("{{{}}}", inner.join(", "))
        }
        Value::Range(r) => {
            format!(
                "{}{}{}",
                render(&r.beg, syms, seen, true),
                if r.excl { "..." } else { ".." },
                render(&r.end, syms, seen, true)
            )
        }
        Value::Class(c) => RClass::display_name(c, syms),
        Value::Proc(_) => "#<Proc>".to_string(),
        Value::Object(o) => {
            format!("#<{}>", RClass::display_name(&o.borrow().class, syms))
        }
        Value::Exception(e) => exception_line(&e.borrow(), syms, seen),
    }
}
