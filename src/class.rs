//! # Classes, Modules and Method Resolution
//!
//! Host-side object model consumed by the interpreter core: class records,
//! the super-chain method search, singleton classes, and the constant /
//! class-variable / instance-variable stores.
//!
//! A class is an `Rc<RefCell<RClass>>` cell ([`ClassRef`]) so that method
//! tables can be reopened while procedures and instances keep pointing at
//! the same class identity. Lookups clone `Rc` handles while walking, never
//! holding a borrow across VM re-entry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{ExcKind, Raised};
use crate::procs::{NativeFn, RProc};
use crate::value::{RException, RObject, Sym, SymbolTable, Value};
use crate::vm::Vm;

/// Shared handle to a class or module record.
pub type ClassRef = Rc<RefCell<RClass>>;

/// A class or module: name, super link, method table and variable stores.
pub struct RClass {
    pub name: Sym,
    pub sup: Option<ClassRef>,
    pub mtable: HashMap<Sym, Rc<RProc>>,
    pub consts: HashMap<Sym, Value>,
    pub cvars: HashMap<Sym, Value>,
    pub ivars: HashMap<Sym, Value>,
    pub module: bool,
    pub singleton: bool,
    /// Cached metaclass for `Class` values.
    pub(crate) sclass: Option<ClassRef>,
}

impl RClass {
    pub fn new(name: Sym, sup: Option<ClassRef>, module: bool) -> ClassRef {
        Rc::new(RefCell::new(RClass {
            name,
            sup,
            mtable: HashMap::new(),
            consts: HashMap::new(),
            cvars: HashMap::new(),
            ivars: HashMap::new(),
            module,
            singleton: false,
            sclass: None,
        }))
    }

    /// Printable name; singleton classes render attached to their origin.
    pub fn display_name(class: &ClassRef, syms: &SymbolTable) -> String {
        let c = class.borrow();
        if c.singleton {
            format!("#<Class:{}>", syms.name(c.name))
        } else {
            syms.name(c.name).to_string()
        }
    }

    /// True when `class` has `ancestor` somewhere in its super chain
    /// (itself included).
    pub fn derives_from(class: &ClassRef, ancestor: &ClassRef) -> bool {
        let mut cur = Some(Rc::clone(class));
        while let Some(c) = cur {
            if Rc::ptr_eq(&c, ancestor) {
                return true;
            }
            cur = c.borrow().sup.clone();
        }
        false
    }
}

impl fmt::Debug for RClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Consts may point back at this class; keep Debug non-recursive.
        f.debug_struct("RClass")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("singleton", &self.singleton)
            .finish()
    }
}

impl Vm {
    /// Map a value to the class method resolution starts at.
    pub fn class_of(&self, v: &Value) -> ClassRef {
        match v {
            Value::Nil => Rc::clone(&self.core.nil),
            Value::Bool(true) => Rc::clone(&self.core.true_class),
            Value::Bool(false) => Rc::clone(&self.core.false_class),
            Value::Int(_) => Rc::clone(&self.core.integer),
            Value::Float(_) => Rc::clone(&self.core.float),
            Value::Sym(_) => Rc::clone(&self.core.symbol),
            Value::Str(_) => Rc::clone(&self.core.string),
            Value::Array(_) => Rc::clone(&self.core.array),
            Value::Hash(_) => Rc::clone(&self.core.hash),
            Value::Range(_) => Rc::clone(&self.core.range),
            Value::Proc(_) => Rc::clone(&self.core.proc_class),
            Value::Object(o) => Rc::clone(&o.borrow().class),
            Value::Exception(e) => Rc::clone(&e.borrow().class),
            Value::Class(c) => {
                let meta = c.borrow().sclass.clone();
                meta.unwrap_or_else(|| Rc::clone(&self.core.class))
            }
        }
    }

    /// Walk the super chain for `mid`. Returns the procedure together with
    /// the class that defines it (the defining class feeds `super` lookup
    /// when the procedure itself carries no target class).
    pub fn method_search(&self, start: &ClassRef, mid: Sym) -> Option<(Rc<RProc>, ClassRef)> {
        let mut cur = Some(Rc::clone(start));
        while let Some(c) = cur {
            if let Some(p) = c.borrow().mtable.get(&mid) {
                return Some((Rc::clone(p), Rc::clone(&c)));
            }
            cur = c.borrow().sup.clone();
        }
        None
    }

    /// Install `p` as method `mid` of `class`.
    pub fn define_method(&mut self, class: &ClassRef, mid: Sym, p: Rc<RProc>) {
        p.set_target_class(Some(Rc::clone(class)));
        class.borrow_mut().mtable.insert(mid, Rc::clone(&p));
        self.write_barrier(&Value::Class(Rc::clone(class)));
    }

    /// Install a host-native method under `name`.
    pub fn define_native(&mut self, class: &ClassRef, name: &str, f: NativeFn) {
        let mid = self.intern(name);
        let p = Rc::new(RProc::native(f));
        self.define_method(class, mid, p);
    }

    /// Singleton class of `v`, creating it on first request.
    ///
    /// Only objects, exceptions and classes can carry one; immediates raise
    /// TypeError as the original semantics dictate.
    pub fn singleton_class(&mut self, v: &Value) -> Result<ClassRef, Raised> {
        match v {
            Value::Object(o) => {
                let class = Rc::clone(&o.borrow().class);
                if class.borrow().singleton {
                    return Ok(class);
                }
                let name = class.borrow().name;
                let sc = RClass::new(name, Some(class), false);
                sc.borrow_mut().singleton = true;
                o.borrow_mut().class = Rc::clone(&sc);
                Ok(sc)
            }
            Value::Exception(e) => {
                let class = Rc::clone(&e.borrow().class);
                if class.borrow().singleton {
                    return Ok(class);
                }
                let name = class.borrow().name;
                let sc = RClass::new(name, Some(class), false);
                sc.borrow_mut().singleton = true;
                e.borrow_mut().class = Rc::clone(&sc);
                Ok(sc)
            }
            Value::Class(c) => {
                if let Some(meta) = c.borrow().sclass.clone() {
                    return Ok(meta);
                }
                let name = c.borrow().name;
                let meta = RClass::new(name, Some(Rc::clone(&self.core.class)), false);
                meta.borrow_mut().singleton = true;
                c.borrow_mut().sclass = Some(Rc::clone(&meta));
                Ok(meta)
            }
            other => {
                let msg = format!("can't define singleton for {}", other.type_name());
                Err(self.raise(ExcKind::Type, msg))
            }
        }
    }

    /// Constant lookup for GETCONST: the lexical target class chain first,
    /// then Object.
    pub fn const_lookup(&mut self, start: Option<ClassRef>, sym: Sym) -> Result<Value, Raised> {
        let mut cur = start;
        while let Some(c) = cur {
            if let Some(v) = c.borrow().consts.get(&sym) {
                return Ok(v.clone());
            }
            cur = c.borrow().sup.clone();
        }
        if let Some(v) = self.core.object.borrow().consts.get(&sym) {
            return Ok(v.clone());
        }
        let msg = format!("uninitialized constant {}", self.symbols.name(sym));
        Err(self.raise(ExcKind::Name, msg))
    }

    /// Constant lookup for GETMCNST: `base::sym` walking `base`'s chain.
    pub fn const_get_under(&mut self, base: &ClassRef, sym: Sym) -> Result<Value, Raised> {
        let mut cur = Some(Rc::clone(base));
        while let Some(c) = cur {
            if let Some(v) = c.borrow().consts.get(&sym) {
                return Ok(v.clone());
            }
            cur = c.borrow().sup.clone();
        }
        let msg = format!(
            "uninitialized constant {}::{}",
            RClass::display_name(base, &self.symbols),
            self.symbols.name(sym)
        );
        Err(self.raise(ExcKind::Name, msg))
    }

    pub fn const_set(&mut self, base: &ClassRef, sym: Sym, v: Value) {
        self.write_barrier(&Value::Class(Rc::clone(base)));
        base.borrow_mut().consts.insert(sym, v);
    }

    /// Class-variable read: walks the super chain from the current target
    /// class; missing names raise NameError.
    pub fn cvar_get(&mut self, start: &ClassRef, sym: Sym) -> Result<Value, Raised> {
        let mut cur = Some(Rc::clone(start));
        while let Some(c) = cur {
            if let Some(v) = c.borrow().cvars.get(&sym) {
                return Ok(v.clone());
            }
            cur = c.borrow().sup.clone();
        }
        let msg = format!(
            "uninitialized class variable {} in {}",
            self.symbols.name(sym),
            RClass::display_name(start, &self.symbols)
        );
        Err(self.raise(ExcKind::Name, msg))
    }

    /// Class-variable write: updates the defining ancestor when one exists,
    /// otherwise defines on `start`.
    pub fn cvar_set(&mut self, start: &ClassRef, sym: Sym, v: Value) {
        self.write_barrier(&Value::Class(Rc::clone(start)));
        let mut cur = Some(Rc::clone(start));
        while let Some(c) = cur {
            if c.borrow().cvars.contains_key(&sym) {
                c.borrow_mut().cvars.insert(sym, v);
                return;
            }
            cur = c.borrow().sup.clone();
        }
        start.borrow_mut().cvars.insert(sym, v);
    }

    /// Instance-variable read. Values that cannot carry ivars read as nil.
    pub fn iv_get(&self, v: &Value, sym: Sym) -> Value {
        match v {
            Value::Object(o) => o.borrow().ivars.get(&sym).cloned().unwrap_or(Value::Nil),
            Value::Exception(e) => e.borrow().ivars.get(&sym).cloned().unwrap_or(Value::Nil),
            Value::Class(c) => c.borrow().ivars.get(&sym).cloned().unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    /// Instance-variable write; immediates cannot hold one.
    pub fn iv_set(&mut self, v: &Value, sym: Sym, val: Value) -> Result<(), Raised> {
        self.write_barrier(v);
        match v {
            Value::Object(o) => {
                o.borrow_mut().ivars.insert(sym, val);
                Ok(())
            }
            Value::Exception(e) => {
                e.borrow_mut().ivars.insert(sym, val);
                Ok(())
            }
            Value::Class(c) => {
                c.borrow_mut().ivars.insert(sym, val);
                Ok(())
            }
            other => {
                let msg = format!("cannot set instance variable on {}", other.type_name());
                Err(self.raise(ExcKind::Argument, msg))
            }
        }
    }

    /// Define or reopen class `name` under `outer` with superclass `sup`.
    pub fn define_class_under(
        &mut self,
        outer: &ClassRef,
        name: Sym,
        sup: Option<ClassRef>,
    ) -> Result<ClassRef, Raised> {
        if let Some(existing) = outer.borrow().consts.get(&name).cloned() {
            return match existing {
                Value::Class(c) if !c.borrow().module => Ok(c),
                _ => {
                    let msg = format!("{} is not a class", self.symbols.name(name));
                    Err(self.raise(ExcKind::Type, msg))
                }
            };
        }
        let sup = match sup {
            Some(c) => c,
            None => Rc::clone(&self.core.object),
        };
        let class = RClass::new(name, Some(sup), false);
        self.const_set(outer, name, Value::Class(Rc::clone(&class)));
        Ok(class)
    }

    /// Define or reopen module `name` under `outer`.
    pub fn define_module_under(&mut self, outer: &ClassRef, name: Sym) -> Result<ClassRef, Raised> {
        if let Some(existing) = outer.borrow().consts.get(&name).cloned() {
            return match existing {
                Value::Class(c) if c.borrow().module => Ok(c),
                _ => {
                    let msg = format!("{} is not a module", self.symbols.name(name));
                    Err(self.raise(ExcKind::Type, msg))
                }
            };
        }
        let module = RClass::new(name, None, true);
        self.const_set(outer, name, Value::Class(Rc::clone(&module)));
        Ok(module)
    }

    /// Construct an exception instance of `class` with `message`.
    pub fn exc_new(&mut self, class: &ClassRef, message: Value) -> Value {
        let message = match message {
            Value::Nil => Value::str(String::new()),
            m => m,
        };
        Value::Exception(Rc::new(RefCell::new(RException {
            class: Rc::clone(class),
            message,
            ivars: HashMap::new(),
        })))
    }

    /// Allocate a plain instance of `class`.
    pub fn obj_new(&mut self, class: &ClassRef) -> Value {
        Value::Object(Rc::new(RefCell::new(RObject::new(Rc::clone(class)))))
    }
}
