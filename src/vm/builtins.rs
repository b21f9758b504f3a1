//! # Bootstrap: Core Classes and Native Methods
//!
//! The minimal object world the interpreter needs before it can run
//! anything: the Object/Module/Class roots, the primitive classes, the
//! exception hierarchy, and the handful of native methods the core itself
//! leans on.
//!
//! Notably `Proc#call` is not a native: it is a one-instruction bytecode
//! procedure containing OP_CALL, which is the only way that opcode is ever
//! reached. Sending `:call` to a proc pushes an ordinary frame for this
//! stub; OP_CALL then rebinds that frame in place to the proc's own body.

use std::rc::Rc;

use crate::bytecode::{op_abc, Irep, OpCode};
use crate::class::{ClassRef, RClass};
use crate::error::{ExcKind, Raised};
use crate::procs::RProc;
use crate::value::{SymbolTable, Value};
use crate::vm::Vm;

/// Handles to the classes the interpreter reaches for directly.
pub struct CoreClasses {
    pub object: ClassRef,
    pub module: ClassRef,
    pub class: ClassRef,
    pub nil: ClassRef,
    pub true_class: ClassRef,
    pub false_class: ClassRef,
    pub integer: ClassRef,
    pub float: ClassRef,
    pub symbol: ClassRef,
    pub string: ClassRef,
    pub array: ClassRef,
    pub hash: ClassRef,
    pub range: ClassRef,
    pub proc_class: ClassRef,
    pub exception: ClassRef,
    pub standard_error: ClassRef,
}

/// Build the class hierarchy and register every class as a constant under
/// Object.
pub(crate) fn core_classes(symbols: &mut SymbolTable) -> CoreClasses {
    let object = RClass::new(symbols.intern("Object"), None, false);
    let module = RClass::new(symbols.intern("Module"), Some(Rc::clone(&object)), false);
    let class = RClass::new(symbols.intern("Class"), Some(Rc::clone(&module)), false);

    let under_object = |symbols: &mut SymbolTable, name: &str, sup: &ClassRef| {
        RClass::new(symbols.intern(name), Some(Rc::clone(sup)), false)
    };

    let nil = under_object(symbols, "NilClass", &object);
    let true_class = under_object(symbols, "TrueClass", &object);
    let false_class = under_object(symbols, "FalseClass", &object);
    let integer = under_object(symbols, "Integer", &object);
    let float = under_object(symbols, "Float", &object);
    let symbol = under_object(symbols, "Symbol", &object);
    let string = under_object(symbols, "String", &object);
    let array = under_object(symbols, "Array", &object);
    let hash = under_object(symbols, "Hash", &object);
    let range = under_object(symbols, "Range", &object);
    let proc_class = under_object(symbols, "Proc", &object);

    let exception = under_object(symbols, "Exception", &object);
    let standard_error = under_object(symbols, "StandardError", &exception);
    let runtime_error = under_object(symbols, "RuntimeError", &standard_error);
    let type_error = under_object(symbols, "TypeError", &standard_error);
    let argument_error = under_object(symbols, "ArgumentError", &standard_error);
    let name_error = under_object(symbols, "NameError", &standard_error);
    let no_method_error = under_object(symbols, "NoMethodError", &name_error);
    let local_jump_error = under_object(symbols, "LocalJumpError", &standard_error);
    let index_error = under_object(symbols, "IndexError", &standard_error);
    let zero_division_error = under_object(symbols, "ZeroDivisionError", &standard_error);

    {
        let mut consts = object.borrow_mut();
        let mut reg = |symbols: &mut SymbolTable, name: &str, c: &ClassRef| {
            consts
                .consts
                .insert(symbols.intern(name), Value::Class(Rc::clone(c)));
        };
        reg(symbols, "Object", &object);
        reg(symbols, "Module", &module);
        reg(symbols, "Class", &class);
        reg(symbols, "NilClass", &nil);
        reg(symbols, "TrueClass", &true_class);
        reg(symbols, "FalseClass", &false_class);
        reg(symbols, "Integer", &integer);
        reg(symbols, "Float", &float);
        reg(symbols, "Symbol", &symbol);
        reg(symbols, "String", &string);
        reg(symbols, "Array", &array);
        reg(symbols, "Hash", &hash);
        reg(symbols, "Range", &range);
        reg(symbols, "Proc", &proc_class);
        reg(symbols, "Exception", &exception);
        reg(symbols, "StandardError", &standard_error);
        reg(symbols, "RuntimeError", &runtime_error);
        reg(symbols, "TypeError", &type_error);
        reg(symbols, "ArgumentError", &argument_error);
        reg(symbols, "NameError", &name_error);
        reg(symbols, "NoMethodError", &no_method_error);
        reg(symbols, "LocalJumpError", &local_jump_error);
        reg(symbols, "IndexError", &index_error);
        reg(symbols, "ZeroDivisionError", &zero_division_error);
    }

    CoreClasses {
        object,
        module,
        class,
        nil,
        true_class,
        false_class,
        integer,
        float,
        symbol,
        string,
        array,
        hash,
        range,
        proc_class,
        exception,
        standard_error,
    }
}

/// Install the native methods the core depends on.
pub(crate) fn install(vm: &mut Vm) {
    let object = vm.object_class();
    vm.define_native(&object, "==", native_eq);
    vm.define_native(&object, "method_missing", native_method_missing);

    let exception = Rc::clone(&vm.core.exception);
    vm.define_native(&exception, "message", native_exc_message);

    let class = Rc::clone(&vm.core.class);
    vm.define_native(&class, "new", native_class_new);

    // Proc#call: the OP_CALL trampoline.
    let call_irep = Rc::new(Irep {
        nlocals: 2,
        nregs: 2,
        code: vec![op_abc(OpCode::Call, 0, 0, 0)],
        pool: Vec::new(),
        syms: Vec::new(),
        reps: Vec::new(),
    });
    vm.add_irep(Rc::clone(&call_irep));
    let proc_class = Rc::clone(&vm.core.proc_class);
    let mid = vm.intern("call");
    let mut stub = RProc::from_irep(call_irep, Some(Rc::clone(&proc_class)));
    stub.strict = true;
    vm.define_method(&proc_class, mid, Rc::new(stub));
}

fn native_eq(_vm: &mut Vm, slf: Value, args: &[Value]) -> Result<Value, Raised> {
    let other = args.first().cloned().unwrap_or(Value::Nil);
    Ok(Value::Bool(slf.value_eq(&other)))
}

fn native_method_missing(vm: &mut Vm, slf: Value, args: &[Value]) -> Result<Value, Raised> {
    let name = match args.first() {
        Some(Value::Sym(s)) => vm.sym_name(*s).to_string(),
        Some(other) => other.inspect(vm.symbols()),
        None => "?".to_string(),
    };
    let recv = slf.inspect(vm.symbols());
    Err(vm.raise(
        ExcKind::NoMethod,
        format!("undefined method '{}' for {}", name, recv),
    ))
}

fn native_exc_message(vm: &mut Vm, slf: Value, _args: &[Value]) -> Result<Value, Raised> {
    match slf {
        Value::Exception(e) => Ok(e.borrow().message.clone()),
        other => Ok(Value::str(other.display(vm.symbols()))),
    }
}

/// `Class#new`: exception classes build exception instances (optional
/// message argument); everything else allocates a plain object and runs
/// `initialize` when the class defines one.
fn native_class_new(vm: &mut Vm, slf: Value, args: &[Value]) -> Result<Value, Raised> {
    let class = match &slf {
        Value::Class(c) => Rc::clone(c),
        other => {
            let msg = format!("{} is not a class", other.type_name());
            return Err(vm.raise(ExcKind::Type, msg));
        }
    };
    if class.borrow().module {
        return Err(vm.raise(ExcKind::Type, "cannot instantiate a module".to_string()));
    }
    let exception = Rc::clone(&vm.core.exception);
    if RClass::derives_from(&class, &exception) {
        let msg = args.first().cloned().unwrap_or(Value::Nil);
        return Ok(vm.exc_new(&class, msg));
    }
    let obj = vm.obj_new(&class);
    let init = vm.intern("initialize");
    if vm.method_search(&class, init).is_some() {
        vm.funcall(obj.clone(), "initialize", args);
        if vm.exception().is_some() {
            return Err(Raised);
        }
    }
    Ok(obj)
}
