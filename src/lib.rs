//! Carmine language runtime: a register-based bytecode virtual machine
//! for a dynamically-typed, object-oriented scripting language.
//!
//! The crate exposes the VM state ([`Vm`]), the value model ([`Value`]),
//! the bytecode encoding ([`bytecode`]) and the `.carb` image loader.
//! Compilation to bytecode happens outside this crate; the runtime
//! executes what the compiler produced.

mod class;
mod error;
mod procs;
mod value;

pub mod bytecode;
pub mod vm;

pub use bytecode::{load_image, Insn, Irep, OpCode};
pub use class::{ClassRef, RClass};
pub use error::{ExcKind, LoadError, Raised};
pub use procs::{Env, NativeFn, ProcBody, RProc};
pub use value::{RException, RObject, RRange, Sym, SymbolTable, Value};
pub use vm::{CoreClasses, Vm};
