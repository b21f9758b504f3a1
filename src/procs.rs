//! # Procedures and Environments
//!
//! [`RProc`] is the callable unit: either a bytecode body (an irep) or a
//! host-native function. A procedure may close over the register window of
//! the frame that created it through an [`Env`].
//!
//! An environment starts out *shared*: it records the index of its frame in
//! the frame stack plus the absolute offset of that frame's register window,
//! and upvalue reads go straight through the operand stack. When the owning
//! frame returns, the window is about to be reused, so the environment is
//! *promoted*: the captured slots are copied into a private buffer and the
//! frame link is severed. Indices are used throughout instead of pointers;
//! the operand stack reallocates when it grows, which would invalidate any
//! raw pointer into it.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::Irep;
use crate::class::ClassRef;
use crate::error::Raised;
use crate::value::{Sym, Value};
use crate::vm::Vm;

/// Host-native method: receives the state, the receiver, and the (already
/// unpacked) positional arguments. A raise is signalled by setting the
/// exception slot and returning `Err(Raised)`.
pub type NativeFn = fn(&mut Vm, Value, &[Value]) -> Result<Value, Raised>;

/// The body of a procedure.
pub enum ProcBody {
    Irep(Rc<Irep>),
    Native(NativeFn),
}

impl std::fmt::Debug for ProcBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcBody::Irep(_) => write!(f, "ProcBody::Irep"),
            ProcBody::Native(_) => write!(f, "ProcBody::Native"),
        }
    }
}

/// A procedure: bytecode or native body, arity discipline, optional
/// captured environment and the class it was defined in.
#[derive(Debug)]
pub struct RProc {
    pub body: ProcBody,
    /// Strict procedures (methods, lambdas) raise on arity mismatch;
    /// lenient ones (blocks) pad and truncate.
    pub strict: bool,
    /// Captured environment of the creating frame, when the capture flag
    /// was set at creation.
    pub env: Option<Rc<Env>>,
    target_class: RefCell<Option<ClassRef>>,
}

impl RProc {
    /// Bytecode procedure without capture.
    pub fn from_irep(irep: Rc<Irep>, target_class: Option<ClassRef>) -> RProc {
        RProc {
            body: ProcBody::Irep(irep),
            strict: false,
            env: None,
            target_class: RefCell::new(target_class),
        }
    }

    /// Host-native procedure; natives always check their own arity.
    pub fn native(f: NativeFn) -> RProc {
        RProc {
            body: ProcBody::Native(f),
            strict: true,
            env: None,
            target_class: RefCell::new(None),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, ProcBody::Native(_))
    }

    pub fn irep(&self) -> Option<&Rc<Irep>> {
        match &self.body {
            ProcBody::Irep(ir) => Some(ir),
            ProcBody::Native(_) => None,
        }
    }

    pub fn target_class(&self) -> Option<ClassRef> {
        self.target_class.borrow().clone()
    }

    pub fn set_target_class(&self, c: Option<ClassRef>) {
        *self.target_class.borrow_mut() = c;
    }
}

/// Where an environment's slots currently live.
#[derive(Debug)]
enum EnvLoc {
    /// Aliasing a live frame: `cioff` indexes the frame stack, `stackidx`
    /// is the absolute register-window base in the operand stack.
    Shared { cioff: usize, stackidx: usize },
    /// The frame has returned; the slots were copied out.
    Detached(Vec<Value>),
}

/// A heap capture of a frame's register window.
#[derive(Debug)]
pub struct Env {
    /// Method name of the frame, re-adopted by CALL-style re-entry.
    pub mid: Option<Sym>,
    /// Captured slice length (the frame's local count).
    pub len: usize,
    /// Enclosing environment, forming the upvalue nesting chain.
    pub parent: Option<Rc<Env>>,
    loc: RefCell<EnvLoc>,
}

impl Env {
    /// New environment aliasing the live frame at `cioff`.
    pub fn shared(
        cioff: usize,
        stackidx: usize,
        len: usize,
        parent: Option<Rc<Env>>,
        mid: Option<Sym>,
    ) -> Env {
        Env {
            mid,
            len,
            parent,
            loc: RefCell::new(EnvLoc::Shared { cioff, stackidx }),
        }
    }

    /// Frame index while shared; `None` once detached.
    pub fn cioff(&self) -> Option<usize> {
        match *self.loc.borrow() {
            EnvLoc::Shared { cioff, .. } => Some(cioff),
            EnvLoc::Detached(_) => None,
        }
    }

    /// Register-window base while shared.
    pub fn stackidx(&self) -> Option<usize> {
        match *self.loc.borrow() {
            EnvLoc::Shared { stackidx, .. } => Some(stackidx),
            EnvLoc::Detached(_) => None,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(*self.loc.borrow(), EnvLoc::Shared { .. })
    }

    /// Read slot `idx`, resolving through the operand stack while shared.
    pub fn get(&self, stack: &[Value], idx: usize) -> Value {
        match &*self.loc.borrow() {
            EnvLoc::Shared { stackidx, .. } => stack
                .get(stackidx + idx)
                .cloned()
                .unwrap_or(Value::Nil),
            EnvLoc::Detached(buf) => buf.get(idx).cloned().unwrap_or(Value::Nil),
        }
    }

    /// Write slot `idx`. The caller is responsible for the write barrier.
    pub fn set(&self, stack: &mut [Value], idx: usize, v: Value) {
        match &mut *self.loc.borrow_mut() {
            EnvLoc::Shared { stackidx, .. } => {
                let at = *stackidx + idx;
                if at < stack.len() {
                    stack[at] = v;
                }
            }
            EnvLoc::Detached(buf) => {
                if idx < buf.len() {
                    buf[idx] = v;
                }
            }
        }
    }

    /// Sever the frame link: copy the captured window out of the operand
    /// stack into a private buffer. Idempotent.
    pub fn detach(&self, stack: &[Value]) {
        let buf = match &*self.loc.borrow() {
            EnvLoc::Shared { stackidx, .. } => {
                let end = (stackidx + self.len).min(stack.len());
                let mut buf = stack[*stackidx..end].to_vec();
                buf.resize(self.len, Value::Nil);
                buf
            }
            EnvLoc::Detached(_) => return,
        };
        *self.loc.borrow_mut() = EnvLoc::Detached(buf);
    }
}
