//! # Register-Based Bytecode Virtual Machine (Runtime)
//!
//! This module implements the execution core of the Carmine runtime: a
//! register machine that runs fixed-width instruction words against a
//! growable operand stack, with frames, closures, exception handling and
//! tail calls.
//!
//! ## High-level model
//! - **Operand stack (`stack`)**: one contiguous buffer of `Value`s. Each
//!   frame owns a *register window* into it; slot 0 of every window is
//!   `self`. Windows are addressed by index, never by pointer, so growth
//!   can reallocate the buffer safely.
//! - **Frame stack (`frames`)**: one [`CallInfo`] per activation, carrying
//!   the method id, the executing procedure, the window base
//!   (`stackidx`), the caller's resume `pc`, the destination register
//!   (`acc`), and the rescue/ensure watermarks at entry.
//! - **Rescue stack (`rescues`)**: saved handler pcs pushed by ONERR.
//! - **Ensure stack (`ensures`)**: procedures to run on any exit from
//!   their protected region, pushed by EPUSH.
//! - **Exception slot (`exc`)**: the single raise mechanism. Opcode
//!   handlers set it and return `Err(Raised)`; the loop then walks frames
//!   until a rescue watermark shows a live handler.
//! - **Arena (`arena`)**: GC rooting checkpoint, snapshotted before and
//!   restored after every opcode so transient values stay reachable for
//!   exactly one instruction.
//!
//! ## Dispatch
//! The loop fetches one word, decodes the opcode and operand fields and
//! executes. `pc` is post-fetch: relative jumps are measured from the
//! instruction after the current one. Control-transfer opcodes rebind the
//! working pointers (`cur_irep`, `pc`, window base) to the new frame; the
//! loop itself only ever sees "continue", "raised" or "this invocation
//! produced a value".
//!
//! Host re-entries (native methods, `funcall`, ensure invocation) recurse
//! into [`Vm::execute`] with their own entry frame. Unwinding never
//! crosses such a boundary: an unhandled raise leaves the exception slot
//! set and hands nil back to the Rust caller, which propagates it in the
//! outer loop.

use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{opcode_from, opcode_name, Insn, Irep, OpCode, CALL_MAXARGS};
use crate::class::ClassRef;
use crate::error::{ExcKind, Raised};
use crate::procs::{Env, ProcBody, RProc};
use crate::value::{Sym, SymbolTable, Value};

pub(crate) mod builtins;
mod ops_arith;
mod ops_array;
mod ops_call;
mod ops_except;

pub use builtins::CoreClasses;

/// `acc` sentinel: this frame was entered from the host; a return here
/// leaves the interpreter.
pub(crate) const ACC_HOST: i32 = -1;

const STACK_INIT: usize = 128;
const FRAMES_INIT: usize = 32;

/// Per-activation record. Watermarks (`ridx`, `eidx`) snapshot the rescue
/// and ensure stacks at entry; handlers and ensures registered inside the
/// frame live above them.
#[derive(Debug, Clone)]
pub(crate) struct CallInfo {
    pub mid: Option<Sym>,
    pub proc: Option<Rc<RProc>>,
    pub target_class: Option<ClassRef>,
    /// Absolute offset of this frame's register window. An offset, not a
    /// pointer: the operand stack may reallocate underneath.
    pub stackidx: usize,
    pub nregs: usize,
    /// Argument count as passed; -1 means packed into one array.
    pub argc: i32,
    /// Caller register that receives the return value; [`ACC_HOST`] marks
    /// a host entry.
    pub acc: i32,
    /// Caller's resume pc.
    pub pc: usize,
    pub ridx: usize,
    pub eidx: usize,
    /// Lazily created register-window capture, set by the first closure.
    pub env: Option<Rc<Env>>,
}

/// The trace sink for the DEBUG opcode.
pub type TraceSink = Box<dyn FnMut(&str)>;

/// A Carmine execution state: one interpreter, its stacks and its object
/// world. All entry points take the state explicitly; there is no ambient
/// global.
pub struct Vm {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallInfo>,
    pub(crate) rescues: Vec<usize>,
    pub(crate) ensures: Vec<Rc<RProc>>,
    pub(crate) exc: Option<Value>,
    pub(crate) arena: Vec<Value>,
    pub(crate) globals: HashMap<Sym, Value>,
    pub(crate) specials: HashMap<u32, Value>,
    pub(crate) symbols: SymbolTable,
    pub(crate) ireps: Vec<Rc<Irep>>,
    pub(crate) core: CoreClasses,
    pub(crate) cur_irep: Rc<Irep>,
    pub(crate) pc: usize,
    pub(crate) trace: Option<TraceSink>,
    top_self: Value,
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

impl Vm {
    /// Create a state with the core object world bootstrapped and an empty
    /// toplevel frame installed.
    pub fn new() -> Vm {
        let mut symbols = SymbolTable::new();
        let core = builtins::core_classes(&mut symbols);
        let mut vm = Vm {
            stack: vec![Value::Nil; STACK_INIT],
            frames: Vec::with_capacity(FRAMES_INIT),
            rescues: Vec::new(),
            ensures: Vec::new(),
            exc: None,
            arena: Vec::new(),
            globals: HashMap::new(),
            specials: HashMap::new(),
            symbols,
            ireps: Vec::new(),
            cur_irep: Rc::new(Irep::empty()),
            pc: 0,
            trace: None,
            top_self: Value::Nil,
            core,
        };
        let object = Rc::clone(&vm.core.object);
        vm.frames.push(CallInfo {
            mid: None,
            proc: None,
            target_class: Some(Rc::clone(&object)),
            stackidx: 0,
            nregs: 1,
            argc: 0,
            acc: ACC_HOST,
            pc: 0,
            ridx: 0,
            eidx: 0,
            env: None,
        });
        let top = vm.obj_new(&object);
        vm.stack[0] = top.clone();
        vm.top_self = top;
        builtins::install(&mut vm);
        vm
    }

    //
    // --- Symbols, ireps, globals ------------------------------------------
    //

    /// Intern a name, returning its symbol id.
    pub fn intern(&mut self, name: &str) -> Sym {
        self.symbols.intern(name)
    }

    /// Resolve a symbol id back to its name.
    pub fn sym_name(&self, sym: Sym) -> &str {
        self.symbols.name(sym)
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// The toplevel `self` object.
    pub fn top_self(&self) -> Value {
        self.top_self.clone()
    }

    pub fn object_class(&self) -> ClassRef {
        Rc::clone(&self.core.object)
    }

    /// Append an irep to the state-global table, returning its index.
    pub fn add_irep(&mut self, irep: Rc<Irep>) -> usize {
        self.ireps.push(irep);
        self.ireps.len() - 1
    }

    pub fn irep_count(&self) -> usize {
        self.ireps.len()
    }

    pub fn global_get(&self, sym: Sym) -> Value {
        self.globals.get(&sym).cloned().unwrap_or(Value::Nil)
    }

    pub fn global_set(&mut self, sym: Sym, v: Value) {
        self.write_barrier(&v);
        self.globals.insert(sym, v);
    }

    /// Install a sink for DEBUG trace output (stdout when unset).
    pub fn set_trace(&mut self, sink: TraceSink) {
        self.trace = Some(sink);
    }

    /// Current frame depth, counting the toplevel sentinel.
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    //
    // --- Exception slot ---------------------------------------------------
    //

    /// The pending exception, if a raise went unhandled.
    pub fn exception(&self) -> Option<Value> {
        self.exc.clone()
    }

    pub fn clear_exception(&mut self) {
        self.exc = None;
    }

    /// Render an exception value as `ClassName: message`, the same form
    /// `display`/`inspect` use for exception values.
    pub fn error_message(&self, exc: &Value) -> String {
        match exc {
            Value::Exception(e) => crate::value::exception_text(&e.borrow(), &self.symbols),
            other => other.inspect(&self.symbols),
        }
    }

    /// Raise a core exception: build an instance of the class behind
    /// `kind`, store it in the exception slot and return the marker.
    pub(crate) fn raise(&mut self, kind: ExcKind, msg: String) -> Raised {
        let class = self.exc_class(kind);
        let message = Value::str(msg);
        let exc = self.exc_new(&class, message);
        self.exc = Some(exc);
        Raised
    }

    /// Raise an arbitrary value (OP_RAISE and host injection).
    pub(crate) fn raise_exc(&mut self, v: Value) -> Raised {
        self.exc = Some(v);
        Raised
    }

    fn exc_class(&mut self, kind: ExcKind) -> ClassRef {
        let sym = self.intern(kind.class_name());
        let found = match self.core.object.borrow().consts.get(&sym) {
            Some(Value::Class(c)) => Some(Rc::clone(c)),
            _ => None,
        };
        found.unwrap_or_else(|| Rc::clone(&self.core.standard_error))
    }

    //
    // --- GC hooks ---------------------------------------------------------
    //

    /// Write barrier: called after a reference is stored into a heap
    /// container (environments, globals, ivars, aggregates). Reference
    /// counting needs no generational bookkeeping, so this only preserves
    /// the call sites a tracing collector would hook.
    #[inline]
    pub fn write_barrier(&mut self, _container: &Value) {}

    /// Same contract for environment stores.
    #[inline]
    pub(crate) fn write_barrier_env(&mut self, _env: &Rc<Env>) {}

    /// Root a transient value until the current opcode completes.
    pub fn gc_protect(&mut self, v: Value) {
        self.arena.push(v);
    }

    /// Arena checkpoint: index saved between opcodes.
    pub fn arena_save(&self) -> usize {
        self.arena.len()
    }

    /// Restore a checkpoint taken with [`Vm::arena_save`].
    pub fn arena_restore(&mut self, idx: usize) {
        self.arena.truncate(idx);
    }

    //
    // --- Registers, frames, stacks ----------------------------------------
    //

    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.frames[self.frames.len() - 1].stackidx
    }

    #[inline]
    pub(crate) fn ci(&self) -> &CallInfo {
        &self.frames[self.frames.len() - 1]
    }

    #[inline]
    pub(crate) fn ci_mut(&mut self) -> &mut CallInfo {
        let i = self.frames.len() - 1;
        &mut self.frames[i]
    }

    #[inline]
    pub(crate) fn rget(&self, i: usize) -> Value {
        self.stack
            .get(self.base() + i)
            .cloned()
            .unwrap_or(Value::Nil)
    }

    #[inline]
    pub(crate) fn rset(&mut self, i: usize, v: Value) {
        let at = self.base() + i;
        if at >= self.stack.len() {
            self.ensure_capacity(at + 1);
        }
        self.stack[at] = v;
    }

    /// Grow the operand stack so the current window spans `room` slots,
    /// zero-initialising `[keep, room)`. Doubling when the request fits
    /// the current size, exact growth otherwise.
    pub(crate) fn stack_extend(&mut self, room: usize, keep: usize) {
        let base = self.base();
        let need = base + room;
        if need > self.stack.len() {
            let size = self.stack.len();
            let grown = if room <= size { size * 2 } else { size + room };
            self.stack.resize(grown.max(need), Value::Nil);
        }
        if keep < room {
            for slot in &mut self.stack[base + keep..base + room] {
                *slot = Value::Nil;
            }
        }
    }

    /// Absolute-capacity variant of the growth policy.
    pub(crate) fn ensure_capacity(&mut self, need: usize) {
        if need > self.stack.len() {
            let size = self.stack.len();
            let room = need - size;
            let grown = if room <= size { size * 2 } else { size + room };
            self.stack.resize(grown.max(need), Value::Nil);
        }
    }

    /// Force operand-stack capacity for `n` registers in the current
    /// window.
    pub fn checkstack(&mut self, n: usize) {
        let base = self.base();
        self.ensure_capacity(base + n);
    }

    /// Pop the current frame. The frame's environment, if any closure
    /// captured it, is promoted to a private buffer first; rescue entries
    /// registered inside the frame are discarded back to the entry
    /// watermark.
    pub(crate) fn cipop(&mut self) -> CallInfo {
        let Some(ci) = self.frames.pop() else {
            unreachable!("frame stack underflow");
        };
        if let Some(env) = &ci.env {
            env.detach(&self.stack);
        }
        self.rescues.truncate(ci.ridx);
        ci
    }

    //
    // --- Environments -----------------------------------------------------
    //

    /// The current frame's environment, created on first capture. The
    /// parent link goes to the creating procedure's own environment,
    /// forming the upvalue nesting chain.
    pub(crate) fn frame_env(&mut self) -> Rc<Env> {
        let idx = self.frames.len() - 1;
        if let Some(e) = &self.frames[idx].env {
            return Rc::clone(e);
        }
        let parent = self.frames[idx]
            .proc
            .as_ref()
            .and_then(|p| p.env.clone());
        let len = self.cur_irep.nlocals.max(1);
        let env = Rc::new(Env::shared(
            idx,
            self.frames[idx].stackidx,
            len,
            parent,
            self.frames[idx].mid,
        ));
        self.frames[idx].env = Some(Rc::clone(&env));
        env
    }

    /// Environment at upvalue nesting depth `nest` from the current
    /// procedure (0 is the procedure's own captured environment).
    pub(crate) fn uvenv(&self, nest: usize) -> Option<Rc<Env>> {
        let mut e = self.ci().proc.as_ref().and_then(|p| p.env.clone());
        for _ in 0..nest {
            e = e.and_then(|env| env.parent.clone());
        }
        e
    }

    pub(crate) fn env_get(&self, e: &Env, idx: usize) -> Value {
        e.get(&self.stack, idx)
    }

    pub(crate) fn env_set(&mut self, e: &Env, idx: usize, v: Value) {
        e.set(&mut self.stack, idx, v);
    }

    //
    // --- Irep field access ------------------------------------------------
    //

    pub(crate) fn isym(&mut self, idx: usize) -> Result<Sym, Raised> {
        match self.cur_irep.syms.get(idx).copied() {
            Some(s) => Ok(s),
            None => Err(self.raise(
                ExcKind::Runtime,
                format!("symbol index {} out of range", idx),
            )),
        }
    }

    pub(crate) fn ipool(&mut self, idx: usize) -> Result<Value, Raised> {
        match self.cur_irep.pool.get(idx).cloned() {
            Some(v) => Ok(v),
            None => Err(self.raise(
                ExcKind::Runtime,
                format!("pool index {} out of range", idx),
            )),
        }
    }

    /// Resolve a child-irep operand through the state-global table.
    pub(crate) fn irep_child(&mut self, idx: usize) -> Result<Rc<Irep>, Raised> {
        let found = self
            .cur_irep
            .reps
            .get(idx)
            .copied()
            .and_then(|g| self.ireps.get(g).cloned());
        match found {
            Some(ir) => Ok(ir),
            None => Err(self.raise(
                ExcKind::Runtime,
                format!("irep reference {} out of range", idx),
            )),
        }
    }

    //
    // --- Exposed host API -------------------------------------------------
    //

    /// Run a procedure to completion with the given `self`. On an
    /// unhandled raise the exception slot stays set and nil is returned.
    pub fn run(&mut self, p: &Rc<RProc>, self_val: Value) -> Value {
        self.call_entry(p, self_val, &[], None, None, None)
    }

    /// Synthesise a method send from the host.
    pub fn funcall(&mut self, recv: Value, name: &str, args: &[Value]) -> Value {
        self.funcall_with_block(recv, name, args, Value::Nil)
    }

    /// As [`Vm::funcall`], passing a block procedure along.
    pub fn funcall_with_block(
        &mut self,
        recv: Value,
        name: &str,
        args: &[Value],
        block: Value,
    ) -> Value {
        let mid = self.intern(name);
        let class = self.class_of(&recv);
        if let Some((p, defclass)) = self.method_search(&class, mid) {
            let t = p.target_class().unwrap_or(defclass);
            return self.call_entry(&p, recv, args, Some(block), Some(mid), Some(t));
        }
        // method_missing rewrite, original name prepended
        let missing = self.intern("method_missing");
        if let Some((p, defclass)) = self.method_search(&class, missing) {
            let mut argv = Vec::with_capacity(args.len() + 1);
            argv.push(Value::Sym(mid));
            argv.extend_from_slice(args);
            let t = p.target_class().unwrap_or(defclass);
            return self.call_entry(&p, recv, &argv, Some(block), Some(missing), Some(t));
        }
        let name = self.sym_name(mid).to_string();
        let recv_s = recv.inspect(&self.symbols);
        let _ = self.raise(
            ExcKind::NoMethod,
            format!("undefined method '{}' for {}", name, recv_s),
        );
        Value::Nil
    }

    /// Invoke a block procedure directly, without method lookup. `self`
    /// defaults to slot 0 of the block's captured environment.
    pub fn vm_yield(&mut self, block: &Value, args: &[Value], self_val: Option<Value>) -> Value {
        let p = match block {
            Value::Proc(p) => Rc::clone(p),
            other => {
                let msg = format!("{} is not a proc", other.type_name());
                let _ = self.raise(ExcKind::Type, msg);
                return Value::Nil;
            }
        };
        let slf = match self_val {
            Some(v) => v,
            None => match &p.env {
                Some(e) => self.env_get(e, 0),
                None => self.top_self(),
            },
        };
        let mid = p.env.as_ref().and_then(|e| e.mid);
        let t = p.target_class();
        self.call_entry(&p, slf, args, None, mid, t)
    }

    /// Shared host re-entry: place the call window above the current
    /// frame, push an [`ACC_HOST`] frame, and run the procedure to
    /// completion. Argument lists at or past the inline maximum are
    /// packed into one array (`argc = -1`).
    pub(crate) fn call_entry(
        &mut self,
        p: &Rc<RProc>,
        self_val: Value,
        args: &[Value],
        block: Option<Value>,
        mid: Option<Sym>,
        target_class: Option<ClassRef>,
    ) -> Value {
        let caller_base = self.base();
        let caller_nregs = self.ci().nregs.max(1);
        let base = caller_base + caller_nregs;

        let packed = args.len() >= CALL_MAXARGS;
        let argc: i32 = if packed { -1 } else { args.len() as i32 };
        let used = if packed { 3 } else { args.len() + 2 };
        let nregs = match p.irep() {
            Some(ir) => ir.nregs.max(used),
            None => used,
        };
        self.ensure_capacity(base + nregs);
        self.stack[base] = self_val.clone();
        if packed {
            self.stack[base + 1] = Value::array(args.to_vec());
            self.stack[base + 2] = block.unwrap_or(Value::Nil);
        } else {
            for (i, a) in args.iter().enumerate() {
                self.stack[base + 1 + i] = a.clone();
            }
            self.stack[base + 1 + args.len()] = block.unwrap_or(Value::Nil);
        }
        for i in used..nregs {
            self.stack[base + i] = Value::Nil;
        }

        let tclass = target_class
            .or_else(|| p.target_class())
            .unwrap_or_else(|| Rc::clone(&self.core.object));
        let saved_pc = self.pc;
        self.frames.push(CallInfo {
            mid,
            proc: Some(Rc::clone(p)),
            target_class: Some(tclass),
            stackidx: base,
            nregs,
            argc,
            acc: ACC_HOST,
            pc: saved_pc,
            ridx: self.rescues.len(),
            eidx: self.ensures.len(),
            env: None,
        });

        match &p.body {
            ProcBody::Native(f) => {
                let f = *f;
                let r = f(self, self_val, args);
                self.cipop();
                match r {
                    Ok(v) if self.exc.is_none() => v,
                    _ => Value::Nil,
                }
            }
            ProcBody::Irep(ir) => {
                let ir = Rc::clone(ir);
                let saved_irep = Rc::clone(&self.cur_irep);
                self.cur_irep = ir;
                self.pc = 0;
                let entry = self.frames.len() - 1;
                let v = self.execute(entry);
                self.cur_irep = saved_irep;
                self.pc = saved_pc;
                v
            }
        }
    }

    //
    // --- Dispatch ---------------------------------------------------------
    //

    #[inline]
    fn jump(&mut self, sbx: i32) {
        self.pc = (self.pc as i64 + sbx as i64).max(0) as usize;
    }

    fn fetch(&mut self) -> Option<Insn> {
        match self.cur_irep.code.get(self.pc).copied() {
            Some(w) => {
                self.pc += 1;
                Some(Insn(w))
            }
            None => None,
        }
    }

    fn trace_event(&mut self, insn: Insn) {
        let msg = format!(
            "{} {} {} {}",
            opcode_name(OpCode::Debug),
            insn.a(),
            insn.b(),
            insn.c()
        );
        match &mut self.trace {
            Some(sink) => sink(&msg),
            None => println!("{}", msg),
        }
    }

    /// Fetch/decode/execute until the frame at `entry` leaves (producing a
    /// value) or a raise escapes it (producing nil with the exception slot
    /// set).
    fn execute(&mut self, entry: usize) -> Value {
        loop {
            let ai = self.arena_save();
            let insn = match self.fetch() {
                Some(i) => i,
                None => {
                    let _ = self.raise(ExcKind::Runtime, "bytecode ran off the end".to_string());
                    match ops_except::raise_unwind(self, entry) {
                        ops_except::Unwound::Resumed => {
                            self.arena_restore(ai);
                            continue;
                        }
                        ops_except::Unwound::Fatal => return Value::Nil,
                    }
                }
            };
            let step: Result<(), Raised> = match opcode_from(insn.opcode()) {
                None => Err(self.raise(
                    ExcKind::Runtime,
                    format!("unknown opcode {:#x}", insn.opcode()),
                )),
                Some(op) => match op {
                    OpCode::Nop => Ok(()),
                    // Reserved opcodes decode but do nothing.
                    OpCode::FSend | OpCode::VSend | OpCode::KArg | OpCode::KDict => Ok(()),

                    OpCode::Move => {
                        let v = self.rget(insn.b());
                        self.rset(insn.a(), v);
                        Ok(())
                    }
                    OpCode::LoadL => match self.ipool(insn.bx()) {
                        Ok(v) => {
                            self.rset(insn.a(), v);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                    OpCode::LoadI => {
                        self.rset(insn.a(), Value::Int(insn.sbx() as i64));
                        Ok(())
                    }
                    OpCode::LoadSym => match self.isym(insn.bx()) {
                        Ok(s) => {
                            self.rset(insn.a(), Value::Sym(s));
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                    OpCode::LoadNil => {
                        self.rset(insn.a(), Value::Nil);
                        Ok(())
                    }
                    OpCode::LoadSelf => {
                        let v = self.rget(0);
                        self.rset(insn.a(), v);
                        Ok(())
                    }
                    OpCode::LoadT => {
                        self.rset(insn.a(), Value::Bool(true));
                        Ok(())
                    }
                    OpCode::LoadF => {
                        self.rset(insn.a(), Value::Bool(false));
                        Ok(())
                    }

                    OpCode::GetGlobal => self.op_getglobal(insn),
                    OpCode::SetGlobal => self.op_setglobal(insn),
                    OpCode::GetSpecial => {
                        let v = self
                            .specials
                            .get(&(insn.bx() as u32))
                            .cloned()
                            .unwrap_or(Value::Nil);
                        self.rset(insn.a(), v);
                        Ok(())
                    }
                    OpCode::SetSpecial => {
                        let v = self.rget(insn.a());
                        self.write_barrier(&v);
                        self.specials.insert(insn.bx() as u32, v);
                        Ok(())
                    }
                    OpCode::GetIv => self.op_getiv(insn),
                    OpCode::SetIv => self.op_setiv(insn),
                    OpCode::GetCv => self.op_getcv(insn),
                    OpCode::SetCv => self.op_setcv(insn),
                    OpCode::GetConst => self.op_getconst(insn),
                    OpCode::SetConst => self.op_setconst(insn),
                    OpCode::GetMCnst => self.op_getmcnst(insn),
                    OpCode::SetMCnst => self.op_setmcnst(insn),

                    OpCode::GetUpvar => {
                        match self.uvenv(insn.c()) {
                            Some(e) => {
                                let v = self.env_get(&e, insn.b());
                                self.rset(insn.a(), v);
                            }
                            None => self.rset(insn.a(), Value::Nil),
                        }
                        Ok(())
                    }
                    OpCode::SetUpvar => {
                        if let Some(e) = self.uvenv(insn.c()) {
                            let v = self.rget(insn.a());
                            self.env_set(&e, insn.b(), v);
                            self.write_barrier_env(&e);
                        }
                        Ok(())
                    }

                    OpCode::Jmp => {
                        self.jump(insn.sbx());
                        Ok(())
                    }
                    OpCode::JmpIf => {
                        if self.rget(insn.a()).truthy() {
                            self.jump(insn.sbx());
                        }
                        Ok(())
                    }
                    OpCode::JmpNot => {
                        if !self.rget(insn.a()).truthy() {
                            self.jump(insn.sbx());
                        }
                        Ok(())
                    }

                    OpCode::OnErr => {
                        let target = (self.pc as i64 + insn.sbx() as i64).max(0) as usize;
                        self.rescues.push(target);
                        Ok(())
                    }
                    OpCode::Rescue => {
                        let v = self.exc.take().unwrap_or(Value::Nil);
                        self.rset(insn.a(), v);
                        Ok(())
                    }
                    OpCode::PopErr => {
                        let floor = self.ci().ridx;
                        for _ in 0..insn.a() {
                            if self.rescues.len() <= floor {
                                break;
                            }
                            self.rescues.pop();
                        }
                        Ok(())
                    }
                    OpCode::Raise => {
                        let v = self.rget(insn.a());
                        Err(self.raise_exc(v))
                    }
                    OpCode::EPush => ops_except::op_epush(self, insn.bx()),
                    OpCode::EPop => ops_except::op_epop(self, insn.a()),

                    OpCode::Send => ops_call::op_send(self, insn.a(), insn.b(), insn.c(), false),
                    OpCode::SendB => ops_call::op_send(self, insn.a(), insn.b(), insn.c(), true),
                    OpCode::Super => ops_call::op_super(self, insn.a(), insn.c()),
                    OpCode::Call => match ops_call::op_call(self, entry) {
                        Ok(Some(v)) => return v,
                        Ok(None) => Ok(()),
                        Err(e) => Err(e),
                    },
                    OpCode::TailCall => {
                        match ops_call::op_tailcall(self, insn.a(), insn.b(), insn.c(), entry) {
                            Ok(Some(v)) => return v,
                            Ok(None) => Ok(()),
                            Err(e) => Err(e),
                        }
                    }
                    OpCode::ArgAry => ops_call::op_argary(self, insn.a(), insn.bx()),
                    OpCode::Enter => ops_call::op_enter(self, insn.ax()),
                    OpCode::BlkPush => ops_call::op_blkpush(self, insn.a(), insn.bx()),
                    OpCode::Return => {
                        if self.exc.is_some() {
                            Err(Raised)
                        } else {
                            let v = self.rget(insn.a());
                            match ops_except::do_return(self, v, insn.b(), entry) {
                                Ok(Some(v)) => return v,
                                Ok(None) => Ok(()),
                                Err(e) => Err(e),
                            }
                        }
                    }

                    OpCode::Add => ops_arith::op_add(self, insn),
                    OpCode::AddI => ops_arith::op_addi(self, insn),
                    OpCode::Sub => ops_arith::op_sub(self, insn),
                    OpCode::SubI => ops_arith::op_subi(self, insn),
                    OpCode::Mul => ops_arith::op_mul(self, insn),
                    OpCode::Div => ops_arith::op_div(self, insn),
                    OpCode::Eq => ops_arith::op_eq(self, insn),
                    OpCode::Lt => ops_arith::op_lt(self, insn),
                    OpCode::Le => ops_arith::op_le(self, insn),
                    OpCode::Gt => ops_arith::op_gt(self, insn),
                    OpCode::Ge => ops_arith::op_ge(self, insn),

                    OpCode::Array => ops_array::op_array(self, insn.a(), insn.b(), insn.c()),
                    OpCode::AryCat => ops_array::op_arycat(self, insn.a(), insn.b()),
                    OpCode::AryPush => ops_array::op_arypush(self, insn.a(), insn.b()),
                    OpCode::ARef => ops_array::op_aref(self, insn.a(), insn.b(), insn.c()),
                    OpCode::ASet => ops_array::op_aset(self, insn.a(), insn.b(), insn.c()),
                    OpCode::APost => ops_array::op_apost(self, insn.a(), insn.b(), insn.c()),
                    OpCode::String => ops_array::op_string(self, insn.a(), insn.bx()),
                    OpCode::StrCat => ops_array::op_strcat(self, insn.a(), insn.b()),
                    OpCode::Hash => ops_array::op_hash(self, insn.a(), insn.b(), insn.c()),
                    OpCode::Range => ops_array::op_range(self, insn.a(), insn.b(), insn.c()),

                    OpCode::Lambda => ops_call::op_lambda(self, insn),
                    OpCode::OClass => {
                        self.rset(insn.a(), Value::Class(Rc::clone(&self.core.object)));
                        Ok(())
                    }
                    OpCode::Class => ops_call::op_class(self, insn.a(), insn.b()),
                    OpCode::Module => ops_call::op_module(self, insn.a(), insn.b()),
                    OpCode::Exec => ops_call::op_exec(self, insn.a(), insn.bx()),
                    OpCode::Method => ops_call::op_method(self, insn.a(), insn.b()),
                    OpCode::SClass => ops_call::op_sclass(self, insn.a(), insn.b()),
                    OpCode::TClass => ops_call::op_tclass(self, insn.a()),

                    OpCode::Debug => {
                        self.trace_event(insn);
                        Ok(())
                    }
                    OpCode::Stop => return ops_except::op_stop(self, entry),
                    OpCode::Err => ops_except::op_err(self, insn.a(), insn.bx()),
                },
            };
            if step.is_err() {
                match ops_except::raise_unwind(self, entry) {
                    ops_except::Unwound::Resumed => {
                        self.arena_restore(ai);
                        continue;
                    }
                    ops_except::Unwound::Fatal => return Value::Nil,
                }
            }
            self.arena_restore(ai);
            debug_assert!(self.ci().stackidx <= self.stack.len());
        }
    }

    //
    // --- Host table opcodes -----------------------------------------------
    //

    fn op_getglobal(&mut self, insn: Insn) -> Result<(), Raised> {
        let s = self.isym(insn.bx())?;
        let v = self.globals.get(&s).cloned().unwrap_or(Value::Nil);
        self.rset(insn.a(), v);
        Ok(())
    }

    fn op_setglobal(&mut self, insn: Insn) -> Result<(), Raised> {
        let s = self.isym(insn.bx())?;
        let v = self.rget(insn.a());
        self.global_set(s, v);
        Ok(())
    }

    fn op_getiv(&mut self, insn: Insn) -> Result<(), Raised> {
        let s = self.isym(insn.bx())?;
        let slf = self.rget(0);
        let v = self.iv_get(&slf, s);
        self.rset(insn.a(), v);
        Ok(())
    }

    fn op_setiv(&mut self, insn: Insn) -> Result<(), Raised> {
        let s = self.isym(insn.bx())?;
        let slf = self.rget(0);
        let v = self.rget(insn.a());
        self.iv_set(&slf, s, v)
    }

    fn op_getcv(&mut self, insn: Insn) -> Result<(), Raised> {
        let s = self.isym(insn.bx())?;
        let t = match self.ci().target_class.clone() {
            Some(c) => c,
            None => self.object_class(),
        };
        let v = self.cvar_get(&t, s)?;
        self.rset(insn.a(), v);
        Ok(())
    }

    fn op_setcv(&mut self, insn: Insn) -> Result<(), Raised> {
        let s = self.isym(insn.bx())?;
        let t = match self.ci().target_class.clone() {
            Some(c) => c,
            None => self.object_class(),
        };
        let v = self.rget(insn.a());
        self.cvar_set(&t, s, v);
        Ok(())
    }

    fn op_getconst(&mut self, insn: Insn) -> Result<(), Raised> {
        let s = self.isym(insn.bx())?;
        let t = self.ci().target_class.clone();
        let v = self.const_lookup(t, s)?;
        self.rset(insn.a(), v);
        Ok(())
    }

    fn op_setconst(&mut self, insn: Insn) -> Result<(), Raised> {
        let s = self.isym(insn.bx())?;
        let t = match self.ci().target_class.clone() {
            Some(c) => c,
            None => self.object_class(),
        };
        let v = self.rget(insn.a());
        self.const_set(&t, s, v);
        Ok(())
    }

    fn op_getmcnst(&mut self, insn: Insn) -> Result<(), Raised> {
        let s = self.isym(insn.bx())?;
        let base = self.rget(insn.a());
        match base {
            Value::Class(c) => {
                let v = self.const_get_under(&c, s)?;
                self.rset(insn.a(), v);
                Ok(())
            }
            other => {
                let msg = format!("{} is not a class or module", other.type_name());
                Err(self.raise(ExcKind::Type, msg))
            }
        }
    }

    fn op_setmcnst(&mut self, insn: Insn) -> Result<(), Raised> {
        let s = self.isym(insn.bx())?;
        let target = self.rget(insn.a() + 1);
        match target {
            Value::Class(c) => {
                let v = self.rget(insn.a());
                self.const_set(&c, s, v);
                Ok(())
            }
            other => {
                let msg = format!("{} is not a class or module", other.type_name());
                Err(self.raise(ExcKind::Type, msg))
            }
        }
    }
}

#[cfg(test)]
mod tests;
