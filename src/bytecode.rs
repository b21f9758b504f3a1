//! # Carmine Bytecode Format & Decoder
//!
//! Instruction words, the opcode table, irep records and the binary parser
//! for `.carb` images. The loader turns a raw byte slice into entries of
//! the state-global irep table plus an entry procedure the VM can run.
//!
//! ## Instruction word
//! A fixed 32-bit little-endian word with a 7-bit opcode in the low bits
//! and three operand layouts over the high 25:
//! ```text
//! +---------+---------+---------+----------+
//! | A:9     | B:9     | C:7     | op:7     |   A B C
//! +---------+---------+---------+----------+
//! | A:9     | Bx:16 (sBx = Bx - 0x7fff)    |   A Bx / A sBx
//! +---------+-------------------+----------+
//! | Ax:25                       | op:7     |   Ax
//! +-----------------------------+----------+
//! | A:9     | b:14        | c:2 | op:7     |   LAMBDA only
//! +---------+-------------+-----+----------+
//! ```
//! Sub-field packings inside Ax (ENTER) and Bx (ARGARY/BLKPUSH) are exposed
//! through [`aspec_fields`] and [`scope_fields`].
//!
//! ## Image layout (little-endian)
//! ```text
//! +------------------+-----------------------------+
//! | Magic "CARB"     | 4 bytes                     |
//! +------------------+-----------------------------+
//! | Version          | u32 (see `BC_VERSION`)      |
//! +------------------+-----------------------------+
//! | Irep count       | u32                         |
//! +------------------+-----------------------------+
//! | For each irep:                                 |
//! |   nlocals        | u16                         |
//! |   nregs          | u16                         |
//! |   code           | u32 count + u32 words       |
//! |   pool           | u32 count + tagged entries: |
//! |                  |   0: i64  1: f64 bits       |
//! |                  |   2: u32 len + UTF-8        |
//! |   syms           | u32 count + (u32 len + str) |
//! |   reps           | u32 count + u32 indices     |
//! |                  |   (image-relative)          |
//! +------------------+-----------------------------+
//! ```
//! The first irep of an image is its entry point. Child references are
//! rebased onto the state-global table at load time, so several images can
//! be loaded into one state.
//!
//! The parser is strict about the header, the version, opcode bytes and
//! every length field; a malformed image yields a [`LoadError`], never a
//! panic.

use std::rc::Rc;

use once_cell::sync::Lazy;

use crate::error::LoadError;
use crate::procs::RProc;
use crate::value::{Sym, Value};
use crate::vm::Vm;

/// Packed bytecode version: `(MAJOR << 16) | (MINOR << 8) | PATCH`.
pub const BC_VERSION: u32 = (0 << 16) | (1 << 8) | 0;

/// Bias for the signed 16-bit sBx operand.
pub const MAXARG_SBX: i32 = 0x7fff;

/// Argument counts at or above this are packed into a single array; the
/// frame then records `argc = -1`.
pub const CALL_MAXARGS: usize = 127;

/// RETURN mode operands.
pub const RET_NORMAL: usize = 0;
pub const RET_BREAK: usize = 1;
pub const RET_RETURN: usize = 2;

/// LAMBDA flag bits: strict arity checking and environment capture.
pub const PROC_STRICT: usize = 1;
pub const PROC_CAPTURE: usize = 2;

/// The Carmine opcode set. Discriminants are the on-wire 7-bit opcode.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Nop = 0,
    Move = 1,
    LoadL = 2,
    LoadI = 3,
    LoadSym = 4,
    LoadNil = 5,
    LoadSelf = 6,
    LoadT = 7,
    LoadF = 8,
    GetGlobal = 9,
    SetGlobal = 10,
    GetSpecial = 11,
    SetSpecial = 12,
    GetIv = 13,
    SetIv = 14,
    GetCv = 15,
    SetCv = 16,
    GetConst = 17,
    SetConst = 18,
    GetMCnst = 19,
    SetMCnst = 20,
    GetUpvar = 21,
    SetUpvar = 22,
    Jmp = 23,
    JmpIf = 24,
    JmpNot = 25,
    OnErr = 26,
    Rescue = 27,
    PopErr = 28,
    Raise = 29,
    EPush = 30,
    EPop = 31,
    Send = 32,
    SendB = 33,
    FSend = 34,
    VSend = 35,
    Call = 36,
    Super = 37,
    ArgAry = 38,
    Enter = 39,
    KArg = 40,
    KDict = 41,
    Return = 42,
    TailCall = 43,
    BlkPush = 44,
    Add = 45,
    AddI = 46,
    Sub = 47,
    SubI = 48,
    Mul = 49,
    Div = 50,
    Eq = 51,
    Lt = 52,
    Le = 53,
    Gt = 54,
    Ge = 55,
    Array = 56,
    AryCat = 57,
    AryPush = 58,
    ARef = 59,
    ASet = 60,
    APost = 61,
    String = 62,
    StrCat = 63,
    Hash = 64,
    Lambda = 65,
    Range = 66,
    OClass = 67,
    Class = 68,
    Module = 69,
    Exec = 70,
    Method = 71,
    SClass = 72,
    TClass = 73,
    Debug = 74,
    Stop = 75,
    Err = 76,
}

#[derive(Clone, Copy)]
struct OpDef {
    code: OpCode,
    name: &'static str,
}

const OPS: &[(OpCode, &str)] = &[
    (OpCode::Nop, "NOP"),
    (OpCode::Move, "MOVE"),
    (OpCode::LoadL, "LOADL"),
    (OpCode::LoadI, "LOADI"),
    (OpCode::LoadSym, "LOADSYM"),
    (OpCode::LoadNil, "LOADNIL"),
    (OpCode::LoadSelf, "LOADSELF"),
    (OpCode::LoadT, "LOADT"),
    (OpCode::LoadF, "LOADF"),
    (OpCode::GetGlobal, "GETGLOBAL"),
    (OpCode::SetGlobal, "SETGLOBAL"),
    (OpCode::GetSpecial, "GETSPECIAL"),
    (OpCode::SetSpecial, "SETSPECIAL"),
    (OpCode::GetIv, "GETIV"),
    (OpCode::SetIv, "SETIV"),
    (OpCode::GetCv, "GETCV"),
    (OpCode::SetCv, "SETCV"),
    (OpCode::GetConst, "GETCONST"),
    (OpCode::SetConst, "SETCONST"),
    (OpCode::GetMCnst, "GETMCNST"),
    (OpCode::SetMCnst, "SETMCNST"),
    (OpCode::GetUpvar, "GETUPVAR"),
    (OpCode::SetUpvar, "SETUPVAR"),
    (OpCode::Jmp, "JMP"),
    (OpCode::JmpIf, "JMPIF"),
    (OpCode::JmpNot, "JMPNOT"),
    (OpCode::OnErr, "ONERR"),
    (OpCode::Rescue, "RESCUE"),
    (OpCode::PopErr, "POPERR"),
    (OpCode::Raise, "RAISE"),
    (OpCode::EPush, "EPUSH"),
    (OpCode::EPop, "EPOP"),
    (OpCode::Send, "SEND"),
    (OpCode::SendB, "SENDB"),
    (OpCode::FSend, "FSEND"),
    (OpCode::VSend, "VSEND"),
    (OpCode::Call, "CALL"),
    (OpCode::Super, "SUPER"),
    (OpCode::ArgAry, "ARGARY"),
    (OpCode::Enter, "ENTER"),
    (OpCode::KArg, "KARG"),
    (OpCode::KDict, "KDICT"),
    (OpCode::Return, "RETURN"),
    (OpCode::TailCall, "TAILCALL"),
    (OpCode::BlkPush, "BLKPUSH"),
    (OpCode::Add, "ADD"),
    (OpCode::AddI, "ADDI"),
    (OpCode::Sub, "SUB"),
    (OpCode::SubI, "SUBI"),
    (OpCode::Mul, "MUL"),
    (OpCode::Div, "DIV"),
    (OpCode::Eq, "EQ"),
    (OpCode::Lt, "LT"),
    (OpCode::Le, "LE"),
    (OpCode::Gt, "GT"),
    (OpCode::Ge, "GE"),
    (OpCode::Array, "ARRAY"),
    (OpCode::AryCat, "ARYCAT"),
    (OpCode::AryPush, "ARYPUSH"),
    (OpCode::ARef, "AREF"),
    (OpCode::ASet, "ASET"),
    (OpCode::APost, "APOST"),
    (OpCode::String, "STRING"),
    (OpCode::StrCat, "STRCAT"),
    (OpCode::Hash, "HASH"),
    (OpCode::Lambda, "LAMBDA"),
    (OpCode::Range, "RANGE"),
    (OpCode::OClass, "OCLASS"),
    (OpCode::Class, "CLASS"),
    (OpCode::Module, "MODULE"),
    (OpCode::Exec, "EXEC"),
    (OpCode::Method, "METHOD"),
    (OpCode::SClass, "SCLASS"),
    (OpCode::TClass, "TCLASS"),
    (OpCode::Debug, "DEBUG"),
    (OpCode::Stop, "STOP"),
    (OpCode::Err, "ERR"),
];

/// Opcode property table, indexed by the 7-bit opcode byte.
static OPTAB: Lazy<[Option<OpDef>; 128]> = Lazy::new(|| {
    let mut table = [None; 128];
    for &(code, name) in OPS {
        table[code as u8 as usize] = Some(OpDef { code, name });
    }
    table
});

/// Decode an opcode byte; `None` for bytes outside the table.
pub fn opcode_from(byte: u8) -> Option<OpCode> {
    OPTAB
        .get(byte as usize)
        .and_then(|d| d.as_ref())
        .map(|d| d.code)
}

/// Mnemonic for an opcode, used by the DEBUG trace output.
pub fn opcode_name(op: OpCode) -> &'static str {
    match OPTAB[op as u8 as usize] {
        Some(d) => d.name,
        None => "?",
    }
}

/// A fetched instruction word with operand-field accessors.
#[derive(Debug, Clone, Copy)]
pub struct Insn(pub u32);

impl Insn {
    pub fn opcode(self) -> u8 {
        (self.0 & 0x7f) as u8
    }

    pub fn a(self) -> usize {
        ((self.0 >> 23) & 0x1ff) as usize
    }

    pub fn b(self) -> usize {
        ((self.0 >> 14) & 0x1ff) as usize
    }

    pub fn c(self) -> usize {
        ((self.0 >> 7) & 0x7f) as usize
    }

    pub fn bx(self) -> usize {
        ((self.0 >> 7) & 0xffff) as usize
    }

    pub fn sbx(self) -> i32 {
        self.bx() as i32 - MAXARG_SBX
    }

    pub fn ax(self) -> u32 {
        (self.0 >> 7) & 0x1ff_ffff
    }

    /// 14-bit b field of the LAMBDA layout.
    pub fn bz(self) -> usize {
        ((self.0 >> 9) & 0x3fff) as usize
    }

    /// 2-bit c field of the LAMBDA layout.
    pub fn cz(self) -> usize {
        ((self.0 >> 7) & 0x3) as usize
    }
}

//
// --- Encoding -------------------------------------------------------------
//
// The assembler producing real images lives outside this crate, but the
// word layout is part of the wire contract, so the packing helpers are
// public (the bootstrap and the test suite assemble with them).
//

pub fn op_abc(op: OpCode, a: u32, b: u32, c: u32) -> u32 {
    ((a & 0x1ff) << 23) | ((b & 0x1ff) << 14) | ((c & 0x7f) << 7) | op as u32
}

pub fn op_abx(op: OpCode, a: u32, bx: u32) -> u32 {
    ((a & 0x1ff) << 23) | ((bx & 0xffff) << 7) | op as u32
}

pub fn op_asbx(op: OpCode, a: u32, sbx: i32) -> u32 {
    op_abx(op, a, (sbx + MAXARG_SBX) as u32)
}

pub fn op_ax(op: OpCode, ax: u32) -> u32 {
    ((ax & 0x1ff_ffff) << 7) | op as u32
}

/// LAMBDA layout: child-irep index `b` (14 bits) and flag bits `c` (2).
pub fn op_abz(op: OpCode, a: u32, b: u32, c: u32) -> u32 {
    ((a & 0x1ff) << 23) | ((b & 0x3fff) << 9) | ((c & 0x3) << 7) | op as u32
}

/// Pack an ENTER arity descriptor: required prefix, optionals, rest flag,
/// required suffix. The keyword fields stay zero (reserved).
pub fn aspec(m1: u32, o: u32, r: bool, m2: u32) -> u32 {
    ((m1 & 0x1f) << 18) | ((o & 0x1f) << 13) | ((r as u32) << 12) | ((m2 & 0x1f) << 7)
}

/// Unpack an ENTER descriptor into `(m1, o, r, m2)`.
pub fn aspec_fields(ax: u32) -> (usize, usize, bool, usize) {
    (
        ((ax >> 18) & 0x1f) as usize,
        ((ax >> 13) & 0x1f) as usize,
        (ax >> 12) & 1 != 0,
        ((ax >> 7) & 0x1f) as usize,
    )
}

/// Pack an ARGARY/BLKPUSH scope descriptor.
pub fn scope_desc(m1: u32, r: bool, m2: u32, lv: u32) -> u32 {
    ((m1 & 0x3f) << 10) | ((r as u32) << 9) | ((m2 & 0x1f) << 4) | (lv & 0xf)
}

/// Unpack a scope descriptor into `(m1, r, m2, lv)`.
pub fn scope_fields(bx: usize) -> (usize, bool, usize, usize) {
    (
        (bx >> 10) & 0x3f,
        (bx >> 9) & 1 != 0,
        (bx >> 4) & 0x1f,
        bx & 0xf,
    )
}

/// A compiled procedure body: instructions, literal pool, symbol table,
/// declared register counts, and child ireps (addressed through the
/// state-global irep table).
#[derive(Debug)]
pub struct Irep {
    pub nlocals: usize,
    pub nregs: usize,
    pub code: Vec<u32>,
    pub pool: Vec<Value>,
    pub syms: Vec<Sym>,
    /// Indices of nested ireps in the state-global table.
    pub reps: Vec<usize>,
}

impl Irep {
    pub fn empty() -> Irep {
        Irep {
            nlocals: 0,
            nregs: 0,
            code: Vec::new(),
            pool: Vec::new(),
            syms: Vec::new(),
            reps: Vec::new(),
        }
    }
}

//
// --- Little-endian readers ------------------------------------------------
//

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        if self.pos + n > self.data.len() {
            return Err(LoadError::Truncated { offset: self.pos });
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, LoadError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, LoadError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_le_bytes(buf))
    }

    fn f64(&mut self) -> Result<f64, LoadError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(f64::from_le_bytes(buf))
    }

    fn string(&mut self) -> Result<String, LoadError> {
        let len = self.u32()? as usize;
        let start = self.pos;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| LoadError::Utf8 { offset: start })
    }
}

//
// --- Image loader ---------------------------------------------------------
//

/// Parse a `.carb` image into the state's irep table and return the entry
/// procedure (a strict procedure over the image's first irep, targeting
/// Object).
pub fn load_image(vm: &mut Vm, data: &[u8]) -> Result<Rc<RProc>, LoadError> {
    let mut r = Reader::new(data);

    // ---- Header ----
    if r.take(4)? != b"CARB" {
        return Err(LoadError::BadMagic);
    }
    let version = r.u32()?;
    if version != BC_VERSION {
        return Err(LoadError::Version {
            expected: BC_VERSION,
            found: version,
        });
    }

    let irep_count = r.u32()? as usize;
    if irep_count == 0 {
        return Err(LoadError::Empty);
    }

    // Child references inside the image are relative to its own block; the
    // block starts where the state table currently ends.
    let rebase = vm.irep_count();

    let mut loaded: Vec<Rc<Irep>> = Vec::with_capacity(irep_count);
    for n in 0..irep_count {
        let nlocals = r.u16()? as usize;
        let nregs = r.u16()? as usize;

        let code_len = r.u32()? as usize;
        let mut code = Vec::with_capacity(code_len);
        for pc in 0..code_len {
            let word = r.u32()?;
            let byte = (word & 0x7f) as u8;
            if opcode_from(byte).is_none() {
                return Err(LoadError::BadOpcode { irep: n, pc, byte });
            }
            code.push(word);
        }

        let pool_len = r.u32()? as usize;
        let mut pool = Vec::with_capacity(pool_len);
        for _ in 0..pool_len {
            let tag = r.u8()?;
            pool.push(match tag {
                0 => Value::Int(r.i64()?),
                1 => Value::Float(r.f64()?),
                2 => Value::str(r.string()?),
                tag => return Err(LoadError::BadPoolTag { irep: n, tag }),
            });
        }

        let sym_len = r.u32()? as usize;
        let mut syms = Vec::with_capacity(sym_len);
        for _ in 0..sym_len {
            let name = r.string()?;
            syms.push(vm.intern(&name));
        }

        let reps_len = r.u32()? as usize;
        let mut reps = Vec::with_capacity(reps_len);
        for _ in 0..reps_len {
            let idx = r.u32()? as usize;
            if idx >= irep_count {
                return Err(LoadError::BadIrepIndex { irep: n, index: idx });
            }
            reps.push(rebase + idx);
        }

        loaded.push(Rc::new(Irep {
            nlocals,
            nregs,
            code,
            pool,
            syms,
            reps,
        }));
    }

    let entry = Rc::clone(&loaded[0]);
    for ir in loaded {
        vm.add_irep(ir);
    }

    let object = vm.object_class();
    let mut p = RProc::from_irep(entry, Some(object));
    p.strict = true;
    Ok(Rc::new(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abc_fields_unpack() {
        let i = Insn(op_abc(OpCode::Send, 3, 7, 2));
        assert_eq!(opcode_from(i.opcode()), Some(OpCode::Send));
        assert_eq!(i.a(), 3);
        assert_eq!(i.b(), 7);
        assert_eq!(i.c(), 2);
    }

    #[test]
    fn sbx_carries_sign() {
        assert_eq!(Insn(op_asbx(OpCode::Jmp, 0, -5)).sbx(), -5);
        assert_eq!(Insn(op_asbx(OpCode::Jmp, 0, 300)).sbx(), 300);
        assert_eq!(Insn(op_asbx(OpCode::LoadI, 1, -32767)).sbx(), -32767);
    }

    #[test]
    fn enter_descriptor_fields() {
        let ax = aspec(1, 2, true, 3);
        assert_eq!(aspec_fields(ax), (1, 2, true, 3));
        let i = Insn(op_ax(OpCode::Enter, ax));
        assert_eq!(aspec_fields(i.ax()), (1, 2, true, 3));
    }

    #[test]
    fn scope_descriptor_fields() {
        let bx = scope_desc(2, true, 1, 3);
        assert_eq!(scope_fields(bx as usize), (2, true, 1, 3));
    }

    #[test]
    fn lambda_layout_fields() {
        let i = Insn(op_abz(OpCode::Lambda, 4, 9, PROC_CAPTURE as u32));
        assert_eq!(i.a(), 4);
        assert_eq!(i.bz(), 9);
        assert_eq!(i.cz(), PROC_CAPTURE);
    }

    #[test]
    fn unknown_opcode_rejected() {
        assert_eq!(opcode_from(0x7f), None);
        assert_eq!(opcode_from(77), None);
        assert!(opcode_from(76).is_some());
    }
}
