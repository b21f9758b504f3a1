//! # Error Handling for the Carmine VM
//!
//! Two kinds of failure exist in this runtime and they are deliberately kept
//! apart:
//!
//! - **Script-level errors** are first-class exception *values* (instances of
//!   the exception classes bootstrapped in the VM). They travel through the
//!   VM's exception slot, never through Rust `Result` payloads. [`ExcKind`]
//!   names the categories the core itself raises and maps each onto its
//!   class constant.
//! - **Host-level errors** are ordinary Rust errors: [`LoadError`] covers a
//!   malformed `.carb` image handed to the loader.
//!
//! [`Raised`] is the glue between the two worlds: a zero-sized marker
//! returned by fallible opcode handlers meaning "the exception slot has been
//! set, enter the unwind path". It carries no data on purpose: the exception
//! value itself lives in the state, so `?` stays cheap and the unwinder is
//! the single reader.

use std::fmt;

/// Marker for "an exception value has been placed in the VM's exception
/// slot". Handlers return `Result<(), Raised>` and propagate with `?`; the
/// dispatch loop reacts by unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Raised;

/// Exception categories raised by the interpreter core itself.
///
/// Each variant corresponds to one of the exception classes registered as a
/// constant under `Object` during bootstrap. Everything else a script can
/// see originates in host code and arrives through the shared exception
/// slot directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcKind {
    /// `RuntimeError` — generic failure, also the class behind `OP_ERR`.
    Runtime,
    /// `TypeError` — operation applied to an inappropriate value.
    Type,
    /// `ArgumentError` — strict arity mismatch in `OP_ENTER`.
    Argument,
    /// `NameError` — missing constant or class variable.
    Name,
    /// `NoMethodError` — method resolution and `method_missing` both failed.
    NoMethod,
    /// `LocalJumpError` — `break`/`return` from a scope that already died.
    LocalJump,
    /// `IndexError` — aggregate access out of range.
    Index,
    /// `ZeroDivisionError` — integer division or modulo by zero.
    ZeroDivision,
}

impl ExcKind {
    /// Name of the exception class this kind instantiates.
    pub fn class_name(self) -> &'static str {
        match self {
            ExcKind::Runtime => "RuntimeError",
            ExcKind::Type => "TypeError",
            ExcKind::Argument => "ArgumentError",
            ExcKind::Name => "NameError",
            ExcKind::NoMethod => "NoMethodError",
            ExcKind::LocalJump => "LocalJumpError",
            ExcKind::Index => "IndexError",
            ExcKind::ZeroDivision => "ZeroDivisionError",
        }
    }
}

/// Errors produced while decoding a `.carb` bytecode image.
///
/// The loader is strict: any structural fault aborts the load with a
/// description of what was wrong and where. A loaded image is trusted by
/// the interpreter afterwards, so nothing gets waved through here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The image does not start with the `CARB` magic.
    BadMagic,
    /// The image was produced for a different bytecode version.
    Version { expected: u32, found: u32 },
    /// The image ends in the middle of a field.
    Truncated { offset: usize },
    /// A string section holds invalid UTF-8.
    Utf8 { offset: usize },
    /// An instruction word names an opcode outside the table.
    BadOpcode { irep: usize, pc: usize, byte: u8 },
    /// An unknown pool-entry tag.
    BadPoolTag { irep: usize, tag: u8 },
    /// A child-irep reference points past the irep table.
    BadIrepIndex { irep: usize, index: usize },
    /// The image declares no ireps at all.
    Empty,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::BadMagic => {
                write!(f, "not a Carmine bytecode image (bad magic)")
            }
            LoadError::Version { expected, found } => {
                write!(
                    f,
                    "unsupported bytecode version {:#x} (runtime expects {:#x})",
                    found, expected
                )
            }
            LoadError::Truncated { offset } => {
                write!(f, "image truncated at byte {}", offset)
            }
            LoadError::Utf8 { offset } => {
                write!(f, "invalid UTF-8 in string at byte {}", offset)
            }
            LoadError::BadOpcode { irep, pc, byte } => {
                write!(f, "unknown opcode {:#x} at irep {} pc {}", byte, irep, pc)
            }
            LoadError::BadPoolTag { irep, tag } => {
                write!(f, "unknown pool tag {:#x} in irep {}", tag, irep)
            }
            LoadError::BadIrepIndex { irep, index } => {
                write!(f, "irep {} references missing child irep {}", irep, index)
            }
            LoadError::Empty => write!(f, "image contains no ireps"),
        }
    }
}

impl std::error::Error for LoadError {}
