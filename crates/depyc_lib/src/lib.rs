//! Decompiler for CPython bytecode images.
//!
//! Takes the bytes of a `.pyc` file, reconstructs the statement tree from
//! the flat instruction stream, and renders source text that would compile
//! back to an equivalent module. Covers the 1.x through 3.x release lines;
//! opcodes without a reconstruction rule degrade into a warning comment
//! instead of wrong output.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod ast;
pub mod builder;
pub mod object;
pub mod opcodes;
pub mod printer;
pub mod stack;

pub use object::{Code, Module, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompileMode {
    Source,
    Disasm,
}

/// Interpreter release a code object targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub fn new(major: u8, minor: u8) -> Version {
        Version { major, minor }
    }

    pub fn at_least(self, major: u8, minor: u8) -> bool {
        (self.major, self.minor) >= (major, minor)
    }

    pub fn before(self, major: u8, minor: u8) -> bool {
        !self.at_least(major, minor)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionSelect {
    /// Read the release from the image's magic number.
    Auto,
    Pinned(Version),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: DecompileMode,
    pub version: VersionSelect,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: DecompileMode::Source,
            version: VersionSelect::Auto,
        }
    }
}

#[derive(Debug, Error)]
pub enum DepycError {
    #[error("unexpected end of input")]
    Eof,

    #[error("unrecognized pyc magic number {0}; pass an explicit version")]
    UnknownMagic(u16),

    #[error("unsupported marshal tag: 0x{0:02x}")]
    UnsupportedTag(u8),

    #[error("string back-reference {0} out of range")]
    BadStringRef(u32),

    #[error("invalid constant pool index: {0}")]
    InvalidConstIndex(u32),

    #[error("invalid name index: {0}")]
    InvalidNameIndex(u32),

    #[error("truncated instruction at offset {pos}")]
    TruncatedInstruction { pos: u32 },

    #[error("unknown opcode 0x{opcode:02x} for Python {version}")]
    UnknownOpcode { opcode: u8, version: Version },

    #[error("formatter error")]
    Fmt(#[from] fmt::Error),
}

pub fn decompile(data: &[u8]) -> Result<String, DepycError> {
    decompile_with_options(data, DecompileOptions::default())
}

pub fn decompile_with_options(
    data: &[u8],
    options: DecompileOptions,
) -> Result<String, DepycError> {
    let module = Module::parse(data, options.version)?;
    decompile_module(&module, options.mode)
}

/// Renders an already-parsed module in the requested mode.
pub fn decompile_module(module: &Module, mode: DecompileMode) -> Result<String, DepycError> {
    let mut out = String::new();
    match mode {
        DecompileMode::Source => printer::render_source(&mut out, module)?,
        DecompileMode::Disasm => printer::render_disassembly(&mut out, module)?,
    }
    Ok(out)
}
