//! Code objects, constant values, and the `.pyc` container reader.
//!
//! The marshal format is a tagged tree: one type byte, then a
//! payload whose layout depends on the tag and on the interpreter release
//! that wrote the file. Only the tags that appear in compiled modules are
//! handled; anything else fails with a typed error rather than a guess.

use std::fmt;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};

use crate::{DepycError, Version, VersionSelect};

const TYPE_NULL: u8 = b'0';
const TYPE_NONE: u8 = b'N';
const TYPE_FALSE: u8 = b'F';
const TYPE_TRUE: u8 = b'T';
const TYPE_STOPITER: u8 = b'S';
const TYPE_ELLIPSIS: u8 = b'.';
const TYPE_INT: u8 = b'i';
const TYPE_INT64: u8 = b'I';
const TYPE_FLOAT: u8 = b'f';
const TYPE_BINARY_FLOAT: u8 = b'g';
const TYPE_COMPLEX: u8 = b'x';
const TYPE_BINARY_COMPLEX: u8 = b'y';
const TYPE_LONG: u8 = b'l';
const TYPE_STRING: u8 = b's';
const TYPE_INTERNED: u8 = b't';
const TYPE_STRINGREF: u8 = b'R';
const TYPE_UNICODE: u8 = b'u';
const TYPE_TUPLE: u8 = b'(';
const TYPE_LIST: u8 = b'[';
const TYPE_DICT: u8 = b'{';
const TYPE_CODE: u8 = b'c';
const TYPE_CODE_OLD: u8 = b'C';

/// References get flagged in the high bit from 3.4 on.
const FLAG_REF: u8 = 0x80;
const TYPE_REF: u8 = b'r';

/// One constant-pool value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    True,
    False,
    Ellipsis,
    StopIteration,
    Int(i32),
    Int64(i64),
    /// Arbitrary-precision integer, already rendered to decimal digits.
    Long(String),
    Float(f64),
    Complex(f64, f64),
    /// Byte string (`str` before 3.0, `bytes` after).
    Str(String),
    Unicode(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Code(Rc<Code>),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::True => write!(f, "True"),
            Value::False => write!(f, "False"),
            Value::Ellipsis => write!(f, "..."),
            Value::StopIteration => write!(f, "StopIteration"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Complex(re, im) => write!(f, "({re:?}{}{im:?}j)", if *im < 0.0 { "" } else { "+" }),
            Value::Str(s) => write!(f, "'{s}'"),
            Value::Unicode(s) => write!(f, "u'{s}'"),
            Value::Tuple(v) => write!(f, "<tuple:{}>", v.len()),
            Value::List(v) => write!(f, "<list:{}>", v.len()),
            Value::Dict(v) => write!(f, "<dict:{}>", v.len()),
            Value::Code(c) => write!(f, "<code:{}>", c.name),
        }
    }
}

/// One function's bytecode plus its metadata tables.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Code {
    pub arg_count: u32,
    pub kwonly_arg_count: u32,
    pub num_locals: u32,
    pub stack_size: u32,
    pub flags: u32,
    pub code: Vec<u8>,
    pub consts: Vec<Value>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub free_vars: Vec<String>,
    pub cell_vars: Vec<String>,
    pub filename: String,
    pub name: String,
}

impl Code {
    pub const CO_VARARGS: u32 = 0x0004;
    pub const CO_VARKEYWORDS: u32 = 0x0008;

    pub fn get_const(&self, index: u32) -> Result<&Value, DepycError> {
        self.consts
            .get(index as usize)
            .ok_or(DepycError::InvalidConstIndex(index))
    }

    pub fn get_name(&self, index: u32) -> Result<&str, DepycError> {
        self.names
            .get(index as usize)
            .map(String::as_str)
            .ok_or(DepycError::InvalidNameIndex(index))
    }

    pub fn get_varname(&self, index: u32) -> Result<&str, DepycError> {
        self.varnames
            .get(index as usize)
            .map(String::as_str)
            .ok_or(DepycError::InvalidNameIndex(index))
    }
}

/// A parsed `.pyc` image: the interpreter version it targets plus the
/// module-level code object.
#[derive(Debug, Clone)]
pub struct Module {
    pub version: Version,
    pub code: Rc<Code>,
}

impl Module {
    pub fn parse(data: &[u8], select: VersionSelect) -> Result<Module, DepycError> {
        let mut r = Reader::new(data);
        let magic = r.get_u16()?;
        let _crlf = r.get_u16()?;
        let version = match select {
            VersionSelect::Pinned(v) => v,
            VersionSelect::Auto => {
                version_from_magic(magic).ok_or(DepycError::UnknownMagic(magic))?
            }
        };

        // 3.7 adds a bitfield word before the timestamp; 3.3 adds a source
        // size word after it.
        if version.at_least(3, 7) {
            let _flags = r.get_u32()?;
        }
        let _mtime = r.get_u32()?;
        if version.at_least(3, 3) {
            let _source_size = r.get_u32()?;
        }

        let mut marshal = Marshal::new(version);
        let value = marshal.read_value(&mut r)?;
        match value {
            Value::Code(code) => Ok(Module { version, code }),
            other => {
                tracing::warn!("top-level marshal object is not code: {other}");
                Err(DepycError::UnsupportedTag(0))
            }
        }
    }
}

fn version_from_magic(magic: u16) -> Option<Version> {
    let v = match magic {
        11913 | 5892 => Version::new(1, 3),
        20117 => Version::new(1, 4),
        20121 => Version::new(1, 5),
        50428 => Version::new(1, 6),
        50823 => Version::new(2, 0),
        60202 => Version::new(2, 1),
        60717 => Version::new(2, 2),
        62011 | 62021 => Version::new(2, 3),
        62041 | 62051 | 62061 => Version::new(2, 4),
        62071 | 62081 | 62091 | 62092 | 62101 | 62111 | 62121 | 62131 => Version::new(2, 5),
        62151 | 62161 => Version::new(2, 6),
        62171 | 62181 | 62191 | 62201 | 62211 => Version::new(2, 7),
        3111 | 3131 => Version::new(3, 0),
        3141 | 3151 => Version::new(3, 1),
        3160 | 3170 | 3180 => Version::new(3, 2),
        3190 | 3200 | 3210 | 3220 | 3230 => Version::new(3, 3),
        3250 | 3260 | 3270 | 3280 | 3290 | 3300 | 3310 => Version::new(3, 4),
        3320 | 3330 | 3340 | 3350 | 3351 => Version::new(3, 5),
        3360 | 3361 | 3370 | 3371 | 3372 | 3373 | 3375 | 3376 | 3377 | 3378 | 3379 => {
            Version::new(3, 6)
        }
        3390 | 3391 | 3392 | 3393 | 3394 => Version::new(3, 7),
        _ => return None,
    };
    Some(v)
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn get_u8(&mut self) -> Result<u8, DepycError> {
        if self.remaining() < 1 {
            return Err(DepycError::Eof);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn get_u16(&mut self) -> Result<u16, DepycError> {
        if self.remaining() < 2 {
            return Err(DepycError::Eof);
        }
        let v = LittleEndian::read_u16(&self.buf[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(v)
    }

    fn get_u32(&mut self) -> Result<u32, DepycError> {
        if self.remaining() < 4 {
            return Err(DepycError::Eof);
        }
        let v = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    fn get_i32(&mut self) -> Result<i32, DepycError> {
        Ok(self.get_u32()? as i32)
    }

    fn get_i64(&mut self) -> Result<i64, DepycError> {
        if self.remaining() < 8 {
            return Err(DepycError::Eof);
        }
        let v = LittleEndian::read_i64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    fn get_f64(&mut self) -> Result<f64, DepycError> {
        if self.remaining() < 8 {
            return Err(DepycError::Eof);
        }
        let v = LittleEndian::read_f64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], DepycError> {
        if self.remaining() < n {
            return Err(DepycError::Eof);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
}

struct Marshal {
    version: Version,
    interned: Vec<String>,
    refs: Vec<Value>,
}

impl Marshal {
    fn new(version: Version) -> Marshal {
        Marshal {
            version,
            interned: Vec::new(),
            refs: Vec::new(),
        }
    }

    fn read_value(&mut self, r: &mut Reader<'_>) -> Result<Value, DepycError> {
        let raw = r.get_u8()?;
        let keep_ref = self.version.at_least(3, 4) && (raw & FLAG_REF) != 0;
        let tag = if self.version.at_least(3, 4) {
            raw & !FLAG_REF
        } else {
            raw
        };

        let value = match tag {
            TYPE_NONE => Value::None,
            TYPE_TRUE => Value::True,
            TYPE_FALSE => Value::False,
            TYPE_ELLIPSIS => Value::Ellipsis,
            TYPE_STOPITER => Value::StopIteration,
            TYPE_INT => Value::Int(r.get_i32()?),
            TYPE_INT64 => Value::Int64(r.get_i64()?),
            TYPE_FLOAT => {
                let len = r.get_u8()? as usize;
                let text = String::from_utf8_lossy(r.get_bytes(len)?).to_string();
                Value::Float(text.parse::<f64>().unwrap_or(0.0))
            }
            TYPE_BINARY_FLOAT => Value::Float(r.get_f64()?),
            TYPE_COMPLEX => {
                let re_len = r.get_u8()? as usize;
                let re = String::from_utf8_lossy(r.get_bytes(re_len)?)
                    .parse::<f64>()
                    .unwrap_or(0.0);
                let im_len = r.get_u8()? as usize;
                let im = String::from_utf8_lossy(r.get_bytes(im_len)?)
                    .parse::<f64>()
                    .unwrap_or(0.0);
                Value::Complex(re, im)
            }
            TYPE_BINARY_COMPLEX => {
                let re = r.get_f64()?;
                let im = r.get_f64()?;
                Value::Complex(re, im)
            }
            TYPE_LONG => {
                let size = r.get_i32()?;
                let negative = size < 0;
                let count = size.unsigned_abs() as usize;
                let mut digits = Vec::with_capacity(count);
                for _ in 0..count {
                    digits.push(r.get_u16()?);
                }
                Value::Long(long_to_decimal(&digits, negative))
            }
            TYPE_STRING => {
                let len = r.get_i32()?.max(0) as usize;
                Value::Str(String::from_utf8_lossy(r.get_bytes(len)?).to_string())
            }
            TYPE_INTERNED => {
                let len = r.get_i32()?.max(0) as usize;
                let s = String::from_utf8_lossy(r.get_bytes(len)?).to_string();
                self.interned.push(s.clone());
                Value::Str(s)
            }
            TYPE_STRINGREF => {
                let index = r.get_u32()?;
                let s = self
                    .interned
                    .get(index as usize)
                    .ok_or(DepycError::BadStringRef(index))?;
                Value::Str(s.clone())
            }
            TYPE_UNICODE => {
                let len = r.get_i32()?.max(0) as usize;
                Value::Unicode(String::from_utf8_lossy(r.get_bytes(len)?).to_string())
            }
            TYPE_TUPLE => {
                let len = r.get_i32()?.max(0) as usize;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_value(r)?);
                }
                Value::Tuple(items)
            }
            TYPE_LIST => {
                let len = r.get_i32()?.max(0) as usize;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_value(r)?);
                }
                Value::List(items)
            }
            TYPE_DICT => {
                let mut items = Vec::new();
                loop {
                    let key = match self.read_value(r) {
                        Err(DepycError::UnsupportedTag(TYPE_NULL)) => break,
                        other => other?,
                    };
                    let val = self.read_value(r)?;
                    items.push((key, val));
                }
                Value::Dict(items)
            }
            TYPE_CODE | TYPE_CODE_OLD => Value::Code(Rc::new(self.read_code(r)?)),
            TYPE_REF => {
                let index = r.get_u32()?;
                self.refs
                    .get(index as usize)
                    .cloned()
                    .ok_or(DepycError::BadStringRef(index))?
            }
            other => return Err(DepycError::UnsupportedTag(other)),
        };

        if keep_ref {
            self.refs.push(value.clone());
        }
        Ok(value)
    }

    fn get_size(&self, r: &mut Reader<'_>) -> Result<u32, DepycError> {
        // Counts widen from 16 to 32 bits in 2.3.
        if self.version.at_least(2, 3) {
            r.get_u32()
        } else {
            Ok(r.get_u16()? as u32)
        }
    }

    fn read_string_tuple(&mut self, r: &mut Reader<'_>) -> Result<Vec<String>, DepycError> {
        let value = self.read_value(r)?;
        match value {
            Value::Tuple(items) => Ok(items
                .into_iter()
                .map(|v| match v {
                    Value::Str(s) | Value::Unicode(s) => s,
                    other => other.to_string(),
                })
                .collect()),
            Value::None => Ok(Vec::new()),
            other => {
                tracing::warn!("expected a name tuple, found {other}");
                Ok(Vec::new())
            }
        }
    }

    fn read_code(&mut self, r: &mut Reader<'_>) -> Result<Code, DepycError> {
        let mut code = Code::default();

        if self.version.at_least(1, 3) {
            code.arg_count = self.get_size(r)?;
            if self.version.at_least(3, 0) {
                code.kwonly_arg_count = self.get_size(r)?;
            }
            code.num_locals = self.get_size(r)?;
            if self.version.at_least(1, 5) {
                code.stack_size = self.get_size(r)?;
            }
            code.flags = self.get_size(r)?;
        }

        code.code = match self.read_value(r)? {
            Value::Str(s) | Value::Unicode(s) => s.into_bytes(),
            other => {
                tracing::warn!("code body is not a string: {other}");
                Vec::new()
            }
        };
        code.consts = match self.read_value(r)? {
            Value::Tuple(items) => items,
            other => vec![other],
        };
        code.names = self.read_string_tuple(r)?;
        if self.version.at_least(1, 3) {
            code.varnames = self.read_string_tuple(r)?;
        }
        if self.version.at_least(2, 1) {
            code.free_vars = self.read_string_tuple(r)?;
            code.cell_vars = self.read_string_tuple(r)?;
        }
        code.filename = match self.read_value(r)? {
            Value::Str(s) | Value::Unicode(s) => s,
            other => other.to_string(),
        };
        code.name = match self.read_value(r)? {
            Value::Str(s) | Value::Unicode(s) => s,
            other => other.to_string(),
        };
        if self.version.at_least(1, 5) {
            let _first_line = self.get_size(r)?;
            let _lnotab = self.read_value(r)?;
        }

        Ok(code)
    }
}

/// Converts marshal's base-2^15 digit train into decimal text.
fn long_to_decimal(digits: &[u16], negative: bool) -> String {
    let mut work: Vec<u32> = digits.iter().map(|&d| d as u32).collect();
    while work.last() == Some(&0) {
        work.pop();
    }
    if work.is_empty() {
        return "0".to_string();
    }

    let mut out = Vec::new();
    while !work.is_empty() {
        let mut rem: u32 = 0;
        for digit in work.iter_mut().rev() {
            let cur = (rem << 15) | *digit;
            *digit = cur / 10;
            rem = cur % 10;
        }
        out.push(char::from_digit(rem, 10).unwrap_or('0'));
        while work.last() == Some(&0) {
            work.pop();
        }
    }

    let mut text = String::new();
    if negative {
        text.push('-');
    }
    text.extend(out.iter().rev());
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_i32(buf: &mut Vec<u8>, v: i32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_string(buf: &mut Vec<u8>, s: &str) {
        buf.push(TYPE_STRING);
        put_i32(buf, s.len() as i32);
        buf.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn reads_scalars_and_containers() {
        let mut buf = vec![TYPE_TUPLE];
        put_i32(&mut buf, 4);
        buf.push(TYPE_NONE);
        buf.push(TYPE_INT);
        put_i32(&mut buf, -7);
        put_string(&mut buf, "spam");
        buf.push(TYPE_BINARY_FLOAT);
        buf.extend_from_slice(&2.5f64.to_le_bytes());

        let mut marshal = Marshal::new(Version::new(2, 7));
        let value = marshal.read_value(&mut Reader::new(&buf)).unwrap();
        assert_eq!(
            value,
            Value::Tuple(vec![
                Value::None,
                Value::Int(-7),
                Value::Str("spam".into()),
                Value::Float(2.5),
            ])
        );
    }

    #[test]
    fn interned_strings_resolve_by_ref() {
        let mut buf = vec![TYPE_TUPLE];
        put_i32(&mut buf, 2);
        buf.push(TYPE_INTERNED);
        put_i32(&mut buf, 3);
        buf.extend_from_slice(b"egg");
        buf.push(TYPE_STRINGREF);
        put_i32(&mut buf, 0);

        let mut marshal = Marshal::new(Version::new(2, 7));
        let value = marshal.read_value(&mut Reader::new(&buf)).unwrap();
        assert_eq!(
            value,
            Value::Tuple(vec![Value::Str("egg".into()), Value::Str("egg".into())])
        );
    }

    #[test]
    fn long_digits_convert_to_decimal() {
        // 3 * 2^15 + 9 = 98313
        assert_eq!(long_to_decimal(&[9, 3], false), "98313");
        assert_eq!(long_to_decimal(&[9, 3], true), "-98313");
        assert_eq!(long_to_decimal(&[], false), "0");
    }

    #[test]
    fn unknown_tag_is_a_typed_error() {
        let buf = vec![b'?'];
        let mut marshal = Marshal::new(Version::new(2, 7));
        assert!(matches!(
            marshal.read_value(&mut Reader::new(&buf)),
            Err(DepycError::UnsupportedTag(b'?'))
        ));
    }
}
