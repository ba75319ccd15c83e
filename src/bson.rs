//! Binary codec for the value model.
//!
//! Encoding is total and deterministic: every in-memory value has exactly one
//! byte representation, with document keys laid out in insertion order.
//! Decoding is strict: declared lengths must match consumed bytes, keys must
//! be valid UTF-8 and unique, and documents end with a 0x00 terminator.

use crate::types::{Array, Binary, Document, MAX_DOCUMENT_LEN, ObjectId, Value};

const TAG_DOUBLE: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_DOCUMENT: u8 = 0x03;
const TAG_ARRAY: u8 = 0x04;
const TAG_BINARY: u8 = 0x05;
const TAG_OBJECT_ID: u8 = 0x07;
const TAG_BOOL: u8 = 0x08;
const TAG_DATE_TIME: u8 = 0x09;
const TAG_NULL: u8 = 0x0A;
const TAG_REGEX: u8 = 0x0B;
const TAG_INT32: u8 = 0x10;
const TAG_TIMESTAMP: u8 = 0x11;
const TAG_INT64: u8 = 0x12;

const MAX_DEPTH: usize = 100;

#[derive(thiserror::Error, Debug)]
pub enum BsonError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid document length")]
    InvalidLength,

    #[error("document exceeds maximum length")]
    DocumentTooLarge,

    #[error("unknown element type 0x{0:02x}")]
    InvalidTypeTag(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("NUL byte inside cstring")]
    NulInCString,

    #[error("invalid boolean byte 0x{0:02x}")]
    InvalidBool(u8),

    #[error("array keys are not sequential indices")]
    InvalidArrayKeys,

    #[error("nesting depth exceeds {MAX_DEPTH}")]
    DepthExceeded,
}

/// Encode a document to its canonical byte form.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>, BsonError> {
    let mut out = Vec::with_capacity(128);
    write_document(&mut out, doc, 0)?;
    if out.len() > MAX_DOCUMENT_LEN {
        return Err(BsonError::DocumentTooLarge);
    }
    Ok(out)
}

/// Decode one document from the front of `buf`, returning it and the number
/// of bytes consumed. Kind-1 wire sections concatenate documents, so callers
/// need the consumed length.
pub fn decode_document_prefix(buf: &[u8]) -> Result<(Document, usize), BsonError> {
    let mut r = Reader { buf, pos: 0 };
    let doc = read_document(&mut r, 0)?;
    Ok((doc, r.pos))
}

/// Decode a document that must occupy the whole buffer.
pub fn decode_document(buf: &[u8]) -> Result<Document, BsonError> {
    let (doc, used) = decode_document_prefix(buf)?;
    if used != buf.len() {
        return Err(BsonError::InvalidLength);
    }
    Ok(doc)
}

fn write_document(out: &mut Vec<u8>, doc: &Document, depth: usize) -> Result<(), BsonError> {
    if depth > MAX_DEPTH {
        return Err(BsonError::DepthExceeded);
    }
    let start = out.len();
    out.extend_from_slice(&0i32.to_le_bytes()); // patched below
    for (key, value) in doc.iter() {
        write_element(out, key, value, depth)?;
    }
    out.push(0);
    let len = (out.len() - start) as i32;
    out[start..start + 4].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

fn write_array(out: &mut Vec<u8>, arr: &Array, depth: usize) -> Result<(), BsonError> {
    if depth > MAX_DEPTH {
        return Err(BsonError::DepthExceeded);
    }
    let start = out.len();
    out.extend_from_slice(&0i32.to_le_bytes());
    let mut idx_buf = itoa_buf();
    for (i, value) in arr.iter().enumerate() {
        let key = fmt_index(&mut idx_buf, i);
        write_element(out, key, value, depth)?;
    }
    out.push(0);
    let len = (out.len() - start) as i32;
    out[start..start + 4].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

// Array keys are decimal indices; format without allocating per element.
fn itoa_buf() -> [u8; 20] {
    [0u8; 20]
}

fn fmt_index(buf: &mut [u8; 20], mut i: usize) -> &str {
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (i % 10) as u8;
        i /= 10;
        if i == 0 {
            break;
        }
    }
    std::str::from_utf8(&buf[pos..]).unwrap_or("0")
}

fn write_element(out: &mut Vec<u8>, key: &str, value: &Value, depth: usize) -> Result<(), BsonError> {
    let tag = match value {
        Value::Double(_) => TAG_DOUBLE,
        Value::String(_) => TAG_STRING,
        Value::Document(_) => TAG_DOCUMENT,
        Value::Array(_) => TAG_ARRAY,
        Value::Binary(_) => TAG_BINARY,
        Value::ObjectId(_) => TAG_OBJECT_ID,
        Value::Bool(_) => TAG_BOOL,
        Value::DateTime(_) => TAG_DATE_TIME,
        Value::Null => TAG_NULL,
        Value::Regex { .. } => TAG_REGEX,
        Value::Int32(_) => TAG_INT32,
        Value::Timestamp(_) => TAG_TIMESTAMP,
        Value::Int64(_) => TAG_INT64,
    };
    out.push(tag);
    write_cstring(out, key)?;
    match value {
        Value::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::String(v) => write_string(out, v),
        Value::Document(v) => write_document(out, v, depth + 1)?,
        Value::Array(v) => write_array(out, v, depth + 1)?,
        Value::Binary(Binary { subtype, bytes }) => {
            out.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
            out.push(*subtype);
            out.extend_from_slice(bytes);
        }
        Value::ObjectId(ObjectId(bytes)) => out.extend_from_slice(bytes),
        Value::Bool(v) => out.push(u8::from(*v)),
        Value::DateTime(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Null => {}
        Value::Regex { pattern, options } => {
            write_cstring(out, pattern)?;
            write_cstring(out, options)?;
        }
        Value::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Timestamp(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
    }
    Ok(())
}

fn write_cstring(out: &mut Vec<u8>, s: &str) -> Result<(), BsonError> {
    if s.as_bytes().contains(&0) {
        return Err(BsonError::NulInCString);
    }
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    Ok(())
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&((s.len() + 1) as i32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BsonError> {
        if self.buf.len() - self.pos < n {
            return Err(BsonError::UnexpectedEof);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, BsonError> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32, BsonError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, BsonError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, BsonError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, BsonError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    fn cstring(&mut self, what: &'static str) -> Result<&'a str, BsonError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(BsonError::UnexpectedEof)?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| BsonError::InvalidUtf8(what))?;
        self.pos += nul + 1;
        Ok(s)
    }
}

fn read_document(r: &mut Reader<'_>, depth: usize) -> Result<Document, BsonError> {
    if depth > MAX_DEPTH {
        return Err(BsonError::DepthExceeded);
    }
    let start = r.pos;
    let declared = r.i32()?;
    if declared < 5 || declared as usize > MAX_DOCUMENT_LEN {
        return Err(BsonError::InvalidLength);
    }
    let end = start + declared as usize;
    if end > r.buf.len() {
        return Err(BsonError::UnexpectedEof);
    }

    let mut doc = Document::new();
    loop {
        if r.pos >= end {
            return Err(BsonError::InvalidLength);
        }
        let tag = r.u8()?;
        if tag == 0 {
            break;
        }
        let key = r.cstring("key")?.to_string();
        let value = read_value(r, tag, depth)?;
        doc.try_insert(key, value)
            .map_err(|e| match e {
                crate::types::DocumentError::DuplicateKey(k) => BsonError::DuplicateKey(k),
            })?;
    }
    // The terminator must land exactly on the declared boundary.
    if r.pos != end {
        return Err(BsonError::InvalidLength);
    }
    Ok(doc)
}

fn read_array(r: &mut Reader<'_>, depth: usize) -> Result<Array, BsonError> {
    if depth > MAX_DEPTH {
        return Err(BsonError::DepthExceeded);
    }
    let start = r.pos;
    let declared = r.i32()?;
    if declared < 5 || declared as usize > MAX_DOCUMENT_LEN {
        return Err(BsonError::InvalidLength);
    }
    let end = start + declared as usize;
    if end > r.buf.len() {
        return Err(BsonError::UnexpectedEof);
    }

    let mut arr = Array::new();
    loop {
        if r.pos >= end {
            return Err(BsonError::InvalidLength);
        }
        let tag = r.u8()?;
        if tag == 0 {
            break;
        }
        let key = r.cstring("array index")?;
        // Array documents must carry sequential decimal indices.
        if key.parse::<usize>() != Ok(arr.len()) {
            return Err(BsonError::InvalidArrayKeys);
        }
        arr.push(read_value(r, tag, depth)?);
    }
    if r.pos != end {
        return Err(BsonError::InvalidLength);
    }
    Ok(arr)
}

fn read_value(r: &mut Reader<'_>, tag: u8, depth: usize) -> Result<Value, BsonError> {
    Ok(match tag {
        TAG_DOUBLE => Value::Double(r.f64()?),
        TAG_STRING => {
            let len = r.i32()?;
            if len < 1 {
                return Err(BsonError::InvalidLength);
            }
            let bytes = r.take(len as usize)?;
            let (body, nul) = bytes.split_at(len as usize - 1);
            if nul != [0] {
                return Err(BsonError::InvalidLength);
            }
            let s = std::str::from_utf8(body).map_err(|_| BsonError::InvalidUtf8("string"))?;
            Value::String(s.to_string())
        }
        TAG_DOCUMENT => Value::Document(read_document(r, depth + 1)?),
        TAG_ARRAY => Value::Array(read_array(r, depth + 1)?),
        TAG_BINARY => {
            let len = r.i32()?;
            if len < 0 {
                return Err(BsonError::InvalidLength);
            }
            let subtype = r.u8()?;
            let bytes = r.take(len as usize)?.to_vec();
            Value::Binary(Binary { subtype, bytes })
        }
        TAG_OBJECT_ID => {
            let bytes = r.take(12)?;
            Value::ObjectId(ObjectId(bytes.try_into().unwrap()))
        }
        TAG_BOOL => match r.u8()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            b => return Err(BsonError::InvalidBool(b)),
        },
        TAG_DATE_TIME => Value::DateTime(r.i64()?),
        TAG_NULL => Value::Null,
        TAG_REGEX => {
            let pattern = r.cstring("regex pattern")?.to_string();
            let options = r.cstring("regex options")?.to_string();
            Value::Regex { pattern, options }
        }
        TAG_INT32 => Value::Int32(r.i32()?),
        TAG_TIMESTAMP => Value::Timestamp(r.u64()?),
        TAG_INT64 => Value::Int64(r.i64()?),
        other => return Err(BsonError::InvalidTypeTag(other)),
    })
}
