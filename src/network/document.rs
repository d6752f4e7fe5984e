//! Self-describing document wire format
//!
//! Every message on the wire is one document: a little-endian u32 total
//! length, a sequence of named typed elements, and a zero terminator.
//! Element names are byte strings and lookup returns the first match.
//!
//! Element types carried on the wire:
//! - string (0x02)
//! - nested document (0x03)
//! - binary with a one-byte subtype tag (0x05)
//! - i32 (0x10)
//! - i64 (0x12)

use bytes::BufMut;

/// Binary subtype tag for an ECDH point.
pub const BIN_POINT: u8 = b'c';

/// Binary subtype tag for a SHA-256 digest.
pub const BIN_DIGEST: u8 = b's';

/// Binary subtype tag for generic bytes.
pub const BIN_GENERIC: u8 = 1;

const TYPE_STRING: u8 = 0x02;
const TYPE_DOC: u8 = 0x03;
const TYPE_BINARY: u8 = 0x05;
const TYPE_INT32: u8 = 0x10;
const TYPE_INT64: u8 = 0x12;

/// Error while decoding a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    /// Document shorter than its header or cut off mid-element
    Truncated,
    /// Length prefix disagrees with the buffer
    BadLength,
    /// Element carries an unsupported type tag
    UnknownType(u8),
    /// String value is not valid UTF-8
    BadString,
    /// Element index out of range
    OutOfRange(usize),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocError::Truncated => write!(f, "truncated document"),
            DocError::BadLength => write!(f, "length prefix mismatch"),
            DocError::UnknownType(t) => write!(f, "unknown element type 0x{:02x}", t),
            DocError::BadString => write!(f, "string value is not valid UTF-8"),
            DocError::OutOfRange(i) => write!(f, "no element at index {}", i),
        }
    }
}

impl std::error::Error for DocError {}

/// Builder for an outgoing document.
///
/// Appends elements in order and finishes with [`DocBuilder::build`],
/// which patches the length prefix and adds the terminator.
#[derive(Debug)]
pub struct DocBuilder {
    buf: Vec<u8>,
}

impl DocBuilder {
    /// Start an empty document.
    pub fn new() -> Self {
        Self { buf: vec![0; 4] }
    }

    fn key(&mut self, ty: u8, name: &str) {
        self.buf.put_u8(ty);
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.put_u8(0);
    }

    /// Append a string element.
    pub fn append_string(mut self, name: &str, value: &str) -> Self {
        self.key(TYPE_STRING, name);
        self.buf.put_i32_le(value.len() as i32 + 1);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.put_u8(0);
        self
    }

    /// Append an i32 element.
    pub fn append_int32(mut self, name: &str, value: i32) -> Self {
        self.key(TYPE_INT32, name);
        self.buf.put_i32_le(value);
        self
    }

    /// Append an i64 element.
    pub fn append_int64(mut self, name: &str, value: i64) -> Self {
        self.key(TYPE_INT64, name);
        self.buf.put_i64_le(value);
        self
    }

    /// Append a binary element with a subtype tag.
    pub fn append_binary(mut self, name: &str, subtype: u8, data: &[u8]) -> Self {
        self.key(TYPE_BINARY, name);
        self.buf.put_i32_le(data.len() as i32);
        self.buf.put_u8(subtype);
        self.buf.extend_from_slice(data);
        self
    }

    /// Append a nested document element from its encoded bytes.
    pub fn append_document(mut self, name: &str, doc: &[u8]) -> Self {
        self.key(TYPE_DOC, name);
        self.buf.extend_from_slice(doc);
        self
    }

    /// Finish: write the length prefix and terminator.
    pub fn build(mut self) -> Vec<u8> {
        self.buf.put_u8(0);
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_le_bytes());
        self.buf
    }
}

impl Default for DocBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An encoded empty document.
pub fn empty_doc() -> Vec<u8> {
    DocBuilder::new().build()
}

/// Total length a document claims in its 4-byte prefix, if present.
pub fn declared_len(bytes: &[u8]) -> Option<usize> {
    let prefix = bytes.get(..4)?;
    let len = u32::from_le_bytes(prefix.try_into().ok()?);
    Some(len as usize)
}

/// Borrowed view over an encoded document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Doc<'a> {
    bytes: &'a [u8],
}

impl<'a> Doc<'a> {
    /// Wrap encoded bytes. Structure is validated during iteration.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// The raw encoded bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Whether the length prefix matches the buffer exactly.
    pub fn is_well_framed(&self) -> bool {
        declared_len(self.bytes) == Some(self.bytes.len()) && self.bytes.len() >= 5
    }

    /// Decode all elements in order.
    pub fn elements(&self) -> Result<Vec<Element<'a>>, DocError> {
        if self.bytes.len() < 5 {
            return Err(DocError::Truncated);
        }
        let end = self.bytes.len() - 1;
        let mut out = Vec::new();
        let mut rest = &self.bytes[4..end];
        while !rest.is_empty() {
            let (elem, tail) = parse_element(rest)?;
            out.push(elem);
            rest = tail;
        }
        Ok(out)
    }

    /// Decode the element at `index`.
    pub fn element(&self, index: usize) -> Result<Element<'a>, DocError> {
        let elems = self.elements()?;
        elems.into_iter().nth(index).ok_or(DocError::OutOfRange(index))
    }

    /// First element whose name matches, by byte comparison.
    pub fn lookup(&self, name: &str) -> Option<Value<'a>> {
        let elems = self.elements().ok()?;
        elems
            .into_iter()
            .find(|e| e.key_bytes() == name.as_bytes())
            .map(|e| e.value)
    }
}

/// One decoded element: a name and a typed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Element<'a> {
    raw: &'a [u8],
    key: &'a [u8],
    value: Value<'a>,
}

impl<'a> Element<'a> {
    /// Element name as raw bytes.
    pub fn key_bytes(&self) -> &'a [u8] {
        self.key
    }

    /// The typed value.
    pub fn value(&self) -> Value<'a> {
        self.value
    }

    /// The encoded bytes of this element (type tag through value end).
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    /// Copy this element out of its backing document.
    pub fn to_owned(&self) -> OwnedElement {
        OwnedElement { bytes: self.raw.to_vec() }
    }
}

/// A decoded element value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    /// UTF-8 string
    String(&'a str),
    /// 32-bit integer
    Int32(i32),
    /// 64-bit integer
    Int64(i64),
    /// Binary blob with subtype tag
    Binary { subtype: u8, data: &'a [u8] },
    /// Nested document
    Doc(Doc<'a>),
}

impl<'a> Value<'a> {
    /// String value, if this is a string.
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// i32 value, if this is an i32.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// i64 value, if this is an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Subtype and bytes, if this is a binary blob.
    pub fn as_binary(&self) -> Option<(u8, &'a [u8])> {
        match self {
            Value::Binary { subtype, data } => Some((*subtype, data)),
            _ => None,
        }
    }

    /// Nested document, if this is one.
    pub fn as_doc(&self) -> Option<Doc<'a>> {
        match self {
            Value::Doc(d) => Some(*d),
            _ => None,
        }
    }
}

/// An element copied out of its backing document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedElement {
    bytes: Vec<u8>,
}

impl OwnedElement {
    /// The encoded element bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decode the element name.
    pub fn key_bytes(&self) -> &[u8] {
        let Some(rest) = self.bytes.get(1..) else { return &[] };
        match rest.iter().position(|&b| b == 0) {
            Some(n) => &rest[..n],
            None => &[],
        }
    }

    /// Decode the value.
    pub fn value(&self) -> Result<Value<'_>, DocError> {
        parse_element(&self.bytes).map(|(elem, _)| elem.value)
    }
}

fn take_i32(bytes: &[u8]) -> Result<(i32, &[u8]), DocError> {
    let prefix = bytes.get(..4).ok_or(DocError::Truncated)?;
    let v = i32::from_le_bytes(prefix.try_into().map_err(|_| DocError::Truncated)?);
    Ok((v, &bytes[4..]))
}

/// Parse one element off the front of `bytes`, returning it and the rest.
fn parse_element(bytes: &[u8]) -> Result<(Element<'_>, &[u8]), DocError> {
    let raw_start = bytes;
    let (&ty, rest) = bytes.split_first().ok_or(DocError::Truncated)?;
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(DocError::Truncated)?;
    let key = &rest[..nul];
    let rest = &rest[nul + 1..];

    let (value, rest) = match ty {
        TYPE_STRING => {
            let (len, rest) = take_i32(rest)?;
            let len = usize::try_from(len).map_err(|_| DocError::Truncated)?;
            if len == 0 || rest.len() < len {
                return Err(DocError::Truncated);
            }
            let s = std::str::from_utf8(&rest[..len - 1]).map_err(|_| DocError::BadString)?;
            (Value::String(s), &rest[len..])
        }
        TYPE_INT32 => {
            let (v, rest) = take_i32(rest)?;
            (Value::Int32(v), rest)
        }
        TYPE_INT64 => {
            let prefix = rest.get(..8).ok_or(DocError::Truncated)?;
            let v = i64::from_le_bytes(prefix.try_into().map_err(|_| DocError::Truncated)?);
            (Value::Int64(v), &rest[8..])
        }
        TYPE_BINARY => {
            let (len, rest) = take_i32(rest)?;
            let len = usize::try_from(len).map_err(|_| DocError::Truncated)?;
            let (&subtype, rest) = rest.split_first().ok_or(DocError::Truncated)?;
            if rest.len() < len {
                return Err(DocError::Truncated);
            }
            (Value::Binary { subtype, data: &rest[..len] }, &rest[len..])
        }
        TYPE_DOC => {
            let len = declared_len(rest).ok_or(DocError::Truncated)?;
            if len < 5 || rest.len() < len {
                return Err(DocError::Truncated);
            }
            (Value::Doc(Doc::new(&rest[..len])), &rest[len..])
        }
        other => return Err(DocError::UnknownType(other)),
    };

    let consumed = raw_start.len() - rest.len();
    Ok((
        Element { raw: &raw_start[..consumed], key, value },
        rest,
    ))
}
