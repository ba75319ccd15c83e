//! Tagged value model shared by every handler.
//!
//! A `Value` is a closed sum over the document-database kinds; documents and
//! arrays preserve insertion order, and order is part of document identity.

use indexmap::IndexMap;
use std::fmt;

/// Marshalled documents may not exceed this length.
pub const MAX_DOCUMENT_LEN: usize = 16 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
}

/// A 12-byte object id, rendered as 24 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub [u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        ObjectId(rand::random())
    }

    pub fn parse_hex(s: &str) -> Option<Self> {
        if s.len() != 24 {
            return None;
        }
        let mut bytes = [0u8; 12];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(ObjectId(bytes))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Binary value with its subtype byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub subtype: u8,
    pub bytes: Vec<u8>,
}

impl Binary {
    pub fn generic(bytes: Vec<u8>) -> Self {
        Binary { subtype: 0, bytes }
    }
}

pub type Array = Vec<Value>;

#[derive(Debug, Clone)]
pub enum Value {
    Double(f64),
    String(String),
    Document(Document),
    Array(Array),
    Binary(Binary),
    ObjectId(ObjectId),
    Bool(bool),
    /// Milliseconds since the Unix epoch, signed.
    DateTime(i64),
    Null,
    Regex {
        pattern: String,
        options: String,
    },
    Int32(i32),
    Timestamp(u64),
    Int64(i64),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Document(_) => "object",
            Value::Array(_) => "array",
            Value::Binary(_) => "binData",
            Value::ObjectId(_) => "objectId",
            Value::Bool(_) => "bool",
            Value::DateTime(_) => "date",
            Value::Null => "null",
            Value::Regex { .. } => "regex",
            Value::Int32(_) => "int",
            Value::Timestamp(_) => "timestamp",
            Value::Int64(_) => "long",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric coercion used by commands that accept any numeric kind
    /// (batchSize, limit, cursor ids from older drivers).
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::Double(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // Doubles are equal when both are NaN, or when the bit patterns
            // match exactly; 0.0 and -0.0 are therefore distinct.
            (Value::Double(a), Value::Double(b)) => {
                (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits()
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Document(a), Value::Document(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::ObjectId(a), Value::ObjectId(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (
                Value::Regex {
                    pattern: pa,
                    options: oa,
                },
                Value::Regex {
                    pattern: pb,
                    options: ob,
                },
            ) => pa == pb && oa == ob,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            _ => false,
        }
    }
}

/// An ordered mapping from unique string keys to values.
#[derive(Debug, Clone, Default)]
pub struct Document {
    entries: IndexMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace; a replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Insert, rejecting duplicate keys. Decoders construct documents through
    /// this so a wire document can never alias a key.
    pub fn try_insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), DocumentError> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(DocumentError::DuplicateKey(key));
        }
        self.entries.insert(key, value.into());
        Ok(())
    }

    /// Insert at the first position; `_id` injection uses this.
    pub fn insert_front(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.shift_insert(0, key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// The command name is the first key of a top-level document.
    pub fn command_name(&self) -> Option<&str> {
        self.entries.keys().next().map(|s| s.as_str())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(Value::as_document)
    }

    pub fn get_array(&self, key: &str) -> Option<&Array> {
        self.get(key).and_then(Value::as_array)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(Value::as_i32)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }
}

// IndexMap equality ignores order; document identity does not.
impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::String(v.clone())
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Document(v)
    }
}

impl From<Binary> for Value {
    fn from(v: Binary) -> Self {
        Value::Binary(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Build a `Document` literal, last write wins like `insert`. Keys are
/// string literals or string constants.
#[macro_export]
macro_rules! doc {
    () => { $crate::types::Document::new() };
    ($($key:tt : $val:expr),+ $(,)?) => {{
        let mut d = $crate::types::Document::new();
        $( d.insert($key, $crate::types::Value::from($val)); )+
        d
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_preserves_insertion_order() {
        let mut d = Document::new();
        d.insert("zebra", 1i32);
        d.insert("apple", 2i32);
        d.insert("mango", 3i32);
        let keys: Vec<&String> = d.keys().collect();
        assert_eq!(keys, ["zebra", "apple", "mango"]);
        assert_eq!(d.command_name(), Some("zebra"));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut d = Document::new();
        d.try_insert("a", 1i32).unwrap();
        let err = d.try_insert("a", 2i32).unwrap_err();
        assert!(matches!(err, DocumentError::DuplicateKey(k) if k == "a"));
        assert_eq!(d.get_i32("a"), Some(1));
    }

    #[test]
    fn test_double_equality_bit_patterns() {
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_eq!(
            Value::Double(f64::NAN),
            Value::Double(f64::from_bits(f64::NAN.to_bits() | 1))
        );
        assert_ne!(Value::Double(0.0), Value::Double(-0.0));
        assert_eq!(Value::Double(1.5), Value::Double(1.5));
        assert_ne!(Value::Double(1.5), Value::Double(1.6));
        assert_eq!(
            Value::Double(f64::INFINITY),
            Value::Double(f64::INFINITY)
        );
        assert_ne!(
            Value::Double(f64::INFINITY),
            Value::Double(f64::NEG_INFINITY)
        );
    }

    #[test]
    fn test_document_equality_is_order_sensitive() {
        let mut a = Document::new();
        a.insert("x", 1i32);
        a.insert("y", 2i32);
        let mut b = Document::new();
        b.insert("y", 2i32);
        b.insert("x", 1i32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_object_id_hex_round_trip() {
        let id = ObjectId::new();
        let hex = id.to_string();
        assert_eq!(hex.len(), 24);
        assert_eq!(ObjectId::parse_hex(&hex), Some(id));
        assert_eq!(ObjectId::parse_hex("zz"), None);
    }

    #[test]
    fn test_doc_macro() {
        let d = doc! {"find": "users", "batchSize": 2i32, "ok": 1.0};
        assert_eq!(d.command_name(), Some("find"));
        assert_eq!(d.get_str("find"), Some("users"));
        assert_eq!(d.get_i32("batchSize"), Some(2));
        assert_eq!(d.get_f64("ok"), Some(1.0));
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Value::Int32(5).as_int(), Some(5));
        assert_eq!(Value::Int64(5).as_int(), Some(5));
        assert_eq!(Value::Double(5.0).as_int(), Some(5));
        assert_eq!(Value::Double(5.5).as_int(), None);
        assert_eq!(Value::String("5".into()).as_int(), None);
    }
}
