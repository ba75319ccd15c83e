//! Schema-carrying JSON round-trip for the value model.
//!
//! JSON alone cannot tell an int32 from an int64 from a double, or binary
//! from a string. Every document serialised here is therefore paired with a
//! `Schema`: a tree recording the kind tag at each position (and the subtype
//! for binary values). `decode(encode(d).json, encode(d).schema)` returns a
//! document identical to `d`, including NaN, ±Inf and ±0 doubles.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::types::{Binary, Document, ObjectId, Value};

#[derive(thiserror::Error, Debug)]
pub enum ExtJsonError {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn mismatch(msg: impl Into<String>) -> ExtJsonError {
    ExtJsonError::SchemaMismatch(msg.into())
}

/// Kind tag for one position of a document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Schema {
    Double,
    String,
    Object { fields: Vec<(String, Schema)> },
    Array { items: Vec<Schema> },
    BinData { subtype: u8 },
    ObjectId,
    Bool,
    Date,
    Null,
    Regex,
    Int,
    Timestamp,
    Long,
}

/// Serialise a document to JSON bytes plus the schema that makes the bytes
/// unambiguous.
pub fn encode(doc: &Document) -> Result<(Vec<u8>, Schema), ExtJsonError> {
    let (json, schema) = encode_value_tree(doc)?;
    Ok((serde_json::to_vec(&json)?, schema))
}

fn encode_value_tree(doc: &Document) -> Result<(serde_json::Value, Schema), ExtJsonError> {
    let mut map = serde_json::Map::with_capacity(doc.len());
    let mut fields = Vec::with_capacity(doc.len());
    for (key, value) in doc.iter() {
        let (json, schema) = encode_value(value)?;
        map.insert(key.clone(), json);
        fields.push((key.clone(), schema));
    }
    Ok((serde_json::Value::Object(map), Schema::Object { fields }))
}

fn encode_value(value: &Value) -> Result<(serde_json::Value, Schema), ExtJsonError> {
    Ok(match value {
        Value::Double(v) => (encode_double(*v), Schema::Double),
        Value::String(v) => (json!(v), Schema::String),
        Value::Document(d) => encode_value_tree(d)?,
        Value::Array(a) => {
            let mut items = Vec::with_capacity(a.len());
            let mut out = Vec::with_capacity(a.len());
            for v in a {
                let (json, schema) = encode_value(v)?;
                out.push(json);
                items.push(schema);
            }
            (serde_json::Value::Array(out), Schema::Array { items })
        }
        Value::Binary(Binary { subtype, bytes }) => (
            json!(BASE64.encode(bytes)),
            Schema::BinData { subtype: *subtype },
        ),
        Value::ObjectId(oid) => (json!(oid.to_string()), Schema::ObjectId),
        Value::Bool(v) => (json!(v), Schema::Bool),
        Value::DateTime(v) => (json!(v), Schema::Date),
        Value::Null => (serde_json::Value::Null, Schema::Null),
        Value::Regex { pattern, options } => (
            json!({"pattern": pattern, "options": options}),
            Schema::Regex,
        ),
        Value::Int32(v) => (json!(v), Schema::Int),
        Value::Timestamp(v) => (json!(v), Schema::Timestamp),
        Value::Int64(v) => (json!(v), Schema::Long),
    })
}

// Non-finite doubles have no JSON number form; they travel as marker strings
// and the schema tag routes them back.
fn encode_double(v: f64) -> serde_json::Value {
    if v.is_nan() {
        json!("NaN")
    } else if v == f64::INFINITY {
        json!("Infinity")
    } else if v == f64::NEG_INFINITY {
        json!("-Infinity")
    } else {
        json!(v)
    }
}

/// Rebuild a document from JSON bytes and its schema. Key order comes from
/// the schema; a JSON field the schema does not know (or vice versa) is a
/// `SchemaMismatch`.
pub fn decode(json: &[u8], schema: &Schema) -> Result<Document, ExtJsonError> {
    let parsed: serde_json::Value = serde_json::from_slice(json)?;
    match schema {
        Schema::Object { .. } => match decode_value(&parsed, schema)? {
            Value::Document(d) => Ok(d),
            _ => unreachable!("object schema decodes to a document"),
        },
        _ => Err(mismatch("top-level schema must be an object")),
    }
}

fn decode_value(json: &serde_json::Value, schema: &Schema) -> Result<Value, ExtJsonError> {
    Ok(match schema {
        Schema::Double => Value::Double(decode_double(json)?),
        Schema::String => Value::String(expect_str(json, "string")?.to_string()),
        Schema::Object { fields } => {
            let map = json
                .as_object()
                .ok_or_else(|| mismatch(format!("expected object, got {json}")))?;
            let mut doc = Document::new();
            for (key, field_schema) in fields {
                let field = map
                    .get(key)
                    .ok_or_else(|| mismatch(format!("missing field {key:?}")))?;
                doc.try_insert(key.clone(), decode_value(field, field_schema)?)
                    .map_err(|_| mismatch(format!("schema repeats field {key:?}")))?;
            }
            if map.len() != fields.len() {
                let unknown = map
                    .keys()
                    .find(|k| !fields.iter().any(|(name, _)| name == *k));
                return Err(mismatch(format!(
                    "unknown field {:?}",
                    unknown.map(String::as_str).unwrap_or("?")
                )));
            }
            Value::Document(doc)
        }
        Schema::Array { items } => {
            let arr = json
                .as_array()
                .ok_or_else(|| mismatch(format!("expected array, got {json}")))?;
            if arr.len() != items.len() {
                return Err(mismatch(format!(
                    "array length {} does not match schema length {}",
                    arr.len(),
                    items.len()
                )));
            }
            Value::Array(
                arr.iter()
                    .zip(items)
                    .map(|(v, s)| decode_value(v, s))
                    .collect::<Result<_, _>>()?,
            )
        }
        Schema::BinData { subtype } => {
            let b64 = expect_str(json, "binData")?;
            let bytes = BASE64
                .decode(b64)
                .map_err(|_| mismatch("invalid base64 in binData"))?;
            Value::Binary(Binary {
                subtype: *subtype,
                bytes,
            })
        }
        Schema::ObjectId => {
            let hex = expect_str(json, "objectId")?;
            Value::ObjectId(
                ObjectId::parse_hex(hex).ok_or_else(|| mismatch("invalid objectId hex"))?,
            )
        }
        Schema::Bool => Value::Bool(
            json.as_bool()
                .ok_or_else(|| mismatch(format!("expected bool, got {json}")))?,
        ),
        Schema::Date => Value::DateTime(
            json.as_i64()
                .ok_or_else(|| mismatch(format!("expected date millis, got {json}")))?,
        ),
        Schema::Null => {
            if !json.is_null() {
                return Err(mismatch(format!("expected null, got {json}")));
            }
            Value::Null
        }
        Schema::Regex => {
            let obj = json
                .as_object()
                .ok_or_else(|| mismatch("expected regex object"))?;
            let pattern = obj
                .get("pattern")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| mismatch("regex missing pattern"))?;
            let options = obj
                .get("options")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| mismatch("regex missing options"))?;
            Value::Regex {
                pattern: pattern.to_string(),
                options: options.to_string(),
            }
        }
        Schema::Int => Value::Int32(
            json.as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| mismatch(format!("expected int32, got {json}")))?,
        ),
        Schema::Timestamp => Value::Timestamp(
            json.as_u64()
                .ok_or_else(|| mismatch(format!("expected timestamp, got {json}")))?,
        ),
        Schema::Long => Value::Int64(
            json.as_i64()
                .ok_or_else(|| mismatch(format!("expected int64, got {json}")))?,
        ),
    })
}

fn decode_double(json: &serde_json::Value) -> Result<f64, ExtJsonError> {
    match json {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| mismatch("number out of double range")),
        serde_json::Value::String(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => Err(mismatch(format!("expected double, got {other:?}"))),
        },
        other => Err(mismatch(format!("expected double, got {other}"))),
    }
}

fn expect_str<'a>(json: &'a serde_json::Value, what: &str) -> Result<&'a str, ExtJsonError> {
    json.as_str()
        .ok_or_else(|| mismatch(format!("expected {what} string, got {json}")))
}

/// Schemaless projection of a value into plain JSON, used by the HTTP
/// surface for responses.
pub fn relaxed_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Double(v) => encode_double(*v),
        Value::String(v) => json!(v),
        Value::Document(d) => {
            let mut map = serde_json::Map::with_capacity(d.len());
            for (k, v) in d.iter() {
                map.insert(k.clone(), relaxed_to_json(v));
            }
            serde_json::Value::Object(map)
        }
        Value::Array(a) => serde_json::Value::Array(a.iter().map(relaxed_to_json).collect()),
        Value::Binary(Binary { bytes, .. }) => json!(BASE64.encode(bytes)),
        Value::ObjectId(oid) => json!(oid.to_string()),
        Value::Bool(v) => json!(v),
        Value::DateTime(v) => json!(v),
        Value::Null => serde_json::Value::Null,
        Value::Regex { pattern, options } => json!({"pattern": pattern, "options": options}),
        Value::Int32(v) => json!(v),
        Value::Timestamp(v) => json!(v),
        Value::Int64(v) => json!(v),
    }
}

/// Schemaless interpretation of incoming plain JSON, used by the HTTP
/// surface for requests. Integral numbers in int32 range become `Int32`,
/// other integral numbers `Int64`, everything else `Double`.
pub fn relaxed_from_json(json: &serde_json::Value) -> Result<Value, ExtJsonError> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                match i32::try_from(i) {
                    Ok(small) => Value::Int32(small),
                    Err(_) => Value::Int64(i),
                }
            } else {
                Value::Double(n.as_f64().ok_or_else(|| mismatch("unrepresentable number"))?)
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(a) => Value::Array(
            a.iter()
                .map(relaxed_from_json)
                .collect::<Result<_, _>>()?,
        ),
        serde_json::Value::Object(map) => {
            let mut doc = Document::new();
            for (k, v) in map {
                doc.try_insert(k.clone(), relaxed_from_json(v)?)
                    .map_err(|_| mismatch(format!("duplicate field {k:?}")))?;
            }
            Value::Document(doc)
        }
    })
}

/// Convenience wrapper for HTTP request bodies that must be documents.
pub fn relaxed_document_from_json(json: &serde_json::Value) -> Result<Document, ExtJsonError> {
    match relaxed_from_json(json)? {
        Value::Document(d) => Ok(d),
        other => Err(mismatch(format!(
            "expected a JSON object, got {}",
            other.type_name()
        ))),
    }
}
