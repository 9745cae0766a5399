//! Tagged cell values shared by every driver and by the JSON-RPC wire format.
//!
//! Grounded on the teacher's per-driver `extract_value` functions
//! (`drivers/sqlite/extract.rs`, `drivers/postgres/extract.rs`) and blob wire
//! format (`drivers/common.rs`), generalised into a single sum type so the
//! registry, cache, and RPC layers never match on driver-specific row types.

use serde_json::{Number, Value as Json};

/// A single cell value. Every variant carries its own payload, including
/// `Null`, so "NULL of type T" and "absence of a tag" are never conflated —
/// callers that need the declared type of a NULL keep it alongside the
/// column metadata, not inside this enum.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
    /// ISO-8601 date fragment, stored verbatim as driver-reported text.
    Date(String),
    /// ISO-8601 timestamp, stored verbatim as driver-reported text.
    Timestamp(String),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Bool(_) => "bool",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Serialises into the wire shape of spec.md §4.2: BLOB becomes lowercase
    /// hex, DATE/TIMESTAMP remain plain strings, everything else maps to the
    /// obvious JSON primitive.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Int(n) => Json::Number((*n).into()),
            Value::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::Text(s) => Json::String(s.clone()),
            Value::Blob(bytes) => Json::String(hex_lower(bytes)),
            Value::Bool(b) => Json::Bool(*b),
            Value::Date(s) => Json::String(s.clone()),
            Value::Timestamp(s) => Json::String(s.clone()),
        }
    }

    /// Parses a bound parameter out of JSON per the ordered rule of spec.md
    /// §4.2: null → NULL; boolean → BOOL; integral number → INT; other
    /// number → FLOAT; string → TEXT. There is no way to address a BLOB,
    /// DATE, or TIMESTAMP literal from this path — those are only ever
    /// produced by a driver reading a column of declared type; a caller that
    /// needs to bind one supplies it as a TEXT or a hex-decoded raw fragment
    /// via the `raw` filter operator.
    pub fn from_json(json: &Json) -> Result<Value, String> {
        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(format!("number {} is out of range", n))
                }
            }
            Json::String(s) => Ok(Value::Text(s.clone())),
            other => Err(format!("cannot bind JSON value as a parameter: {}", other)),
        }
    }

    /// Parses a BLOB column value's hex wire form back into raw bytes.
    /// Only used when a caller round-trips a previously-emitted BLOB cell.
    pub fn blob_from_hex(hex: &str) -> Result<Value, String> {
        decode_hex(hex).map(Value::Blob)
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("hex string must have even length".to_string());
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for chunk in bytes.chunks(2) {
        let hi = (chunk[0] as char).to_digit(16).ok_or("invalid hex digit")?;
        let lo = (chunk[1] as char).to_digit(16).ok_or("invalid hex digit")?;
        out.push(((hi << 4) | lo) as u8);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) {
        let json = v.to_json();
        let back = match &v {
            Value::Blob(bytes) => Value::blob_from_hex(&hex_lower(bytes)).unwrap(),
            _ => Value::from_json(&json).unwrap(),
        };
        assert_eq!(back, v, "roundtrip mismatch for {:?}", v);
    }

    #[test]
    fn value_roundtrip_null() {
        roundtrip(Value::Null);
    }

    #[test]
    fn value_roundtrip_int() {
        roundtrip(Value::Int(-42));
        roundtrip(Value::Int(i64::MAX));
        roundtrip(Value::Int(0));
    }

    #[test]
    fn value_roundtrip_bool() {
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
    }

    #[test]
    fn value_roundtrip_text() {
        roundtrip(Value::Text("hello, 'world'".to_string()));
        roundtrip(Value::Text(String::new()));
    }

    #[test]
    fn value_roundtrip_date_timestamp() {
        roundtrip(Value::Date("2024-01-15".to_string()));
        roundtrip(Value::Timestamp("2024-01-15T10:30:00Z".to_string()));
    }

    #[test]
    fn value_roundtrip_blob() {
        roundtrip(Value::Blob(vec![0, 1, 2, 255, 254, 16]));
        roundtrip(Value::Blob(vec![]));
    }

    #[test]
    fn value_float_roundtrip_within_one_ulp() {
        for f in [0.1_f64, -3.5, 1e300, f64::MIN_POSITIVE, 123456.789] {
            let v = Value::Float(f);
            let back = Value::from_json(&v.to_json()).unwrap();
            match back {
                Value::Float(g) => assert!((f - g).abs() <= f64::EPSILON * f.abs().max(1.0)),
                other => panic!("expected float, got {:?}", other),
            }
        }
    }

    #[test]
    fn blob_acquires_hex_encoding_on_first_emission() {
        let v = Value::Blob(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(v.to_json(), Json::String("deadbeef".to_string()));
    }

    #[test]
    fn from_json_rejects_arrays_and_objects() {
        assert!(Value::from_json(&serde_json::json!([1, 2])).is_err());
        assert!(Value::from_json(&serde_json::json!({"a": 1})).is_err());
    }
}
