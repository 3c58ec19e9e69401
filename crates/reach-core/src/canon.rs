//! Canonical JSON encoding and SHA-256 hashing.
//!
//! Every hashed byte in Reach passes through this module. Object keys are
//! emitted in UTF-8 byte order, arrays keep their order, floats are snapped
//! to a 1e-9 grid, and nesting is capped so hostile inputs cannot recurse
//! without bound. The encoder writes into any [`ByteSink`], which lets the
//! fingerprint code feed a hasher directly instead of buffering whole logs.

use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::error::{ReachError, Result};

/// Maximum nesting depth accepted on the hash path.
pub const DEFAULT_MAX_DEPTH: usize = 25;

/// Containers an event payload adds around the values it carries.
/// `artifact.patch` is the deepest: `{"changes": [{"after": value}]}`.
pub const EVENT_ENVELOPE_DEPTH: usize = 3;

/// Cap for event payloads, so any value accepted at [`DEFAULT_MAX_DEPTH`]
/// still hashes once it is wrapped in an event.
pub const EVENT_MAX_DEPTH: usize = DEFAULT_MAX_DEPTH + EVENT_ENVELOPE_DEPTH;

/// Grid that floats are rounded onto before encoding.
pub const FLOAT_PRECISION: f64 = 1e-9;

/// Destination for canonical bytes.
pub trait ByteSink {
    fn put(&mut self, bytes: &[u8]);
}

impl ByteSink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl ByteSink for Sha256 {
    fn put(&mut self, bytes: &[u8]) {
        Digest::update(self, bytes);
    }
}

/// Canonical encoder with a configurable depth cap.
#[derive(Debug, Clone, Copy)]
pub struct Canonicalizer {
    max_depth: usize,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl Canonicalizer {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Encode `value` into a fresh buffer.
    pub fn to_bytes(&self, value: &Value) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write(value, &mut out)?;
        Ok(out)
    }

    /// Hash the canonical form of `value` without materializing it.
    pub fn hash(&self, value: &Value) -> Result<String> {
        let mut hasher = Sha256::new();
        self.write(value, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// Stream the canonical form of `value` into `sink`.
    pub fn write<S: ByteSink>(&self, value: &Value, sink: &mut S) -> Result<()> {
        self.write_value(value, 0, sink)
    }

    fn write_value<S: ByteSink>(&self, value: &Value, depth: usize, sink: &mut S) -> Result<()> {
        match value {
            Value::Null => sink.put(b"null"),
            Value::Bool(true) => sink.put(b"true"),
            Value::Bool(false) => sink.put(b"false"),
            Value::Number(n) => sink.put(format_number(n).as_bytes()),
            Value::String(s) => write_string(s, sink),
            Value::Array(items) => {
                let depth = self.enter(depth)?;
                sink.put(b"[");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        sink.put(b",");
                    }
                    self.write_value(item, depth, sink)?;
                }
                sink.put(b"]");
            }
            Value::Object(map) => {
                let depth = self.enter(depth)?;
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
                sink.put(b"{");
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        sink.put(b",");
                    }
                    write_string(key, sink);
                    sink.put(b":");
                    self.write_value(&map[key.as_str()], depth, sink)?;
                }
                sink.put(b"}");
            }
        }
        Ok(())
    }

    fn enter(&self, depth: usize) -> Result<usize> {
        let next = depth + 1;
        if next > self.max_depth {
            return Err(ReachError::Schema(format!(
                "nesting depth {} exceeds limit of {}",
                next, self.max_depth
            )));
        }
        Ok(next)
    }
}

/// Canonical bytes of `value` with the default depth cap.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>> {
    Canonicalizer::default().to_bytes(value)
}

/// Canonical form as a `String`. The encoder only emits valid UTF-8.
pub fn canonical_string(value: &Value) -> Result<String> {
    String::from_utf8(canonicalize(value)?)
        .map_err(|e| ReachError::Internal(format!("canonical output not UTF-8: {}", e)))
}

/// SHA-256 of the canonical form of `value`.
pub fn canonical_hash(value: &Value) -> Result<String> {
    Canonicalizer::default().hash(value)
}

/// Serialize any `T` through serde and hash its canonical form.
pub fn hash_serialize<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)
        .map_err(|e| ReachError::Schema(format!("value has no canonical form: {}", e)))?;
    canonical_hash(&value)
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// True for a 64-character lowercase hex digest.
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Snap a float onto the 1e-9 grid. NaN becomes 0, infinities saturate.
pub fn normalize_float(v: f64) -> f64 {
    if v.is_nan() {
        return 0.0;
    }
    if v == f64::INFINITY {
        return f64::MAX;
    }
    if v == f64::NEG_INFINITY {
        return f64::MIN;
    }
    let scaled = v / FLOAT_PRECISION;
    // Past ~1.8e299 the grid index overflows; such values are far coarser
    // than the grid already.
    if !scaled.is_finite() {
        return v;
    }
    let snapped = scaled.round() / 1e9;
    if snapped == 0.0 {
        0.0
    } else {
        snapped
    }
}

/// Build a JSON number from a float after normalization.
pub fn float_value(v: f64) -> Value {
    Number::from_f64(normalize_float(v))
        .map(Value::Number)
        .unwrap_or_else(|| Value::from(0))
}

/// Copy of `value` with every non-integer number normalized.
pub fn normalize_value(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => float_value(n.as_f64().unwrap_or(0.0)),
        Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn format_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    format_float(n.as_f64().unwrap_or(0.0))
}

fn format_float(v: f64) -> String {
    let v = normalize_float(v);
    if v == 0.0 {
        return "0".to_string();
    }
    // Display never uses exponent notation and drops ".0" on integral values.
    format!("{}", v)
}

fn write_string<S: ByteSink>(s: &str, sink: &mut S) {
    sink.put(b"\"");
    let bytes = s.as_bytes();
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        let escape: Option<&[u8]> = match b {
            b'"' => Some(b"\\\""),
            b'\\' => Some(b"\\\\"),
            b'\n' => Some(b"\\n"),
            b'\r' => Some(b"\\r"),
            b'\t' => Some(b"\\t"),
            _ => None,
        };
        if let Some(esc) = escape {
            sink.put(&bytes[start..i]);
            sink.put(esc);
            start = i + 1;
        } else if b < 0x20 {
            sink.put(&bytes[start..i]);
            sink.put(format!("\\u{:04x}", b).as_bytes());
            start = i + 1;
        }
    }
    sink.put(&bytes[start..]);
    sink.put(b"\"");
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn nested_arrays(depth: usize) -> Value {
        let mut v = json!(1);
        for _ in 0..depth {
            v = Value::Array(vec![v]);
        }
        v
    }

    #[test]
    fn test_keys_sorted_recursively() {
        let v = json!({"b": {"z": 1, "a": 2}, "a": [3, 1]});
        assert_eq!(
            canonical_string(&v).unwrap(),
            r#"{"a":[3,1],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn test_key_order_invariance() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
    }

    #[test]
    fn test_array_order_sensitivity() {
        assert_ne!(
            canonical_hash(&json!([1, 2, 3])).unwrap(),
            canonical_hash(&json!([3, 2, 1])).unwrap()
        );
    }

    #[test]
    fn test_noisy_float_matches_literal() {
        let noisy = json!({"x": 0.1 + 0.2});
        let clean = json!({"x": 0.3});
        assert_eq!(canonical_string(&noisy).unwrap(), r#"{"x":0.3}"#);
        assert_eq!(canonical_hash(&noisy).unwrap(), canonical_hash(&clean).unwrap());
    }

    #[test]
    fn test_float_special_values() {
        assert_eq!(normalize_float(f64::NAN), 0.0);
        assert_eq!(normalize_float(f64::INFINITY), f64::MAX);
        assert_eq!(normalize_float(f64::NEG_INFINITY), f64::MIN);
        assert_eq!(normalize_float(-0.0).to_bits(), 0.0f64.to_bits());
        assert_eq!(normalize_float(1.0000000001), 1.0);
    }

    #[test]
    fn test_large_floats_are_normalized() {
        assert_eq!(canonical_string(&json!(2000000.0000000002)).unwrap(), "2000000");
        assert_eq!(normalize_float(12345678.000000000001), 12345678.0);
        assert_eq!(normalize_float(f64::MAX), f64::MAX);
        assert_eq!(normalize_float(f64::MIN), f64::MIN);
        assert!(normalize_float(1.0e300).is_finite());
    }

    #[test]
    fn test_integral_float_has_no_fraction() {
        assert_eq!(canonical_string(&json!(2.0)).unwrap(), "2");
        assert_eq!(canonical_string(&json!(-17.0)).unwrap(), "-17");
        assert_eq!(canonical_string(&json!(1.5)).unwrap(), "1.5");
    }

    #[test]
    fn test_string_escapes() {
        let v = json!("a\"b\\c\nd\re\tf\u{1}g é");
        assert_eq!(
            canonical_string(&v).unwrap(),
            "\"a\\\"b\\\\c\\nd\\re\\tf\\u0001g é\""
        );
    }

    #[test]
    fn test_null_emitted_explicitly() {
        assert_eq!(canonical_string(&json!({"a": null})).unwrap(), r#"{"a":null}"#);
    }

    #[test]
    fn test_depth_cap() {
        assert!(canonicalize(&nested_arrays(25)).is_ok());
        let err = canonicalize(&nested_arrays(26)).unwrap_err();
        assert_eq!(err.code(), "E_SCHEMA");
    }

    #[test]
    fn test_custom_depth() {
        let c = Canonicalizer::new(2);
        assert!(c.to_bytes(&json!({"a": [1]})).is_ok());
        assert!(c.to_bytes(&json!({"a": [[1]]})).is_err());
    }

    #[test]
    fn test_hash_is_lowercase_hex64() {
        let h = canonical_hash(&json!({"k": "v"})).unwrap();
        assert!(is_hex_digest(&h));
        assert_eq!(h, sha256_hex(br#"{"k":"v"}"#));
    }

    #[test]
    fn test_streamed_hash_matches_buffered() {
        let v = json!({"list": [1, 2.5, "x"], "obj": {"n": null}});
        assert_eq!(canonical_hash(&v).unwrap(), sha256_hex(&canonicalize(&v).unwrap()));
    }

    #[test]
    fn test_normalize_value_rewrites_floats() {
        let v = normalize_value(&json!({"a": [0.30000000000000004], "b": 3}));
        assert_eq!(v, json!({"a": [0.3], "b": 3}));
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            (-1.0e5f64..1.0e5f64).prop_map(Value::from),
            "[a-z\\\\\"\n\té]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_canonicalization_idempotent(v in arb_json()) {
            let once = canonicalize(&v).unwrap();
            let reparsed: Value = serde_json::from_slice(&once).unwrap();
            let twice = canonicalize(&reparsed).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_normalize_float_idempotent(x in -1.0e6f64..1.0e6f64) {
            let n = normalize_float(x);
            prop_assert_eq!(normalize_float(n), n);
        }
    }
}
