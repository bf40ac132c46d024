//! Dynamic tagged value for query evaluation
//!
//! The VM, the result accumulator, and the grid all traffic in `Value`.
//! It is a tagged sum over the types the query language can express:
//! nil, int, float, bool, text, list, dict, and set.
//!
//! ## Two notions of equality
//!
//! `Value` carries **structural** `Eq`/`Ord`/`Hash` implementations so it
//! can serve as a dict key, a set member, and a group key in the result
//! tree. Structural equality never coerces across tags (except that text
//! compares by its 64-bit hash, which is the storage representation).
//!
//! The query language's comparison semantics are looser: numeric tags
//! coerce to each other, text parses as a number when compared to one,
//! and `false == 0`. Those rules live in [`Value::loose_eq`] and
//! [`Value::loose_cmp`] and are applied only by the VM's comparison
//! opcodes.
//!
//! ## Text values
//!
//! Text is stored column-side as a 64-bit xxh3 hash; the hash → string
//! mapping is partition-local. A [`Text`] value therefore carries the
//! hash always and the string only when it has been resolved. Equality
//! and hashing use the hash alone.

use crate::error::{Error, ErrorCode, Result};
use crate::hash_text;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A text value: 64-bit hash plus (when known) the backing string.
#[derive(Debug, Clone)]
pub struct Text {
    hash: i64,
    text: Option<Arc<str>>,
}

impl Text {
    /// Build from a string, computing the hash.
    pub fn new(s: &str) -> Self {
        Text {
            hash: hash_text(s),
            text: Some(Arc::from(s)),
        }
    }

    /// Build from a bare hash (string not yet resolved).
    pub fn from_hash(hash: i64) -> Self {
        Text { hash, text: None }
    }

    /// The 64-bit hash, as stored in grid cells.
    pub fn hash(&self) -> i64 {
        self.hash
    }

    /// The backing string, if resolved.
    pub fn as_str(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

impl PartialEq for Text {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}
impl Eq for Text {}

impl PartialOrd for Text {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Text {
    fn cmp(&self, other: &Self) -> Ordering {
        // compare by string when both sides are resolved so sorted output
        // reads naturally; fall back to hash order otherwise
        match (&self.text, &other.text) {
            (Some(a), Some(b)) => a.cmp(b),
            _ => self.hash.cmp(&other.hash),
        }
    }
}

impl Hash for Text {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(s) => write!(f, "{}", s),
            None => write!(f, "#{:016x}", self.hash),
        }
    }
}

impl From<&str> for Text {
    fn from(s: &str) -> Self {
        Text::new(s)
    }
}

/// The dynamic value the VM evaluates over.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent / null
    Nil,
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// Boolean
    Bool(bool),
    /// Text (hash + optional backing string)
    Text(Text),
    /// Ordered list
    List(Vec<Value>),
    /// Key → value mapping, ordered by structural key order
    Dict(BTreeMap<Value, Value>),
    /// Set of values, ordered structurally
    Set(BTreeSet<Value>),
}

impl Value {
    /// Construct a text value from a string.
    pub fn text(s: &str) -> Self {
        Value::Text(Text::new(s))
    }

    /// Construct a text value from a bare hash.
    pub fn text_hash(hash: i64) -> Self {
        Value::Text(Text::from_hash(hash))
    }

    /// Short tag name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Text(_) => "text",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
        }
    }

    /// Is this value nil?
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Truthiness under the query language's rules: nil, zero, and empty
    /// collections/strings are false; everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(t) => match t.as_str() {
                Some(s) => !s.is_empty(),
                None => true,
            },
            Value::List(v) => !v.is_empty(),
            Value::Dict(m) => !m.is_empty(),
            Value::Set(s) => !s.is_empty(),
        }
    }

    /// Numeric view as f64: ints, floats, bools (`false` = 0), and text
    /// that parses as a number.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(t) => t.as_str().and_then(|s| s.trim().parse::<f64>().ok()),
            _ => None,
        }
    }

    /// Numeric view as i64 (floats truncate).
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(if *b { 1 } else { 0 }),
            Value::Text(t) => t.as_str().and_then(|s| {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
            }),
            _ => None,
        }
    }

    /// Number of elements, for collections and text.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::List(v) => Some(v.len()),
            Value::Dict(m) => Some(m.len()),
            Value::Set(s) => Some(s.len()),
            Value::Text(t) => t.as_str().map(|s| s.len()),
            _ => None,
        }
    }

    /// True when `len()` is Some(0).
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    // ------------------------------------------------------------------
    // Loose comparison (VM semantics)
    // ------------------------------------------------------------------

    /// Query-language equality: numeric↔numeric coerces, text↔numeric
    /// parses the string, bool↔numeric maps `false`=0. All other
    /// cross-tag pairs are unequal. Nil equals only nil.
    pub fn loose_eq(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Nil, _) | (_, Nil) => false,
            (Text(a), Text(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Dict(a), Dict(b)) => a == b,
            (Set(a), Set(b)) => a == b,
            _ => match (self.as_float(), other.as_float()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Query-language ordering. `None` means the pair is not orderable
    /// (the VM turns that into a runtime error for `<`, `<=`, `>`, `>=`).
    pub fn loose_cmp(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Text(a), Text(b)) => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => Some(x.cmp(y)),
                _ => Some(a.hash().cmp(&b.hash())),
            },
            (Int(a), Int(b)) => Some(a.cmp(b)),
            _ => match (self.as_float(), other.as_float()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    // ------------------------------------------------------------------
    // Arithmetic (VM semantics)
    // ------------------------------------------------------------------

    /// Addition. Numeric adds; text concatenates; dict merges; list
    /// concatenates or appends; set inserts or unions. Nil propagates.
    pub fn add(self, rhs: Value) -> Result<Value> {
        use Value::*;
        Ok(match (self, rhs) {
            (Nil, _) | (_, Nil) => Nil,
            (Int(a), Int(b)) => Int(a.wrapping_add(b)),
            (Dict(mut a), Dict(b)) => {
                a.extend(b);
                Dict(a)
            }
            (List(mut a), List(b)) => {
                a.extend(b);
                List(a)
            }
            (List(mut a), b) => {
                a.push(b);
                List(a)
            }
            (Set(mut a), Set(b)) => {
                a.extend(b);
                Set(a)
            }
            (Set(mut a), b) => {
                a.insert(b);
                Set(a)
            }
            (Text(a), b) => {
                let mut s = a.as_str().map(str::to_owned).unwrap_or_else(|| a.to_string());
                s.push_str(&b.to_string());
                Value::text(&s)
            }
            (a, Text(b)) => {
                let mut s = a.to_string();
                s.push_str(&b.to_string());
                Value::text(&s)
            }
            (a, b) => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => Float(x + y),
                _ => return Err(type_mismatch("+", &a, &b)),
            },
        })
    }

    /// Subtraction. Numeric subtracts. For collections the right-hand
    /// side is treated as a key set: every key present in the RHS
    /// (whatever its tag) is removed from the left collection; a scalar
    /// RHS removes that single key. Nil propagates.
    pub fn sub(self, rhs: Value) -> Result<Value> {
        use Value::*;
        Ok(match (self, rhs) {
            (Nil, _) | (_, Nil) => Nil,
            (Int(a), Int(b)) => Int(a.wrapping_sub(b)),
            (Dict(mut a), b) => {
                for key in b.into_keys() {
                    a.remove(&key);
                }
                Dict(a)
            }
            (Set(mut a), b) => {
                for key in b.into_keys() {
                    a.remove(&key);
                }
                Set(a)
            }
            (List(a), b) => {
                let keys = b.into_keys();
                List(a.into_iter().filter(|v| !keys.contains(v)).collect())
            }
            (a, b) => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => Float(x - y),
                _ => return Err(type_mismatch("-", &a, &b)),
            },
        })
    }

    /// Multiplication (numeric only). Nil propagates.
    pub fn mul(self, rhs: Value) -> Result<Value> {
        use Value::*;
        Ok(match (self, rhs) {
            (Nil, _) | (_, Nil) => Nil,
            (Int(a), Int(b)) => Int(a.wrapping_mul(b)),
            (a, b) => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => Float(x * y),
                _ => return Err(type_mismatch("*", &a, &b)),
            },
        })
    }

    /// Division (numeric only). Int/int truncates. Division by zero is a
    /// runtime error. Nil propagates.
    pub fn div(self, rhs: Value) -> Result<Value> {
        use Value::*;
        Ok(match (self, rhs) {
            (Nil, _) | (_, Nil) => Nil,
            (Int(a), Int(b)) => {
                if b == 0 {
                    return Err(Error::runtime(ErrorCode::DivideByZero, "division by zero"));
                }
                Int(a / b)
            }
            (a, b) => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => {
                    if y == 0.0 {
                        return Err(Error::runtime(ErrorCode::DivideByZero, "division by zero"));
                    }
                    Float(x / y)
                }
                _ => return Err(type_mismatch("/", &a, &b)),
            },
        })
    }

    /// View this value as the set of keys it contributes when used as
    /// the right-hand side of a collection subtraction or membership
    /// test. Dicts contribute their keys; lists and sets their members;
    /// scalars contribute themselves.
    fn into_keys(self) -> Vec<Value> {
        match self {
            Value::Dict(m) => m.into_keys().collect(),
            Value::List(v) => v,
            Value::Set(s) => s.into_iter().collect(),
            scalar => vec![scalar],
        }
    }

    // ------------------------------------------------------------------
    // Collection access
    // ------------------------------------------------------------------

    /// Subscript read: list index (negative counts from the end) or dict
    /// key. Missing entries read as nil; a non-subscriptable base is a
    /// runtime error.
    pub fn get_index(&self, key: &Value) -> Result<Value> {
        match self {
            Value::List(v) => {
                let i = key
                    .as_int()
                    .ok_or_else(|| bad_subscript(self, key))?;
                let idx = if i < 0 { v.len() as i64 + i } else { i };
                if idx < 0 || idx as usize >= v.len() {
                    return Err(bad_subscript(self, key));
                }
                Ok(v[idx as usize].clone())
            }
            Value::Dict(m) => Ok(m.get(key).cloned().unwrap_or(Value::Nil)),
            _ => Err(bad_subscript(self, key)),
        }
    }

    /// Subscript write. Dict inserts; list assigns in range (or appends
    /// when the index equals the length).
    pub fn set_index(&mut self, key: Value, value: Value) -> Result<()> {
        match self {
            Value::Dict(m) => {
                m.insert(key, value);
                Ok(())
            }
            Value::List(v) => {
                let i = key.as_int().ok_or_else(|| {
                    Error::runtime(ErrorCode::BadSubscript, format!("bad subscript {} on list", key))
                })?;
                let idx = if i < 0 { v.len() as i64 + i } else { i };
                if idx < 0 || idx as usize > v.len() {
                    return Err(Error::runtime(
                        ErrorCode::BadSubscript,
                        format!("list index {} out of range", i),
                    ));
                }
                if idx as usize == v.len() {
                    v.push(value);
                } else {
                    v[idx as usize] = value;
                }
                Ok(())
            }
            other => Err(Error::runtime(
                ErrorCode::BadSubscript,
                format!("bad subscript {} on {}", key, other.type_name()),
            )),
        }
    }

    /// Membership: `needle in self`. Lists use loose equality; dicts test
    /// keys; sets test members; text tests substring.
    pub fn contains(&self, needle: &Value) -> bool {
        match self {
            Value::List(v) => v.iter().any(|item| item.loose_eq(needle)),
            Value::Dict(m) => m.contains_key(needle),
            Value::Set(s) => s.contains(needle),
            Value::Text(t) => match (t.as_str(), needle) {
                (Some(hay), Value::Text(n)) => {
                    n.as_str().map(|sub| hay.contains(sub)).unwrap_or(false)
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Items iterated by `for x in value`: list items, dict keys, set
    /// members.
    pub fn iter_items(&self) -> Result<Vec<Value>> {
        match self {
            Value::List(v) => Ok(v.clone()),
            Value::Dict(m) => Ok(m.keys().cloned().collect()),
            Value::Set(s) => Ok(s.iter().cloned().collect()),
            other => Err(Error::runtime(
                ErrorCode::TypeMismatch,
                format!("cannot iterate a {}", other.type_name()),
            )),
        }
    }

    // ------------------------------------------------------------------
    // JSON conversion
    // ------------------------------------------------------------------

    /// Convert to a `serde_json::Value` for response emission. Unresolved
    /// text renders as its hex hash form; non-text dict keys render via
    /// `Display`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Nil => J::Null,
            Value::Int(i) => J::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(J::Number).unwrap_or(J::Null),
            Value::Bool(b) => J::from(*b),
            Value::Text(t) => J::from(t.to_string()),
            Value::List(v) => J::Array(v.iter().map(Value::to_json).collect()),
            Value::Set(s) => J::Array(s.iter().map(Value::to_json).collect()),
            Value::Dict(m) => J::Object(
                m.iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert from parsed JSON (the ingest path). Arrays become lists;
    /// objects become dicts with text keys; integral numbers become ints.
    pub fn from_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as J;
        match json {
            J::Null => Value::Nil,
            J::Bool(b) => Value::Bool(*b),
            J::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            J::String(s) => Value::text(s),
            J::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            J::Object(fields) => Value::Dict(
                fields
                    .iter()
                    .map(|(k, v)| (Value::text(k), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Nil => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Text(_) => 4,
            Value::List(_) => 5,
            Value::Dict(_) => 6,
            Value::Set(_) => 7,
        }
    }
}

fn type_mismatch(op: &str, a: &Value, b: &Value) -> Error {
    Error::runtime(
        ErrorCode::TypeMismatch,
        format!("cannot apply `{}` to {} and {}", op, a.type_name(), b.type_name()),
    )
}

fn bad_subscript(base: &Value, key: &Value) -> Error {
    Error::runtime(
        ErrorCode::BadSubscript,
        format!("bad subscript {} on {}", key, base.type_name()),
    )
}

// ----------------------------------------------------------------------
// Structural Eq / Ord / Hash — dict keys, set members, group keys
// ----------------------------------------------------------------------

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (List(a), List(b)) => a.cmp(b),
            (Dict(a), Dict(b)) => a.iter().cmp(b.iter()),
            (Set(a), Set(b)) => a.iter().cmp(b.iter()),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Nil => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(t) => Hash::hash(t, state),
            Value::List(v) => v.hash(state),
            Value::Dict(m) => {
                for (k, v) in m {
                    k.hash(state);
                    v.hash(state);
                }
            }
            Value::Set(s) => {
                for v in s {
                    v.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Text(t) => write!(f, "{}", t),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Set(items) => {
                write!(f, "set(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Dict(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::text(s)
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::text(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loose_eq_numeric_coercion() {
        assert!(Value::Int(3).loose_eq(&Value::Float(3.0)));
        assert!(Value::Bool(false).loose_eq(&Value::Int(0)));
        assert!(Value::text("3.14").loose_eq(&Value::Float(3.14)));
        assert!(!Value::text("fish").loose_eq(&Value::Int(3)));
        assert!(!Value::Nil.loose_eq(&Value::Int(0)));
        assert!(Value::Nil.loose_eq(&Value::Nil));
    }

    #[test]
    fn test_structural_eq_does_not_coerce() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::text("a"), Value::text("a"));
        assert_eq!(Value::text("a"), Value::text_hash(hash_text("a")));
    }

    #[test]
    fn test_arithmetic_int_and_float() {
        assert_eq!(Value::Int(2).add(Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(
            Value::Int(2).add(Value::Float(0.5)).unwrap(),
            Value::Float(2.5)
        );
        assert_eq!(Value::Int(14).div(Value::Int(3)).unwrap(), Value::Int(4));
        assert!(Value::Int(1).div(Value::Int(0)).is_err());
    }

    #[test]
    fn test_nil_propagates_through_arithmetic() {
        assert!(Value::Nil.add(Value::Int(1)).unwrap().is_nil());
        assert!(Value::Int(1).mul(Value::Nil).unwrap().is_nil());
    }

    #[test]
    fn test_text_concatenation() {
        let merry = Value::text("merry").add(Value::text(" new year")).unwrap();
        assert!(merry.loose_eq(&Value::text("merry new year")));
    }

    #[test]
    fn test_dict_merge_and_heterogeneous_subtract() {
        let mut a = BTreeMap::new();
        a.insert(Value::text("hello"), Value::text("goodbye"));
        a.insert(Value::text("many"), Value::List(vec![Value::Int(1)]));
        let dict = Value::Dict(a);

        let mut b = BTreeMap::new();
        b.insert(Value::text("another"), Value::text("thing"));
        let merged = dict.add(Value::Dict(b)).unwrap();
        assert_eq!(merged.len(), Some(3));

        // subtract with a list RHS removes those keys
        let trimmed = merged
            .sub(Value::List(vec![Value::text("hello"), Value::text("many")]))
            .unwrap();
        assert_eq!(trimmed.len(), Some(1));

        // subtract with a scalar RHS removes one key
        let empty = trimmed.sub(Value::text("another")).unwrap();
        assert_eq!(empty.len(), Some(0));
    }

    #[test]
    fn test_set_insert_and_remove() {
        let set = Value::Set(BTreeSet::new());
        let set = set.add(Value::text("hello")).unwrap();
        let set = set.add(Value::text("goodbye")).unwrap();
        let set = set.add(Value::text("hello")).unwrap();
        assert_eq!(set.len(), Some(2));
        let set = set.sub(Value::text("hello")).unwrap();
        assert_eq!(set.len(), Some(1));
    }

    #[test]
    fn test_subscript_read_write() {
        let mut list = Value::List(vec![Value::Int(10), Value::Int(20)]);
        assert_eq!(list.get_index(&Value::Int(1)).unwrap(), Value::Int(20));
        assert_eq!(list.get_index(&Value::Int(-1)).unwrap(), Value::Int(20));
        assert!(list.get_index(&Value::Int(5)).is_err());
        list.set_index(Value::Int(0), Value::Int(99)).unwrap();
        assert_eq!(list.get_index(&Value::Int(0)).unwrap(), Value::Int(99));

        let mut dict = Value::Dict(BTreeMap::new());
        dict.set_index(Value::text("k"), Value::Int(1)).unwrap();
        assert_eq!(dict.get_index(&Value::text("k")).unwrap(), Value::Int(1));
        // missing dict keys read as nil
        assert!(dict.get_index(&Value::text("zz")).unwrap().is_nil());
    }

    #[test]
    fn test_contains() {
        let list = Value::List(vec![Value::text("apple"), Value::text("pear")]);
        assert!(list.contains(&Value::text("apple")));
        assert!(!list.contains(&Value::text("plum")));
        assert!(Value::text("hamburger").contains(&Value::text("urge")));
    }

    #[test]
    fn test_json_round_trip_shapes() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a": [1, 2.5, "x"], "b": null}"#).unwrap();
        let v = Value::from_json(&json);
        assert_eq!(v.len(), Some(2));
        let a = v.get_index(&Value::text("a")).unwrap();
        assert_eq!(a.len(), Some(3));
        assert!(v.get_index(&Value::text("b")).unwrap().is_nil());
    }
}
