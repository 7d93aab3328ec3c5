//! Value wrappers: primitive scalars, counters, timestamps, object refs.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::identity::ObjectId;

/// Primitive JSON scalar. Untagged: the wire form is plain JSON.
///
/// Variant order matters for deserialisation - integers must be tried
/// before floats.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    F64(f64),
    Str(String),
}

impl Scalar {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

impl From<i64> for Scalar {
    fn from(n: i64) -> Self {
        Scalar::Int(n)
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::F64(n)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// Wire tag refining a scalar into a richer value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Counter,
    Timestamp,
}

/// A replicated counter.
///
/// Compares and prints like its numeric value, but a counter field is never
/// deep-equal to a raw integer and is only moved by increment/decrement
/// inside a change block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Counter(i64);

impl Counter {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Counter {
    fn from(n: i64) -> Self {
        Self(n)
    }
}

impl From<Counter> for i64 {
    fn from(c: Counter) -> i64 {
        c.0
    }
}

impl PartialEq<i64> for Counter {
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i64> for Counter {
    fn partial_cmp(&self, other: &i64) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

impl Add<i64> for Counter {
    type Output = Counter;

    fn add(self, rhs: i64) -> Counter {
        Counter(self.0.wrapping_add(rhs))
    }
}

impl Sub<i64> for Counter {
    type Output = Counter;

    fn sub(self, rhs: i64) -> Counter {
        Counter(self.0.wrapping_sub(rhs))
    }
}

/// Millisecond-precision point in time.
///
/// Stored as a raw millisecond count; converts to and from
/// [`OffsetDateTime`] with the count preserved exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn millis(self) -> i64 {
        self.0
    }

    /// `None` when the count is outside the representable datetime range.
    pub fn to_datetime(self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000).ok()
    }
}

impl From<OffsetDateTime> for Timestamp {
    fn from(t: OffsetDateTime) -> Self {
        Self((t.unix_timestamp_nanos() / 1_000_000) as i64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A materialised field or element value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Timestamp(Timestamp),
    Counter(Counter),
    /// Link to another node in the cache.
    Object(ObjectId),
}

impl Value {
    pub fn as_object(&self) -> Option<&ObjectId> {
        match self {
            Value::Object(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<Counter> {
        match self {
            Value::Counter(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn is_counter(&self) -> bool {
        matches!(self, Value::Counter(_))
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        Value::Scalar(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn scalar_wire_form_is_plain_json() {
        assert_eq!(serde_json::to_string(&Scalar::Null).unwrap(), "null");
        assert_eq!(serde_json::to_string(&Scalar::Int(3)).unwrap(), "3");
        assert_eq!(
            serde_json::to_string(&Scalar::Str("magpie".into())).unwrap(),
            "\"magpie\""
        );

        let parsed: Scalar = serde_json::from_str("42").unwrap();
        assert_eq!(parsed, Scalar::Int(42));
        let parsed: Scalar = serde_json::from_str("2.5").unwrap();
        assert_eq!(parsed, Scalar::F64(2.5));
        let parsed: Scalar = serde_json::from_str("false").unwrap();
        assert_eq!(parsed, Scalar::Bool(false));
        let parsed: Scalar = serde_json::from_str("null").unwrap();
        assert_eq!(parsed, Scalar::Null);
    }

    #[test]
    fn counter_compares_like_a_number() {
        let c = Counter::new(3);
        assert_eq!(c, 3);
        assert!(c < 4);
        assert_eq!((c + 2).value(), 5);
        assert_eq!((c - 1).value(), 2);
        assert_eq!(c.to_string(), "3");
    }

    #[test]
    fn counter_value_is_not_a_raw_int() {
        assert_ne!(
            Value::Counter(Counter::new(1)),
            Value::Scalar(Scalar::Int(1))
        );
    }

    #[test]
    fn timestamp_preserves_millis_exactly() {
        let t = datetime!(2021-03-04 05:06:07.089 UTC);
        let ts = Timestamp::from(t);
        assert_eq!(ts.millis() % 1000, 89);
        assert_eq!(ts.to_datetime().expect("in range"), t);
    }

    #[test]
    fn timestamp_out_of_range_is_none() {
        assert!(Timestamp::from_millis(i64::MAX).to_datetime().is_none());
    }
}
