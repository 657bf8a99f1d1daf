//! The closed set of BSON values.

use super::oid::ObjectId;
use super::types::{BinarySubtype, ElementType};
use super::Document;
use crate::error::{MongoError, Result};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Regex flags with a defined meaning, in wire order.
const RECOGNIZED_REGEX_FLAGS: [char; 3] = ['i', 'm', 'x'];

/// A BSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Double(f64),
    String(String),
    Document(Document),
    Array(Vec<Value>),
    Binary(Binary),
    Undefined,
    ObjectId(ObjectId),
    Boolean(bool),
    DateTime(DateTime),
    Null,
    RegularExpression(Regex),
    DbPointer(DbPointer),
    JavaScriptCode(String),
    Symbol(String),
    JavaScriptCodeWithScope(JavaScriptCodeWithScope),
    Int32(i32),
    Timestamp(Timestamp),
    Int64(i64),
    Decimal128(Decimal128),
    MaxKey,
    MinKey,
}

impl Value {
    /// The element type byte this value encodes with.
    pub fn element_type(&self) -> ElementType {
        match self {
            Value::Double(_) => ElementType::Double,
            Value::String(_) => ElementType::String,
            Value::Document(_) => ElementType::EmbeddedDocument,
            Value::Array(_) => ElementType::Array,
            Value::Binary(_) => ElementType::Binary,
            Value::Undefined => ElementType::Undefined,
            Value::ObjectId(_) => ElementType::ObjectId,
            Value::Boolean(_) => ElementType::Boolean,
            Value::DateTime(_) => ElementType::DateTime,
            Value::Null => ElementType::Null,
            Value::RegularExpression(_) => ElementType::RegularExpression,
            Value::DbPointer(_) => ElementType::DbPointer,
            Value::JavaScriptCode(_) => ElementType::JavaScriptCode,
            Value::Symbol(_) => ElementType::Symbol,
            Value::JavaScriptCodeWithScope(_) => ElementType::JavaScriptCodeWithScope,
            Value::Int32(_) => ElementType::Int32,
            Value::Timestamp(_) => ElementType::Timestamp,
            Value::Int64(_) => ElementType::Int64,
            Value::Decimal128(_) => ElementType::Decimal128,
            Value::MaxKey => ElementType::MaxKey,
            Value::MinKey => ElementType::MinKey,
        }
    }

    /// Build an `Int32`, failing with a range error if `value` does not fit.
    pub fn int32(value: impl Into<i64>) -> Result<Value> {
        let value = value.into();
        i32::try_from(value).map(Value::Int32).map_err(|_| {
            MongoError::IntegerRange(format!(
                "{} does not fit in a 32-bit integer; use a 64-bit integer",
                value
            ))
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
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

    /// Any numeric value widened to an i64. Doubles must be integral.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            Value::Double(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Value::ObjectId(oid) => Some(*oid),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Truthiness the way servers report flags: booleans or non-zero numbers.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Null | Value::Undefined => false,
            other => other.as_integer().map(|v| v != 0).unwrap_or(true),
        }
    }
}

/// Binary data with a subtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub subtype: BinarySubtype,
    pub bytes: Vec<u8>,
}

impl Binary {
    pub fn new(subtype: BinarySubtype, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            subtype,
            bytes: bytes.into(),
        }
    }
}

/// UTC datetime in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DateTime(i64);

impl DateTime {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        let millis = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        };
        Self(millis)
    }

    pub const fn timestamp_millis(&self) -> i64 {
        self.0
    }
}

/// A regular expression with normalized flags.
///
/// Flags are stored `i`, `m`, `x` first, followed by any other flag characters
/// sorted by byte value. Repeated flags are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regex {
    pattern: String,
    options: String,
}

impl Regex {
    pub fn new(pattern: impl Into<String>, options: &str) -> Self {
        Self {
            pattern: pattern.into(),
            options: normalize_regex_options(options),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn options(&self) -> &str {
        &self.options
    }
}

/// Order regex flags for the wire: recognized flags first, then the rest by byte value.
pub fn normalize_regex_options(options: &str) -> String {
    let mut recognized: Vec<char> = Vec::new();
    let mut extra: Vec<char> = Vec::new();
    for flag in options.chars() {
        if RECOGNIZED_REGEX_FLAGS.contains(&flag) {
            recognized.push(flag);
        } else {
            extra.push(flag);
        }
    }
    recognized.sort_unstable();
    extra.sort_unstable();
    recognized.into_iter().chain(extra).collect()
}

/// Internal replication timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    /// Seconds since the epoch.
    pub time: u32,
    /// Ordinal within the second.
    pub increment: u32,
}

/// JavaScript code with a scope document.
#[derive(Debug, Clone, PartialEq)]
pub struct JavaScriptCodeWithScope {
    pub code: String,
    pub scope: Document,
}

/// Deprecated pointer to a document in another namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbPointer {
    pub namespace: String,
    pub id: ObjectId,
}

/// 128-bit decimal, kept as its raw IEEE 754-2008 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal128 {
    bytes: [u8; 16],
}

impl Decimal128 {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self { bytes }
    }

    pub const fn bytes(&self) -> [u8; 16] {
        self.bytes
    }
}

impl fmt::Debug for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decimal128(")?;
        for b in self.bytes {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A reference to a document in another collection, stored as `{$ref, $id[, $db]}`.
#[derive(Debug, Clone, PartialEq)]
pub struct DbRef {
    pub collection: String,
    pub id: Value,
    pub database: Option<String>,
}

impl DbRef {
    pub fn new(collection: impl Into<String>, id: impl Into<Value>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            database: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// The plain embedded document this reference encodes as.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("$ref", self.collection.clone());
        doc.insert("$id", self.id.clone());
        if let Some(db) = &self.database {
            doc.insert("$db", db.clone());
        }
        doc
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )+
    };
}

value_from! {
    f64 => Double,
    String => String,
    Document => Document,
    Binary => Binary,
    ObjectId => ObjectId,
    bool => Boolean,
    DateTime => DateTime,
    Regex => RegularExpression,
    DbPointer => DbPointer,
    JavaScriptCodeWithScope => JavaScriptCodeWithScope,
    i32 => Int32,
    Timestamp => Timestamp,
    i64 => Int64,
    Decimal128 => Decimal128,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::String(v.clone())
    }
}

impl From<DbRef> for Value {
    fn from(v: DbRef) -> Self {
        Value::Document(v.to_document())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl TryFrom<u64> for Value {
    type Error = MongoError;

    fn try_from(v: u64) -> Result<Self> {
        i64::try_from(v).map(Value::Int64).map_err(|_| {
            MongoError::IntegerRange(format!("{} does not fit in an 8-byte integer", v))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regex_flag_order() {
        assert_eq!(Regex::new("a", "xmi").options(), "imx");
        assert_eq!(Regex::new("a", "mx").options(), "mx");
        assert_eq!(Regex::new("a", "usxi").options(), "ixsu");
        assert_eq!(Regex::new("a", "xii").options(), "iix");
        assert_eq!(Regex::new("a", "uxuim").options(), "imxuu");
    }

    #[test]
    fn test_int32_range() {
        assert_eq!(Value::int32(5i64).unwrap(), Value::Int32(5));
        assert_eq!(Value::int32(i32::MIN).unwrap(), Value::Int32(i32::MIN));
        assert!(matches!(
            Value::int32(i64::from(i32::MAX) + 1),
            Err(MongoError::IntegerRange(_))
        ));
    }

    #[test]
    fn test_u64_range() {
        assert_eq!(Value::try_from(7u64).unwrap(), Value::Int64(7));
        assert!(Value::try_from(u64::MAX).is_err());
    }

    #[test]
    fn test_as_integer_widens() {
        assert_eq!(Value::Int32(3).as_integer(), Some(3));
        assert_eq!(Value::Int64(-3).as_integer(), Some(-3));
        assert_eq!(Value::Double(1.0).as_integer(), Some(1));
        assert_eq!(Value::Double(1.5).as_integer(), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::Boolean(true).is_truthy());
        assert!(Value::Int32(1).is_truthy());
        assert!(!Value::Double(0.0).is_truthy());
        assert!(!Value::Null.is_truthy());
    }

    #[test]
    fn test_dbref_document_order() {
        let dbref = DbRef::new("users", 5).with_database("app");
        let doc = dbref.to_document();
        let keys: Vec<&str> = doc.keys().collect();
        assert_eq!(keys, vec!["$ref", "$id", "$db"]);
    }
}
