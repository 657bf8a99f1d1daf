//! BSON documents and their binary codec.
//!
//! A [`Document`] is an ordered mapping from unique string keys to [`Value`]s.
//! [`encode`] and [`decode`] convert between documents and the length-prefixed
//! binary format servers speak:
//!
//! ```text
//! document := int32 e_list 0x00
//! e_list   := (type-byte cstring payload)*
//! ```
//!
//! The first four bytes of every encoded document hold its total length,
//! including the length field itself and the trailing NUL.

mod decode;
mod encode;
mod interop;
mod oid;
pub(crate) mod raw;
mod types;
mod value;

pub use decode::{decode, decode_prefix};
pub use encode::{encode, encode_with_options, EncodeOptions, DEFAULT_MAX_DOCUMENT_SIZE};
pub use oid::ObjectId;
pub use types::{BinarySubtype, ElementType};
pub use value::{
    normalize_regex_options, Binary, DateTime, DbPointer, DbRef, Decimal128,
    JavaScriptCodeWithScope, Regex, Timestamp, Value,
};

pub(crate) use decode::read_document;
pub(crate) use encode::encode_into;

use crate::error::{MongoError, Result};
use indexmap::map::Entry;
use indexmap::IndexMap;

/// Build a [`Document`] from literal keys.
///
/// ```ignore
/// use mongo_core::doc;
///
/// let command = doc! { "hello": 1, "$db": "admin" };
/// let nested = doc! { "filter": doc! { "x": 1 } };
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::document::Document::new()
    };
    ( $( $key:literal : $value:expr ),+ $(,)? ) => {{
        let mut document = $crate::document::Document::new();
        $( document.insert($key, $value); )+
        document
    }};
}

/// An ordered map of unique string keys to BSON values.
///
/// Equality is order-sensitive: two documents are equal only when they hold
/// the same entries in the same order, as their encodings would.
#[derive(Debug, Clone, Default)]
pub struct Document {
    entries: IndexMap<String, Value>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value. An existing key keeps its position and gets the new value,
    /// which returns the old one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    /// Remove a key, preserving the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// The first key, which names the command in a command document.
    pub fn first_key(&self) -> Option<&str> {
        self.entries.first().map(|(k, _)| k.as_str())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
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

    /// Any numeric field widened to an i64.
    pub fn get_integer(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_integer)
    }

    pub fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(Value::as_document)
    }

    pub fn get_array(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_array)
    }

    pub fn get_object_id(&self, key: &str) -> Option<ObjectId> {
        self.get(key).and_then(Value::as_object_id)
    }

    pub fn get_datetime(&self, key: &str) -> Option<DateTime> {
        self.get(key).and_then(Value::as_datetime)
    }

    /// Interpret this document as a `{$ref, $id[, $db]}` reference.
    pub fn as_dbref(&self) -> Option<DbRef> {
        let collection = self.get_str("$ref")?;
        let id = self.get("$id")?;
        let mut dbref = DbRef::new(collection, id.clone());
        if let Some(db) = self.get_str("$db") {
            dbref = dbref.with_database(db);
        }
        Some(dbref)
    }

    /// Append a decoded entry, failing on a key already present.
    pub(crate) fn push_decoded(&mut self, key: &str, value: Value) -> Result<()> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Err(MongoError::corrupt(format!("duplicate key {:?}", key))),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len() && self.entries.iter().eq(other.entries.iter())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
