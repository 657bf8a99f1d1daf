//! Conversions to and from the `bson` crate's types.
//!
//! Documents cross over through their wire bytes, so anything the `bson`
//! crate can represent survives the trip unchanged.

use super::{decode, encode, Document, ObjectId};
use crate::error::Result;

impl Document {
    /// Convert into a `bson::Document`.
    pub fn to_bson(&self) -> Result<bson::Document> {
        let bytes = encode(self, false)?;
        Ok(bson::Document::from_reader(&mut bytes.as_slice())?)
    }

    /// Convert from a `bson::Document`.
    pub fn from_bson(document: &bson::Document) -> Result<Self> {
        let mut bytes = Vec::new();
        document.to_writer(&mut bytes)?;
        decode(&bytes)
    }
}

impl From<ObjectId> for bson::oid::ObjectId {
    fn from(oid: ObjectId) -> Self {
        bson::oid::ObjectId::from_bytes(oid.bytes())
    }
}

impl From<bson::oid::ObjectId> for ObjectId {
    fn from(oid: bson::oid::ObjectId) -> Self {
        ObjectId::from_bytes(oid.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_round_trip_through_bson() {
        let doc = doc! { "a": 1, "b": "two", "c": vec![1.5, 2.5] };
        let converted = doc.to_bson().unwrap();
        assert_eq!(converted.get_i32("a").unwrap(), 1);
        assert_eq!(converted.get_str("b").unwrap(), "two");
        assert_eq!(Document::from_bson(&converted).unwrap(), doc);
    }

    #[test]
    fn test_object_id_conversion() {
        let oid = ObjectId::new();
        let theirs: bson::oid::ObjectId = oid.into();
        assert_eq!(theirs.to_hex(), oid.to_hex());
        assert_eq!(ObjectId::from(theirs), oid);
    }
}
