//! Integration tests for the document codec and message framing.
//!
//! Documents are checked for byte-level parity with the `bson` crate, and
//! messages are pushed through in-memory tokio streams.

use mongo_core::document::{
    decode, decode_prefix, encode, encode_with_options, Binary, BinarySubtype, DateTime,
    DbPointer, DbRef, Decimal128, EncodeOptions, JavaScriptCodeWithScope, Regex, Timestamp,
};
use mongo_core::error::{ErrorKind, MongoError};
use mongo_core::wire::{
    read_message, write_message, CompressorRegistry, Message, MessageHeader, OpCode,
    OpCompressed, OpMsg, OpQuery, OpReply, Zlib, HEADER_LENGTH,
};
use mongo_core::{doc, Document, ObjectId, Value};
use pretty_assertions::assert_eq;

fn every_type() -> Document {
    let oid = ObjectId::parse_str("5f1d7f8c9b1e8a3d4c2b1a09").unwrap();
    doc! {
        "double": 1.5,
        "string": "héllo",
        "document": doc! { "nested": true },
        "array": vec![Value::Int32(1), Value::from("two"), Value::Null],
        "binary": Binary::new(BinarySubtype::Generic, vec![0u8, 1, 2, 255]),
        "uuid": Binary::new(BinarySubtype::Uuid, vec![7u8; 16]),
        "old_binary": Binary::new(BinarySubtype::BinaryOld, vec![9u8, 8, 7]),
        "undefined": Value::Undefined,
        "oid": oid,
        "bool": false,
        "date": DateTime::from_millis(-1_234),
        "null": Value::Null,
        "regex": Regex::new("^a.*z$", "xi"),
        "pointer": DbPointer { namespace: "db.coll".to_string(), id: oid },
        "code": Value::JavaScriptCode("function() {}".to_string()),
        "symbol": Value::Symbol("sym".to_string()),
        "scoped": JavaScriptCodeWithScope { code: "x + 1".to_string(), scope: doc! { "x": 1 } },
        "int32": i32::MIN,
        "timestamp": Timestamp { time: 1_600_000_000, increment: 3 },
        "int64": i64::MAX,
        "decimal": Decimal128::from_bytes([0x11; 16]),
        "max": Value::MaxKey,
        "min": Value::MinKey,
    }
}

// ============================================================================
// Document Codec Tests
// ============================================================================

mod document_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_every_type_survives_the_wire() {
        let document = every_type();
        let bytes = encode(&document, false).unwrap();
        assert_eq!(decode(&bytes).unwrap(), document);
    }

    #[test]
    fn test_length_prefix_matches_encoded_size() {
        let bytes = encode(&every_type(), false).unwrap();
        let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(declared as usize, bytes.len());
        assert_eq!(bytes.last(), Some(&0));

        assert_eq!(encode(&Document::new(), false).unwrap(), vec![5, 0, 0, 0, 0]);
    }

    #[test]
    fn test_integer_boundaries() {
        assert_eq!(Value::int32(i32::MAX).unwrap(), Value::Int32(i32::MAX));
        assert_eq!(Value::int32(i32::MIN).unwrap(), Value::Int32(i32::MIN));
        assert!(matches!(
            Value::int32(i64::from(i32::MAX) + 1),
            Err(MongoError::IntegerRange(_))
        ));
        assert!(matches!(
            Value::int32(i64::from(i32::MIN) - 1),
            Err(MongoError::IntegerRange(_))
        ));

        assert_eq!(Value::try_from(i64::MAX as u64).unwrap(), Value::Int64(i64::MAX));
        let err = Value::try_from(u64::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Codec);
    }

    #[test]
    fn test_top_level_key_validation() {
        let operator = doc! { "$set": doc! { "a": 1 } };
        assert!(matches!(encode(&operator, true), Err(MongoError::InvalidKey(_))));
        assert!(encode(&operator, false).is_ok());

        let dotted = doc! { "a.b": 1 };
        assert!(matches!(encode(&dotted, true), Err(MongoError::InvalidKey(_))));

        // only the top level is checked
        let nested = doc! { "update": doc! { "$inc": doc! { "n": 1 } } };
        assert!(encode(&nested, true).is_ok());
    }

    #[test]
    fn test_nul_in_key_always_rejected() {
        let mut document = Document::new();
        document.insert("bad\0key", 1);
        assert!(matches!(encode(&document, false), Err(MongoError::InvalidKey(_))));

        // strings are length prefixed, so interior NULs are fine
        let text = doc! { "s": "a\0b" };
        let bytes = encode(&text, false).unwrap();
        assert_eq!(decode(&bytes).unwrap().get_str("s"), Some("a\0b"));
    }

    #[test]
    fn test_regex_flag_order() {
        assert_eq!(Regex::new("p", "xmi").options(), "imx");
        assert_eq!(Regex::new("p", "usxi").options(), "ixsu");
        assert_eq!(Regex::new("p", "mii").options(), "iim");

        let bytes = encode(&doc! { "r": Regex::new("a", "mi") }, false).unwrap();
        // type, key, pattern, flags
        assert_eq!(&bytes[4..], b"\x0br\0a\0im\0\0");

        // repeated and unknown flags survive a trip over the wire
        let unusual = doc! { "r": Regex::new("a", "suiis") };
        let decoded = decode(&encode(&unusual, false).unwrap()).unwrap();
        assert_eq!(decoded, unusual);
        match decoded.get("r") {
            Some(Value::RegularExpression(regex)) => assert_eq!(regex.options(), "iissu"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_move_id_and_size_limit() {
        let document = doc! { "name": "x", "_id": 7 };
        let bytes = encode_with_options(&document, &EncodeOptions::user_document()).unwrap();
        assert_eq!(decode(&bytes).unwrap().first_key(), Some("_id"));

        let big = doc! { "blob": Binary::new(BinarySubtype::Generic, vec![0u8; 256]) };
        let options = EncodeOptions {
            max_document_size: Some(128),
            ..EncodeOptions::default()
        };
        assert!(matches!(
            encode_with_options(&big, &options),
            Err(MongoError::DocumentTooLarge { max: 128, .. })
        ));
    }

    #[test]
    fn test_corrupt_input() {
        let bytes = encode(&doc! { "a": true }, false).unwrap();

        assert_eq!(decode(&bytes[..bytes.len() - 1]).unwrap_err().kind(), ErrorKind::Codec);
        assert!(decode(&[4, 0, 0, 0]).is_err());

        let mut bad_bool = bytes.clone();
        let index = bad_bool.len() - 2;
        bad_bool[index] = 2;
        assert!(matches!(decode(&bad_bool), Err(MongoError::CorruptData(_))));

        let mut trailing = bytes.clone();
        trailing.extend_from_slice(&[0, 0]);
        assert!(decode(&trailing).is_err());
        assert_eq!(decode_prefix(&trailing).unwrap().1, bytes.len());
    }

    #[test]
    fn test_many_keys_decode_in_linear_time() {
        let count = 100_000;
        let document: Document = (0..count).map(|i| (format!("k{}", i), i)).collect();
        let bytes = encode(&document, false).unwrap();

        let started = std::time::Instant::now();
        let decoded = decode(&bytes).unwrap();
        assert!(
            started.elapsed() < std::time::Duration::from_secs(5),
            "decoding {} keys took {:?}",
            count,
            started.elapsed()
        );
        assert_eq!(decoded.len(), count as usize);
        assert_eq!(decoded.first_key(), Some("k0"));
        assert_eq!(decoded.get_i32("k99999"), Some(99_999));
        assert_eq!(decoded, document);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        // {a: 1, a: 2} written by hand
        let bytes = [
            19, 0, 0, 0, 0x10, b'a', 0, 1, 0, 0, 0, 0x10, b'a', 0, 2, 0, 0, 0, 0,
        ];
        assert!(matches!(decode(&bytes), Err(MongoError::CorruptData(_))));
    }

    #[test]
    fn test_dbref_is_a_plain_document() {
        let id = ObjectId::new();
        let reference = DbRef::new("users", id).with_database("app");
        let document = doc! { "owner": reference.clone() };
        let owner = document.get_document("owner").unwrap();
        assert_eq!(owner.keys().collect::<Vec<_>>(), vec!["$ref", "$id", "$db"]);
        assert_eq!(owner.as_dbref(), Some(reference));
    }
}

// ============================================================================
// BSON Crate Parity Tests
// ============================================================================

mod bson_parity_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bytes_match_bson_crate() {
        let oid = ObjectId::new();
        let ours = doc! {
            "_id": oid,
            "double": 2.25,
            "string": "text",
            "embedded": doc! { "a": 1, "b": vec!["x", "y"] },
            "binary": Binary::new(BinarySubtype::Generic, vec![1u8, 2, 3]),
            "bool": true,
            "date": DateTime::from_millis(1_700_000_000_123),
            "null": Value::Null,
            "regex": Regex::new("^x", "imx"),
            "code": Value::JavaScriptCode("f()".to_string()),
            "int32": 42,
            "timestamp": Timestamp { time: 5, increment: 6 },
            "int64": 1i64 << 40,
            "min": Value::MinKey,
            "max": Value::MaxKey,
        };
        let theirs = bson::doc! {
            "_id": bson::oid::ObjectId::from(oid),
            "double": 2.25,
            "string": "text",
            "embedded": { "a": 1i32, "b": ["x", "y"] },
            "binary": bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: vec![1, 2, 3] },
            "bool": true,
            "date": bson::DateTime::from_millis(1_700_000_000_123),
            "null": bson::Bson::Null,
            "regex": bson::Regex { pattern: "^x".to_string(), options: "imx".to_string() },
            "code": bson::Bson::JavaScriptCode("f()".to_string()),
            "int32": 42i32,
            "timestamp": bson::Timestamp { time: 5, increment: 6 },
            "int64": 1i64 << 40,
            "min": bson::Bson::MinKey,
            "max": bson::Bson::MaxKey,
        };

        let mut expected = Vec::new();
        theirs.to_writer(&mut expected).unwrap();
        assert_eq!(encode(&ours, false).unwrap(), expected);

        assert_eq!(Document::from_bson(&theirs).unwrap(), ours);
        assert_eq!(ours.to_bson().unwrap(), theirs);
    }

    #[test]
    fn test_object_id_conversion() {
        let oid = ObjectId::new();
        let converted = bson::oid::ObjectId::from(oid);
        assert_eq!(converted.to_hex(), oid.to_hex());
        assert_eq!(ObjectId::from(converted), oid);
    }
}

// ============================================================================
// Message Framing Tests
// ============================================================================

mod framing_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_header_fields() {
        let message = Message::Msg(OpMsg::command("admin", doc! { "ping": 1 }));
        let bytes = message.serialize().unwrap();
        let header = MessageHeader::parse(&bytes, bytes.len()).unwrap();

        assert_eq!(header.length as usize, bytes.len());
        assert_eq!(header.request_id, message.request_id());
        assert_eq!(header.response_to, 0);
        assert_eq!(header.op_code, OpCode::Msg);
        assert_eq!(header.body_length(), bytes.len() - HEADER_LENGTH);

        assert!(matches!(
            MessageHeader::parse(&bytes, bytes.len() - 1),
            Err(MongoError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_request_ids_increase() {
        let first = OpMsg::new(doc! { "a": 1 }).request_id;
        let second = OpQuery::command("admin", doc! { "a": 1 }).request_id;
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let compressors = CompressorRegistry::default();

        let query = Message::Query(OpQuery::command("admin", doc! { "isMaster": 1 }));
        write_message(&mut client, &query).await.unwrap();
        let received = read_message(&mut server, 1 << 20, &compressors).await.unwrap();
        assert_eq!(received, query);

        let reply = Message::Reply(OpReply::new(
            query.request_id(),
            vec![doc! { "ok": 1.0, "ismaster": true }],
        ));
        write_message(&mut server, &reply).await.unwrap();
        let received = read_message(&mut client, 1 << 20, &compressors).await.unwrap();
        assert_eq!(received.response_to(), query.request_id());
        assert_eq!(
            received.into_reply_document().unwrap().get_bool("ismaster"),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_compressed_stream_is_restored() {
        let (mut client, mut server) = tokio::io::duplex(1 << 16);
        let compressors = CompressorRegistry::default();

        let payload = "z".repeat(4_096);
        let original = Message::Msg(OpMsg::command("db", doc! { "insert": "c", "pad": payload }));
        let compressed = Message::Compressed(OpCompressed::compress(&original, &Zlib::new()).unwrap());
        assert!(compressed.serialize().unwrap().len() < original.serialize().unwrap().len());

        write_message(&mut client, &compressed).await.unwrap();
        let received = read_message(&mut server, 1 << 20, &compressors).await.unwrap();
        assert_eq!(received, original);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1 << 16);
        let message = Message::Msg(OpMsg::command(
            "db",
            doc! { "pad": "x".repeat(2_000) },
        ));
        write_message(&mut client, &message).await.unwrap();

        let err = read_message(&mut server, 1_024, &CompressorRegistry::default())
            .await
            .unwrap_err();
        assert!(err.is_protocol_error());
        assert!(matches!(err, MongoError::MessageTooLarge { max: 1_024, .. }));
    }
}
