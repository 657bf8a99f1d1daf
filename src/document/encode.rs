use super::raw::{
    patch_length, reserve_length, write_cstring, write_i32, write_i64, write_string, write_u32,
};
use super::types::BinarySubtype;
use super::value::{normalize_regex_options, Binary, Value};
use super::Document;
use crate::error::{MongoError, Result};

/// Maximum size of a single document accepted by servers (16 MiB).
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Options controlling how a document is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodeOptions {
    /// Reject top-level keys that start with `$` or contain `.`.
    pub validate_keys: bool,
    /// Write a top-level `_id` field first.
    pub move_id: bool,
    /// Fail with `DocumentTooLarge` when the encoded size exceeds this.
    pub max_document_size: Option<usize>,
}

impl EncodeOptions {
    /// Options for user-supplied documents: validated keys, `_id` first, size capped.
    pub fn user_document() -> Self {
        Self {
            validate_keys: true,
            move_id: true,
            max_document_size: Some(DEFAULT_MAX_DOCUMENT_SIZE),
        }
    }
}

/// Encode a document, optionally validating its top-level keys.
pub fn encode(document: &Document, validate_keys: bool) -> Result<Vec<u8>> {
    encode_with_options(
        document,
        &EncodeOptions {
            validate_keys,
            ..EncodeOptions::default()
        },
    )
}

/// Encode a document with explicit options.
pub fn encode_with_options(document: &Document, options: &EncodeOptions) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    encode_into(&mut buf, document, options)?;
    Ok(buf)
}

/// Append an encoded document to `buf`, returning the number of bytes written.
pub(crate) fn encode_into(
    buf: &mut Vec<u8>,
    document: &Document,
    options: &EncodeOptions,
) -> Result<usize> {
    let start = buf.len();
    write_document(buf, document, Some(options))?;
    let size = buf.len() - start;
    if let Some(max) = options.max_document_size {
        if size > max {
            buf.truncate(start);
            return Err(MongoError::DocumentTooLarge { size, max });
        }
    }
    Ok(size)
}

/// `top_level` carries the options that only apply to the outermost document.
fn write_document(
    buf: &mut Vec<u8>,
    document: &Document,
    top_level: Option<&EncodeOptions>,
) -> Result<()> {
    let offset = reserve_length(buf);
    let move_id = top_level.map(|o| o.move_id).unwrap_or(false);
    let validate_keys = top_level.map(|o| o.validate_keys).unwrap_or(false);

    if move_id {
        if let Some(id) = document.get("_id") {
            write_element(buf, "_id", id)?;
        }
    }
    for (key, value) in document.iter() {
        if move_id && key == "_id" {
            continue;
        }
        if validate_keys {
            validate_key(key)?;
        }
        write_element(buf, key, value)?;
    }

    buf.push(0);
    patch_length(buf, offset)
}

fn write_array(buf: &mut Vec<u8>, items: &[Value]) -> Result<()> {
    let offset = reserve_length(buf);
    for (index, item) in items.iter().enumerate() {
        write_element(buf, &index.to_string(), item)?;
    }
    buf.push(0);
    patch_length(buf, offset)
}

fn validate_key(key: &str) -> Result<()> {
    if key.starts_with('$') {
        return Err(MongoError::InvalidKey(format!(
            "key {:?} must not start with '$'",
            key
        )));
    }
    if key.contains('.') {
        return Err(MongoError::InvalidKey(format!(
            "key {:?} must not contain '.'",
            key
        )));
    }
    Ok(())
}

fn write_element(buf: &mut Vec<u8>, key: &str, value: &Value) -> Result<()> {
    buf.push(value.element_type() as u8);
    write_cstring(buf, key)?;

    match value {
        Value::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::String(s) | Value::JavaScriptCode(s) | Value::Symbol(s) => write_string(buf, s)?,
        Value::Document(doc) => write_document(buf, doc, None)?,
        Value::Array(items) => write_array(buf, items)?,
        Value::Binary(binary) => write_binary(buf, binary)?,
        Value::Undefined | Value::Null | Value::MaxKey | Value::MinKey => {}
        Value::ObjectId(oid) => buf.extend_from_slice(&oid.bytes()),
        Value::Boolean(b) => buf.push(u8::from(*b)),
        Value::DateTime(dt) => write_i64(buf, dt.timestamp_millis()),
        Value::RegularExpression(regex) => {
            write_regex_part(buf, regex.pattern(), "pattern")?;
            // Normalized again: flags must reach the wire sorted even if built elsewhere.
            write_regex_part(buf, &normalize_regex_options(regex.options()), "options")?;
        }
        Value::DbPointer(pointer) => {
            write_string(buf, &pointer.namespace)?;
            buf.extend_from_slice(&pointer.id.bytes());
        }
        Value::JavaScriptCodeWithScope(code) => {
            let offset = reserve_length(buf);
            write_string(buf, &code.code)?;
            write_document(buf, &code.scope, None)?;
            patch_length(buf, offset)?;
        }
        Value::Int32(v) => write_i32(buf, *v),
        Value::Timestamp(ts) => {
            write_u32(buf, ts.increment);
            write_u32(buf, ts.time);
        }
        Value::Int64(v) => write_i64(buf, *v),
        Value::Decimal128(d) => buf.extend_from_slice(&d.bytes()),
    }
    Ok(())
}

fn write_binary(buf: &mut Vec<u8>, binary: &Binary) -> Result<()> {
    let len = super::raw::checked_length(binary.bytes.len())?;
    if binary.subtype == BinarySubtype::BinaryOld {
        let outer = len
            .checked_add(4)
            .ok_or_else(|| MongoError::IntegerRange("binary too large".to_string()))?;
        write_i32(buf, outer);
        buf.push(u8::from(binary.subtype));
        write_i32(buf, len);
    } else {
        write_i32(buf, len);
        buf.push(u8::from(binary.subtype));
    }
    buf.extend_from_slice(&binary.bytes);
    Ok(())
}

fn write_regex_part(buf: &mut Vec<u8>, part: &str, what: &str) -> Result<()> {
    if part.as_bytes().contains(&0) {
        return Err(MongoError::InvalidType(format!(
            "regex {} {:?} contains a null byte",
            what, part
        )));
    }
    write_cstring(buf, part)
}
