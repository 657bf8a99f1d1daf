use super::oid::ObjectId;
use super::raw::ByteReader;
use super::types::{BinarySubtype, ElementType};
use super::value::{
    Binary, DateTime, DbPointer, Decimal128, JavaScriptCodeWithScope, Regex, Timestamp, Value,
};
use super::Document;
use crate::error::{MongoError, Result};

/// Smallest valid document: length prefix plus terminator.
const MIN_DOCUMENT_SIZE: usize = 5;

/// Nesting guard against stack exhaustion on hostile input.
const MAX_NESTING_DEPTH: usize = 200;

/// Decode exactly one document occupying all of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Document> {
    let (document, consumed) = decode_prefix(bytes)?;
    if consumed != bytes.len() {
        return Err(MongoError::corrupt(format!(
            "{} trailing bytes after document",
            bytes.len() - consumed
        )));
    }
    Ok(document)
}

/// Decode the document at the start of `bytes`, returning it and the bytes consumed.
pub fn decode_prefix(bytes: &[u8]) -> Result<(Document, usize)> {
    let mut reader = ByteReader::new(bytes);
    let document = read_document(&mut reader, 0)?;
    Ok((document, reader.position()))
}

pub(crate) fn read_document(reader: &mut ByteReader<'_>, depth: usize) -> Result<Document> {
    let mut elements = element_list(reader, depth)?;
    let mut document = Document::new();
    while !elements.is_empty() {
        let (key, value) = read_element(&mut elements, depth)?;
        document.push_decoded(key, value)?;
    }
    Ok(document)
}

/// Arrays trust their keys to be "0", "1", ... in order; only the values are kept.
fn read_array(reader: &mut ByteReader<'_>, depth: usize) -> Result<Vec<Value>> {
    let mut elements = element_list(reader, depth)?;
    let mut items = Vec::new();
    while !elements.is_empty() {
        let (_, value) = read_element(&mut elements, depth)?;
        items.push(value);
    }
    Ok(items)
}

/// Consume one length-prefixed document and return a reader over its elements.
fn element_list<'a>(reader: &mut ByteReader<'a>, depth: usize) -> Result<ByteReader<'a>> {
    if depth > MAX_NESTING_DEPTH {
        return Err(MongoError::corrupt("document nesting is too deep"));
    }
    let declared = reader.peek_i32()?;
    let length = usize::try_from(declared)
        .ok()
        .filter(|l| *l >= MIN_DOCUMENT_SIZE)
        .ok_or_else(|| MongoError::corrupt(format!("invalid document length {}", declared)))?;
    if length > reader.remaining() {
        return Err(MongoError::corrupt(format!(
            "document length {} exceeds the {} bytes available",
            length,
            reader.remaining()
        )));
    }
    let bytes = reader.read_bytes(length)?;
    if bytes[length - 1] != 0 {
        return Err(MongoError::corrupt("document is not null-terminated"));
    }
    Ok(ByteReader::new(&bytes[4..length - 1]))
}

fn read_element<'a>(reader: &mut ByteReader<'a>, depth: usize) -> Result<(&'a str, Value)> {
    let type_byte = reader.read_u8()?;
    let element_type = ElementType::from_byte(type_byte).ok_or_else(|| {
        MongoError::corrupt(format!("unknown element type 0x{:02x}", type_byte))
    })?;
    let key = reader.read_cstring()?;

    let value = match element_type {
        ElementType::Double => Value::Double(reader.read_f64()?),
        ElementType::String => Value::String(reader.read_string()?.to_string()),
        ElementType::EmbeddedDocument => Value::Document(read_document(reader, depth + 1)?),
        ElementType::Array => Value::Array(read_array(reader, depth + 1)?),
        ElementType::Binary => Value::Binary(read_binary(reader)?),
        ElementType::Undefined => Value::Undefined,
        ElementType::ObjectId => Value::ObjectId(ObjectId::from_bytes(reader.read_array()?)),
        ElementType::Boolean => match reader.read_u8()? {
            0 => Value::Boolean(false),
            1 => Value::Boolean(true),
            other => {
                return Err(MongoError::corrupt(format!(
                    "invalid boolean byte {} for key {:?}",
                    other, key
                )))
            }
        },
        ElementType::DateTime => Value::DateTime(DateTime::from_millis(reader.read_i64()?)),
        ElementType::Null => Value::Null,
        ElementType::RegularExpression => {
            let pattern = reader.read_cstring()?;
            let options = reader.read_cstring()?;
            Value::RegularExpression(Regex::new(pattern, options))
        }
        ElementType::DbPointer => {
            let namespace = reader.read_string()?.to_string();
            let id = ObjectId::from_bytes(reader.read_array()?);
            Value::DbPointer(DbPointer { namespace, id })
        }
        ElementType::JavaScriptCode => Value::JavaScriptCode(reader.read_string()?.to_string()),
        ElementType::Symbol => Value::Symbol(reader.read_string()?.to_string()),
        ElementType::JavaScriptCodeWithScope => {
            Value::JavaScriptCodeWithScope(read_code_with_scope(reader, depth)?)
        }
        ElementType::Int32 => Value::Int32(reader.read_i32()?),
        ElementType::Timestamp => {
            let increment = reader.read_u32()?;
            let time = reader.read_u32()?;
            Value::Timestamp(Timestamp { time, increment })
        }
        ElementType::Int64 => Value::Int64(reader.read_i64()?),
        ElementType::Decimal128 => Value::Decimal128(Decimal128::from_bytes(reader.read_array()?)),
        ElementType::MaxKey => Value::MaxKey,
        ElementType::MinKey => Value::MinKey,
    };
    Ok((key, value))
}

fn read_binary(reader: &mut ByteReader<'_>) -> Result<Binary> {
    let length = reader.read_length()?;
    let subtype = BinarySubtype::from(reader.read_u8()?);
    let payload = reader.read_bytes(length)?;
    if subtype != BinarySubtype::BinaryOld {
        return Ok(Binary::new(subtype, payload));
    }

    let mut inner = ByteReader::new(payload);
    let inner_length = inner.read_length()?;
    if inner_length + 4 != length {
        return Err(MongoError::corrupt(format!(
            "old binary inner length {} does not match outer length {}",
            inner_length, length
        )));
    }
    Ok(Binary::new(subtype, inner.rest()))
}

fn read_code_with_scope(
    reader: &mut ByteReader<'_>,
    depth: usize,
) -> Result<JavaScriptCodeWithScope> {
    let total = reader.read_length()?;
    // length field, empty code string, empty scope
    if total < 4 + 5 + MIN_DOCUMENT_SIZE {
        return Err(MongoError::corrupt(format!(
            "code with scope length {} is too small",
            total
        )));
    }
    let mut inner = ByteReader::new(reader.read_bytes(total - 4)?);
    let code = inner.read_string()?.to_string();
    let scope = read_document(&mut inner, depth + 1)?;
    if !inner.is_empty() {
        return Err(MongoError::corrupt(
            "code with scope length does not match its contents",
        ));
    }
    Ok(JavaScriptCodeWithScope { code, scope })
}
