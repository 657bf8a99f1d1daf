//! `OP_COMPRESSED` and the compressors that can fill it.
//!
//! ```text
//! OP_COMPRESSED := header originalOpcode:i32 uncompressedSize:i32 compressorId:u8 bytes*
//! ```
//!
//! Compression wraps the body of an already-serialized message. The wrapper
//! keeps the original request id and `responseTo`, so replies still match up.

use super::header::{check_length, MessageHeader, OpCode, HEADER_LENGTH};
use super::{Message, WireMessage};
use crate::document::raw::{checked_length, write_i32, ByteReader};
use crate::document::Document;
use crate::error::{MongoError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

/// Commands whose messages are never compressed.
const UNCOMPRESSIBLE_COMMANDS: &[&str] = &[
    "hello",
    "ismaster",
    "saslstart",
    "saslcontinue",
    "getnonce",
    "authenticate",
    "createuser",
    "updateuser",
    "copydbsaslstart",
    "copydbgetnonce",
    "copydb",
];

/// Whether a message carrying `command` may be compressed.
pub fn is_compressible(command: &Document) -> bool {
    match command.first_key() {
        Some(name) => !UNCOMPRESSIBLE_COMMANDS
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name)),
        None => true,
    }
}

/// A byte transform identified on the wire by a one-byte id.
pub trait Compressor: Send + Sync + fmt::Debug {
    /// Wire id.
    fn id(&self) -> u8;

    /// Name used when negotiating with the server.
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress `data`, which must expand to exactly `uncompressed_size` bytes.
    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>>;
}

/// Identity compressor, id 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

impl Compressor for Noop {
    fn id(&self) -> u8 {
        0
    }

    fn name(&self) -> &'static str {
        "noop"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        if data.len() != uncompressed_size {
            return Err(MongoError::Compression(format!(
                "noop payload is {} bytes, expected {}",
                data.len(),
                uncompressed_size
            )));
        }
        Ok(data.to_vec())
    }
}

/// zlib compressor, id 2.
#[derive(Debug, Clone, Copy)]
pub struct Zlib {
    level: u32,
}

impl Zlib {
    /// Default level (6).
    pub fn new() -> Self {
        Self { level: 6 }
    }

    /// Level 0-9; larger values are clamped.
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for Zlib {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Zlib {
    fn id(&self) -> u8 {
        2
    }

    fn name(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| MongoError::Compression(format!("zlib compression failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| MongoError::Compression(format!("zlib compression failed: {}", e)))
    }

    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(uncompressed_size);
        // one extra byte so an overlong stream is detected without inflating all of it
        ZlibDecoder::new(data)
            .take(uncompressed_size as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| MongoError::Compression(format!("zlib decompression failed: {}", e)))?;
        if out.len() != uncompressed_size {
            return Err(MongoError::Compression(format!(
                "zlib payload inflated to {} bytes, expected {}",
                out.len(),
                uncompressed_size
            )));
        }
        Ok(out)
    }
}

/// Compressors known to this process, by wire id.
#[derive(Debug, Clone)]
pub struct CompressorRegistry {
    compressors: HashMap<u8, Arc<dyn Compressor>>,
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            compressors: HashMap::new(),
        };
        registry.register(Arc::new(Noop));
        registry.register(Arc::new(Zlib::new()));
        registry
    }
}

impl CompressorRegistry {
    /// Add or replace a compressor under its id.
    pub fn register(&mut self, compressor: Arc<dyn Compressor>) {
        self.compressors.insert(compressor.id(), compressor);
    }

    pub fn get(&self, id: u8) -> Option<Arc<dyn Compressor>> {
        self.compressors.get(&id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Compressor>> {
        self.compressors
            .values()
            .find(|c| c.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// The first compressor in the client's preference order that the server
    /// also advertised.
    pub fn negotiate(&self, preferred: &[String], server: &[String]) -> Option<Arc<dyn Compressor>> {
        preferred
            .iter()
            .filter(|name| server.iter().any(|s| s.eq_ignore_ascii_case(name)))
            .find_map(|name| self.by_name(name))
    }
}

/// An `OP_COMPRESSED` message.
#[derive(Debug, Clone, PartialEq)]
pub struct OpCompressed {
    pub request_id: i32,
    pub response_to: i32,
    pub original_op_code: OpCode,
    pub uncompressed_size: i32,
    pub compressor_id: u8,
    pub compressed: Vec<u8>,
}

impl OpCompressed {
    /// Compress the body of `message`.
    pub fn compress(message: &Message, compressor: &dyn Compressor) -> Result<Self> {
        if let Message::Compressed(_) = message {
            return Err(MongoError::Compression(
                "message is already compressed".to_string(),
            ));
        }
        let bytes = message.serialize()?;
        let body = &bytes[HEADER_LENGTH..];
        Ok(Self {
            request_id: message.request_id(),
            response_to: message.response_to(),
            original_op_code: message.op_code(),
            uncompressed_size: checked_length(body.len())?,
            compressor_id: compressor.id(),
            compressed: compressor.compress(body)?,
        })
    }

    /// Restore the wrapped message under its original opcode.
    pub fn decompress(
        &self,
        compressors: &CompressorRegistry,
        max_message_size: usize,
    ) -> Result<Message> {
        if self.original_op_code == OpCode::Compressed {
            return Err(MongoError::protocol("nested OP_COMPRESSED message"));
        }
        let length = self
            .uncompressed_size
            .checked_add(HEADER_LENGTH as i32)
            .ok_or_else(|| MongoError::protocol("uncompressed size overflows"))?;
        check_length(length, max_message_size)?;

        let compressor = compressors.get(self.compressor_id).ok_or_else(|| {
            MongoError::Compression(format!("unknown compressor id {}", self.compressor_id))
        })?;
        let body = compressor.decompress(&self.compressed, self.uncompressed_size as usize)?;

        let mut bytes = Vec::with_capacity(length as usize);
        MessageHeader {
            length,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: self.original_op_code,
        }
        .write_to(&mut bytes);
        bytes.extend_from_slice(&body);
        Message::decode_raw(&bytes, max_message_size)
    }
}

impl WireMessage for OpCompressed {
    const OP_CODE: OpCode = OpCode::Compressed;

    fn request_id(&self) -> i32 {
        self.request_id
    }

    fn response_to(&self) -> i32 {
        self.response_to
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_i32(buf, self.original_op_code as i32);
        write_i32(buf, self.uncompressed_size);
        buf.push(self.compressor_id);
        buf.extend_from_slice(&self.compressed);
        Ok(())
    }

    fn read_body(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        let original_op_code = OpCode::try_from(reader.read_i32()?)?;
        let uncompressed_size = reader.read_i32()?;
        if uncompressed_size < 0 {
            return Err(MongoError::protocol(format!(
                "negative uncompressed size {}",
                uncompressed_size
            )));
        }
        let compressor_id = reader.read_u8()?;
        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            original_op_code,
            uncompressed_size,
            compressor_id,
            compressed: reader.rest().to_vec(),
        })
    }
}
