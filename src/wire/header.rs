use crate::document::raw::{write_i32, ByteReader};
use crate::error::{MongoError, Result};
use std::sync::atomic::{AtomicI32, Ordering};

/// Size of the standard message header.
pub const HEADER_LENGTH: usize = 16;

/// Default ceiling on a single message, as advertised by servers.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Next process-wide request id. Starts at 1.
pub fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
}

/// Message opcode.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
    Compressed = 2012,
    Msg = 2013,
}

impl TryFrom<i32> for OpCode {
    type Error = MongoError;

    fn try_from(code: i32) -> Result<Self> {
        Ok(match code {
            1 => OpCode::Reply,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            2012 => OpCode::Compressed,
            2013 => OpCode::Msg,
            other => return Err(MongoError::UnknownOpCode(other)),
        })
    }
}

/// The 16-byte header that starts every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total message size, header included.
    pub length: i32,
    pub request_id: i32,
    /// Request id this message answers, or 0.
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    /// Parse a header, rejecting declared lengths outside `16..=max_message_size`
    /// before the opcode is even looked at.
    pub fn parse(bytes: &[u8], max_message_size: usize) -> Result<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(MongoError::protocol(format!(
                "message header needs {} bytes, got {}",
                HEADER_LENGTH,
                bytes.len()
            )));
        }
        let mut reader = ByteReader::new(&bytes[..HEADER_LENGTH]);
        let length = reader.read_i32()?;
        check_length(length, max_message_size)?;
        let request_id = reader.read_i32()?;
        let response_to = reader.read_i32()?;
        let op_code = OpCode::try_from(reader.read_i32()?)?;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }

    /// Bytes following the header.
    pub fn body_length(&self) -> usize {
        self.length as usize - HEADER_LENGTH
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        write_i32(buf, self.length);
        write_i32(buf, self.request_id);
        write_i32(buf, self.response_to);
        write_i32(buf, self.op_code as i32);
    }
}

pub(crate) fn check_length(length: i32, max_message_size: usize) -> Result<()> {
    let size = usize::try_from(length)
        .ok()
        .filter(|l| *l >= HEADER_LENGTH)
        .ok_or_else(|| MongoError::protocol(format!("invalid message length {}", length)))?;
    if size > max_message_size {
        return Err(MongoError::MessageTooLarge {
            size,
            max: max_message_size,
        });
    }
    Ok(())
}
