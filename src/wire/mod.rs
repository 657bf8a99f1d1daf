//! Message framing for the wire protocol.
//!
//! Every message is a 16-byte [`MessageHeader`] followed by an opcode-specific
//! body. The legacy opcodes (`OP_QUERY`, `OP_INSERT`, `OP_UPDATE`, `OP_DELETE`,
//! `OP_GET_MORE`, `OP_KILL_CURSORS`, `OP_REPLY`) each carry a fixed grammar;
//! `OP_MSG` carries flag bits, one command document and optional document
//! sequences; `OP_COMPRESSED` wraps the body of any other message.

mod compression;
mod header;
mod legacy;
mod msg;

pub use compression::{
    is_compressible, Compressor, CompressorRegistry, Noop, OpCompressed, Zlib,
};
pub use header::{
    next_request_id, MessageHeader, OpCode, DEFAULT_MAX_MESSAGE_SIZE, HEADER_LENGTH,
};
pub use legacy::{
    DeleteFlags, InsertFlags, OpDelete, OpGetMore, OpInsert, OpKillCursors, OpQuery, OpReply,
    OpUpdate, QueryFlags, ReplyFlags, UpdateFlags,
};
pub use msg::{DocumentSequence, MsgFlags, OpMsg, COMMAND_OVERHEAD};

use crate::document::raw::{patch_length, reserve_length, write_i32};
use crate::document::Document;
use crate::error::{MongoError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Define a bit-flag newtype over an integer word.
macro_rules! wire_flags {
    (
        $(#[$meta:meta])*
        pub struct $name:ident($int:ty) {
            $( $(#[$fmeta:meta])* const $flag:ident = $value:expr; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($int);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: $name = $name($value); )*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn from_bits(bits: $int) -> Self {
                $name(bits)
            }

            pub const fn bits(&self) -> $int {
                self.0
            }

            pub const fn contains(&self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}
pub(crate) use wire_flags;

/// A message type with a fixed opcode and body grammar.
pub trait WireMessage: Sized {
    const OP_CODE: OpCode;

    fn request_id(&self) -> i32;

    fn response_to(&self) -> i32;

    /// Append the opcode-specific body.
    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()>;

    /// Parse the opcode-specific body.
    fn read_body(header: &MessageHeader, body: &[u8]) -> Result<Self>;

    /// Serialize header and body. The declared length always equals the byte count.
    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);
        let offset = reserve_length(&mut buf);
        write_i32(&mut buf, self.request_id());
        write_i32(&mut buf, self.response_to());
        write_i32(&mut buf, Self::OP_CODE as i32);
        self.write_body(&mut buf)?;
        patch_length(&mut buf, offset)?;
        Ok(buf)
    }

    /// Parse a complete message of this type.
    fn deserialize(bytes: &[u8], max_message_size: usize) -> Result<Self> {
        let header = MessageHeader::parse(bytes, max_message_size)?;
        if header.op_code != Self::OP_CODE {
            return Err(MongoError::protocol(format!(
                "expected {:?} message, got {:?}",
                Self::OP_CODE,
                header.op_code
            )));
        }
        check_declared_length(&header, bytes.len())?;
        Self::read_body(&header, &bytes[HEADER_LENGTH..])
    }
}

fn check_declared_length(header: &MessageHeader, actual: usize) -> Result<()> {
    if header.length as usize != actual {
        return Err(MongoError::protocol(format!(
            "message declares {} bytes but {} were supplied",
            header.length, actual
        )));
    }
    Ok(())
}

/// Any wire protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Reply(OpReply),
    Update(OpUpdate),
    Insert(OpInsert),
    Query(OpQuery),
    GetMore(OpGetMore),
    Delete(OpDelete),
    KillCursors(OpKillCursors),
    Compressed(OpCompressed),
    Msg(OpMsg),
}

macro_rules! dispatch {
    ($self:expr, $m:ident => $body:expr) => {
        match $self {
            Message::Reply($m) => $body,
            Message::Update($m) => $body,
            Message::Insert($m) => $body,
            Message::Query($m) => $body,
            Message::GetMore($m) => $body,
            Message::Delete($m) => $body,
            Message::KillCursors($m) => $body,
            Message::Compressed($m) => $body,
            Message::Msg($m) => $body,
        }
    };
}

impl Message {
    pub fn op_code(&self) -> OpCode {
        match self {
            Message::Reply(_) => OpCode::Reply,
            Message::Update(_) => OpCode::Update,
            Message::Insert(_) => OpCode::Insert,
            Message::Query(_) => OpCode::Query,
            Message::GetMore(_) => OpCode::GetMore,
            Message::Delete(_) => OpCode::Delete,
            Message::KillCursors(_) => OpCode::KillCursors,
            Message::Compressed(_) => OpCode::Compressed,
            Message::Msg(_) => OpCode::Msg,
        }
    }

    pub fn request_id(&self) -> i32 {
        dispatch!(self, m => m.request_id())
    }

    pub fn response_to(&self) -> i32 {
        dispatch!(self, m => m.response_to())
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        dispatch!(self, m => m.serialize())
    }

    /// Whether the sender should wait for a reply to this message.
    ///
    /// One-way legacy writes, kill-cursors, replies and `OP_MSG` with
    /// `moreToCome` are not replyable. A compressed wrapper answers for its
    /// original opcode; it cannot see an `OP_MSG`'s compressed flag bits.
    pub fn is_replyable(&self) -> bool {
        match self {
            Message::Query(_) | Message::GetMore(_) => true,
            Message::Msg(msg) => !msg.more_to_come(),
            Message::Compressed(c) => matches!(
                c.original_op_code,
                OpCode::Query | OpCode::GetMore | OpCode::Msg
            ),
            Message::Reply(_)
            | Message::Update(_)
            | Message::Insert(_)
            | Message::Delete(_)
            | Message::KillCursors(_) => false,
        }
    }

    /// Parse a complete message without decompressing it.
    pub fn decode_raw(bytes: &[u8], max_message_size: usize) -> Result<Message> {
        let header = MessageHeader::parse(bytes, max_message_size)?;
        check_declared_length(&header, bytes.len())?;
        let body = &bytes[HEADER_LENGTH..];
        Ok(match header.op_code {
            OpCode::Reply => Message::Reply(OpReply::read_body(&header, body)?),
            OpCode::Update => Message::Update(OpUpdate::read_body(&header, body)?),
            OpCode::Insert => Message::Insert(OpInsert::read_body(&header, body)?),
            OpCode::Query => Message::Query(OpQuery::read_body(&header, body)?),
            OpCode::GetMore => Message::GetMore(OpGetMore::read_body(&header, body)?),
            OpCode::Delete => Message::Delete(OpDelete::read_body(&header, body)?),
            OpCode::KillCursors => {
                Message::KillCursors(OpKillCursors::read_body(&header, body)?)
            }
            OpCode::Compressed => Message::Compressed(OpCompressed::read_body(&header, body)?),
            OpCode::Msg => Message::Msg(OpMsg::read_body(&header, body)?),
        })
    }

    /// Parse a complete message, unwrapping `OP_COMPRESSED` into the original message.
    pub fn from_bytes(
        bytes: &[u8],
        max_message_size: usize,
        compressors: &CompressorRegistry,
    ) -> Result<Message> {
        match Message::decode_raw(bytes, max_message_size)? {
            Message::Compressed(compressed) => {
                compressed.decompress(compressors, max_message_size)
            }
            message => Ok(message),
        }
    }

    /// The reply document of a command response.
    ///
    /// `OP_MSG` yields its section 0 document; `OP_REPLY` yields its first
    /// document, or a command error when the query-failure flag is set.
    pub fn into_reply_document(self) -> Result<Document> {
        match self {
            Message::Msg(msg) => Ok(msg.command),
            Message::Reply(reply) => {
                let failed = reply.flags.contains(ReplyFlags::QUERY_FAILURE);
                let document = reply
                    .documents
                    .into_iter()
                    .next()
                    .ok_or_else(|| MongoError::protocol("reply contained no documents"))?;
                if failed {
                    let message = document.get_str("$err").unwrap_or("query failure");
                    let code = document.get_integer("code").unwrap_or(0) as i32;
                    return Err(MongoError::command(code, message));
                }
                Ok(document)
            }
            other => Err(MongoError::protocol(format!(
                "{:?} is not a reply message",
                other.op_code()
            ))),
        }
    }
}

/// Read one complete message's bytes from a stream.
///
/// The declared length is validated against `max_message_size` before any of
/// the body is read or allocated.
pub async fn read_message_bytes<R>(reader: &mut R, max_message_size: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LENGTH];
    reader.read_exact(&mut header).await?;
    let parsed = MessageHeader::parse(&header, max_message_size)?;

    let mut bytes = vec![0u8; parsed.length as usize];
    bytes[..HEADER_LENGTH].copy_from_slice(&header);
    reader.read_exact(&mut bytes[HEADER_LENGTH..]).await?;
    Ok(bytes)
}

/// Read and parse one message, decompressing it if needed.
pub async fn read_message<R>(
    reader: &mut R,
    max_message_size: usize,
    compressors: &CompressorRegistry,
) -> Result<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let bytes = read_message_bytes(reader, max_message_size).await?;
    Message::from_bytes(&bytes, max_message_size, compressors)
}

/// Serialize and write one message.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = message.serialize()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
