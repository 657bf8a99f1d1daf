//! Legacy opcodes.
//!
//! Servers from wire version 6 on accept `OP_MSG` for everything, but
//! `OP_QUERY` against `admin.$cmd` remains the only way to open a handshake
//! with a server of unknown version, and `OP_REPLY` is how it answers.

use super::header::{next_request_id, MessageHeader, OpCode};
use super::{wire_flags, WireMessage};
use crate::document::raw::{write_cstring, write_i32, write_i64, ByteReader};
use crate::document::{encode_into, read_document, Document, EncodeOptions};
use crate::error::{MongoError, Result};

wire_flags! {
    /// `OP_QUERY` flag bits.
    pub struct QueryFlags(i32) {
        const TAILABLE_CURSOR = 1 << 1;
        const SECONDARY_OK = 1 << 2;
        const OPLOG_REPLAY = 1 << 3;
        const NO_CURSOR_TIMEOUT = 1 << 4;
        const AWAIT_DATA = 1 << 5;
        const EXHAUST = 1 << 6;
        const PARTIAL = 1 << 7;
    }
}

wire_flags! {
    /// `OP_REPLY` response flag bits.
    pub struct ReplyFlags(i32) {
        const CURSOR_NOT_FOUND = 1;
        const QUERY_FAILURE = 1 << 1;
        const SHARD_CONFIG_STALE = 1 << 2;
        const AWAIT_CAPABLE = 1 << 3;
    }
}

wire_flags! {
    /// `OP_INSERT` flag bits.
    pub struct InsertFlags(i32) {
        const CONTINUE_ON_ERROR = 1;
    }
}

wire_flags! {
    /// `OP_UPDATE` flag bits.
    pub struct UpdateFlags(i32) {
        const UPSERT = 1;
        const MULTI_UPDATE = 1 << 1;
    }
}

wire_flags! {
    /// `OP_DELETE` flag bits.
    pub struct DeleteFlags(i32) {
        const SINGLE_REMOVE = 1;
    }
}

/// Command documents are not subject to user key rules.
fn command_options() -> EncodeOptions {
    EncodeOptions::default()
}

fn read_documents(reader: &mut ByteReader<'_>) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    while !reader.is_empty() {
        documents.push(read_document(reader, 0)?);
    }
    Ok(documents)
}

fn expect_zero(reader: &mut ByteReader<'_>, what: &str) -> Result<()> {
    match reader.read_i32()? {
        0 => Ok(()),
        other => Err(MongoError::protocol(format!(
            "reserved field in {} must be zero, got {}",
            what, other
        ))),
    }
}

fn expect_end(reader: &ByteReader<'_>, what: &str) -> Result<()> {
    if reader.is_empty() {
        Ok(())
    } else {
        Err(MongoError::protocol(format!(
            "{} trailing bytes after {} body",
            reader.remaining(),
            what
        )))
    }
}

/// `OP_QUERY`: a query, or a command when the namespace is `<db>.$cmd`.
#[derive(Debug, Clone, PartialEq)]
pub struct OpQuery {
    pub request_id: i32,
    pub flags: QueryFlags,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields_selector: Option<Document>,
}

impl OpQuery {
    pub fn new(full_collection_name: impl Into<String>, query: Document) -> Self {
        Self {
            request_id: next_request_id(),
            flags: QueryFlags::empty(),
            full_collection_name: full_collection_name.into(),
            number_to_skip: 0,
            number_to_return: 0,
            query,
            return_fields_selector: None,
        }
    }

    /// A command against `<db>.$cmd`, asking for exactly one reply document.
    pub fn command(db: &str, command: Document) -> Self {
        let mut query = Self::new(format!("{}.$cmd", db), command);
        query.number_to_return = -1;
        query
    }

    pub fn with_flags(mut self, flags: QueryFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_fields(mut self, selector: Document) -> Self {
        self.return_fields_selector = Some(selector);
        self
    }
}

impl WireMessage for OpQuery {
    const OP_CODE: OpCode = OpCode::Query;

    fn request_id(&self) -> i32 {
        self.request_id
    }

    fn response_to(&self) -> i32 {
        0
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_i32(buf, self.flags.bits());
        write_cstring(buf, &self.full_collection_name)?;
        write_i32(buf, self.number_to_skip);
        write_i32(buf, self.number_to_return);
        encode_into(buf, &self.query, &command_options())?;
        if let Some(selector) = &self.return_fields_selector {
            encode_into(buf, selector, &command_options())?;
        }
        Ok(())
    }

    fn read_body(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        let flags = QueryFlags::from_bits(reader.read_i32()?);
        let full_collection_name = reader.read_cstring()?.to_string();
        let number_to_skip = reader.read_i32()?;
        let number_to_return = reader.read_i32()?;
        let query = read_document(&mut reader, 0)?;
        let return_fields_selector = if reader.is_empty() {
            None
        } else {
            Some(read_document(&mut reader, 0)?)
        };
        expect_end(&reader, "OP_QUERY")?;
        Ok(Self {
            request_id: header.request_id,
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_fields_selector,
        })
    }
}

/// `OP_REPLY`: the answer to an `OP_QUERY` or `OP_GET_MORE`.
#[derive(Debug, Clone, PartialEq)]
pub struct OpReply {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl OpReply {
    pub fn new(response_to: i32, documents: Vec<Document>) -> Self {
        Self {
            request_id: next_request_id(),
            response_to,
            flags: ReplyFlags::empty(),
            cursor_id: 0,
            starting_from: 0,
            documents,
        }
    }

    pub fn number_returned(&self) -> usize {
        self.documents.len()
    }
}

impl WireMessage for OpReply {
    const OP_CODE: OpCode = OpCode::Reply;

    fn request_id(&self) -> i32 {
        self.request_id
    }

    fn response_to(&self) -> i32 {
        self.response_to
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_i32(buf, self.flags.bits());
        write_i64(buf, self.cursor_id);
        write_i32(buf, self.starting_from);
        write_i32(buf, crate::document::raw::checked_length(self.documents.len())?);
        for document in &self.documents {
            encode_into(buf, document, &command_options())?;
        }
        Ok(())
    }

    fn read_body(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        let flags = ReplyFlags::from_bits(reader.read_i32()?);
        let cursor_id = reader.read_i64()?;
        let starting_from = reader.read_i32()?;
        let number_returned = reader.read_i32()?;
        let documents = read_documents(&mut reader)?;
        if usize::try_from(number_returned).ok() != Some(documents.len()) {
            return Err(MongoError::protocol(format!(
                "OP_REPLY declares {} documents but carries {}",
                number_returned,
                documents.len()
            )));
        }
        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            cursor_id,
            starting_from,
            documents,
        })
    }
}

/// `OP_INSERT`: a one-way insert of user documents.
#[derive(Debug, Clone, PartialEq)]
pub struct OpInsert {
    pub request_id: i32,
    pub flags: InsertFlags,
    pub full_collection_name: String,
    pub documents: Vec<Document>,
}

impl OpInsert {
    pub fn new(full_collection_name: impl Into<String>, documents: Vec<Document>) -> Self {
        Self {
            request_id: next_request_id(),
            flags: InsertFlags::empty(),
            full_collection_name: full_collection_name.into(),
            documents,
        }
    }
}

impl WireMessage for OpInsert {
    const OP_CODE: OpCode = OpCode::Insert;

    fn request_id(&self) -> i32 {
        self.request_id
    }

    fn response_to(&self) -> i32 {
        0
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.documents.is_empty() {
            return Err(MongoError::invalid_argument(
                "OP_INSERT requires at least one document",
            ));
        }
        write_i32(buf, self.flags.bits());
        write_cstring(buf, &self.full_collection_name)?;
        let options = EncodeOptions::user_document();
        for document in &self.documents {
            encode_into(buf, document, &options)?;
        }
        Ok(())
    }

    fn read_body(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        let flags = InsertFlags::from_bits(reader.read_i32()?);
        let full_collection_name = reader.read_cstring()?.to_string();
        let documents = read_documents(&mut reader)?;
        Ok(Self {
            request_id: header.request_id,
            flags,
            full_collection_name,
            documents,
        })
    }
}

/// `OP_UPDATE`: a one-way update.
#[derive(Debug, Clone, PartialEq)]
pub struct OpUpdate {
    pub request_id: i32,
    pub full_collection_name: String,
    pub flags: UpdateFlags,
    pub selector: Document,
    pub update: Document,
}

impl OpUpdate {
    pub fn new(full_collection_name: impl Into<String>, selector: Document, update: Document) -> Self {
        Self {
            request_id: next_request_id(),
            full_collection_name: full_collection_name.into(),
            flags: UpdateFlags::empty(),
            selector,
            update,
        }
    }
}

impl WireMessage for OpUpdate {
    const OP_CODE: OpCode = OpCode::Update;

    fn request_id(&self) -> i32 {
        self.request_id
    }

    fn response_to(&self) -> i32 {
        0
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_i32(buf, 0);
        write_cstring(buf, &self.full_collection_name)?;
        write_i32(buf, self.flags.bits());
        encode_into(buf, &self.selector, &command_options())?;
        encode_into(buf, &self.update, &command_options())?;
        Ok(())
    }

    fn read_body(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        expect_zero(&mut reader, "OP_UPDATE")?;
        let full_collection_name = reader.read_cstring()?.to_string();
        let flags = UpdateFlags::from_bits(reader.read_i32()?);
        let selector = read_document(&mut reader, 0)?;
        let update = read_document(&mut reader, 0)?;
        expect_end(&reader, "OP_UPDATE")?;
        Ok(Self {
            request_id: header.request_id,
            full_collection_name,
            flags,
            selector,
            update,
        })
    }
}

/// `OP_DELETE`: a one-way delete.
#[derive(Debug, Clone, PartialEq)]
pub struct OpDelete {
    pub request_id: i32,
    pub full_collection_name: String,
    pub flags: DeleteFlags,
    pub selector: Document,
}

impl OpDelete {
    pub fn new(full_collection_name: impl Into<String>, selector: Document) -> Self {
        Self {
            request_id: next_request_id(),
            full_collection_name: full_collection_name.into(),
            flags: DeleteFlags::empty(),
            selector,
        }
    }
}

impl WireMessage for OpDelete {
    const OP_CODE: OpCode = OpCode::Delete;

    fn request_id(&self) -> i32 {
        self.request_id
    }

    fn response_to(&self) -> i32 {
        0
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_i32(buf, 0);
        write_cstring(buf, &self.full_collection_name)?;
        write_i32(buf, self.flags.bits());
        encode_into(buf, &self.selector, &command_options())?;
        Ok(())
    }

    fn read_body(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        expect_zero(&mut reader, "OP_DELETE")?;
        let full_collection_name = reader.read_cstring()?.to_string();
        let flags = DeleteFlags::from_bits(reader.read_i32()?);
        let selector = read_document(&mut reader, 0)?;
        expect_end(&reader, "OP_DELETE")?;
        Ok(Self {
            request_id: header.request_id,
            full_collection_name,
            flags,
            selector,
        })
    }
}

/// `OP_GET_MORE`: fetch the next batch of an open cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct OpGetMore {
    pub request_id: i32,
    pub full_collection_name: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

impl OpGetMore {
    pub fn new(full_collection_name: impl Into<String>, number_to_return: i32, cursor_id: i64) -> Self {
        Self {
            request_id: next_request_id(),
            full_collection_name: full_collection_name.into(),
            number_to_return,
            cursor_id,
        }
    }
}

impl WireMessage for OpGetMore {
    const OP_CODE: OpCode = OpCode::GetMore;

    fn request_id(&self) -> i32 {
        self.request_id
    }

    fn response_to(&self) -> i32 {
        0
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_i32(buf, 0);
        write_cstring(buf, &self.full_collection_name)?;
        write_i32(buf, self.number_to_return);
        write_i64(buf, self.cursor_id);
        Ok(())
    }

    fn read_body(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        expect_zero(&mut reader, "OP_GET_MORE")?;
        let full_collection_name = reader.read_cstring()?.to_string();
        let number_to_return = reader.read_i32()?;
        let cursor_id = reader.read_i64()?;
        expect_end(&reader, "OP_GET_MORE")?;
        Ok(Self {
            request_id: header.request_id,
            full_collection_name,
            number_to_return,
            cursor_id,
        })
    }
}

/// `OP_KILL_CURSORS`: close server-side cursors. Never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct OpKillCursors {
    pub request_id: i32,
    pub cursor_ids: Vec<i64>,
}

impl OpKillCursors {
    pub fn new(cursor_ids: Vec<i64>) -> Self {
        Self {
            request_id: next_request_id(),
            cursor_ids,
        }
    }
}

impl WireMessage for OpKillCursors {
    const OP_CODE: OpCode = OpCode::KillCursors;

    fn request_id(&self) -> i32 {
        self.request_id
    }

    fn response_to(&self) -> i32 {
        0
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_i32(buf, 0);
        write_i32(buf, crate::document::raw::checked_length(self.cursor_ids.len())?);
        for id in &self.cursor_ids {
            write_i64(buf, *id);
        }
        Ok(())
    }

    fn read_body(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        expect_zero(&mut reader, "OP_KILL_CURSORS")?;
        let count = reader.read_length()?;
        if count.saturating_mul(8) != reader.remaining() {
            return Err(MongoError::protocol(format!(
                "OP_KILL_CURSORS declares {} cursor ids in {} bytes",
                count,
                reader.remaining()
            )));
        }
        let cursor_ids = (0..count)
            .map(|_| reader.read_i64())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            request_id: header.request_id,
            cursor_ids,
        })
    }
}
