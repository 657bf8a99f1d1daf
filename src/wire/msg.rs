//! `OP_MSG`, the extensible message format.
//!
//! ```text
//! OP_MSG   := header flagBits:u32 section+ checksum:u32?
//! section  := 0x00 document
//!           | 0x01 size:i32 identifier:cstring document*
//! ```

use super::header::{next_request_id, MessageHeader, OpCode};
use super::{wire_flags, WireMessage};
use crate::document::raw::{patch_length, reserve_length, write_cstring, write_u32, ByteReader};
use crate::document::{
    encode_into, read_document, Document, EncodeOptions, DEFAULT_MAX_DOCUMENT_SIZE,
};
use crate::error::{MongoError, Result};

wire_flags! {
    /// `OP_MSG` flag bits.
    pub struct MsgFlags(u32) {
        const CHECKSUM_PRESENT = 1;
        const MORE_TO_COME = 1 << 1;
        const EXHAUST_ALLOWED = 1 << 16;
    }
}

/// Bits 0-15 must be understood by the receiver; bits 16-31 may be ignored.
const REQUIRED_BITS: u32 = 0xFFFF;
const KNOWN_REQUIRED_BITS: u32 = 0b11;

/// Room a command body gets beyond the document ceiling for its own fields.
pub const COMMAND_OVERHEAD: usize = 16 * 1024;

const SECTION_BODY: u8 = 0;
const SECTION_SEQUENCE: u8 = 1;

/// A kind 1 section: a named run of documents, such as the `documents`
/// argument of an `insert`.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

/// An `OP_MSG` message.
#[derive(Debug, Clone, PartialEq)]
pub struct OpMsg {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: MsgFlags,
    /// The kind 0 section.
    pub command: Document,
    pub sequences: Vec<DocumentSequence>,
    /// Checksum read off the wire, if the sender included one.
    pub checksum: Option<u32>,
    /// Largest document the receiver accepts. Not part of the encoding.
    pub max_document_size: Option<usize>,
}

impl OpMsg {
    pub fn new(command: Document) -> Self {
        Self {
            request_id: next_request_id(),
            response_to: 0,
            flags: MsgFlags::empty(),
            command,
            sequences: Vec::new(),
            checksum: None,
            max_document_size: None,
        }
    }

    /// A command addressed to `db`, which travels as the `$db` field.
    pub fn command(db: &str, mut command: Document) -> Self {
        command.insert("$db", db);
        Self::new(command)
    }

    /// A reply to `request_id` carrying `command`.
    pub fn reply_to(request_id: i32, command: Document) -> Self {
        let mut msg = Self::new(command);
        msg.response_to = request_id;
        msg
    }

    pub fn with_sequence(mut self, identifier: impl Into<String>, documents: Vec<Document>) -> Self {
        self.sequences.push(DocumentSequence {
            identifier: identifier.into(),
            documents,
        });
        self
    }

    /// Cap every sequence document at `size` bytes, and the body at `size`
    /// plus [`COMMAND_OVERHEAD`].
    pub fn with_max_document_size(mut self, size: usize) -> Self {
        self.max_document_size = Some(size);
        self
    }

    /// The sender will not wait for a reply.
    pub fn more_to_come(&self) -> bool {
        self.flags.contains(MsgFlags::MORE_TO_COME)
    }

    /// The server may stream several replies to this request.
    pub fn exhaust_allowed(&self) -> bool {
        self.flags.contains(MsgFlags::EXHAUST_ALLOWED)
    }
}

impl WireMessage for OpMsg {
    const OP_CODE: OpCode = OpCode::Msg;

    fn request_id(&self) -> i32 {
        self.request_id
    }

    fn response_to(&self) -> i32 {
        self.response_to
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        // Checksums are never generated, so the flag is never sent.
        let mut flags = self.flags;
        flags.remove(MsgFlags::CHECKSUM_PRESENT);
        write_u32(buf, flags.bits());

        let document_limit = self.max_document_size.unwrap_or(DEFAULT_MAX_DOCUMENT_SIZE);

        buf.push(SECTION_BODY);
        let body = EncodeOptions {
            max_document_size: Some(document_limit.saturating_add(COMMAND_OVERHEAD)),
            ..EncodeOptions::default()
        };
        encode_into(buf, &self.command, &body)?;

        // Sequence entries may be update statements, so `$` keys pass through.
        let entry = EncodeOptions {
            max_document_size: Some(document_limit),
            ..EncodeOptions::default()
        };
        for sequence in &self.sequences {
            buf.push(SECTION_SEQUENCE);
            let offset = reserve_length(buf);
            write_cstring(buf, &sequence.identifier)?;
            for document in &sequence.documents {
                encode_into(buf, document, &entry)?;
            }
            patch_length(buf, offset)?;
        }
        Ok(())
    }

    fn read_body(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        let flags = MsgFlags::from_bits(reader.read_u32()?);
        let unknown = flags.bits() & REQUIRED_BITS & !KNOWN_REQUIRED_BITS;
        if unknown != 0 {
            return Err(MongoError::protocol(format!(
                "OP_MSG sets unknown required flag bits {:#06x}",
                unknown
            )));
        }

        let (sections, checksum) = if flags.contains(MsgFlags::CHECKSUM_PRESENT) {
            let split = body
                .len()
                .checked_sub(4)
                .filter(|split| *split >= 4)
                .ok_or_else(|| MongoError::protocol("OP_MSG too short for its checksum"))?;
            let checksum = u32::from_le_bytes([
                body[split],
                body[split + 1],
                body[split + 2],
                body[split + 3],
            ]);
            (ByteReader::new(&body[4..split]), Some(checksum))
        } else {
            (ByteReader::new(reader.rest()), None)
        };
        let mut reader = sections;

        let mut command = None;
        let mut sequences = Vec::new();
        while !reader.is_empty() {
            match reader.read_u8()? {
                SECTION_BODY => {
                    let document = read_document(&mut reader, 0)?;
                    if command.replace(document).is_some() {
                        return Err(MongoError::protocol(
                            "OP_MSG contains more than one body section",
                        ));
                    }
                }
                SECTION_SEQUENCE => sequences.push(read_sequence(&mut reader)?),
                other => return Err(MongoError::InvalidPayloadType(other)),
            }
        }

        let command =
            command.ok_or_else(|| MongoError::protocol("OP_MSG has no body section"))?;
        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            command,
            sequences,
            checksum,
            max_document_size: None,
        })
    }
}

fn read_sequence(reader: &mut ByteReader<'_>) -> Result<DocumentSequence> {
    let size = reader.read_length()?;
    let payload = size
        .checked_sub(4)
        .ok_or_else(|| MongoError::protocol(format!("invalid document sequence size {}", size)))?;
    let mut section = ByteReader::new(reader.read_bytes(payload)?);
    let identifier = section.read_cstring()?.to_string();
    let mut documents = Vec::new();
    while !section.is_empty() {
        documents.push(read_document(&mut section, 0)?);
    }
    Ok(DocumentSequence {
        identifier,
        documents,
    })
}
