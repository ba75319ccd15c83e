//! Wire protocol framing.
//! - Message header parsing and encoding
//! - OP_MSG with kind-0 / kind-1 sections, flag bits and CRC-32C trailer
//! - Legacy OP_QUERY / OP_REPLY for the driver handshake path

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bson::{decode_document_prefix, encode_document};
use crate::error::{CodecError, Error, Result};
use crate::types::Document;

pub const OP_REPLY: i32 = 1;
pub const OP_QUERY: i32 = 2004;
pub const OP_MSG: i32 = 2013;

pub const HEADER_LEN: usize = 16;
pub const MAX_MESSAGE_LEN: usize = 48_000_000;

pub const FLAG_CHECKSUM_PRESENT: u32 = 1 << 0;
pub const FLAG_MORE_TO_COME: u32 = 1 << 1;
pub const FLAG_EXHAUST_ALLOWED: u32 = 1 << 16;
const KNOWN_FLAGS: u32 = FLAG_CHECKSUM_PRESENT | FLAG_MORE_TO_COME | FLAG_EXHAUST_ALLOWED;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        // Little-endian 32-bit fields
        let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let request_id = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let response_to = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let op_code = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        Some((
            Self {
                message_length,
                request_id,
                response_to,
                op_code,
            },
            HEADER_LEN,
        ))
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        out[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        out[12..16].copy_from_slice(&self.op_code.to_le_bytes());
        out
    }
}

/// One OP_MSG section.
#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    /// Kind 0: a single body document.
    Body(Document),
    /// Kind 1: a named sequence of documents.
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpMsg {
    pub flags: u32,
    pub sections: Vec<Section>,
}

impl OpMsg {
    /// The canonical reply form: one kind-0 section, no flags.
    pub fn body(doc: Document) -> Self {
        Self {
            flags: 0,
            sections: vec![Section::Body(doc)],
        }
    }

    pub fn more_to_come(&self) -> bool {
        self.flags & FLAG_MORE_TO_COME != 0
    }

    pub fn exhaust_allowed(&self) -> bool {
        self.flags & FLAG_EXHAUST_ALLOWED != 0
    }

    /// The body document of the single kind-0 section.
    pub fn document(&self) -> Result<&Document> {
        self.sections
            .iter()
            .find_map(|s| match s {
                Section::Body(d) => Some(d),
                _ => None,
            })
            .ok_or_else(|| CodecError::malformed("message has no body section").into())
    }

    /// Fold kind-1 sequences into the body document as array fields, yielding
    /// the flat command document handlers dispatch on.
    pub fn into_command(self) -> Result<Document> {
        let mut body = None;
        let mut sequences = Vec::new();
        for section in self.sections {
            match section {
                Section::Body(d) => body = Some(d),
                Section::Sequence {
                    identifier,
                    documents,
                } => sequences.push((identifier, documents)),
            }
        }
        let mut body =
            body.ok_or_else(|| Error::from(CodecError::malformed("message has no body section")))?;
        for (identifier, documents) in sequences {
            let values: Vec<crate::types::Value> = documents
                .into_iter()
                .map(crate::types::Value::Document)
                .collect();
            body.try_insert(identifier, values)
                .map_err(|e| CodecError::malformed(e.to_string()))?;
        }
        Ok(body)
    }
}

/// Legacy OP_QUERY request (read-only subset used by the handshake).
#[derive(Debug, Clone, PartialEq)]
pub struct OpQuery {
    pub flags: u32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields: Option<Document>,
}

/// Legacy OP_REPLY, written in response to OP_QUERY only.
#[derive(Debug, Clone, PartialEq)]
pub struct OpReply {
    pub response_flags: u32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpBody {
    Msg(OpMsg),
    Query(OpQuery),
    Reply(OpReply),
}

/// Read one message. `Ok(None)` means the peer closed the connection cleanly
/// before sending a header.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(MessageHeader, OpBody)>> {
    let mut header_buf = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let (header, _) = MessageHeader::parse(&header_buf)
        .ok_or_else(|| Error::from(CodecError::malformed("short header")))?;

    if (header.message_length as usize) < HEADER_LEN {
        return Err(CodecError::malformed(format!(
            "declared length {} below header size",
            header.message_length
        ))
        .into());
    }
    if header.message_length as usize > MAX_MESSAGE_LEN {
        return Err(CodecError::malformed(format!(
            "declared length {} exceeds maximum",
            header.message_length
        ))
        .into());
    }

    let mut body = vec![0u8; header.message_length as usize - HEADER_LEN];
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CodecError::TruncatedBody.into());
        }
        Err(e) => return Err(e.into()),
    }

    let parsed = match header.op_code {
        OP_MSG => OpBody::Msg(decode_op_msg(&header_buf, &body)?),
        OP_QUERY => OpBody::Query(decode_op_query(&body)?),
        OP_REPLY => OpBody::Reply(decode_op_reply(&body)?),
        other => return Err(CodecError::UnknownOpcode(other).into()),
    };
    Ok(Some((header, parsed)))
}

/// Write one already-encoded message.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

fn bson_err(e: crate::bson::BsonError) -> Error {
    CodecError::malformed(e.to_string()).into()
}

/// Decode an OP_MSG body. `header_bytes` is needed because the CRC-32C
/// trailer covers the header as well.
pub fn decode_op_msg(header_bytes: &[u8], body: &[u8]) -> Result<OpMsg> {
    if body.len() < 4 {
        return Err(CodecError::TruncatedBody.into());
    }
    let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    if flags & !KNOWN_FLAGS != 0 {
        return Err(CodecError::malformed(format!(
            "reserved flag bits set: 0x{:08x}",
            flags & !KNOWN_FLAGS
        ))
        .into());
    }

    let sections_end = if flags & FLAG_CHECKSUM_PRESENT != 0 {
        if body.len() < 8 {
            return Err(CodecError::TruncatedBody.into());
        }
        let tail = &body[body.len() - 4..];
        let declared = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let mut crc = crc32c::crc32c(header_bytes);
        crc = crc32c::crc32c_append(crc, &body[..body.len() - 4]);
        if crc != declared {
            return Err(CodecError::ChecksumMismatch.into());
        }
        body.len() - 4
    } else {
        body.len()
    };

    let mut sections = Vec::new();
    let mut body_sections = 0usize;
    let mut pos = 4;
    while pos < sections_end {
        let kind = body[pos];
        pos += 1;
        match kind {
            0 => {
                let (doc, used) =
                    decode_document_prefix(&body[pos..sections_end]).map_err(bson_err)?;
                pos += used;
                body_sections += 1;
                sections.push(Section::Body(doc));
            }
            1 => {
                if sections_end - pos < 4 {
                    return Err(CodecError::TruncatedBody.into());
                }
                let sec_len =
                    i32::from_le_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]])
                        as usize;
                if sec_len < 5 || sec_len > sections_end - pos {
                    return Err(CodecError::malformed("bad kind-1 section length").into());
                }
                let sec_end = pos + sec_len;
                let mut cur = pos + 4;
                let rest = &body[cur..sec_end];
                let nul = rest
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| Error::from(CodecError::malformed("unterminated identifier")))?;
                let identifier = std::str::from_utf8(&rest[..nul])
                    .map_err(|_| Error::from(CodecError::malformed("identifier not UTF-8")))?
                    .to_string();
                cur += nul + 1;

                // Documents run to the section boundary, never past it.
                let mut documents = Vec::new();
                while cur < sec_end {
                    let (doc, used) =
                        decode_document_prefix(&body[cur..sec_end]).map_err(bson_err)?;
                    cur += used;
                    documents.push(doc);
                }
                pos = sec_end;
                sections.push(Section::Sequence {
                    identifier,
                    documents,
                });
            }
            other => {
                return Err(
                    CodecError::malformed(format!("unknown section kind {other}")).into(),
                );
            }
        }
    }

    if sections.is_empty() {
        return Err(CodecError::malformed("message has no sections").into());
    }
    if body_sections != 1 {
        return Err(CodecError::malformed(format!(
            "expected exactly one body section, got {body_sections}"
        ))
        .into());
    }
    Ok(OpMsg { flags, sections })
}

/// Encode an OP_MSG, honouring `FLAG_CHECKSUM_PRESENT` symmetrically.
pub fn encode_op_msg(msg: &OpMsg, response_to: i32, request_id: i32) -> Result<Vec<u8>> {
    let mut sections = Vec::new();
    for section in &msg.sections {
        match section {
            Section::Body(doc) => {
                sections.push(0u8);
                sections.extend_from_slice(&encode_document(doc).map_err(bson_err)?);
            }
            Section::Sequence {
                identifier,
                documents,
            } => {
                sections.push(1u8);
                let mut seq = Vec::new();
                seq.extend_from_slice(identifier.as_bytes());
                seq.push(0);
                for doc in documents {
                    seq.extend_from_slice(&encode_document(doc).map_err(bson_err)?);
                }
                sections.extend_from_slice(&((seq.len() + 4) as i32).to_le_bytes());
                sections.extend_from_slice(&seq);
            }
        }
    }

    let with_checksum = msg.flags & FLAG_CHECKSUM_PRESENT != 0;
    let body_len = 4 + sections.len() + if with_checksum { 4 } else { 0 };
    let message_length = (HEADER_LEN + body_len) as i32;

    let mut out = Vec::with_capacity(message_length as usize);
    let header = MessageHeader {
        message_length,
        request_id,
        response_to,
        op_code: OP_MSG,
    };
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&msg.flags.to_le_bytes());
    out.extend_from_slice(&sections);
    if with_checksum {
        let crc = crc32c::crc32c(&out);
        out.extend_from_slice(&crc.to_le_bytes());
    }
    Ok(out)
}

/// Encode an OP_MSG carrying a single body document, the common reply shape.
pub fn encode_op_msg_doc(doc: &Document, response_to: i32, request_id: i32) -> Result<Vec<u8>> {
    encode_op_msg(&OpMsg::body(doc.clone()), response_to, request_id)
}

/// Decode OP_QUERY into its fields; trailing bytes after the query document
/// are the optional returnFieldsSelector.
pub fn decode_op_query(body: &[u8]) -> Result<OpQuery> {
    if body.len() < 4 {
        return Err(CodecError::TruncatedBody.into());
    }
    let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let mut pos = 4;
    let rest = &body[pos..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::from(CodecError::malformed("unterminated collection name")))?;
    let full_collection_name = std::str::from_utf8(&rest[..nul])
        .map_err(|_| Error::from(CodecError::malformed("collection name not UTF-8")))?
        .to_string();
    pos += nul + 1;

    if body.len() - pos < 8 {
        return Err(CodecError::TruncatedBody.into());
    }
    let number_to_skip = i32::from_le_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]]);
    pos += 4;
    let number_to_return =
        i32::from_le_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]]);
    pos += 4;

    let (query, used) = decode_document_prefix(&body[pos..]).map_err(bson_err)?;
    pos += used;

    let return_fields = if pos < body.len() {
        let (doc, used) = decode_document_prefix(&body[pos..]).map_err(bson_err)?;
        pos += used;
        Some(doc)
    } else {
        None
    };
    if pos != body.len() {
        return Err(CodecError::malformed("trailing bytes after OP_QUERY").into());
    }

    Ok(OpQuery {
        flags,
        full_collection_name,
        number_to_skip,
        number_to_return,
        query,
        return_fields,
    })
}

/// Encode an OP_QUERY request (used by the test client and proxy path).
pub fn encode_op_query(q: &OpQuery, request_id: i32) -> Result<Vec<u8>> {
    let query_bytes = encode_document(&q.query).map_err(bson_err)?;
    let selector_bytes = match &q.return_fields {
        Some(doc) => encode_document(doc).map_err(bson_err)?,
        None => Vec::new(),
    };
    let body_len =
        4 + q.full_collection_name.len() + 1 + 8 + query_bytes.len() + selector_bytes.len();
    let message_length = (HEADER_LEN + body_len) as i32;

    let mut out = Vec::with_capacity(message_length as usize);
    let header = MessageHeader {
        message_length,
        request_id,
        response_to: 0,
        op_code: OP_QUERY,
    };
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&q.flags.to_le_bytes());
    out.extend_from_slice(q.full_collection_name.as_bytes());
    out.push(0);
    out.extend_from_slice(&q.number_to_skip.to_le_bytes());
    out.extend_from_slice(&q.number_to_return.to_le_bytes());
    out.extend_from_slice(&query_bytes);
    out.extend_from_slice(&selector_bytes);
    Ok(out)
}

/// Re-encode a decoded request, e.g. for forwarding upstream.
pub fn encode_request(body: &OpBody, request_id: i32) -> Result<Vec<u8>> {
    match body {
        OpBody::Msg(msg) => encode_op_msg(msg, 0, request_id),
        OpBody::Query(query) => encode_op_query(query, request_id),
        OpBody::Reply(_) => Err(CodecError::malformed("OP_REPLY is not a request").into()),
    }
}

pub fn decode_op_reply(body: &[u8]) -> Result<OpReply> {
    if body.len() < 20 {
        return Err(CodecError::TruncatedBody.into());
    }
    let response_flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let cursor_id = i64::from_le_bytes(body[4..12].try_into().unwrap());
    let starting_from = i32::from_le_bytes([body[12], body[13], body[14], body[15]]);
    let number_returned = i32::from_le_bytes([body[16], body[17], body[18], body[19]]);

    let mut documents = Vec::new();
    let mut pos = 20;
    while pos < body.len() {
        let (doc, used) = decode_document_prefix(&body[pos..]).map_err(bson_err)?;
        pos += used;
        documents.push(doc);
    }
    if documents.len() != number_returned as usize {
        return Err(CodecError::malformed("numberReturned disagrees with body").into());
    }
    Ok(OpReply {
        response_flags,
        cursor_id,
        starting_from,
        documents,
    })
}

/// Encode an OP_REPLY with the provided documents.
pub fn encode_op_reply(reply: &OpReply, response_to: i32, request_id: i32) -> Result<Vec<u8>> {
    let mut docs_buf = Vec::new();
    for d in &reply.documents {
        docs_buf.extend_from_slice(&encode_document(d).map_err(bson_err)?);
    }

    let body_len = 4 + 8 + 4 + 4 + docs_buf.len();
    let message_length = (HEADER_LEN + body_len) as i32;

    let mut out = Vec::with_capacity(message_length as usize);
    let header = MessageHeader {
        message_length,
        request_id,
        response_to,
        op_code: OP_REPLY,
    };
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&reply.response_flags.to_le_bytes());
    out.extend_from_slice(&reply.cursor_id.to_le_bytes());
    out.extend_from_slice(&reply.starting_from.to_le_bytes());
    out.extend_from_slice(&(reply.documents.len() as i32).to_le_bytes());
    out.extend_from_slice(&docs_buf);
    Ok(out)
}
