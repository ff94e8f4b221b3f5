// LDAP v3 wire codec: BER encoding/decoding for client-side protocol
// messages (RFC 4511). No I/O and no connection state lives here.

use crate::error::{LdapError, Result};
use bytes::BytesMut;
use std::io::{Cursor, Read};

fn malformed<T>(msg: impl Into<String>) -> Result<T> {
    Err(LdapError::ProtocolDecode(msg.into()))
}

/// LDAP Control (request or response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub ctype: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

/// One decoded protocol message: correlation id, operation, controls.
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

/// Result fields shared by all non-search single-shot responses and by
/// SearchResultDone. A non-zero `result_code` is data, not an engine error.
#[derive(Debug, Clone, Default)]
pub struct LdapResult {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    /// Response controls attached to the message carrying this result.
    pub controls: Vec<Control>,
}

impl LdapResult {
    /// Success result code per RFC 4511.
    pub const SUCCESS: i32 = 0;
    /// compareFalse / compareTrue result codes.
    pub const COMPARE_FALSE: i32 = 5;
    pub const COMPARE_TRUE: i32 = 6;

    /// Convert a failure result code into `LdapError::ServerError`.
    pub fn success(self) -> Result<LdapResult> {
        match self.result_code {
            Self::SUCCESS | Self::COMPARE_FALSE | Self::COMPARE_TRUE => Ok(self),
            rc => Err(LdapError::ServerError {
                rc,
                matched: self.matched_dn,
                text: self.diagnostic_message,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(LdapResult),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
}

impl ProtocolOp {
    /// Wire tag this operation is encoded with.
    pub fn tag(&self) -> u8 {
        match self {
            ProtocolOp::BindRequest(_) => LDAP_TAG_BIND_REQUEST,
            ProtocolOp::BindResponse(_) => LDAP_TAG_BIND_RESPONSE,
            ProtocolOp::UnbindRequest => LDAP_TAG_UNBIND_REQUEST,
            ProtocolOp::SearchRequest(_) => LDAP_TAG_SEARCH_REQUEST,
            ProtocolOp::SearchResultEntry(_) => LDAP_TAG_SEARCH_RESULT_ENTRY,
            ProtocolOp::SearchResultReference(_) => LDAP_TAG_SEARCH_RESULT_REFERENCE,
            ProtocolOp::SearchResultDone(_) => LDAP_TAG_SEARCH_RESULT_DONE,
            ProtocolOp::ModifyRequest(_) => LDAP_TAG_MODIFY_REQUEST,
            ProtocolOp::ModifyResponse(_) => LDAP_TAG_MODIFY_RESPONSE,
            ProtocolOp::AddRequest(_) => LDAP_TAG_ADD_REQUEST,
            ProtocolOp::AddResponse(_) => LDAP_TAG_ADD_RESPONSE,
            ProtocolOp::DelRequest(_) => LDAP_TAG_DEL_REQUEST,
            ProtocolOp::DelResponse(_) => LDAP_TAG_DEL_RESPONSE,
            ProtocolOp::ModifyDnRequest(_) => LDAP_TAG_MODIFY_DN_REQUEST,
            ProtocolOp::ModifyDnResponse(_) => LDAP_TAG_MODIFY_DN_RESPONSE,
            ProtocolOp::CompareRequest(_) => LDAP_TAG_COMPARE_REQUEST,
            ProtocolOp::CompareResponse(_) => LDAP_TAG_COMPARE_RESPONSE,
            ProtocolOp::AbandonRequest(_) => LDAP_TAG_ABANDON_REQUEST,
            ProtocolOp::ExtendedRequest(_) => LDAP_TAG_EXTENDED_REQUEST,
            ProtocolOp::ExtendedResponse(_) => LDAP_TAG_EXTENDED_RESPONSE,
            ProtocolOp::IntermediateResponse(_) => LDAP_TAG_INTERMEDIATE_RESPONSE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone)]
pub enum BindAuthentication {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObject = 2,
    Always = 3,
}

#[derive(Debug, Clone)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

#[derive(Debug, Clone)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone)]
pub struct ModifyDnRequest {
    pub entry: String,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct IntermediateResponse {
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

// LDAP protocol tag constants (RFC 4511 [APPLICATION n]).
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
/// [25] IMPLICIT - intermediate response
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0xB9;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;

/// Top-level LDAP message is always a SEQUENCE (BER tag 0x30).
const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

/// Tags that terminate an operation: once one of these is routed, no
/// further envelopes will arrive for that message id. Entry and reference
/// envelopes (and intermediate responses) are not in this set.
pub fn is_terminal_response_tag(tag: u8) -> bool {
    matches!(
        tag,
        LDAP_TAG_BIND_RESPONSE
            | LDAP_TAG_SEARCH_RESULT_DONE
            | LDAP_TAG_MODIFY_RESPONSE
            | LDAP_TAG_ADD_RESPONSE
            | LDAP_TAG_DEL_RESPONSE
            | LDAP_TAG_MODIFY_DN_RESPONSE
            | LDAP_TAG_COMPARE_RESPONSE
            | LDAP_TAG_EXTENDED_RESPONSE
    )
}

/// Response tags that are valid replies to the given request op.
/// Used by the dispatcher to flag crossed wires in debug logs.
pub fn expected_response_tags(op: &ProtocolOp) -> &'static [u8] {
    match op {
        ProtocolOp::BindRequest(_) => &[LDAP_TAG_BIND_RESPONSE],
        ProtocolOp::SearchRequest(_) => &[
            LDAP_TAG_SEARCH_RESULT_ENTRY,
            LDAP_TAG_SEARCH_RESULT_REFERENCE,
            LDAP_TAG_SEARCH_RESULT_DONE,
        ],
        ProtocolOp::ModifyRequest(_) => &[LDAP_TAG_MODIFY_RESPONSE],
        ProtocolOp::AddRequest(_) => &[LDAP_TAG_ADD_RESPONSE],
        ProtocolOp::DelRequest(_) => &[LDAP_TAG_DEL_RESPONSE],
        ProtocolOp::ModifyDnRequest(_) => &[LDAP_TAG_MODIFY_DN_RESPONSE],
        ProtocolOp::CompareRequest(_) => &[LDAP_TAG_COMPARE_RESPONSE],
        ProtocolOp::ExtendedRequest(_) => &[
            LDAP_TAG_EXTENDED_RESPONSE,
            LDAP_TAG_INTERMEDIATE_RESPONSE,
        ],
        _ => &[],
    }
}

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub(crate) fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub(crate) fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        let first_byte = buf[0];

        if (first_byte & 0x80) == 0 {
            // Short form
            Ok(first_byte as usize)
        } else {
            // Long form
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                return malformed("indefinite length not supported");
            }
            if length_bytes > 4 {
                return malformed(format!("length too large: {} bytes", length_bytes));
            }
            let mut length = 0u32;
            for _ in 0..length_bytes {
                self.read_exact(&mut buf)?;
                length = (length << 8) | buf[0] as u32;
            }
            Ok(length as usize)
        }
    }

    pub(crate) fn read_integer(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x02 {
            return malformed(format!("expected INTEGER tag (0x02), got: 0x{:02X}", tag));
        }
        self.read_integer_value()
    }

    /// Length + value of an INTEGER whose tag was already consumed.
    pub(crate) fn read_integer_value(&mut self) -> Result<i32> {
        let length = self.read_length()?;
        if length == 0 || length > 4 {
            return malformed(format!("integer of {} bytes", length));
        }
        let mut buf = vec![0u8; length];
        self.read_exact(&mut buf)?;

        let mut value = 0i32;
        for &byte in &buf {
            value = (value << 8) | (byte as i32);
        }
        // Sign extension for negative numbers
        if length < 4 && (buf[0] & 0x80) != 0 {
            value |= !0 << (length * 8);
        }
        Ok(value)
    }

    pub(crate) fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x04 && !(0x80..=0xBF).contains(&tag) {
            return malformed(format!(
                "expected OCTET STRING tag (0x04), got: 0x{:02X}",
                tag
            ));
        }
        self.read_octet_string_value()
    }

    /// Length + value of an OCTET STRING whose tag was already consumed.
    /// Use after read_tag() for [0] IMPLICIT etc.
    pub(crate) fn read_octet_string_value(&mut self) -> Result<Vec<u8>> {
        let length = self.read_length()?;
        let mut buf = vec![0u8; length];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).or_else(|_| malformed("invalid UTF-8 string"))
    }

    pub(crate) fn read_sequence(&mut self) -> Result<usize> {
        let tag = self.read_tag()?;
        // SEQUENCE 0x30 or SET 0x31
        if (tag & 0x1F) != 0x10 && (tag & 0x1F) != 0x11 {
            return malformed(format!("expected SEQUENCE tag, got: 0x{:02X}", tag));
        }
        self.read_length()
    }

    pub(crate) fn read_enumerated(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x0A {
            return malformed(format!("expected ENUMERATED tag, got: 0x{:02X}", tag));
        }
        self.read_integer_value()
    }

    pub(crate) fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x01 {
            return malformed(format!("expected BOOLEAN tag, got: 0x{:02X}", tag));
        }
        let length = self.read_length()?;
        if length != 1 {
            return malformed(format!("boolean value of {} bytes", length));
        }
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0] != 0)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return malformed("truncated value");
        }
        self.cursor.set_position(self.cursor.position() + n as u64);
        Ok(())
    }

    pub(crate) fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    pub(crate) fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().len().saturating_sub(pos)
    }

    fn read_octet_at(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.remaining() < buf.len() {
            return malformed(format!(
                "BER truncated: need {} bytes, {} remaining",
                buf.len(),
                self.remaining()
            ));
        }
        self.cursor
            .read_exact(buf)
            .or_else(|_| malformed("BER truncated"))
    }
}

// BER encoding utilities
#[derive(Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    pub fn write_length(&mut self, length: usize) {
        if length < 128 {
            // Short form
            self.buffer.push(length as u8);
        } else {
            // Long form
            let mut bytes = Vec::new();
            let mut len = length;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tag(0x02);
        self.write_integer_content(value);
    }

    /// Minimal two's complement content bytes, length-prefixed (no tag).
    pub fn write_integer_content(&mut self, value: i32) {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < 3 {
            let b = bytes[start];
            let next = bytes[start + 1];
            let redundant =
                (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0);
            if redundant {
                start += 1;
            } else {
                break;
            }
        }
        self.write_length(4 - start);
        self.buffer.extend_from_slice(&bytes[start..]);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tag(0x04);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    /// OCTET STRING value under a caller-supplied implicit tag.
    pub fn write_tagged_octet_string(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tag(0x01);
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    pub fn write_enumerated(&mut self, value: i32) {
        self.write_tag(0x0A);
        self.write_integer_content(value);
    }

    /// Open a constructed value: writes the tag and a length placeholder,
    /// returns the placeholder position for `end`.
    pub fn begin(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch the length at `pos` for everything written since the
    /// matching `begin`. Inner constructions must be ended before outer
    /// ones (long-form patching shifts later bytes).
    pub fn end(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        if content_len < 128 {
            self.buffer[pos] = content_len as u8;
        } else {
            let mut bytes = Vec::new();
            let mut len = content_len;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer[pos] = 0x80 | bytes.len() as u8;
            for (i, b) in bytes.iter().enumerate() {
                self.buffer.insert(pos + 1 + i, *b);
            }
        }
    }

    pub fn begin_sequence(&mut self) -> usize {
        self.begin(0x30)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

/// Correlation id, operation tag, and controls of any envelope, request
/// or response, without touching the operation body.
pub fn parse_envelope(data: &[u8]) -> Result<(i32, u8, Vec<Control>)> {
    let mut reader = BerReader::new(data);
    let _seq_len = reader.read_sequence()?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    let op_len = reader.read_length()?;
    reader.skip(op_len)?;
    let controls = if reader.remaining() > 0 {
        let next_tag = reader.read_tag()?;
        if next_tag == LDAP_CONTEXT_CONTROLS {
            parse_controls(&mut reader)?
        } else {
            Vec::new()
        }
    } else {
        Vec::new()
    };
    Ok((message_id, tag, controls))
}

/// Parse only the message header (SEQUENCE, messageID, protocolOp tag).
/// Cheap way to identify a frame without a full parse.
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut reader = BerReader::new(data);
    let _seq_len = reader.read_sequence()?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    Ok((message_id, tag))
}

/// Total frame length (tag + length field + content) if the buffer holds
/// enough bytes to determine it. `None` means more bytes are needed.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != LDAP_MESSAGE_SEQUENCE_TAG {
        return malformed(format!(
            "stream out of sync: expected SEQUENCE (0x30), got 0x{:02X}",
            buf[0]
        ));
    }
    let first = buf[1];
    if (first & 0x80) == 0 {
        return Ok(Some(2 + first as usize));
    }
    let length_bytes = (first & 0x7F) as usize;
    if length_bytes == 0 || length_bytes > 4 {
        return malformed("invalid length encoding");
    }
    if buf.len() < 2 + length_bytes {
        return Ok(None);
    }
    let mut length = 0usize;
    for i in 0..length_bytes {
        length = (length << 8) | buf[2 + i] as usize;
    }
    Ok(Some(2 + length_bytes + length))
}

/// Result of decoding one message out of the accumulation buffer.
pub enum Decoded {
    /// Not enough data yet; read more from the transport.
    Incomplete,
    /// One full message extracted and parsed.
    Message(LdapMessage),
}

/// Extract and parse one message from the front of `buffer`. Any error is
/// fatal to the stream: BER has no resynchronization point.
pub fn decode_message(buffer: &mut BytesMut) -> Result<Decoded> {
    let total = match frame_length(buffer)? {
        Some(t) => t,
        None => return Ok(Decoded::Incomplete),
    };
    if buffer.len() < total {
        return Ok(Decoded::Incomplete);
    }
    let frame = buffer.split_to(total);
    let message = parse_ldap_message(&frame)?;
    Ok(Decoded::Message(message))
}

pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut reader = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let _seq_len = reader.read_sequence()?;
    let message_id = reader.read_integer()?;

    let tag = reader.read_tag()?;
    let protocol_op = match tag {
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_result(&mut reader)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => {
            ProtocolOp::SearchResultEntry(parse_search_result_entry(&mut reader)?)
        }
        LDAP_TAG_SEARCH_RESULT_REFERENCE => {
            ProtocolOp::SearchResultReference(parse_search_result_reference(&mut reader)?)
        }
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(parse_result(&mut reader)?),
        LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(parse_result(&mut reader)?),
        LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(parse_result(&mut reader)?),
        LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(parse_result(&mut reader)?),
        LDAP_TAG_MODIFY_DN_RESPONSE => ProtocolOp::ModifyDnResponse(parse_result(&mut reader)?),
        LDAP_TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(parse_result(&mut reader)?),
        LDAP_TAG_EXTENDED_RESPONSE => {
            ProtocolOp::ExtendedResponse(parse_extended_response(&mut reader)?)
        }
        LDAP_TAG_INTERMEDIATE_RESPONSE => {
            ProtocolOp::IntermediateResponse(parse_intermediate_response(&mut reader)?)
        }
        _ => return malformed(format!("unsupported response tag: 0x{:02X}", tag)),
    };

    let controls = if reader.remaining() > 0 {
        let next_tag = reader.read_tag()?;
        if next_tag == LDAP_CONTEXT_CONTROLS {
            Some(parse_controls(&mut reader)?)
        } else {
            return malformed(format!("trailing data with tag 0x{:02X}", next_tag));
        }
    } else {
        None
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

/// Controls: SEQUENCE OF Control,
/// Control ::= SEQUENCE { type, critical DEFAULT FALSE, value OPTIONAL }
fn parse_controls(reader: &mut BerReader) -> Result<Vec<Control>> {
    let seq_len = reader.read_length()?;
    let end = reader.position() + seq_len;
    let mut controls = Vec::new();
    while reader.position() < end {
        let ctrl_len = reader.read_sequence()?;
        let ctrl_end = reader.position() + ctrl_len;
        let ctype = reader.read_string()?;
        let mut critical = false;
        let mut value = None;
        while reader.position() < ctrl_end {
            let tag = reader.read_tag()?;
            if (tag & 0x1F) == 0x01 {
                let len = reader.read_length()?;
                if len != 1 {
                    return malformed("control criticality must be 1 byte");
                }
                critical = reader.read_octet_at()? != 0;
            } else if (tag & 0x1F) == 0x04 {
                value = Some(reader.read_octet_string_value()?);
            } else {
                return malformed(format!("unexpected tag 0x{:02X} in control", tag));
            }
        }
        controls.push(Control {
            ctype,
            critical,
            value,
        });
    }
    Ok(controls)
}

/// LDAPResult ::= SEQUENCE-like body: resultCode, matchedDN, diagnosticMessage,
/// referral [3] OPTIONAL (skipped).
fn parse_result(reader: &mut BerReader) -> Result<LdapResult> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let result_code = reader.read_enumerated()?;
    let matched_dn = reader.read_string()?;
    let diagnostic_message = reader.read_string()?;
    // referral [3] — present on some error results; not modeled.
    if reader.position() < end {
        let tag = reader.read_tag()?;
        if tag == 0xA3 {
            let ref_len = reader.read_length()?;
            reader.skip(ref_len)?;
        } else {
            return malformed(format!("unexpected tag 0x{:02X} after result", tag));
        }
    }
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
        controls: Vec::new(),
    })
}

fn parse_search_result_entry(reader: &mut BerReader) -> Result<SearchResultEntry> {
    let _len = reader.read_length()?;
    let object_name = reader.read_string()?;
    let attrs_len = reader.read_sequence()?;
    let end = reader.position() + attrs_len;
    let mut attributes = Vec::new();
    while reader.position() < end {
        attributes.push(parse_attribute(reader)?);
    }
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

fn parse_search_result_reference(reader: &mut BerReader) -> Result<Vec<String>> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let mut uris = Vec::new();
    while reader.position() < end {
        uris.push(reader.read_string()?);
    }
    Ok(uris)
}

fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    let seq_len = reader.read_sequence()?;
    let seq_end = reader.position() + seq_len;
    let attr_type = reader.read_string()?;
    let vals_len = reader.read_sequence()?; // SET OF value
    let vals_end = reader.position() + vals_len;
    let mut attr_values = Vec::new();
    while reader.position() < vals_end {
        attr_values.push(reader.read_octet_string()?);
    }
    if reader.position() != seq_end {
        return malformed("attribute length mismatch");
    }
    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

fn parse_extended_response(reader: &mut BerReader) -> Result<ExtendedResponse> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let result_code = reader.read_enumerated()?;
    let matched_dn = reader.read_string()?;
    let diagnostic_message = reader.read_string()?;
    let mut response_name = None;
    let mut response_value = None;
    while reader.position() < end {
        let tag = reader.read_tag()?;
        match tag {
            // referral [3]
            0xA3 => {
                let ref_len = reader.read_length()?;
                reader.skip(ref_len)?;
            }
            // responseName [10]
            0x8A => {
                let bytes = reader.read_octet_string_value()?;
                response_name = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            // responseValue [11]
            0x8B => {
                response_value = Some(reader.read_octet_string_value()?);
            }
            _ => return malformed(format!("unexpected tag 0x{:02X} in extended response", tag)),
        }
    }
    Ok(ExtendedResponse {
        result: LdapResult {
            result_code,
            matched_dn,
            diagnostic_message,
            controls: Vec::new(),
        },
        response_name,
        response_value,
    })
}

fn parse_intermediate_response(reader: &mut BerReader) -> Result<IntermediateResponse> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let mut response_name = None;
    let mut response_value = None;
    while reader.position() < end {
        let tag = reader.read_tag()?;
        match tag {
            0x80 => {
                let bytes = reader.read_octet_string_value()?;
                response_name = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            0x81 => {
                response_value = Some(reader.read_octet_string_value()?);
            }
            _ => {
                return malformed(format!(
                    "unexpected tag 0x{:02X} in intermediate response",
                    tag
                ))
            }
        }
    }
    Ok(IntermediateResponse {
        response_name,
        response_value,
    })
}

/// Encode a full LDAPMessage (both request and response ops).
pub fn encode_ldap_message(message: &LdapMessage) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq = writer.begin_sequence();
    writer.write_integer(message.message_id);

    match &message.protocol_op {
        ProtocolOp::BindRequest(req) => encode_bind_request(&mut writer, req),
        ProtocolOp::UnbindRequest => {
            // UnbindRequest ::= [APPLICATION 2] NULL
            writer.write_tag(LDAP_TAG_UNBIND_REQUEST);
            writer.write_length(0);
        }
        ProtocolOp::SearchRequest(req) => encode_search_request(&mut writer, req),
        ProtocolOp::ModifyRequest(req) => encode_modify_request(&mut writer, req),
        ProtocolOp::AddRequest(req) => encode_add_request(&mut writer, req),
        ProtocolOp::DelRequest(req) => {
            // [APPLICATION 10] LDAPDN (primitive)
            writer.write_tagged_octet_string(LDAP_TAG_DEL_REQUEST, req.entry.as_bytes());
        }
        ProtocolOp::ModifyDnRequest(req) => encode_modify_dn_request(&mut writer, req),
        ProtocolOp::CompareRequest(req) => encode_compare_request(&mut writer, req),
        ProtocolOp::AbandonRequest(msgid) => {
            // [APPLICATION 16] MessageID (IMPLICIT INTEGER)
            writer.write_tag(LDAP_TAG_ABANDON_REQUEST);
            writer.write_integer_content(*msgid);
        }
        ProtocolOp::ExtendedRequest(req) => encode_extended_request(&mut writer, req),
        ProtocolOp::BindResponse(r) => encode_result(&mut writer, LDAP_TAG_BIND_RESPONSE, r),
        ProtocolOp::SearchResultEntry(entry) => encode_search_result_entry(&mut writer, entry),
        ProtocolOp::SearchResultReference(uris) => {
            let pos = writer.begin(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            for uri in uris {
                writer.write_string(uri);
            }
            writer.end(pos);
        }
        ProtocolOp::SearchResultDone(r) => {
            encode_result(&mut writer, LDAP_TAG_SEARCH_RESULT_DONE, r)
        }
        ProtocolOp::ModifyResponse(r) => encode_result(&mut writer, LDAP_TAG_MODIFY_RESPONSE, r),
        ProtocolOp::AddResponse(r) => encode_result(&mut writer, LDAP_TAG_ADD_RESPONSE, r),
        ProtocolOp::DelResponse(r) => encode_result(&mut writer, LDAP_TAG_DEL_RESPONSE, r),
        ProtocolOp::ModifyDnResponse(r) => {
            encode_result(&mut writer, LDAP_TAG_MODIFY_DN_RESPONSE, r)
        }
        ProtocolOp::CompareResponse(r) => encode_result(&mut writer, LDAP_TAG_COMPARE_RESPONSE, r),
        ProtocolOp::ExtendedResponse(resp) => encode_extended_response(&mut writer, resp),
        ProtocolOp::IntermediateResponse(resp) => {
            let pos = writer.begin(LDAP_TAG_INTERMEDIATE_RESPONSE);
            if let Some(ref name) = resp.response_name {
                writer.write_tagged_octet_string(0x80, name.as_bytes());
            }
            if let Some(ref value) = resp.response_value {
                writer.write_tagged_octet_string(0x81, value);
            }
            writer.end(pos);
        }
    }

    if let Some(ref controls) = message.controls {
        if !controls.is_empty() {
            encode_controls(&mut writer, controls);
        }
    }

    writer.end(seq);
    writer.into_vec()
}

fn encode_controls(writer: &mut BerWriter, controls: &[Control]) {
    let pos = writer.begin(LDAP_CONTEXT_CONTROLS);
    for ctrl in controls {
        let c = writer.begin_sequence();
        writer.write_string(&ctrl.ctype);
        if ctrl.critical {
            writer.write_boolean(true);
        }
        if let Some(ref value) = ctrl.value {
            writer.write_octet_string(value);
        }
        writer.end(c);
    }
    writer.end(pos);
}

fn encode_bind_request(writer: &mut BerWriter, req: &BindRequest) {
    let pos = writer.begin(LDAP_TAG_BIND_REQUEST);
    writer.write_integer(req.version);
    writer.write_string(&req.name);
    match &req.authentication {
        BindAuthentication::Simple(password) => {
            // simple [0] IMPLICIT OCTET STRING
            writer.write_tagged_octet_string(0x80, password.as_bytes());
        }
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        } => {
            // sasl [3] SaslCredentials
            let sasl = writer.begin(0xA3);
            writer.write_string(mechanism);
            if let Some(creds) = credentials {
                writer.write_octet_string(creds);
            }
            writer.end(sasl);
        }
    }
    writer.end(pos);
}

fn encode_search_request(writer: &mut BerWriter, req: &SearchRequest) {
    let pos = writer.begin(LDAP_TAG_SEARCH_REQUEST);
    writer.write_string(&req.base_object);
    writer.write_enumerated(req.scope as i32);
    writer.write_enumerated(req.deref_aliases as i32);
    writer.write_integer(req.size_limit);
    writer.write_integer(req.time_limit);
    writer.write_boolean(req.types_only);
    req.filter.encode(writer);
    let attrs = writer.begin_sequence();
    for attr in &req.attributes {
        writer.write_string(attr);
    }
    writer.end(attrs);
    writer.end(pos);
}

fn encode_attribute(writer: &mut BerWriter, attr: &Attribute) {
    let seq = writer.begin_sequence();
    writer.write_string(&attr.attr_type);
    let vals = writer.begin(0x31); // SET OF value
    for value in &attr.attr_values {
        writer.write_octet_string(value);
    }
    writer.end(vals);
    writer.end(seq);
}

fn encode_modify_request(writer: &mut BerWriter, req: &ModifyRequest) {
    let pos = writer.begin(LDAP_TAG_MODIFY_REQUEST);
    writer.write_string(&req.object);
    let changes = writer.begin_sequence();
    for change in &req.changes {
        let c = writer.begin_sequence();
        writer.write_enumerated(change.operation as i32);
        encode_attribute(writer, &change.modification);
        writer.end(c);
    }
    writer.end(changes);
    writer.end(pos);
}

fn encode_add_request(writer: &mut BerWriter, req: &AddRequest) {
    let pos = writer.begin(LDAP_TAG_ADD_REQUEST);
    writer.write_string(&req.entry);
    let attrs = writer.begin_sequence();
    for attr in &req.attributes {
        encode_attribute(writer, attr);
    }
    writer.end(attrs);
    writer.end(pos);
}

fn encode_modify_dn_request(writer: &mut BerWriter, req: &ModifyDnRequest) {
    let pos = writer.begin(LDAP_TAG_MODIFY_DN_REQUEST);
    writer.write_string(&req.entry);
    writer.write_string(&req.newrdn);
    writer.write_boolean(req.delete_old_rdn);
    if let Some(ref sup) = req.new_superior {
        writer.write_tagged_octet_string(0x80, sup.as_bytes());
    }
    writer.end(pos);
}

fn encode_compare_request(writer: &mut BerWriter, req: &CompareRequest) {
    let pos = writer.begin(LDAP_TAG_COMPARE_REQUEST);
    writer.write_string(&req.entry);
    let ava = writer.begin_sequence();
    writer.write_string(&req.attr);
    writer.write_octet_string(&req.assertion_value);
    writer.end(ava);
    writer.end(pos);
}

fn encode_extended_request(writer: &mut BerWriter, req: &ExtendedRequest) {
    let pos = writer.begin(LDAP_TAG_EXTENDED_REQUEST);
    writer.write_tagged_octet_string(0x80, req.request_name.as_bytes());
    if let Some(ref value) = req.request_value {
        writer.write_tagged_octet_string(0x81, value);
    }
    writer.end(pos);
}

fn encode_result(writer: &mut BerWriter, tag: u8, result: &LdapResult) {
    let pos = writer.begin(tag);
    writer.write_enumerated(result.result_code);
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostic_message);
    writer.end(pos);
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &SearchResultEntry) {
    let pos = writer.begin(LDAP_TAG_SEARCH_RESULT_ENTRY);
    writer.write_string(&entry.object_name);
    let attrs = writer.begin_sequence();
    for attr in &entry.attributes {
        encode_attribute(writer, attr);
    }
    writer.end(attrs);
    writer.end(pos);
}

fn encode_extended_response(writer: &mut BerWriter, resp: &ExtendedResponse) {
    let pos = writer.begin(LDAP_TAG_EXTENDED_RESPONSE);
    writer.write_enumerated(resp.result.result_code);
    writer.write_string(&resp.result.matched_dn);
    writer.write_string(&resp.result.diagnostic_message);
    if let Some(ref name) = resp.response_name {
        writer.write_tagged_octet_string(0x8A, name.as_bytes());
    }
    if let Some(ref value) = resp.response_value {
        writer.write_tagged_octet_string(0x8B, value);
    }
    writer.end(pos);
}

// --- Search filters -------------------------------------------------------

/// Search filter (RFC 4511 §4.5.1), parsed from the familiar string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Vec<u8>),
    Substrings {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        fin: Option<Vec<u8>>,
    },
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
    Approx(String, Vec<u8>),
}

impl Filter {
    /// Parse a filter string like `(&(objectClass=person)(cn=ab*))`.
    pub fn parse(s: &str) -> Result<Filter> {
        let mut p = FilterParser {
            input: s.as_bytes(),
            pos: 0,
        };
        let filter = p.parse_filter()?;
        if p.pos != p.input.len() {
            return Err(LdapError::InvalidFilter(format!(
                "trailing characters at offset {}",
                p.pos
            )));
        }
        Ok(filter)
    }

    fn encode(&self, writer: &mut BerWriter) {
        match self {
            Filter::And(parts) => {
                let pos = writer.begin(0xA0);
                for f in parts {
                    f.encode(writer);
                }
                writer.end(pos);
            }
            Filter::Or(parts) => {
                let pos = writer.begin(0xA1);
                for f in parts {
                    f.encode(writer);
                }
                writer.end(pos);
            }
            Filter::Not(inner) => {
                let pos = writer.begin(0xA2);
                inner.encode(writer);
                writer.end(pos);
            }
            Filter::Equality(attr, value) => encode_ava_filter(writer, 0xA3, attr, value),
            Filter::Substrings {
                attr,
                initial,
                any,
                fin,
            } => {
                let pos = writer.begin(0xA4);
                writer.write_string(attr);
                let subs = writer.begin_sequence();
                if let Some(i) = initial {
                    writer.write_tagged_octet_string(0x80, i);
                }
                for a in any {
                    writer.write_tagged_octet_string(0x81, a);
                }
                if let Some(f) = fin {
                    writer.write_tagged_octet_string(0x82, f);
                }
                writer.end(subs);
                writer.end(pos);
            }
            Filter::GreaterOrEqual(attr, value) => encode_ava_filter(writer, 0xA5, attr, value),
            Filter::LessOrEqual(attr, value) => encode_ava_filter(writer, 0xA6, attr, value),
            Filter::Present(attr) => {
                // present [7] IMPLICIT AttributeDescription (primitive)
                writer.write_tagged_octet_string(0x87, attr.as_bytes());
            }
            Filter::Approx(attr, value) => encode_ava_filter(writer, 0xA8, attr, value),
        }
    }
}

fn encode_ava_filter(writer: &mut BerWriter, tag: u8, attr: &str, value: &[u8]) {
    let pos = writer.begin(tag);
    writer.write_string(attr);
    writer.write_octet_string(value);
    writer.end(pos);
}

struct FilterParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> FilterParser<'a> {
    fn err<T>(&self, msg: &str) -> Result<T> {
        Err(LdapError::InvalidFilter(format!(
            "{} at offset {}",
            msg, self.pos
        )))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, b: u8) -> Result<()> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            self.err(&format!("expected '{}'", b as char))
        }
    }

    fn parse_filter(&mut self) -> Result<Filter> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return self.err("unexpected end of filter"),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_filter_list(&mut self) -> Result<Vec<Filter>> {
        let mut parts = Vec::new();
        while self.peek() == Some(b'(') {
            parts.push(self.parse_filter()?);
        }
        if parts.is_empty() {
            return self.err("empty filter set");
        }
        Ok(parts)
    }

    fn parse_item(&mut self) -> Result<Filter> {
        let attr_start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'=' | b'<' | b'>' | b'~' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let attr = std::str::from_utf8(&self.input[attr_start..self.pos])
            .map_err(|_| LdapError::InvalidFilter("attribute is not UTF-8".into()))?
            .trim()
            .to_string();
        if attr.is_empty() {
            return self.err("empty attribute description");
        }

        let op = match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                b'='
            }
            Some(b'>') => {
                self.pos += 1;
                self.expect(b'=')?;
                b'>'
            }
            Some(b'<') => {
                self.pos += 1;
                self.expect(b'=')?;
                b'<'
            }
            Some(b'~') => {
                self.pos += 1;
                self.expect(b'=')?;
                b'~'
            }
            _ => return self.err("expected comparison operator"),
        };

        // Value runs to the closing paren. '*' splits substring components
        // for equality matches; escapes are backslash-hex (RFC 4515).
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut current: Vec<u8> = Vec::new();
        while let Some(b) = self.peek() {
            match b {
                b')' => break,
                b'(' => return self.err("unescaped '(' in value"),
                b'*' if op == b'=' => {
                    chunks.push(std::mem::take(&mut current));
                    self.pos += 1;
                }
                b'\\' => {
                    self.pos += 1;
                    let hi = self.hex_digit()?;
                    let lo = self.hex_digit()?;
                    current.push((hi << 4) | lo);
                }
                _ => {
                    current.push(b);
                    self.pos += 1;
                }
            }
        }

        if op != b'=' {
            return Ok(match op {
                b'>' => Filter::GreaterOrEqual(attr, current),
                b'<' => Filter::LessOrEqual(attr, current),
                _ => Filter::Approx(attr, current),
            });
        }

        // `chunks` holds one element per '*'; `current` is the tail.
        if chunks.is_empty() {
            return Ok(Filter::Equality(attr, current));
        }
        if chunks.len() == 1 && chunks[0].is_empty() && current.is_empty() {
            return Ok(Filter::Present(attr));
        }
        let fin = if current.is_empty() {
            None
        } else {
            Some(current)
        };
        let mut rest = chunks.into_iter();
        let initial = rest.next().filter(|c| !c.is_empty());
        let any = rest.filter(|c| !c.is_empty()).collect();
        Ok(Filter::Substrings {
            attr,
            initial,
            any,
            fin,
        })
    }

    fn hex_digit(&mut self) -> Result<u8> {
        let b = match self.peek() {
            Some(b) => b,
            None => return self.err("truncated escape"),
        };
        self.pos += 1;
        match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            _ => self.err("invalid hex escape"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_simple_bind_matches_known_bytes() {
        let msg = LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: "cn=admin,dc=example,dc=com".to_string(),
                authentication: BindAuthentication::Simple("secret".to_string()),
            }),
            controls: None,
        };
        let encoded = encode_ldap_message(&msg);
        let expected = vec![
            0x30, 0x2c, // SEQUENCE length 44
            0x02, 0x01, 0x01, // messageID 1
            0x60, 0x27, // [0] BindRequest length 39
            0x02, 0x01, 0x03, // version 3
            0x04, 0x1a, 0x63, 0x6e, 0x3d, 0x61, 0x64, 0x6d, 0x69, 0x6e, 0x2c, 0x64, 0x63, 0x3d,
            0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2c, 0x64, 0x63, 0x3d, 0x63, 0x6f, 0x6d,
            0x80, 0x06, 0x73, 0x65, 0x63, 0x72, 0x65, 0x74, // [0] simple "secret"
        ];
        assert_eq!(encoded, expected);
    }

    #[test]
    fn encode_unbind() {
        let msg = LdapMessage {
            message_id: 5,
            protocol_op: ProtocolOp::UnbindRequest,
            controls: None,
        };
        let encoded = encode_ldap_message(&msg);
        assert_eq!(encoded, vec![0x30, 0x05, 0x02, 0x01, 0x05, 0x42, 0x00]);
    }

    #[test]
    fn encode_abandon() {
        let msg = LdapMessage {
            message_id: 7,
            protocol_op: ProtocolOp::AbandonRequest(3),
            controls: None,
        };
        let encoded = encode_ldap_message(&msg);
        assert_eq!(encoded, vec![0x30, 0x06, 0x02, 0x01, 0x07, 0x50, 0x01, 0x03]);
    }

    #[test]
    fn parse_bind_response() {
        // BindResponse: rc=0, empty matched/diagnostic
        let data = vec![
            0x30, 0x0C, 0x02, 0x01, 0x01, 0x61, 0x07, 0x0A, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00,
        ];
        let msg = parse_ldap_message(&data).unwrap();
        assert_eq!(msg.message_id, 1);
        match msg.protocol_op {
            ProtocolOp::BindResponse(r) => {
                assert_eq!(r.result_code, 0);
                assert!(r.matched_dn.is_empty());
            }
            _ => panic!("expected BindResponse"),
        }
    }

    #[test]
    fn parse_bind_response_invalid_credentials() {
        let mut w = BerWriter::new();
        let seq = w.begin_sequence();
        w.write_integer(2);
        let op = w.begin(LDAP_TAG_BIND_RESPONSE);
        w.write_enumerated(49);
        w.write_string("");
        w.write_string("invalid credentials");
        w.end(op);
        w.end(seq);
        let msg = parse_ldap_message(&w.into_vec()).unwrap();
        match msg.protocol_op {
            ProtocolOp::BindResponse(r) => {
                assert_eq!(r.result_code, 49);
                assert_eq!(r.diagnostic_message, "invalid credentials");
                assert!(r.success().is_err());
            }
            _ => panic!("expected BindResponse"),
        }
    }

    #[test]
    fn search_entry_roundtrip() {
        let entry = SearchResultEntry {
            object_name: "cn=test,dc=example,dc=com".to_string(),
            attributes: vec![
                Attribute {
                    attr_type: "cn".to_string(),
                    attr_values: vec![b"test".to_vec()],
                },
                Attribute {
                    attr_type: "mail".to_string(),
                    attr_values: vec![b"test@example.com".to_vec(), b"t@example.com".to_vec()],
                },
            ],
        };
        let msg = LdapMessage {
            message_id: 3,
            protocol_op: ProtocolOp::SearchResultEntry(entry),
            controls: None,
        };
        let parsed = parse_ldap_message(&encode_ldap_message(&msg)).unwrap();
        assert_eq!(parsed.message_id, 3);
        match parsed.protocol_op {
            ProtocolOp::SearchResultEntry(e) => {
                assert_eq!(e.object_name, "cn=test,dc=example,dc=com");
                assert_eq!(e.attributes.len(), 2);
                assert_eq!(e.attributes[1].attr_values.len(), 2);
            }
            _ => panic!("expected SearchResultEntry"),
        }
    }

    #[test]
    fn search_done_with_control_roundtrip() {
        let msg = LdapMessage {
            message_id: 4,
            protocol_op: ProtocolOp::SearchResultDone(LdapResult {
                result_code: 0,
                matched_dn: String::new(),
                diagnostic_message: String::new(),
                controls: Vec::new(),
            }),
            controls: Some(vec![Control {
                ctype: "1.2.840.113556.1.4.319".to_string(),
                critical: false,
                value: Some(vec![0x30, 0x05, 0x02, 0x01, 0x00, 0x04, 0x00]),
            }]),
        };
        let parsed = parse_ldap_message(&encode_ldap_message(&msg)).unwrap();
        let controls = parsed.controls.expect("controls present");
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].ctype, "1.2.840.113556.1.4.319");
        assert!(!controls[0].critical);
        assert!(controls[0].value.is_some());
    }

    #[test]
    fn extended_response_roundtrip() {
        let msg = LdapMessage {
            message_id: 9,
            protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult {
                    result_code: 0,
                    matched_dn: String::new(),
                    diagnostic_message: String::new(),
                    controls: Vec::new(),
                },
                response_name: Some("1.3.6.1.4.1.4203.1.11.3".to_string()),
                response_value: Some(b"dn:cn=test".to_vec()),
            }),
            controls: None,
        };
        let parsed = parse_ldap_message(&encode_ldap_message(&msg)).unwrap();
        match parsed.protocol_op {
            ProtocolOp::ExtendedResponse(r) => {
                assert_eq!(r.response_name.as_deref(), Some("1.3.6.1.4.1.4203.1.11.3"));
                assert_eq!(r.response_value.as_deref(), Some(&b"dn:cn=test"[..]));
            }
            _ => panic!("expected ExtendedResponse"),
        }
    }

    #[test]
    fn intermediate_response_roundtrip() {
        let msg = LdapMessage {
            message_id: 10,
            protocol_op: ProtocolOp::IntermediateResponse(IntermediateResponse {
                response_name: Some("1.3.6.1.4.1.4203.1.9.1.4".to_string()),
                response_value: Some(vec![0x00, 0x01, 0x02]),
            }),
            controls: None,
        };
        let parsed = parse_ldap_message(&encode_ldap_message(&msg)).unwrap();
        match parsed.protocol_op {
            ProtocolOp::IntermediateResponse(r) => {
                assert_eq!(r.response_value.as_deref(), Some(&[0x00, 0x01, 0x02][..]));
            }
            _ => panic!("expected IntermediateResponse"),
        }
    }

    #[test]
    fn integer_encodings() {
        for (value, expect) in [
            (0i32, vec![0x02, 0x01, 0x00]),
            (127, vec![0x02, 0x01, 0x7F]),
            (128, vec![0x02, 0x02, 0x00, 0x80]),
            (256, vec![0x02, 0x02, 0x01, 0x00]),
            (-1, vec![0x02, 0x01, 0xFF]),
            (-128, vec![0x02, 0x01, 0x80]),
            (0x7FFF_FFFF, vec![0x02, 0x04, 0x7F, 0xFF, 0xFF, 0xFF]),
        ] {
            let mut w = BerWriter::new();
            w.write_integer(value);
            assert_eq!(w.into_vec(), expect, "value {}", value);

            let encoded = expect.clone();
            let mut r = BerReader::new(&encoded);
            assert_eq!(r.read_integer().unwrap(), value);
        }
    }

    #[test]
    fn long_form_length_roundtrip() {
        let mut w = BerWriter::new();
        let seq = w.begin_sequence();
        for _ in 0..200 {
            w.write_string("test");
        }
        w.end(seq);
        let bytes = w.into_vec();
        assert!(bytes[1] & 0x80 != 0);
        let mut r = BerReader::new(&bytes);
        let len = r.read_sequence().unwrap();
        assert_eq!(len, bytes.len() - 4); // 0x30, 0x82, two length bytes
    }

    #[test]
    fn frame_length_short_and_long() {
        assert_eq!(frame_length(&[0x30, 0x05]).unwrap(), Some(7));
        assert_eq!(frame_length(&[0x30]).unwrap(), None);
        assert_eq!(frame_length(&[0x30, 0x82]).unwrap(), None);
        assert_eq!(
            frame_length(&[0x30, 0x82, 0x01, 0x00]).unwrap(),
            Some(4 + 256)
        );
        assert!(frame_length(&[0x04, 0x05]).is_err());
    }

    #[test]
    fn decode_message_incomplete_then_complete() {
        let full = encode_ldap_message(&LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::BindResponse(LdapResult::default()),
            controls: None,
        });
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..3]);
        assert!(matches!(decode_message(&mut buf).unwrap(), Decoded::Incomplete));
        buf.extend_from_slice(&full[3..]);
        match decode_message(&mut buf).unwrap() {
            Decoded::Message(m) => assert_eq!(m.message_id, 1),
            Decoded::Incomplete => panic!("should be complete"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_message_garbage_is_fatal() {
        let mut buf = BytesMut::from(&[0xFF, 0x00, 0x01][..]);
        assert!(decode_message(&mut buf).is_err());
    }

    #[test]
    fn filter_parse_equality() {
        assert_eq!(
            Filter::parse("(cn=bob)").unwrap(),
            Filter::Equality("cn".into(), b"bob".to_vec())
        );
    }

    #[test]
    fn filter_parse_presence_and_substrings() {
        assert_eq!(
            Filter::parse("(objectClass=*)").unwrap(),
            Filter::Present("objectClass".into())
        );
        assert_eq!(
            Filter::parse("(cn=ab*cd*ef)").unwrap(),
            Filter::Substrings {
                attr: "cn".into(),
                initial: Some(b"ab".to_vec()),
                any: vec![b"cd".to_vec()],
                fin: Some(b"ef".to_vec()),
            }
        );
        assert_eq!(
            Filter::parse("(cn=ab*)").unwrap(),
            Filter::Substrings {
                attr: "cn".into(),
                initial: Some(b"ab".to_vec()),
                any: vec![],
                fin: None,
            }
        );
    }

    #[test]
    fn filter_parse_composite() {
        let f = Filter::parse("(&(objectClass=person)(|(cn=a*)(!(uid=root)))(age>=30))").unwrap();
        match f {
            Filter::And(parts) => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(parts[1], Filter::Or(_)));
                assert_eq!(
                    parts[2],
                    Filter::GreaterOrEqual("age".into(), b"30".to_vec())
                );
            }
            _ => panic!("expected And"),
        }
    }

    #[test]
    fn filter_parse_escapes() {
        assert_eq!(
            Filter::parse(r"(cn=a\2ab)").unwrap(),
            Filter::Equality("cn".into(), b"a*b".to_vec())
        );
    }

    #[test]
    fn filter_parse_rejects_malformed() {
        assert!(Filter::parse("cn=bob").is_err());
        assert!(Filter::parse("(cn=bob").is_err());
        assert!(Filter::parse("(&)").is_err());
        assert!(Filter::parse("(=bob)").is_err());
        assert!(Filter::parse(r"(cn=\zz)").is_err());
    }

    #[test]
    fn filter_encode_presence_bytes() {
        let mut w = BerWriter::new();
        Filter::Present("objectClass".into()).encode(&mut w);
        let bytes = w.into_vec();
        assert_eq!(bytes[0], 0x87);
        assert_eq!(bytes[1] as usize, "objectClass".len());
    }

    #[test]
    fn terminal_tags() {
        assert!(is_terminal_response_tag(LDAP_TAG_BIND_RESPONSE));
        assert!(is_terminal_response_tag(LDAP_TAG_SEARCH_RESULT_DONE));
        assert!(!is_terminal_response_tag(LDAP_TAG_SEARCH_RESULT_ENTRY));
        assert!(!is_terminal_response_tag(LDAP_TAG_SEARCH_RESULT_REFERENCE));
        assert!(!is_terminal_response_tag(LDAP_TAG_INTERMEDIATE_RESPONSE));
    }

    #[test]
    fn envelope_parse_skips_request_body() {
        let msg = LdapMessage {
            message_id: 8,
            protocol_op: ProtocolOp::SearchRequest(SearchRequest {
                base_object: "dc=example,dc=com".to_string(),
                scope: SearchScope::WholeSubtree,
                deref_aliases: DerefAliases::Never,
                size_limit: 0,
                time_limit: 0,
                types_only: false,
                filter: Filter::parse("(objectClass=*)").unwrap(),
                attributes: vec!["cn".to_string()],
            }),
            controls: Some(vec![Control {
                ctype: "1.2.840.113556.1.4.319".to_string(),
                critical: true,
                value: Some(vec![0x30, 0x05, 0x02, 0x01, 0x0A, 0x04, 0x00]),
            }]),
        };
        let bytes = encode_ldap_message(&msg);
        let (id, tag, controls) = parse_envelope(&bytes).unwrap();
        assert_eq!(id, 8);
        assert_eq!(tag, LDAP_TAG_SEARCH_REQUEST);
        assert_eq!(controls.len(), 1);
        assert!(controls[0].critical);
    }

    #[test]
    fn header_parse() {
        let msg = encode_ldap_message(&LdapMessage {
            message_id: 42,
            protocol_op: ProtocolOp::SearchResultDone(LdapResult::default()),
            controls: None,
        });
        let (id, tag) = parse_ldap_message_header(&msg).unwrap();
        assert_eq!(id, 42);
        assert_eq!(tag, LDAP_TAG_SEARCH_RESULT_DONE);
    }
}
