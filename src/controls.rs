// Request/response control codecs layered over the BER writer/reader.
// Each control here is opaque to the dispatcher: it rides in the controls
// field of an LDAPMessage and only the paging layer interprets it.

use crate::error::{LdapError, Result};
use crate::protocol::{BerReader, BerWriter, Control};

/// Simple paged results (RFC 2696).
pub const OID_PAGED_RESULTS: &str = "1.2.840.113556.1.4.319";
/// Server-side sorting request (RFC 2891).
pub const OID_SORT_REQUEST: &str = "1.2.840.113556.1.4.473";
/// Virtual list view request / response (draft-ietf-ldapext-ldapv3-vlv).
pub const OID_VLV_REQUEST: &str = "2.16.840.1.113730.3.4.9";
pub const OID_VLV_RESPONSE: &str = "2.16.840.1.113730.3.4.10";

/// First control with a matching type, if any.
pub fn find_control<'a>(controls: &'a [Control], oid: &str) -> Option<&'a Control> {
    controls.iter().find(|c| c.ctype == oid)
}

/// pagedResultsControl value, same shape in both directions:
/// SEQUENCE { size INTEGER, cookie OCTET STRING }.
/// Request: size = page size, cookie = from previous response (empty first).
/// Response: size = total estimate (0 if unknown), cookie = resume point
/// (empty = no more pages).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedResultsControl {
    pub size: i32,
    pub cookie: Vec<u8>,
}

impl PagedResultsControl {
    pub fn new(size: i32, cookie: Vec<u8>) -> Self {
        Self { size, cookie }
    }

    pub fn to_control(&self, critical: bool) -> Control {
        let mut w = BerWriter::new();
        let seq = w.begin_sequence();
        w.write_integer(self.size);
        w.write_octet_string(&self.cookie);
        w.end(seq);
        Control {
            ctype: OID_PAGED_RESULTS.to_string(),
            critical,
            value: Some(w.into_vec()),
        }
    }

    pub fn parse(control: &Control) -> Result<Self> {
        let value = control
            .value
            .as_deref()
            .ok_or_else(|| LdapError::ProtocolDecode("paged results control without value".into()))?;
        let mut r = BerReader::new(value);
        let _len = r.read_sequence()?;
        let size = r.read_integer()?;
        let cookie = r.read_octet_string()?;
        Ok(Self { size, cookie })
    }
}

/// One key of a server-side sort request. `rule` is an optional matching
/// rule OID; `reverse` flips the order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attribute: String,
    pub rule: Option<String>,
    pub reverse: bool,
}

impl SortKey {
    pub fn ascending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            rule: None,
            reverse: false,
        }
    }

    pub fn descending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            rule: None,
            reverse: true,
        }
    }
}

/// SortKeyList ::= SEQUENCE OF SEQUENCE {
///   attributeType, orderingRule [0] OPTIONAL, reverseOrder [1] DEFAULT FALSE }
pub fn sort_control(keys: &[SortKey], critical: bool) -> Control {
    let mut w = BerWriter::new();
    let list = w.begin_sequence();
    for key in keys {
        let item = w.begin_sequence();
        w.write_string(&key.attribute);
        if let Some(ref rule) = key.rule {
            w.write_tagged_octet_string(0x80, rule.as_bytes());
        }
        if key.reverse {
            w.write_tag(0x81);
            w.write_length(1);
            w.write_raw(&[0xFF]);
        }
        w.end(item);
    }
    w.end(list);
    Control {
        ctype: OID_SORT_REQUEST.to_string(),
        critical,
        value: Some(w.into_vec()),
    }
}

/// VirtualListViewRequest ::= SEQUENCE {
///   beforeCount INTEGER, afterCount INTEGER,
///   target CHOICE { byOffset [0] SEQUENCE { offset, contentCount } },
///   contextID OCTET STRING OPTIONAL }
///
/// Only offset targeting is encoded; assertion-value targeting is not
/// exposed by the paging layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvRequestControl {
    pub before_count: i32,
    pub after_count: i32,
    pub offset: i32,
    pub content_count: i32,
    pub context_id: Option<Vec<u8>>,
}

impl VlvRequestControl {
    pub fn parse(control: &Control) -> Result<Self> {
        let value = control
            .value
            .as_deref()
            .ok_or_else(|| LdapError::ProtocolDecode("VLV request control without value".into()))?;
        let mut r = BerReader::new(value);
        let len = r.read_sequence()?;
        let end = r.position() + len;
        let before_count = r.read_integer()?;
        let after_count = r.read_integer()?;
        let tag = r.read_tag()?;
        if tag != 0xA0 {
            return Err(LdapError::ProtocolDecode(format!(
                "unsupported VLV target tag 0x{:02X}",
                tag
            )));
        }
        let _target_len = r.read_length()?;
        let offset = r.read_integer()?;
        let content_count = r.read_integer()?;
        let context_id = if r.position() < end {
            Some(r.read_octet_string()?)
        } else {
            None
        };
        Ok(Self {
            before_count,
            after_count,
            offset,
            content_count,
            context_id,
        })
    }

    pub fn to_control(&self, critical: bool) -> Control {
        let mut w = BerWriter::new();
        let seq = w.begin_sequence();
        w.write_integer(self.before_count);
        w.write_integer(self.after_count);
        let by_offset = w.begin(0xA0);
        w.write_integer(self.offset);
        w.write_integer(self.content_count);
        w.end(by_offset);
        if let Some(ref ctx) = self.context_id {
            w.write_octet_string(ctx);
        }
        w.end(seq);
        Control {
            ctype: OID_VLV_REQUEST.to_string(),
            critical,
            value: Some(w.into_vec()),
        }
    }
}

/// VirtualListViewResponse ::= SEQUENCE {
///   targetPosition INTEGER, contentCount INTEGER,
///   virtualListViewResult ENUMERATED, contextID OCTET STRING OPTIONAL }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvResponseControl {
    pub target_position: i32,
    pub content_count: i32,
    pub result_code: i32,
    pub context_id: Option<Vec<u8>>,
}

impl VlvResponseControl {
    pub fn to_control(&self) -> Control {
        let mut w = BerWriter::new();
        let seq = w.begin_sequence();
        w.write_integer(self.target_position);
        w.write_integer(self.content_count);
        w.write_enumerated(self.result_code);
        if let Some(ref ctx) = self.context_id {
            w.write_octet_string(ctx);
        }
        w.end(seq);
        Control {
            ctype: OID_VLV_RESPONSE.to_string(),
            critical: false,
            value: Some(w.into_vec()),
        }
    }

    pub fn parse(control: &Control) -> Result<Self> {
        let value = control
            .value
            .as_deref()
            .ok_or_else(|| LdapError::ProtocolDecode("VLV response control without value".into()))?;
        let mut r = BerReader::new(value);
        let len = r.read_sequence()?;
        let end = r.position() + len;
        let target_position = r.read_integer()?;
        let content_count = r.read_integer()?;
        let result_code = r.read_enumerated()?;
        let context_id = if r.position() < end {
            Some(r.read_octet_string()?)
        } else {
            None
        };
        Ok(Self {
            target_position,
            content_count,
            result_code,
            context_id,
        })
    }
}
