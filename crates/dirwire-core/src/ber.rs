//! Minimal BER encoding for the LDAPMessage envelope.
//!
//! Only what the connection itself needs: the outer SEQUENCE, the message id
//! INTEGER, the Abandon and Unbind operations, and the `[0] Controls` element.
//! Operation bodies (bind, search, ...) are encoded by the caller.

use bytes::{BufMut, Bytes, BytesMut};

use crate::DecodeError;

/// Universal constructed SEQUENCE; every LDAPMessage starts with it.
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_ENUMERATED: u8 = 0x0a;

/// `[APPLICATION 2] NULL`
pub const TAG_UNBIND_REQUEST: u8 = 0x42;
/// `[APPLICATION 16] INTEGER`
pub const TAG_ABANDON_REQUEST: u8 = 0x50;
/// `[0] Controls`
pub const TAG_CONTROLS: u8 = 0xa0;

pub const TAG_BIND_RESPONSE: u8 = 0x61;
pub const TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const TAG_EXTENDED_RESPONSE: u8 = 0x78;
pub const TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Maximum number of octets in a long-form definite length.
pub const MAX_LENGTH_OCTETS: usize = 4;

/// A request or response control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Bytes>,
}

impl Control {
    pub fn new(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            critical: false,
            value: None,
        }
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    fn encode(&self, out: &mut BytesMut) {
        let mut body = BytesMut::new();
        put_tlv(&mut body, TAG_OCTET_STRING, self.oid.as_bytes());
        if self.critical {
            put_tlv(&mut body, TAG_BOOLEAN, &[0xff]);
        }
        if let Some(value) = &self.value {
            put_tlv(&mut body, TAG_OCTET_STRING, value);
        }
        put_tlv(out, TAG_SEQUENCE, &body);
    }
}

/// Append a definite length in the shortest form.
pub fn put_length(out: &mut BytesMut, len: usize) {
    if len < 0x80 {
        out.put_u8(len as u8);
        return;
    }
    let bytes = (len as u32).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.put_u8(0x80 | (MAX_LENGTH_OCTETS - skip) as u8);
    out.put_slice(&bytes[skip..]);
}

/// Append a tag, length and value.
pub fn put_tlv(out: &mut BytesMut, tag: u8, value: &[u8]) {
    out.put_u8(tag);
    put_length(out, value.len());
    out.put_slice(value);
}

/// Minimal two's-complement content octets of `value`.
fn integer_octets(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Append an INTEGER (or an implicitly tagged integer when `tag` differs).
pub fn put_integer(out: &mut BytesMut, tag: u8, value: i64) {
    put_tlv(out, tag, &integer_octets(value));
}

fn put_controls(out: &mut BytesMut, controls: &[Control]) {
    if controls.is_empty() {
        return;
    }
    let mut body = BytesMut::new();
    for control in controls {
        control.encode(&mut body);
    }
    put_tlv(out, TAG_CONTROLS, &body);
}

/// Wrap an encoded protocolOp (optionally followed by controls) into a
/// complete LDAPMessage carrying `msg_id`.
pub fn encode_message(msg_id: u32, op: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(op.len() + 6);
    put_integer(&mut body, TAG_INTEGER, i64::from(msg_id));
    body.put_slice(op);
    let mut out = BytesMut::with_capacity(body.len() + 6);
    put_tlv(&mut out, TAG_SEQUENCE, &body);
    out.freeze()
}

/// `AbandonRequest` for `target_id`, numbered `msg_id`.
pub fn encode_abandon(msg_id: u32, target_id: u32, controls: &[Control]) -> Bytes {
    let mut op = BytesMut::new();
    put_integer(&mut op, TAG_ABANDON_REQUEST, i64::from(target_id));
    put_controls(&mut op, controls);
    encode_message(msg_id, &op)
}

/// `UnbindRequest` numbered `msg_id`.
pub fn encode_unbind(msg_id: u32, controls: &[Control]) -> Bytes {
    let mut op = BytesMut::new();
    put_tlv(&mut op, TAG_UNBIND_REQUEST, &[]);
    put_controls(&mut op, controls);
    encode_message(msg_id, &op)
}

/// Envelope fields read from the front of a frame without parsing the
/// operation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub msg_id: u32,
    /// Tag of the protocolOp element, if the frame has one.
    pub op_tag: Option<u8>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self.data.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn length(&mut self) -> Result<usize, DecodeError> {
        let first = self.byte()?;
        if first & 0x80 == 0 {
            return Ok(usize::from(first));
        }
        let count = usize::from(first & 0x7f);
        if count == 0 || count > MAX_LENGTH_OCTETS {
            return Err(DecodeError::InvalidLength);
        }
        let mut len = 0usize;
        for _ in 0..count {
            len = (len << 8) | usize::from(self.byte()?);
        }
        Ok(len)
    }

    fn expect_tag(&mut self, expected: u8) -> Result<(), DecodeError> {
        let found = self.byte()?;
        if found != expected {
            return Err(DecodeError::UnexpectedTag { expected, found });
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::InvalidLength)?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }
}

/// Peek the outer SEQUENCE, the message id and the protocolOp tag.
pub fn peek_envelope(frame: &[u8]) -> Result<Envelope, DecodeError> {
    let mut cur = Cursor { data: frame, pos: 0 };
    cur.expect_tag(TAG_SEQUENCE)?;
    let _ = cur.length()?;
    cur.expect_tag(TAG_INTEGER)?;
    let len = cur.length()?;
    if len == 0 || len > 5 {
        return Err(DecodeError::InvalidMessageId);
    }
    let octets = cur.take(len)?;
    if octets[0] & 0x80 != 0 {
        return Err(DecodeError::InvalidMessageId);
    }
    let value = octets
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    let msg_id = i32::try_from(value).map_err(|_| DecodeError::InvalidMessageId)? as u32;
    let op_tag = cur.byte().ok();
    Ok(Envelope { msg_id, op_tag })
}

/// Result code of an LDAPResult-shaped reply (`BindResponse`,
/// `SearchResultDone`, `ExtendedResponse`, ...).
pub fn peek_result_code(frame: &[u8]) -> Result<u32, DecodeError> {
    let mut cur = Cursor { data: frame, pos: 0 };
    cur.expect_tag(TAG_SEQUENCE)?;
    let _ = cur.length()?;
    cur.expect_tag(TAG_INTEGER)?;
    let len = cur.length()?;
    cur.take(len)?;
    let _op_tag = cur.byte()?;
    let _ = cur.length()?;
    cur.expect_tag(TAG_ENUMERATED)?;
    let len = cur.length()?;
    if len == 0 || len > 4 {
        return Err(DecodeError::InvalidLength);
    }
    Ok(cur
        .take(len)?
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_lengths() {
        let mut out = BytesMut::new();
        put_length(&mut out, 5);
        assert_eq!(&out[..], &[0x05]);

        let mut out = BytesMut::new();
        put_length(&mut out, 0x80);
        assert_eq!(&out[..], &[0x81, 0x80]);

        let mut out = BytesMut::new();
        put_length(&mut out, 0x0102_0304);
        assert_eq!(&out[..], &[0x84, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn integers_are_minimal() {
        assert_eq!(integer_octets(0), vec![0x00]);
        assert_eq!(integer_octets(127), vec![0x7f]);
        assert_eq!(integer_octets(128), vec![0x00, 0x80]);
        assert_eq!(integer_octets(256), vec![0x01, 0x00]);
        assert_eq!(integer_octets(-1), vec![0xff]);
        assert_eq!(integer_octets(i64::from(i32::MAX)), vec![0x7f, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn abandon_frame_layout() {
        let frame = encode_abandon(7, 3, &[]);
        assert_eq!(&frame[..], &[0x30, 0x06, 0x02, 0x01, 0x07, 0x50, 0x01, 0x03]);
        let env = peek_envelope(&frame).unwrap();
        assert_eq!(env.msg_id, 7);
        assert_eq!(env.op_tag, Some(TAG_ABANDON_REQUEST));
    }

    #[test]
    fn peeks_result_code() {
        // BindResponse { resultCode 49, matchedDN "", diagnosticMessage "" }
        let op = [0x61, 0x07, 0x0a, 0x01, 0x31, 0x04, 0x00, 0x04, 0x00];
        let frame = encode_message(1, &op);
        assert_eq!(peek_result_code(&frame), Ok(49));
        assert!(peek_result_code(&encode_unbind(1, &[])).is_err());
    }

    #[test]
    fn unbind_frame_layout() {
        let frame = encode_unbind(2, &[]);
        assert_eq!(&frame[..], &[0x30, 0x05, 0x02, 0x01, 0x02, 0x42, 0x00]);
    }

    #[test]
    fn controls_are_appended() {
        let control = Control::new("1.2.3").critical(true);
        let frame = encode_unbind(1, &[control]);
        // 42 00 | a0 0c | 30 0a 04 05 "1.2.3" 01 01 ff
        assert_eq!(
            &frame[5..],
            &[
                0x42, 0x00, 0xa0, 0x0c, 0x30, 0x0a, 0x04, 0x05, b'1', b'.', b'2', b'.', b'3',
                0x01, 0x01, 0xff
            ]
        );
        assert_eq!(frame[1] as usize, frame.len() - 2);
    }

    #[test]
    fn peek_rejects_garbage() {
        assert_eq!(peek_envelope(&[]), Err(DecodeError::UnexpectedEof));
        assert_eq!(
            peek_envelope(&[0x31, 0x00]),
            Err(DecodeError::UnexpectedTag {
                expected: TAG_SEQUENCE,
                found: 0x31
            })
        );
        assert_eq!(
            peek_envelope(&[0x30, 0x03, 0x04, 0x01, 0x01]),
            Err(DecodeError::UnexpectedTag {
                expected: TAG_INTEGER,
                found: 0x04
            })
        );
        // negative message id
        assert_eq!(
            peek_envelope(&[0x30, 0x03, 0x02, 0x01, 0xff]),
            Err(DecodeError::InvalidMessageId)
        );
    }

    #[test]
    fn peek_reads_multi_byte_ids() {
        let frame = encode_message(300, &[TAG_SEARCH_RESULT_DONE, 0x00]);
        let env = peek_envelope(&frame).unwrap();
        assert_eq!(env.msg_id, 300);
        assert_eq!(env.op_tag, Some(TAG_SEARCH_RESULT_DONE));
    }
}
