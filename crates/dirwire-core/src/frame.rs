//! Received protocol frames.

use bytes::Bytes;

use crate::ber::{
    self, TAG_INTERMEDIATE_RESPONSE, TAG_SEARCH_RESULT_ENTRY, TAG_SEARCH_RESULT_REFERENCE,
};
use crate::DecodeError;

/// One complete LDAPMessage as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    msg_id: u32,
    op_tag: Option<u8>,
    bytes: Bytes,
}

impl Frame {
    /// Peek the envelope of `bytes` and wrap them.
    pub fn decode(bytes: Bytes) -> Result<Self, DecodeError> {
        let env = ber::peek_envelope(&bytes)?;
        Ok(Self {
            msg_id: env.msg_id,
            op_tag: env.op_tag,
            bytes,
        })
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    /// Tag of the protocolOp element.
    pub fn op_tag(&self) -> Option<u8> {
        self.op_tag
    }

    /// Message id 0 is reserved for unsolicited notifications.
    pub fn is_unsolicited(&self) -> bool {
        self.msg_id == 0
    }

    /// True unless this is one of the intermediate replies of a multi-reply
    /// operation (search entries, search references, intermediate responses).
    pub fn is_final(&self) -> bool {
        !matches!(
            self.op_tag,
            Some(TAG_SEARCH_RESULT_ENTRY | TAG_SEARCH_RESULT_REFERENCE | TAG_INTERMEDIATE_RESPONSE)
                | None
        )
    }

    /// Result code, for replies shaped as an LDAPResult.
    pub fn result_code(&self) -> Result<u32, DecodeError> {
        ber::peek_result_code(&self.bytes)
    }

    /// The full frame bytes, including tag and length octets.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
