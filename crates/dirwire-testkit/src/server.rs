//! Server side of an in-process connection, driven step by step by a test.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dirwire_core::ber::{self, TAG_ABANDON_REQUEST, TAG_ENUMERATED, TAG_OCTET_STRING};
use dirwire_core::framing::read_frame;
use dirwire_core::{Connection, ConnectionConfig};
use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

use crate::TestError;

const PIPE_CAPACITY: usize = 64 * 1024;
const MAX_FRAME: usize = 1 << 20;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A request frame as the server saw it.
#[derive(Debug, Clone)]
pub struct ServerFrame {
    pub msg_id: u32,
    pub op_tag: Option<u8>,
    pub bytes: Bytes,
}

impl ServerFrame {
    fn parse(bytes: Bytes) -> Result<Self, TestError> {
        let env = ber::peek_envelope(&bytes)
            .map_err(|e| TestError::Protocol(format!("bad request frame: {e}")))?;
        Ok(Self {
            msg_id: env.msg_id,
            op_tag: env.op_tag,
            bytes,
        })
    }

    /// Target message id of an Abandon request.
    pub fn abandon_target(&self) -> Option<u32> {
        if self.op_tag != Some(TAG_ABANDON_REQUEST) {
            return None;
        }
        let mut pos = skip_header(&self.bytes, 0)?;
        // message id
        let (id_len, id_start) = tlv(&self.bytes, pos)?;
        pos = id_start + id_len;
        let (len, start) = tlv(&self.bytes, pos)?;
        let octets = self.bytes.get(start..start + len)?;
        Some(octets.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
    }
}

fn skip_header(bytes: &[u8], pos: usize) -> Option<usize> {
    tlv(bytes, pos).map(|(_, start)| start)
}

/// Length and content offset of the element starting at `pos`.
fn tlv(bytes: &[u8], pos: usize) -> Option<(usize, usize)> {
    let first = *bytes.get(pos + 1)?;
    if first & 0x80 == 0 {
        return Some((usize::from(first), pos + 2));
    }
    let count = usize::from(first & 0x7f);
    let octets = bytes.get(pos + 2..pos + 2 + count)?;
    let len = octets.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
    Some((len, pos + 2 + count))
}

/// The directory server end of a duplex pipe.
#[derive(Debug)]
pub struct ScriptedServer {
    stream: DuplexStream,
}

impl ScriptedServer {
    /// A connection over an in-memory pipe plus the server end of it.
    pub fn pair(config: ConnectionConfig) -> (Arc<Connection>, ScriptedServer) {
        let (client, server) = Self::pipe();
        (Connection::from_stream(config, client), server)
    }

    /// Raw pipe: the client end plus the server.
    pub fn pipe() -> (DuplexStream, ScriptedServer) {
        let (client, server) = duplex(PIPE_CAPACITY);
        (client, ScriptedServer { stream: server })
    }

    /// Next request frame. Fails on end of stream or after five seconds.
    pub async fn recv(&mut self) -> Result<ServerFrame, TestError> {
        match self.try_recv(RECV_TIMEOUT).await? {
            Some(frame) => Ok(frame),
            None => Err(TestError::Protocol("client closed the stream".into())),
        }
    }

    /// Next request frame, or `None` once the client has shut down.
    pub async fn try_recv(&mut self, wait: Duration) -> Result<Option<ServerFrame>, TestError> {
        let read = tokio::time::timeout(wait, read_frame(&mut self.stream, MAX_FRAME))
            .await
            .map_err(|_| TestError::Timeout("server waiting for a request"))??;
        read.map(ServerFrame::parse).transpose()
    }

    /// Every remaining frame up to end of stream.
    pub async fn drain(&mut self) -> Result<Vec<ServerFrame>, TestError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.try_recv(RECV_TIMEOUT).await? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Send `op` as the reply to `msg_id`.
    pub async fn reply(&mut self, msg_id: u32, op: &[u8]) -> Result<(), TestError> {
        let frame = ber::encode_message(msg_id, op);
        self.send_raw(&frame).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TestError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Hang up: the client's reader sees end of stream.
    pub fn hang_up(self) {
        drop(self.stream);
    }

    pub fn into_inner(self) -> DuplexStream {
        self.stream
    }
}

/// `BindRequest` for an anonymous simple bind, version 3.
pub fn anonymous_bind() -> Vec<u8> {
    vec![0x60, 0x07, 0x02, 0x01, 0x03, 0x04, 0x00, 0x80, 0x00]
}

/// Generic placeholder operation body; the server never interprets it.
pub fn request_body(marker: u8) -> Vec<u8> {
    let mut out = BytesMut::new();
    ber::put_tlv(&mut out, 0x63, &[TAG_OCTET_STRING, 0x01, marker]);
    out.to_vec()
}

fn ldap_result(tag: u8, code: u8) -> Vec<u8> {
    let mut body = BytesMut::new();
    ber::put_tlv(&mut body, TAG_ENUMERATED, &[code]);
    ber::put_tlv(&mut body, TAG_OCTET_STRING, &[]);
    ber::put_tlv(&mut body, TAG_OCTET_STRING, &[]);
    let mut out = BytesMut::new();
    ber::put_tlv(&mut out, tag, &body);
    out.to_vec()
}

pub fn bind_response(code: u8) -> Vec<u8> {
    ldap_result(ber::TAG_BIND_RESPONSE, code)
}

pub fn search_done(code: u8) -> Vec<u8> {
    ldap_result(ber::TAG_SEARCH_RESULT_DONE, code)
}

pub fn extended_response(code: u8) -> Vec<u8> {
    ldap_result(ber::TAG_EXTENDED_RESPONSE, code)
}

/// `SearchResultEntry` for `dn` with no attributes.
pub fn search_entry(dn: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    ber::put_tlv(&mut body, TAG_OCTET_STRING, dn.as_bytes());
    ber::put_tlv(&mut body, ber::TAG_SEQUENCE, &[]);
    let mut out = BytesMut::new();
    ber::put_tlv(&mut out, ber::TAG_SEARCH_RESULT_ENTRY, &body);
    out.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_abandon_target() {
        let frame = ServerFrame::parse(ber::encode_abandon(9, 300, &[])).unwrap();
        assert_eq!(frame.msg_id, 9);
        assert_eq!(frame.abandon_target(), Some(300));
    }
}
