//! Error types.

use std::io;
use std::time::Duration;

/// Errors surfaced to callers of a [`Connection`](crate::Connection).
///
/// The three ways an operation can stop are kept apart so a caller never
/// sends a redundant Abandon:
/// - [`LdapError::Cancelled`]: already handled, do not abandon.
/// - [`LdapError::Closed`]: the reply stream was cut, abandon it.
/// - [`LdapError::ReadTimeout`]: the caller gave up, abandon it.
#[derive(Debug, thiserror::Error)]
pub enum LdapError {
    /// The connection is already closed or was never usable.
    #[error("connection closed{}", reason_suffix(.reason))]
    ServiceUnavailable { reason: Option<String> },

    /// I/O failure on the underlying stream.
    #[error("communication failure: {0}")]
    Io(#[source] io::Error),

    /// No reply arrived within the read timeout.
    #[error("LDAP response read timed out, timeout used: {} ms", .0.as_millis())]
    ReadTimeout(Duration),

    /// Connecting did not finish within the connect timeout.
    #[error("connect timed out after {} ms", .0.as_millis())]
    ConnectTimeout(Duration),

    /// The secure-transport handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// The request was cancelled; no Abandon is needed.
    #[error("request cancelled")]
    Cancelled,

    /// The request was closed under the caller; an Abandon is required.
    #[error("request closed, abandon required")]
    Closed,

    /// A frame could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default()
}

impl LdapError {
    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            reason: Some(reason.into()),
        }
    }

    /// True for I/O failures and read timeouts.
    pub fn is_communication_failure(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ReadTimeout(_) | Self::ConnectTimeout(_) | Self::Handshake(_)
        )
    }

    /// True when the caller still has to abandon the operation on the wire.
    pub fn requires_abandon(&self) -> bool {
        matches!(self, Self::Closed | Self::ReadTimeout(_))
    }
}

impl From<io::Error> for LdapError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure to peek the envelope of a received frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of frame")]
    UnexpectedEof,
    #[error("unexpected tag {found:#04x}, expected {expected:#04x}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("invalid length encoding")]
    InvalidLength,
    #[error("message id out of range")]
    InvalidMessageId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_carries_duration() {
        let e = LdapError::ReadTimeout(Duration::from_millis(100));
        assert_eq!(
            e.to_string(),
            "LDAP response read timed out, timeout used: 100 ms"
        );
        assert!(e.is_communication_failure());
        assert!(e.requires_abandon());
    }

    #[test]
    fn cancelled_and_closed_differ_on_abandon() {
        assert!(!LdapError::Cancelled.requires_abandon());
        assert!(LdapError::Closed.requires_abandon());
        assert!(!LdapError::Closed.is_communication_failure());
    }

    #[test]
    fn unavailable_includes_reason() {
        assert_eq!(
            LdapError::unavailable("peer reset").to_string(),
            "connection closed: peer reset"
        );
        assert_eq!(
            LdapError::ServiceUnavailable { reason: None }.to_string(),
            "connection closed"
        );
    }
}
