//! Connection configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::WireTrace;

const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Convert a millisecond setting to a timeout; values `<= 0` mean "none".
pub fn timeout_from_millis(ms: i64) -> Option<Duration> {
    u64::try_from(ms)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn env_millis(key: &str) -> Option<Option<Duration>> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(timeout_from_millis)
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Bound on connecting and on the secure-transport handshake.
    pub connect_timeout: Option<Duration>,
    /// Default bound used by [`Connection::read_reply`](crate::Connection::read_reply).
    pub read_timeout: Option<Duration>,
    /// Frames announcing a longer payload fail the connection.
    pub max_frame_len: usize,
    /// Raw wire-trace sink.
    pub trace: Option<Arc<dyn WireTrace>>,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("max_frame_len", &self.max_frame_len)
            .field("trace", &self.trace.is_some())
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: None,
            read_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            trace: None,
        }
    }

    /// Defaults overridden by `DIRWIRE_CONNECT_TIMEOUT_MS`,
    /// `DIRWIRE_READ_TIMEOUT_MS` and `DIRWIRE_MAX_FRAME_LEN`. Unparsable
    /// values are ignored.
    pub fn from_env(host: impl Into<String>, port: u16) -> Self {
        let mut config = Self::new(host, port);
        if let Some(timeout) = env_millis("DIRWIRE_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = timeout;
        }
        if let Some(timeout) = env_millis("DIRWIRE_READ_TIMEOUT_MS") {
            config.read_timeout = timeout;
        }
        if let Some(max) = std::env::var("DIRWIRE_MAX_FRAME_LEN")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
        {
            config.max_frame_len = max;
        }
        config
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn WireTrace>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub(crate) fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_millis_disable_timeout() {
        assert_eq!(timeout_from_millis(0), None);
        assert_eq!(timeout_from_millis(-5), None);
        assert_eq!(timeout_from_millis(250), Some(Duration::from_millis(250)));
    }

    #[test]
    fn builder_sets_fields() {
        let config = ConnectionConfig::new("ldap.example.org", 389)
            .with_connect_timeout(Duration::from_secs(3))
            .with_read_timeout(Duration::from_secs(10))
            .with_max_frame_len(1024);
        assert_eq!(config.endpoint(), "ldap.example.org:389");
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.read_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.max_frame_len, 1024);
        assert!(config.trace.is_none());
    }
}
