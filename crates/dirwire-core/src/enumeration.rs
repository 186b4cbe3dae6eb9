//! Scoped handle for a multi-reply result being consumed by a caller.

use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::Connection;
use crate::ber::Control;

/// What to do with the connection when an [`EnumerationGuard`] goes away.
pub trait ReleaseHook: Send + Sync + 'static {
    /// `msg_id` is the id of the last raw result the guard consumed, if any.
    fn release(&self, conn: Arc<Connection>, msg_id: Option<u32>) -> BoxFuture<'static, ()>;
}

/// Default hook: [`Connection::release_result`] with fixed controls.
#[derive(Debug, Clone, Default)]
pub struct ReleaseResult {
    controls: Vec<Control>,
}

impl ReleaseResult {
    pub fn new(controls: Vec<Control>) -> Self {
        Self { controls }
    }
}

impl ReleaseHook for ReleaseResult {
    fn release(&self, conn: Arc<Connection>, msg_id: Option<u32>) -> BoxFuture<'static, ()> {
        let controls = self.controls.clone();
        async move {
            if let Some(msg_id) = msg_id {
                conn.release_result(msg_id, &controls).await;
            }
        }
        .boxed()
    }
}

/// Keeps the connection's outstanding-enumeration count up while alive.
///
/// Release happens exactly once: through [`EnumerationGuard::close`], or on
/// drop by spawning onto the current tokio runtime.
pub struct EnumerationGuard {
    conn: Arc<Connection>,
    last_msg_id: Option<u32>,
    hook: Arc<dyn ReleaseHook>,
    released: bool,
}

impl fmt::Debug for EnumerationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnumerationGuard")
            .field("last_msg_id", &self.last_msg_id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl EnumerationGuard {
    pub fn new(conn: Arc<Connection>, hook: Arc<dyn ReleaseHook>) -> Self {
        let outstanding = conn.increment_outstanding();
        tracing::trace!(outstanding, "enumeration opened");
        Self {
            conn,
            last_msg_id: None,
            hook,
            released: false,
        }
    }

    /// Guard using [`ReleaseResult`] without controls.
    pub fn with_default_hook(conn: Arc<Connection>) -> Self {
        Self::new(conn, Arc::new(ReleaseResult::default()))
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn last_message_id(&self) -> Option<u32> {
        self.last_msg_id
    }

    /// Record the id of the raw result most recently consumed.
    pub fn set_last_message_id(&mut self, msg_id: u32) {
        self.last_msg_id = Some(msg_id);
    }

    pub async fn close(mut self) {
        if let Some(release) = self.take_release() {
            release.await;
        }
    }

    fn take_release(&mut self) -> Option<BoxFuture<'static, ()>> {
        if self.released {
            return None;
        }
        self.released = true;
        let outstanding = self.conn.decrement_outstanding();
        tracing::trace!(outstanding, msg_id = ?self.last_msg_id, "enumeration released");
        Some(self.hook.release(self.conn.clone(), self.last_msg_id))
    }
}

impl Drop for EnumerationGuard {
    fn drop(&mut self) {
        let Some(release) = self.take_release() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release);
            }
            Err(_) => {
                tracing::warn!(msg_id = ?self.last_msg_id, "no runtime, enumeration release skipped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::duplex;

    use super::*;
    use crate::ConnectionConfig;

    #[derive(Default)]
    struct CountingHook {
        calls: AtomicUsize,
    }

    impl ReleaseHook for CountingHook {
        fn release(&self, _conn: Arc<Connection>, _msg_id: Option<u32>) -> BoxFuture<'static, ()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        }
    }

    fn conn() -> (Arc<Connection>, tokio::io::DuplexStream) {
        let (client, server) = duplex(4096);
        (
            Connection::from_stream(ConnectionConfig::new("test", 389), client),
            server,
        )
    }

    #[tokio::test]
    async fn close_releases_once() {
        let (conn, _server) = conn();
        let hook = Arc::new(CountingHook::default());
        let guard = EnumerationGuard::new(conn.clone(), hook.clone());
        assert_eq!(conn.outstanding_enumerations(), 1);
        guard.close().await;
        assert_eq!(conn.outstanding_enumerations(), 0);
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_releases_once() {
        let (conn, _server) = conn();
        let hook = Arc::new(CountingHook::default());
        {
            let mut guard = EnumerationGuard::new(conn.clone(), hook.clone());
            guard.set_last_message_id(4);
            assert_eq!(guard.last_message_id(), Some(4));
        }
        tokio::task::yield_now().await;
        assert_eq!(conn.outstanding_enumerations(), 0);
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    }
}
