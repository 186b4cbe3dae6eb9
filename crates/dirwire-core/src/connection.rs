//! One physical connection multiplexing many outstanding operations.
//!
//! # Locking
//!
//! - `state` (`parking_lot`): registry, id counter and lifecycle flags.
//!   Never held across an `.await`.
//! - `writer` / `reader` (`tokio`): the two stream halves. The writer lock is
//!   held for the whole write of one frame; the reader task holds the reader
//!   lock only while reading a frame.
//! - `swaps`: count of stream swaps waiting for the reader lock. A read in
//!   flight gives the lock up as soon as it goes above zero, and the reader
//!   does not take the lock again until it is back at zero.
//! - `gate`: its own channel, so callers can unpause the reader from
//!   anywhere without touching the other locks.
//!
//! Lock order when more than one is needed: reader, writer, state.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::watch;

use crate::ber::{Control, encode_abandon, encode_message, encode_unbind};
use crate::{
    AsyncStream, BoxedStream, ConnectionConfig, Direction, Frame, LdapError, PauseGate,
    PendingRequests, Request, RequestOptions, SocketFactory, StreamUpgrader,
};

mod reader;

/// Receives what the connection cannot route to a request.
///
/// Held weakly; a dropped owner simply stops receiving callbacks.
pub trait ConnectionOwner: Send + Sync + 'static {
    /// A frame with message id 0 (unsolicited notification).
    fn unsolicited(&self, frame: Frame) {
        tracing::debug!(len = frame.len(), "unsolicited notification ignored");
    }

    /// The reader observed the connection going away and tore it down.
    fn connection_closed(&self, reason: Option<&str>);
}

#[derive(Debug)]
struct ConnectionState {
    pending: PendingRequests,
    torn_down: bool,
    bound: bool,
    tls_upgraded: bool,
    closure_reason: Option<String>,
}

pub struct Connection {
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    reader: AsyncMutex<Option<ReadHalf<BoxedStream>>>,
    writer: AsyncMutex<Option<WriteHalf<BoxedStream>>>,
    gate: PauseGate,
    /// Bumped on every stream replacement.
    generation: AtomicU64,
    /// Stream swaps waiting for, or holding, the reader lock.
    swaps: watch::Sender<usize>,
    /// Tells the reader to stop.
    shutdown: watch::Sender<bool>,
    /// Set once teardown has finished.
    closed: watch::Sender<bool>,
    outstanding: AtomicUsize,
    owner: Mutex<Option<Weak<dyn ConnectionOwner>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Connection")
            .field("endpoint", &self.config.endpoint())
            .field("pending", &state.pending.len())
            .field("torn_down", &state.torn_down)
            .field("bound", &state.bound)
            .field("tls_upgraded", &state.tls_upgraded)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Dial `config.host:config.port` through `factory`, optionally run a
    /// secure-transport handshake, and start the reader task.
    ///
    /// Both the dial and the handshake are bounded by `config.connect_timeout`.
    pub async fn open(
        config: ConnectionConfig,
        factory: Arc<dyn SocketFactory>,
        upgrader: Option<Arc<dyn StreamUpgrader>>,
    ) -> Result<Arc<Self>, LdapError> {
        let connect = factory.connect(&config.host, config.port);
        let stream = match config.connect_timeout {
            Some(limit) if factory.connect_timeout_capable() => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| LdapError::ConnectTimeout(limit))??,
            Some(_) => {
                tracing::debug!(
                    endpoint = %config.endpoint(),
                    "socket factory cannot enforce connect timeout, connecting without one"
                );
                connect.await?
            }
            None => connect.await?,
        };

        let tls_upgraded = upgrader.is_some();
        let stream = match upgrader {
            Some(upgrader) => handshake(upgrader.as_ref(), stream, config.connect_timeout).await?,
            None => stream,
        };

        tracing::debug!(endpoint = %config.endpoint(), tls_upgraded, "connection open");
        let conn = Self::start(config, stream);
        conn.state.lock().tls_upgraded = tls_upgraded;
        Ok(conn)
    }

    /// Run over an already-open stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S: AsyncStream>(config: ConnectionConfig, stream: S) -> Arc<Self> {
        Self::start(config, Box::new(stream))
    }

    fn start(config: ConnectionConfig, stream: BoxedStream) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(Self {
            config,
            state: Mutex::new(ConnectionState {
                pending: PendingRequests::new(),
                torn_down: false,
                bound: false,
                tls_upgraded: false,
                closure_reason: None,
            }),
            reader: AsyncMutex::new(Some(reader)),
            writer: AsyncMutex::new(Some(writer)),
            gate: PauseGate::new(),
            generation: AtomicU64::new(0),
            swaps: watch::Sender::new(0),
            shutdown: watch::Sender::new(false),
            closed: watch::Sender::new(false),
            outstanding: AtomicUsize::new(0),
            owner: Mutex::new(None),
        });
        tokio::spawn(conn.clone().run_reader());
        conn
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn set_owner<O: ConnectionOwner>(&self, owner: &Arc<O>) {
        let weak: Weak<dyn ConnectionOwner> = Arc::downgrade(owner) as Weak<dyn ConnectionOwner>;
        *self.owner.lock() = Some(weak);
    }

    fn owner(&self) -> Option<Arc<dyn ConnectionOwner>> {
        self.owner.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn pause_gate(&self) -> &PauseGate {
        &self.gate
    }

    fn unavailable(&self) -> LdapError {
        LdapError::ServiceUnavailable {
            reason: self.state.lock().closure_reason.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Register a request and send `body` (the encoded protocolOp, plus any
    /// controls) in an LDAPMessage envelope.
    ///
    /// The request is registered before any byte is written, so its reply
    /// cannot race past it.
    pub async fn write_request(
        &self,
        body: &[u8],
        options: RequestOptions,
    ) -> Result<Arc<Request>, LdapError> {
        let request = {
            let mut state = self.state.lock();
            if state.torn_down {
                return Err(LdapError::ServiceUnavailable {
                    reason: state.closure_reason.clone(),
                });
            }
            let msg_id = state
                .pending
                .next_message_id()
                .ok_or_else(|| LdapError::unavailable("message id space exhausted"))?;
            let request = Arc::new(Request::new(msg_id, options));
            state.pending.add(request.clone());
            tracing::debug!(
                msg_id,
                pending_len = state.pending.len(),
                pause_after_receipt = options.pause_after_receipt,
                "request registered"
            );
            request
        };

        // A reader parked after a previous reply resumes once the next
        // request is on its way.
        self.gate.unpause();

        let frame = encode_message(request.msg_id(), body);
        match self.write_frame(&frame).await {
            Ok(()) => Ok(request),
            Err(LdapError::Io(e)) => {
                tracing::debug!(msg_id = request.msg_id(), error = %e, "request write failed");
                self.teardown(&[], true, Some(e.to_string())).await;
                Err(LdapError::Io(e))
            }
            Err(e) => {
                self.remove_request(&request);
                Err(e)
            }
        }
    }

    async fn write_frame(&self, frame: &Bytes) -> Result<(), LdapError> {
        let mut writer = self.writer.lock().await;
        let Some(out) = writer.as_mut() else {
            return Err(self.unavailable());
        };
        if let Some(trace) = &self.config.trace {
            trace.record(Direction::Sent, frame);
        }
        tracing::trace!(payload_len = frame.len(), "writing frame");
        out.write_all(frame).await?;
        out.flush().await?;
        Ok(())
    }

    fn next_admin_id(&self) -> Option<u32> {
        self.state.lock().pending.next_message_id()
    }

    /// `request.get_reply` bounded by the configured read timeout.
    pub async fn read_reply(&self, request: &Request) -> Result<Frame, LdapError> {
        request.get_reply(self.config.read_timeout).await
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    pub fn find_request(&self, msg_id: u32) -> Option<Arc<Request>> {
        self.state.lock().pending.find(msg_id)
    }

    /// Unlink `request` and mark it cancelled, without telling the server.
    pub fn remove_request(&self, request: &Request) -> bool {
        let mut state = self.state.lock();
        let removed = state.pending.remove(request);
        if removed {
            tracing::debug!(
                msg_id = request.msg_id(),
                pending_len = state.pending.len(),
                "request removed"
            );
        }
        removed
    }

    /// Ids of every outstanding request, sorted.
    pub fn pending_message_ids(&self) -> Vec<u32> {
        self.state.lock().pending.message_ids()
    }

    /// Unlink `request` and tell the server to stop working on it.
    ///
    /// Abandon has no reply. Write failures are logged and swallowed.
    pub async fn abandon_request(&self, request: &Request, controls: &[Control]) {
        self.remove_request(request);
        self.send_abandon(request.msg_id(), controls).await;
    }

    async fn send_abandon(&self, target_id: u32, controls: &[Control]) {
        let Some(msg_id) = self.next_admin_id() else {
            tracing::warn!(target_id, "no message id left for abandon");
            return;
        };
        let frame = encode_abandon(msg_id, target_id, controls);
        if let Err(e) = self.write_frame(&frame).await {
            tracing::warn!(target_id, error = %e, "abandon not sent");
        } else {
            tracing::debug!(msg_id, target_id, "abandon sent");
        }
    }

    /// Abandon and unlink every outstanding request.
    pub async fn abandon_all(&self, controls: &[Control]) {
        let requests = self.state.lock().pending.drain();
        for request in requests {
            request.cancel();
            self.send_abandon(request.msg_id(), controls).await;
        }
    }

    /// Let go of the result identified by `msg_id`: abandon it while the
    /// server may still be sending, otherwise just unlink it.
    pub async fn release_result(&self, msg_id: u32, controls: &[Control]) {
        let Some(request) = self.find_request(msg_id) else {
            return;
        };
        if request.is_completed() {
            self.remove_request(&request);
        } else {
            self.abandon_request(&request, controls).await;
        }
    }

    // ------------------------------------------------------------------
    // Flags and counters
    // ------------------------------------------------------------------

    pub fn set_bound(&self, bound: bool) {
        self.state.lock().bound = bound;
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().bound
    }

    /// False once teardown has started.
    pub fn is_usable(&self) -> bool {
        !self.state.lock().torn_down
    }

    pub fn closure_reason(&self) -> Option<String> {
        self.state.lock().closure_reason.clone()
    }

    pub fn is_tls_upgraded(&self) -> bool {
        self.state.lock().tls_upgraded
    }

    pub(crate) fn increment_outstanding(&self) -> usize {
        self.outstanding.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the outstanding-enumeration counter. Saturates at zero.
    pub fn decrement_outstanding(&self) -> usize {
        let prev = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or_default();
        prev.saturating_sub(1)
    }

    pub fn outstanding_enumerations(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Stream replacement
    // ------------------------------------------------------------------

    /// Swap in a new stream.
    ///
    /// Normally called while the reader is parked on the pause gate. A read
    /// in flight on the old stream is interrupted and resumes on the new one;
    /// any partial frame from the old stream is discarded.
    pub async fn replace_streams(&self, stream: BoxedStream) -> Result<(), LdapError> {
        let (read_half, write_half) = tokio::io::split(stream);
        let _swap = SwapGuard::new(&self.swaps);
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        if !self.is_usable() {
            return Err(self.unavailable());
        }
        *reader = Some(read_half);
        *writer = Some(write_half);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(generation, "streams replaced");
        Ok(())
    }

    /// Wrap the current stream with `upgrader` and install the result.
    ///
    /// Normally called while the reader is parked; a read in flight is
    /// interrupted as in [`Connection::replace_streams`]. The handshake is
    /// bounded by the connect timeout. On failure the old stream is gone, so the connection
    /// is torn down.
    pub async fn upgrade_streams(&self, upgrader: &dyn StreamUpgrader) -> Result<(), LdapError> {
        let result = {
            let _swap = SwapGuard::new(&self.swaps);
            let mut reader = self.reader.lock().await;
            let mut writer = self.writer.lock().await;
            let (Some(read_half), Some(write_half)) = (reader.take(), writer.take()) else {
                return Err(self.unavailable());
            };
            let stream = read_half.unsplit(write_half);
            match handshake(upgrader, stream, self.config.connect_timeout).await {
                Ok(stream) => {
                    let (read_half, write_half) = tokio::io::split(stream);
                    *reader = Some(read_half);
                    *writer = Some(write_half);
                    let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    self.state.lock().tls_upgraded = true;
                    tracing::debug!(generation, "streams upgraded");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = &result {
            self.teardown(&[], true, Some(e.to_string())).await;
        }
        result
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Owner-initiated teardown: abandon everything, unbind if bound, close.
    pub async fn close(&self, controls: &[Control]) {
        self.cleanup(controls, false).await;
    }

    /// Tear the connection down. Only the first call does anything.
    ///
    /// `notify_owner` selects the reader path: remaining requests are closed
    /// (their callers must abandon) and the owner is told. Otherwise
    /// outstanding requests are abandoned and then cancelled.
    pub async fn cleanup(&self, controls: &[Control], notify_owner: bool) {
        self.teardown(controls, notify_owner, None).await;
    }

    async fn teardown(&self, controls: &[Control], notify_owner: bool, reason: Option<String>) {
        let bound = {
            let mut state = self.state.lock();
            if state.torn_down {
                tracing::trace!("cleanup already done");
                return;
            }
            state.torn_down = true;
            state.closure_reason = reason.clone();
            tracing::debug!(
                notify_owner,
                pending_len = state.pending.len(),
                reason = reason.as_deref().unwrap_or(""),
                "connection cleanup"
            );
            state.bound
        };

        if !notify_owner {
            self.abandon_all(controls).await;
        }

        if bound {
            if let Some(msg_id) = self.next_admin_id() {
                let frame = encode_unbind(msg_id, controls);
                if let Err(e) = self.write_frame(&frame).await {
                    tracing::debug!(error = %e, "unbind not sent");
                }
            }
            self.state.lock().bound = false;
        }

        if let Some(mut out) = self.writer.lock().await.take() {
            if let Err(e) = out.flush().await {
                tracing::debug!(error = %e, "writer flush failed");
            }
            if let Err(e) = out.shutdown().await {
                tracing::debug!(error = %e, "writer shutdown failed");
            }
        }

        self.shutdown.send_replace(true);
        drop(self.reader.lock().await.take());
        self.gate.unpause();

        let remaining = self.state.lock().pending.drain();
        for request in &remaining {
            if notify_owner {
                request.close();
            } else {
                request.cancel();
            }
        }

        if notify_owner {
            if let Some(owner) = self.owner() {
                owner.connection_closed(reason.as_deref());
            }
        }
        self.closed.send_replace(true);
        tracing::debug!(closed_requests = remaining.len(), "connection torn down");
    }

    /// Resolve once teardown has finished, however it was started.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Keeps the reader off the stream for as long as it lives.
struct SwapGuard<'a>(&'a watch::Sender<usize>);

impl<'a> SwapGuard<'a> {
    fn new(swaps: &'a watch::Sender<usize>) -> Self {
        swaps.send_modify(|n| *n += 1);
        Self(swaps)
    }
}

impl Drop for SwapGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn handshake(
    upgrader: &dyn StreamUpgrader,
    stream: BoxedStream,
    limit: Option<Duration>,
) -> Result<BoxedStream, LdapError> {
    // The stream moves into the handshake future; a timeout drops it.
    let upgrade = upgrader.upgrade(stream);
    let result = match limit {
        Some(limit) => tokio::time::timeout(limit, upgrade)
            .await
            .map_err(|_| LdapError::ConnectTimeout(limit))?,
        None => upgrade.await,
    };
    result.map_err(LdapError::Handshake)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    use super::*;
    use crate::ber::{TAG_ABANDON_REQUEST, TAG_UNBIND_REQUEST, peek_envelope};
    use crate::framing::read_frame;

    fn pair() -> (Arc<Connection>, DuplexStream) {
        let (client, server) = duplex(64 * 1024);
        let conn = Connection::from_stream(ConnectionConfig::new("test", 389), client);
        (conn, server)
    }

    async fn next_envelope(server: &mut DuplexStream) -> crate::ber::Envelope {
        let bytes = read_frame(server, 1 << 20).await.unwrap().unwrap();
        peek_envelope(&bytes).unwrap()
    }

    #[tokio::test]
    async fn request_is_registered_before_bytes_go_out() {
        let (conn, mut server) = pair();
        let req = conn
            .write_request(&[0x42, 0x00], RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(req.msg_id(), 1);
        assert_eq!(conn.pending_message_ids(), vec![1]);
        assert_eq!(next_envelope(&mut server).await.msg_id, 1);

        server.write_all(&encode_message(1, &[0x65, 0x00])).await.unwrap();
        let frame = conn.read_reply(&req).await.unwrap();
        assert_eq!(frame.msg_id(), 1);
    }

    #[tokio::test]
    async fn abandon_uses_fresh_id_and_unlinks() {
        let (conn, mut server) = pair();
        let req = conn
            .write_request(&[0x42, 0x00], RequestOptions::default())
            .await
            .unwrap();
        next_envelope(&mut server).await;
        conn.abandon_request(&req, &[]).await;

        let env = next_envelope(&mut server).await;
        assert_eq!(env.msg_id, 2);
        assert_eq!(env.op_tag, Some(TAG_ABANDON_REQUEST));
        assert!(req.is_cancelled());
        assert!(conn.find_request(1).is_none());
    }

    #[tokio::test]
    async fn close_unbinds_when_bound() {
        let (conn, mut server) = pair();
        conn.set_bound(true);
        conn.close(&[]).await;
        let env = next_envelope(&mut server).await;
        assert_eq!(env.op_tag, Some(TAG_UNBIND_REQUEST));
        assert!(!conn.is_usable());
        assert!(!conn.is_bound());

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn write_after_close_is_unavailable() {
        let (conn, _server) = pair();
        conn.close(&[]).await;
        let err = conn
            .write_request(&[0x42, 0x00], RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn release_result_abandons_only_incomplete() {
        let (conn, mut server) = pair();
        let done = conn
            .write_request(&[0x42, 0x00], RequestOptions::default())
            .await
            .unwrap();
        next_envelope(&mut server).await;
        server.write_all(&encode_message(1, &[0x65, 0x00])).await.unwrap();
        conn.read_reply(&done).await.unwrap();
        conn.release_result(1, &[]).await;
        assert!(conn.find_request(1).is_none());

        let running = conn
            .write_request(&[0x42, 0x00], RequestOptions::default())
            .await
            .unwrap();
        next_envelope(&mut server).await;
        conn.release_result(running.msg_id(), &[]).await;
        let env = next_envelope(&mut server).await;
        assert_eq!(env.op_tag, Some(TAG_ABANDON_REQUEST));
    }

    #[tokio::test]
    async fn outstanding_counter_saturates() {
        let (conn, _server) = pair();
        assert_eq!(conn.increment_outstanding(), 1);
        assert_eq!(conn.decrement_outstanding(), 0);
        assert_eq!(conn.decrement_outstanding(), 0);
    }
}
