//! dirwire-testkit: shared scenarios for dirwire connections.
//!
//! Provides an in-process [`ScriptedServer`](server::ScriptedServer), stream
//! wrappers for observing teardown, and `run_*` scenario functions that panic
//! with a message on failure.
//!
//! # Usage
//!
//! ```ignore
//! #[tokio::test]
//! async fn single_reply() {
//!     dirwire_testkit::init_test_tracing();
//!     dirwire_testkit::run_single_reply().await;
//! }
//! ```

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dirwire_core::ber::{
    TAG_ABANDON_REQUEST, TAG_SEARCH_RESULT_DONE, TAG_SEARCH_RESULT_ENTRY, TAG_UNBIND_REQUEST,
};
use dirwire_core::{
    BoxedStream, Connection, ConnectionConfig, ConnectionOwner, EnumerationGuard, Frame,
    HexDumpTrace, LdapError, RequestOptions, RequestState, SocketFactory, StreamUpgrader,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

pub mod server;
pub mod stream;

use server::{
    ScriptedServer, ServerFrame, anonymous_bind, bind_response, extended_response,
    request_body, search_done, search_entry,
};
use stream::CountingStream;

/// Error type for test scenarios.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    #[error("setup error: {0}")]
    Setup(String),
    #[error("LDAP error: {0}")]
    Ldap(#[from] LdapError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out: {0}")]
    Timeout(&'static str),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

impl From<tokio::task::JoinError> for TestError {
    fn from(e: tokio::task::JoinError) -> Self {
        TestError::Setup(format!("task failed: {e}"))
    }
}

static TRACING: Once = Once::new();

/// Install a `fmt` subscriber honouring `RUST_LOG`, once per process.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

async fn within<T>(what: &'static str, fut: impl Future<Output = T>) -> Result<T, TestError> {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .map_err(|_| TestError::Timeout(what))
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), TestError> {
    if cond {
        Ok(())
    } else {
        Err(TestError::Assertion(msg()))
    }
}

fn config() -> ConnectionConfig {
    ConnectionConfig::new("directory.test", 389)
}

fn finish(name: &str, result: Result<(), TestError>) {
    if let Err(e) = result {
        panic!("{name} failed: {e}");
    }
}

// ============================================================================
// Owner that records callbacks
// ============================================================================

/// Records every callback a connection makes to its owner.
#[derive(Debug)]
pub struct RecordingOwner {
    closed: AtomicUsize,
    reasons: Mutex<Vec<Option<String>>>,
    unsolicited: mpsc::UnboundedSender<Frame>,
}

impl RecordingOwner {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                closed: AtomicUsize::new(0),
                reasons: Mutex::new(Vec::new()),
                unsolicited: tx,
            }),
            rx,
        )
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn reasons(&self) -> Vec<Option<String>> {
        self.reasons.lock().clone()
    }
}

impl ConnectionOwner for RecordingOwner {
    fn unsolicited(&self, frame: Frame) {
        let _ = self.unsolicited.send(frame);
    }

    fn connection_closed(&self, reason: Option<&str>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.reasons.lock().push(reason.map(str::to_owned));
    }
}

// ============================================================================
// Socket factories and upgraders
// ============================================================================

/// Hands out one prepared client stream.
pub struct PipeFactory {
    stream: Mutex<Option<DuplexStream>>,
    timed: bool,
}

impl PipeFactory {
    pub fn new(stream: DuplexStream, timed: bool) -> Arc<Self> {
        Arc::new(Self {
            stream: Mutex::new(Some(stream)),
            timed,
        })
    }
}

impl SocketFactory for PipeFactory {
    fn connect<'a>(&'a self, _host: &'a str, _port: u16) -> BoxFuture<'a, io::Result<BoxedStream>> {
        let stream = self.stream.lock().take();
        async move {
            stream
                .map(|s| Box::new(s) as BoxedStream)
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "already used"))
        }
        .boxed()
    }

    fn connect_timeout_capable(&self) -> bool {
        self.timed
    }
}

/// Never finishes connecting.
pub struct StallingFactory;

impl SocketFactory for StallingFactory {
    fn connect<'a>(&'a self, _host: &'a str, _port: u16) -> BoxFuture<'a, io::Result<BoxedStream>> {
        futures::future::pending().boxed()
    }
}

/// Upgrader that swaps in `next` instead of wrapping the old stream.
fn swap_upgrader(
    next: DuplexStream,
) -> impl Fn(BoxedStream) -> BoxFuture<'static, io::Result<BoxedStream>> + Send + Sync + 'static {
    let slot = Arc::new(Mutex::new(Some(next)));
    move |_old: BoxedStream| {
        let next = slot.lock().take();
        async move {
            next.map(|s| Box::new(s) as BoxedStream)
                .ok_or_else(|| io::Error::other("upgrade already used"))
        }
        .boxed()
    }
}

fn failing_upgrader() -> impl Fn(BoxedStream) -> BoxFuture<'static, io::Result<BoxedStream>>
+ Send
+ Sync
+ 'static {
    |_old: BoxedStream| async { Err::<BoxedStream, _>(io::Error::other("certificate rejected")) }.boxed()
}

// ============================================================================
// Scenario A: single request, single reply
// ============================================================================

pub async fn run_single_reply() {
    finish("run_single_reply", run_single_reply_inner().await);
}

async fn run_single_reply_inner() -> Result<(), TestError> {
    let (conn, mut server) = ScriptedServer::pair(config());

    let req = conn
        .write_request(&anonymous_bind(), RequestOptions::default())
        .await?;
    ensure(req.msg_id() == 1, || format!("first id was {}", req.msg_id()))?;

    let seen = server.recv().await?;
    ensure(seen.msg_id == 1, || format!("server saw id {}", seen.msg_id))?;
    server.reply(1, &bind_response(0)).await?;

    let frame = within("reply", req.get_reply(None)).await??;
    ensure(frame.msg_id() == 1, || format!("reply id {}", frame.msg_id()))?;
    ensure(frame.result_code() == Ok(0), || {
        format!("result code {:?}", frame.result_code())
    })?;
    ensure(req.is_completed(), || "bind response is final".into())?;

    conn.close(&[]).await;
    Ok(())
}

// ============================================================================
// Scenario B: replies out of order
// ============================================================================

pub async fn run_out_of_order_replies() {
    finish(
        "run_out_of_order_replies",
        run_out_of_order_replies_inner().await,
    );
}

async fn run_out_of_order_replies_inner() -> Result<(), TestError> {
    let (conn, mut server) = ScriptedServer::pair(config());

    let first = conn
        .write_request(&request_body(1), RequestOptions::default())
        .await?;
    let second = conn
        .write_request(&request_body(2), RequestOptions::default())
        .await?;
    server.recv().await?;
    server.recv().await?;

    let first_wait = tokio::spawn({
        let first = first.clone();
        async move { first.get_reply(None).await }
    });
    let second_wait = tokio::spawn({
        let second = second.clone();
        async move { second.get_reply(None).await }
    });

    server.reply(second.msg_id(), &search_done(2)).await?;
    let reply = within("second reply", second_wait).await???;
    ensure(reply.msg_id() == second.msg_id(), || {
        format!("second caller got id {}", reply.msg_id())
    })?;
    ensure(!first_wait.is_finished(), || {
        "first caller woke on the other reply".into()
    })?;

    server.reply(first.msg_id(), &search_done(1)).await?;
    let reply = within("first reply", first_wait).await???;
    ensure(reply.msg_id() == first.msg_id(), || {
        format!("first caller got id {}", reply.msg_id())
    })?;
    ensure(reply.result_code() == Ok(1), || "first reply swapped".into())?;

    conn.close(&[]).await;
    Ok(())
}

// ============================================================================
// Scenario C: read timeout, then abandon
// ============================================================================

pub async fn run_read_timeout_then_abandon() {
    finish(
        "run_read_timeout_then_abandon",
        run_read_timeout_then_abandon_inner().await,
    );
}

async fn run_read_timeout_then_abandon_inner() -> Result<(), TestError> {
    let limit = Duration::from_millis(100);
    let (conn, mut server) = ScriptedServer::pair(config().with_read_timeout(limit));

    let req = conn
        .write_request(&request_body(1), RequestOptions::default())
        .await?;
    server.recv().await?;

    let started = Instant::now();
    let err = match conn.read_reply(&req).await {
        Ok(frame) => {
            return Err(TestError::Assertion(format!(
                "unexpected reply {}",
                frame.msg_id()
            )));
        }
        Err(e) => e,
    };
    let waited = started.elapsed();
    ensure(matches!(err, LdapError::ReadTimeout(d) if d == limit), || {
        format!("expected read timeout, got {err}")
    })?;
    ensure(err.to_string().contains("100 ms"), || err.to_string())?;
    ensure(err.requires_abandon(), || "timeout must require abandon".into())?;
    ensure(
        waited >= Duration::from_millis(90) && waited < Duration::from_secs(2),
        || format!("timed out after {waited:?}"),
    )?;

    conn.abandon_request(&req, &[]).await;
    let abandon = server.recv().await?;
    ensure(abandon.abandon_target() == Some(req.msg_id()), || {
        format!("expected abandon of {}, got {abandon:?}", req.msg_id())
    })?;
    ensure(conn.find_request(req.msg_id()).is_none(), || {
        "abandoned request still registered".into()
    })?;

    conn.close(&[]).await;
    Ok(())
}

// ============================================================================
// Scenario D: server hangs up with a request outstanding
// ============================================================================

pub async fn run_server_hangup_closes_requests() {
    finish(
        "run_server_hangup_closes_requests",
        run_server_hangup_closes_requests_inner().await,
    );
}

async fn run_server_hangup_closes_requests_inner() -> Result<(), TestError> {
    let (client, mut server) = ScriptedServer::pipe();
    let (client, counters) = CountingStream::new(client);
    let conn = Connection::from_stream(config(), client);
    let (owner, _notices) = RecordingOwner::new();
    conn.set_owner(&owner);

    let req = conn
        .write_request(&request_body(1), RequestOptions::default())
        .await?;
    server.recv().await?;
    server.hang_up();

    let err = within("closed sentinel", req.get_reply(None))
        .await?
        .err()
        .ok_or_else(|| TestError::Assertion("reply after hang-up".into()))?;
    ensure(matches!(err, LdapError::Closed), || {
        format!("expected closed, got {err}")
    })?;
    ensure(err.requires_abandon(), || "closed must require abandon".into())?;

    within("teardown", conn.wait_closed()).await?;
    ensure(!conn.is_usable(), || "connection still usable".into())?;
    ensure(owner.closed_count() == 1, || {
        format!("owner notified {} times", owner.closed_count())
    })?;
    ensure(counters.shutdowns() == 1, || {
        format!("stream shut down {} times", counters.shutdowns())
    })?;
    let reasons = owner.reasons();
    ensure(
        reasons == vec![Some("connection closed by peer".to_owned())],
        || format!("owner told {reasons:?}"),
    )?;

    // Later cleanups change nothing.
    conn.cleanup(&[], true).await;
    conn.close(&[]).await;
    ensure(owner.closed_count() == 1 && counters.shutdowns() == 1, || {
        "second cleanup tore down again".into()
    })?;

    let err = conn
        .write_request(&request_body(2), RequestOptions::default())
        .await
        .err()
        .ok_or_else(|| TestError::Assertion("write after teardown succeeded".into()))?;
    ensure(matches!(err, LdapError::ServiceUnavailable { .. }), || {
        format!("expected service unavailable, got {err}")
    })?;
    Ok(())
}

// ============================================================================
// Scenario E: caller cancels before any reply
// ============================================================================

pub async fn run_cancel_sends_no_abandon() {
    finish(
        "run_cancel_sends_no_abandon",
        run_cancel_sends_no_abandon_inner().await,
    );
}

async fn run_cancel_sends_no_abandon_inner() -> Result<(), TestError> {
    let (conn, mut server) = ScriptedServer::pair(config());

    let req = conn
        .write_request(&request_body(1), RequestOptions::default())
        .await?;
    server.recv().await?;

    ensure(conn.remove_request(&req), || "request was not registered".into())?;
    let err = req
        .get_reply(Some(Duration::from_secs(5)))
        .await
        .err()
        .ok_or_else(|| TestError::Assertion("reply after cancel".into()))?;
    ensure(matches!(err, LdapError::Cancelled), || {
        format!("expected cancelled, got {err}")
    })?;
    ensure(!err.requires_abandon(), || "cancel must not abandon".into())?;

    // A reply that still arrives is dropped by the reader.
    server.reply(req.msg_id(), &search_done(0)).await?;

    conn.close(&[]).await;
    let rest = server.drain().await?;
    ensure(
        rest.iter().all(|f| f.op_tag != Some(TAG_ABANDON_REQUEST)),
        || format!("abandon transmitted after cancel: {rest:?}"),
    )?;
    Ok(())
}

// ============================================================================
// Routing and message ids
// ============================================================================

pub async fn run_concurrent_routing(n: usize) {
    finish("run_concurrent_routing", run_concurrent_routing_inner(n).await);
}

async fn run_concurrent_routing_inner(n: usize) -> Result<(), TestError> {
    let (conn, mut server) = ScriptedServer::pair(config());

    let mut callers = Vec::with_capacity(n);
    for i in 0..n {
        let conn = conn.clone();
        callers.push(tokio::spawn(async move {
            let marker = (i % 256) as u8;
            let req = conn
                .write_request(&request_body(marker), RequestOptions::default())
                .await?;
            let frame = req.get_reply(None).await?;
            Ok::<_, TestError>((req.msg_id(), frame))
        }));
    }

    let mut seen = Vec::with_capacity(n);
    for _ in 0..n {
        seen.push(server.recv().await?.msg_id);
    }
    for msg_id in seen.iter().rev() {
        server.reply(*msg_id, &search_done((*msg_id % 256) as u8)).await?;
    }

    for caller in callers {
        let (msg_id, frame) = within("routed reply", caller).await???;
        ensure(frame.msg_id() == msg_id, || {
            format!("request {msg_id} received reply for {}", frame.msg_id())
        })?;
        ensure(frame.result_code() == Ok(msg_id % 256), || {
            format!("request {msg_id} got the wrong payload")
        })?;
    }
    ensure(conn.pending_message_ids().len() == n, || {
        "completed requests stay registered until released".into()
    })?;

    conn.close(&[]).await;
    Ok(())
}

pub async fn run_message_ids_increase() {
    finish(
        "run_message_ids_increase",
        run_message_ids_increase_inner().await,
    );
}

async fn run_message_ids_increase_inner() -> Result<(), TestError> {
    let (conn, mut server) = ScriptedServer::pair(config());

    let mut last = 0;
    for _ in 0..10 {
        let req = conn
            .write_request(&request_body(0), RequestOptions::default())
            .await?;
        ensure(req.msg_id() > last, || {
            format!("id {} after {last}", req.msg_id())
        })?;
        last = req.msg_id();
        conn.remove_request(&req);
    }

    // Abandon consumes an id of its own.
    let req = conn
        .write_request(&request_body(0), RequestOptions::default())
        .await?;
    conn.abandon_request(&req, &[]).await;

    let mut concurrent = Vec::new();
    for _ in 0..32 {
        let conn = conn.clone();
        concurrent.push(tokio::spawn(async move {
            conn.write_request(&request_body(0), RequestOptions::default())
                .await
                .map(|req| req.msg_id())
        }));
    }
    let mut ids = Vec::new();
    for task in concurrent {
        ids.push(task.await??);
    }
    ids.sort_unstable();
    ids.dedup();
    ensure(ids.len() == 32, || "duplicate message ids".into())?;
    ensure(ids[0] > last + 2, || format!("id {} reused", ids[0]))?;

    let mut wire_ids = Vec::new();
    for _ in 0..(10 + 2 + 32) {
        wire_ids.push(server.recv().await?.msg_id);
    }
    let mut unique = wire_ids.clone();
    unique.sort_unstable();
    unique.dedup();
    ensure(unique.len() == wire_ids.len(), || {
        format!("repeated id on the wire: {wire_ids:?}")
    })?;

    conn.close(&[]).await;
    Ok(())
}

// ============================================================================
// Teardown
// ============================================================================

pub async fn run_close_with_outstanding(k: usize) {
    finish(
        "run_close_with_outstanding",
        run_close_with_outstanding_inner(k).await,
    );
}

async fn run_close_with_outstanding_inner(k: usize) -> Result<(), TestError> {
    let (conn, mut server) = ScriptedServer::pair(config());
    let (owner, _notices) = RecordingOwner::new();
    conn.set_owner(&owner);
    conn.set_bound(true);

    let mut waiters = Vec::with_capacity(k);
    let mut ids = Vec::with_capacity(k);
    for i in 0..k {
        let req = conn
            .write_request(&request_body(i as u8), RequestOptions::default())
            .await?;
        ids.push(req.msg_id());
        waiters.push(tokio::spawn(async move {
            let first = req.get_reply(None).await;
            let again = req.get_reply(Some(Duration::from_millis(10))).await;
            (first, again, req.state())
        }));
    }
    for _ in 0..k {
        server.recv().await?;
    }

    conn.close(&[]).await;

    for waiter in waiters {
        let (first, again, state) = within("cancel sentinel", waiter).await??;
        ensure(matches!(first, Err(LdapError::Cancelled)), || {
            format!("expected cancelled, got {first:?}")
        })?;
        ensure(matches!(again, Err(LdapError::Cancelled)), || {
            format!("terminal state not sticky: {again:?}")
        })?;
        ensure(state == RequestState::Cancelled, || format!("state {state:?}"))?;
    }
    ensure(owner.closed_count() == 0, || {
        "owner notified on owner-initiated close".into()
    })?;

    let rest = server.drain().await?;
    let mut targets: Vec<u32> = rest.iter().filter_map(ServerFrame::abandon_target).collect();
    targets.sort_unstable();
    ensure(targets == ids, || {
        format!("abandoned {targets:?}, expected {ids:?}")
    })?;
    ensure(rest.last().and_then(|f| f.op_tag) == Some(TAG_UNBIND_REQUEST), || {
        "unbind must be the last frame".into()
    })?;
    ensure(conn.pending_message_ids().is_empty(), || {
        "registry not empty after close".into()
    })?;
    Ok(())
}

pub async fn run_concurrent_double_cleanup() {
    finish(
        "run_concurrent_double_cleanup",
        run_concurrent_double_cleanup_inner().await,
    );
}

async fn run_concurrent_double_cleanup_inner() -> Result<(), TestError> {
    let (client, mut server) = ScriptedServer::pipe();
    let (client, counters) = CountingStream::new(client);
    let conn = Connection::from_stream(config(), client);
    let (owner, _notices) = RecordingOwner::new();
    conn.set_owner(&owner);

    let mut requests = Vec::new();
    for i in 0..4 {
        requests.push(
            conn.write_request(&request_body(i), RequestOptions::default())
                .await?,
        );
        server.recv().await?;
    }

    let owner_path = tokio::spawn({
        let conn = conn.clone();
        async move { conn.cleanup(&[], false).await }
    });
    let reader_path = tokio::spawn({
        let conn = conn.clone();
        async move { conn.cleanup(&[], true).await }
    });
    within("owner cleanup", owner_path).await??;
    within("reader cleanup", reader_path).await??;
    within("teardown", conn.wait_closed()).await?;

    ensure(counters.shutdowns() == 1, || {
        format!("stream shut down {} times", counters.shutdowns())
    })?;
    ensure(owner.closed_count() <= 1, || {
        format!("owner notified {} times", owner.closed_count())
    })?;
    for req in &requests {
        ensure(req.state() != RequestState::Open, || {
            format!("request {} left open", req.msg_id())
        })?;
    }

    let rest = server.drain().await?;
    let mut targets: Vec<u32> = rest.iter().filter_map(ServerFrame::abandon_target).collect();
    let total = targets.len();
    targets.dedup();
    ensure(targets.len() == total, || "abandon sent twice".into())?;
    Ok(())
}

// ============================================================================
// Pause gate and stream replacement
// ============================================================================

pub async fn run_pause_and_upgrade() {
    finish("run_pause_and_upgrade", run_pause_and_upgrade_inner().await);
}

async fn run_pause_and_upgrade_inner() -> Result<(), TestError> {
    let (conn, mut plain) = ScriptedServer::pair(config());
    let (secure_client, mut secure) = ScriptedServer::pipe();

    let start_tls = conn
        .write_request(
            &request_body(0x77),
            RequestOptions::default().pause_after_receipt(),
        )
        .await?;
    plain.recv().await?;
    plain.reply(start_tls.msg_id(), &extended_response(0)).await?;
    // Must stay unread: the reader is parked.
    plain.reply(start_tls.msg_id(), &search_done(1)).await?;

    let frame = within("start tls reply", start_tls.get_reply(None)).await??;
    ensure(frame.result_code() == Ok(0), || "start tls failed".into())?;
    ensure(conn.pause_gate().is_paused(), || "reader not paused".into())?;

    let pending = start_tls.get_reply(Some(Duration::from_millis(50))).await;
    ensure(matches!(pending, Err(LdapError::ReadTimeout(_))), || {
        format!("reader consumed bytes while paused: {pending:?}")
    })?;

    conn.upgrade_streams(&swap_upgrader(secure_client)).await?;
    ensure(conn.is_tls_upgraded(), || "upgrade flag not set".into())?;
    conn.remove_request(&start_tls);

    let bind = conn
        .write_request(&anonymous_bind(), RequestOptions::default())
        .await?;
    ensure(!conn.pause_gate().is_paused(), || "write did not unpause".into())?;
    let seen = secure.recv().await?;
    ensure(seen.msg_id == bind.msg_id(), || {
        format!("secure server saw id {}", seen.msg_id)
    })?;
    secure.reply(bind.msg_id(), &bind_response(0)).await?;
    let reply = within("bind over upgraded stream", bind.get_reply(None)).await??;
    ensure(reply.msg_id() == bind.msg_id(), || "wrong reply".into())?;

    conn.close(&[]).await;
    Ok(())
}

pub async fn run_replace_streams() {
    finish("run_replace_streams", run_replace_streams_inner().await);
}

async fn run_replace_streams_inner() -> Result<(), TestError> {
    let (conn, mut old) = ScriptedServer::pair(config());
    let (new_client, mut new) = ScriptedServer::pipe();

    let req = conn
        .write_request(
            &request_body(1),
            RequestOptions::default().pause_after_receipt(),
        )
        .await?;
    old.recv().await?;
    old.reply(req.msg_id(), &extended_response(0)).await?;
    within("reply", req.get_reply(None)).await??;

    conn.replace_streams(Box::new(new_client)).await?;
    ensure(!conn.is_tls_upgraded(), || "plain swap is not an upgrade".into())?;
    old.hang_up();

    let next = conn
        .write_request(&request_body(2), RequestOptions::default())
        .await?;
    new.recv().await?;
    new.reply(next.msg_id(), &search_done(0)).await?;
    within("reply on new stream", next.get_reply(None)).await??;
    ensure(conn.is_usable(), || {
        "old stream closing tore down the new one".into()
    })?;

    conn.close(&[]).await;
    Ok(())
}

pub async fn run_replace_streams_mid_read() {
    finish(
        "run_replace_streams_mid_read",
        run_replace_streams_mid_read_inner().await,
    );
}

async fn run_replace_streams_mid_read_inner() -> Result<(), TestError> {
    let (conn, mut old) = ScriptedServer::pair(config());
    let (owner, _notices) = RecordingOwner::new();
    conn.set_owner(&owner);
    let (new_client, mut new) = ScriptedServer::pipe();

    let req = conn
        .write_request(&request_body(1), RequestOptions::default())
        .await?;
    old.recv().await?;

    // Leave the reader blocked inside a frame on the old stream.
    let partial = dirwire_core::ber::encode_message(req.msg_id(), &search_done(0));
    old.send_raw(&partial[..3]).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    within("swap during read", conn.replace_streams(Box::new(new_client))).await??;
    old.hang_up();

    new.reply(req.msg_id(), &search_done(0)).await?;
    let frame = within("reply on new stream", req.get_reply(None)).await??;
    ensure(frame.result_code() == Ok(0), || {
        format!("result code {:?}", frame.result_code())
    })?;
    ensure(conn.is_usable() && owner.closed_count() == 0, || {
        "swap during a read tore the connection down".into()
    })?;

    conn.close(&[]).await;
    Ok(())
}

pub async fn run_failed_upgrade_tears_down() {
    finish(
        "run_failed_upgrade_tears_down",
        run_failed_upgrade_tears_down_inner().await,
    );
}

async fn run_failed_upgrade_tears_down_inner() -> Result<(), TestError> {
    let (conn, mut server) = ScriptedServer::pair(config());
    let (owner, _notices) = RecordingOwner::new();
    conn.set_owner(&owner);

    let start_tls = conn
        .write_request(
            &request_body(0x77),
            RequestOptions::default().pause_after_receipt(),
        )
        .await?;
    let other = conn
        .write_request(&request_body(2), RequestOptions::default())
        .await?;
    server.recv().await?;
    server.recv().await?;
    server.reply(start_tls.msg_id(), &extended_response(0)).await?;
    within("start tls reply", start_tls.get_reply(None)).await??;

    let err = conn
        .upgrade_streams(&failing_upgrader())
        .await
        .err()
        .ok_or_else(|| TestError::Assertion("failing upgrade succeeded".into()))?;
    ensure(matches!(err, LdapError::Handshake(_)), || {
        format!("expected handshake error, got {err}")
    })?;
    ensure(!conn.is_usable() && !conn.is_tls_upgraded(), || {
        "connection survived failed upgrade".into()
    })?;
    ensure(owner.closed_count() == 1, || "owner not notified".into())?;
    let reason = conn.closure_reason().unwrap_or_default();
    ensure(reason.contains("certificate rejected"), || {
        format!("closure reason {reason:?}")
    })?;

    let err = other
        .get_reply(None)
        .await
        .err()
        .ok_or_else(|| TestError::Assertion("reply after failed upgrade".into()))?;
    ensure(matches!(err, LdapError::Closed), || {
        format!("expected closed, got {err}")
    })?;
    Ok(())
}

// ============================================================================
// Reader edge cases
// ============================================================================

pub async fn run_unsolicited_notification() {
    finish(
        "run_unsolicited_notification",
        run_unsolicited_notification_inner().await,
    );
}

async fn run_unsolicited_notification_inner() -> Result<(), TestError> {
    let (conn, mut server) = ScriptedServer::pair(config());
    let (owner, mut notices) = RecordingOwner::new();
    conn.set_owner(&owner);

    let req = conn
        .write_request(&request_body(1), RequestOptions::default())
        .await?;
    server.recv().await?;

    // Notice of disconnection carries message id 0.
    server.reply(0, &extended_response(52)).await?;
    let notice = within("notification", notices.recv())
        .await?
        .ok_or_else(|| TestError::Assertion("owner channel closed".into()))?;
    ensure(notice.is_unsolicited(), || "notice has a message id".into())?;
    ensure(notice.result_code() == Ok(52), || "wrong notice".into())?;

    let pending = req.get_reply(Some(Duration::from_millis(20))).await;
    ensure(matches!(pending, Err(LdapError::ReadTimeout(_))), || {
        format!("notification reached a request: {pending:?}")
    })?;

    conn.close(&[]).await;
    Ok(())
}

pub async fn run_malformed_frame_skipped() {
    finish(
        "run_malformed_frame_skipped",
        run_malformed_frame_skipped_inner().await,
    );
}

async fn run_malformed_frame_skipped_inner() -> Result<(), TestError> {
    let (conn, mut server) = ScriptedServer::pair(config());

    let req = conn
        .write_request(&request_body(1), RequestOptions::default())
        .await?;
    server.recv().await?;

    // Stray bytes, then a SEQUENCE whose first element is not an INTEGER.
    server.send_raw(&[0x00, 0xff]).await?;
    server.send_raw(&[0x30, 0x03, 0x04, 0x01, 0x00]).await?;
    // Reply for an id nobody is waiting on.
    server.reply(99, &search_done(0)).await?;
    server.reply(req.msg_id(), &search_done(0)).await?;

    let frame = within("reply after garbage", req.get_reply(None)).await??;
    ensure(frame.msg_id() == req.msg_id(), || "wrong reply".into())?;
    ensure(conn.is_usable(), || "malformed frame tore down".into())?;

    conn.close(&[]).await;
    Ok(())
}

pub async fn run_oversized_frame_fails_connection() {
    finish(
        "run_oversized_frame_fails_connection",
        run_oversized_frame_fails_connection_inner().await,
    );
}

async fn run_oversized_frame_fails_connection_inner() -> Result<(), TestError> {
    let (conn, mut server) = ScriptedServer::pair(config().with_max_frame_len(64));

    let req = conn
        .write_request(&request_body(1), RequestOptions::default())
        .await?;
    server.recv().await?;
    server.send_raw(&[0x30, 0x82, 0x03, 0xe8]).await?;

    let result = within("closed sentinel", req.get_reply(None)).await?;
    ensure(matches!(result, Err(LdapError::Closed)), || {
        format!("expected closed, got {result:?}")
    })?;
    within("teardown", conn.wait_closed()).await?;
    ensure(conn.closure_reason().is_some(), || "no closure reason".into())?;
    Ok(())
}

pub async fn run_bounded_reply_queue() {
    finish("run_bounded_reply_queue", run_bounded_reply_queue_inner().await);
}

async fn run_bounded_reply_queue_inner() -> Result<(), TestError> {
    let (conn, mut server) = ScriptedServer::pair(config());

    let search = conn
        .write_request(
            &request_body(1),
            RequestOptions::default().with_reply_capacity(1),
        )
        .await?;
    server.recv().await?;
    for dn in ["cn=a", "cn=b", "cn=c"] {
        server.reply(search.msg_id(), &search_entry(dn)).await?;
    }
    server.reply(search.msg_id(), &search_done(0)).await?;

    for _ in 0..3 {
        let entry = within("entry", search.get_reply(None)).await??;
        ensure(entry.op_tag() == Some(TAG_SEARCH_RESULT_ENTRY), || {
            format!("expected entry, got {:?}", entry.op_tag())
        })?;
    }
    let done = within("done", search.get_reply(None)).await??;
    ensure(done.op_tag() == Some(TAG_SEARCH_RESULT_DONE), || {
        "expected search done".into()
    })?;
    ensure(search.is_completed(), || "done not seen as final".into())?;

    conn.close(&[]).await;
    Ok(())
}

// ============================================================================
// Enumeration guard
// ============================================================================

pub async fn run_enumeration_guard_release() {
    finish(
        "run_enumeration_guard_release",
        run_enumeration_guard_release_inner().await,
    );
}

async fn run_enumeration_guard_release_inner() -> Result<(), TestError> {
    let (conn, mut server) = ScriptedServer::pair(config());

    // Dropped mid-search: the rest of the search is abandoned.
    let running = conn
        .write_request(&request_body(1), RequestOptions::default())
        .await?;
    server.recv().await?;
    server.reply(running.msg_id(), &search_entry("cn=a")).await?;
    within("entry", running.get_reply(None)).await??;
    {
        let mut guard = EnumerationGuard::with_default_hook(conn.clone());
        guard.set_last_message_id(running.msg_id());
        ensure(conn.outstanding_enumerations() == 1, || "count not raised".into())?;
    }
    let abandon = server.recv().await?;
    ensure(abandon.abandon_target() == Some(running.msg_id()), || {
        format!("expected abandon of {}, got {abandon:?}", running.msg_id())
    })?;
    ensure(conn.outstanding_enumerations() == 0, || "count not lowered".into())?;

    // Closed after the final result: only unlinked.
    let finished = conn
        .write_request(&request_body(2), RequestOptions::default())
        .await?;
    server.recv().await?;
    server.reply(finished.msg_id(), &search_done(0)).await?;
    within("done", finished.get_reply(None)).await??;
    let mut guard = EnumerationGuard::with_default_hook(conn.clone());
    guard.set_last_message_id(finished.msg_id());
    guard.close().await;
    ensure(conn.find_request(finished.msg_id()).is_none(), || {
        "completed result still registered".into()
    })?;
    ensure(conn.outstanding_enumerations() == 0, || "count not lowered".into())?;

    conn.close(&[]).await;
    let rest = server.drain().await?;
    ensure(rest.iter().all(|f| f.abandon_target().is_none()), || {
        format!("completed result abandoned: {rest:?}")
    })?;
    Ok(())
}

// ============================================================================
// Construction
// ============================================================================

pub async fn run_open_through_factory() {
    finish("run_open_through_factory", run_open_through_factory_inner().await);
}

async fn run_open_through_factory_inner() -> Result<(), TestError> {
    // Stalled dial hits the connect timeout.
    let limit = Duration::from_millis(50);
    let err = Connection::open(
        config().with_connect_timeout(limit),
        Arc::new(StallingFactory),
        None,
    )
    .await
    .err()
    .ok_or_else(|| TestError::Assertion("stalled connect succeeded".into()))?;
    ensure(matches!(err, LdapError::ConnectTimeout(d) if d == limit), || {
        format!("expected connect timeout, got {err}")
    })?;

    // A factory that cannot time its connects is dialed without a bound.
    let (client, mut server) = ScriptedServer::pipe();
    let conn = Connection::open(
        config().with_connect_timeout(limit),
        PipeFactory::new(client, false),
        None,
    )
    .await?;
    ensure(!conn.is_tls_upgraded(), || "plain connection upgraded".into())?;
    let req = conn
        .write_request(&anonymous_bind(), RequestOptions::default())
        .await?;
    server.recv().await?;
    server.reply(req.msg_id(), &bind_response(0)).await?;
    within("bind", req.get_reply(None)).await??;
    conn.close(&[]).await;

    // Secure transport from the start.
    let (raw, _raw_server) = ScriptedServer::pipe();
    let (secure_client, mut secure) = ScriptedServer::pipe();
    let conn = Connection::open(
        config(),
        PipeFactory::new(raw, true),
        Some(Arc::new(swap_upgrader(secure_client)) as Arc<dyn StreamUpgrader>),
    )
    .await?;
    ensure(conn.is_tls_upgraded(), || "upgrade flag not set".into())?;
    let req = conn
        .write_request(&anonymous_bind(), RequestOptions::default())
        .await?;
    ensure(secure.recv().await?.msg_id == req.msg_id(), || {
        "request not on the secure stream".into()
    })?;
    conn.close(&[]).await;

    // A failed handshake surfaces as such.
    let (raw, _raw_server) = ScriptedServer::pipe();
    let err = Connection::open(
        config(),
        PipeFactory::new(raw, true),
        Some(Arc::new(failing_upgrader()) as Arc<dyn StreamUpgrader>),
    )
    .await
    .err()
    .ok_or_else(|| TestError::Assertion("failed handshake succeeded".into()))?;
    ensure(matches!(err, LdapError::Handshake(_)), || {
        format!("expected handshake error, got {err}")
    })?;
    Ok(())
}

// ============================================================================
// Wire trace
// ============================================================================

/// `Write` sink shared between a trace and the test reading it back.
#[derive(Debug, Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub async fn run_wire_trace() {
    finish("run_wire_trace", run_wire_trace_inner().await);
}

async fn run_wire_trace_inner() -> Result<(), TestError> {
    let buf = SharedBuf::default();
    let (conn, mut server) =
        ScriptedServer::pair(config().with_trace(Arc::new(HexDumpTrace::new(buf.clone()))));

    let req = conn
        .write_request(&anonymous_bind(), RequestOptions::default())
        .await?;
    server.recv().await?;
    server.reply(req.msg_id(), &bind_response(0)).await?;
    within("reply", req.get_reply(None)).await??;

    let dump = buf.contents();
    ensure(dump.contains("Write buffer [14 bytes]"), || dump.clone())?;
    ensure(dump.contains("0000: 30 0c 02 01 01 60 07"), || dump.clone())?;
    ensure(dump.contains("Read buffer ["), || dump.clone())?;

    conn.close(&[]).await;
    Ok(())
}
