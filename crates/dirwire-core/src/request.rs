//! Per-operation reply channel.
//!
//! A [`Request`] is shared between the reader task (producer) and the caller
//! that issued the operation (consumer). Terminal transitions are one-way and
//! the first one wins: only the winner pushes its sentinel, so a consumer
//! observes exactly one of "cancelled" or "closed".

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, watch};

use crate::{Frame, LdapError};

/// Per-request options chosen when the request is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Park the reader right after this request's first reply is delivered,
    /// so the caller can replace the connection's streams (StartTLS).
    pub pause_after_receipt: bool,
    /// Reply queue capacity; `None` for unbounded.
    pub reply_capacity: Option<usize>,
}

impl RequestOptions {
    pub fn pause_after_receipt(mut self) -> Self {
        self.pause_after_receipt = true;
        self
    }

    pub fn with_reply_capacity(mut self, capacity: usize) -> Self {
        self.reply_capacity = Some(capacity.max(1));
        self
    }
}

/// Terminal state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Open,
    /// Handled locally; the caller must not abandon it.
    Cancelled,
    /// Cut off by the connection; the caller must abandon it.
    Closed,
}

#[derive(Debug)]
enum Reply {
    Frame(Frame),
    Cancelled,
    Closed,
}

#[derive(Debug)]
enum ReplyTx {
    Bounded(mpsc::Sender<Reply>),
    Unbounded(mpsc::UnboundedSender<Reply>),
}

#[derive(Debug)]
enum ReplyRx {
    Bounded(mpsc::Receiver<Reply>),
    Unbounded(mpsc::UnboundedReceiver<Reply>),
}

impl ReplyRx {
    fn try_recv(&mut self) -> Option<Reply> {
        match self {
            Self::Bounded(rx) => rx.try_recv().ok(),
            Self::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    async fn recv(&mut self) -> Option<Reply> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// An outstanding operation on a connection.
#[derive(Debug)]
pub struct Request {
    msg_id: u32,
    pause_after_receipt: bool,
    tx: ReplyTx,
    rx: AsyncMutex<ReplyRx>,
    state: watch::Sender<RequestState>,
    completed: AtomicBool,
}

impl Request {
    pub fn new(msg_id: u32, options: RequestOptions) -> Self {
        let (tx, rx) = match options.reply_capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (ReplyTx::Bounded(tx), ReplyRx::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (ReplyTx::Unbounded(tx), ReplyRx::Unbounded(rx))
            }
        };
        Self {
            msg_id,
            pause_after_receipt: options.pause_after_receipt,
            tx,
            rx: AsyncMutex::new(rx),
            state: watch::Sender::new(RequestState::Open),
            completed: AtomicBool::new(false),
        }
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub fn pauses_after_receipt(&self) -> bool {
        self.pause_after_receipt
    }

    pub fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == RequestState::Cancelled
    }

    pub fn is_closed(&self) -> bool {
        self.state() == RequestState::Closed
    }

    /// A final reply has been seen. Advisory only: later frames are still
    /// queued.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Mark cancelled and wake the consumer. Idempotent.
    pub fn cancel(&self) {
        if self.terminate(RequestState::Cancelled) {
            self.push_sentinel(Reply::Cancelled);
        }
    }

    /// Mark closed and wake the consumer. Idempotent.
    pub fn close(&self) {
        if self.terminate(RequestState::Closed) {
            self.push_sentinel(Reply::Closed);
        }
    }

    fn terminate(&self, to: RequestState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == RequestState::Open {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn push_sentinel(&self, sentinel: Reply) {
        // A full bounded queue drops the sentinel; the consumer then sees the
        // terminal state once it has drained the queue.
        match &self.tx {
            ReplyTx::Bounded(tx) => {
                let _ = tx.try_send(sentinel);
            }
            ReplyTx::Unbounded(tx) => {
                let _ = tx.send(sentinel);
            }
        }
    }

    /// Producer side, called by the reader task only.
    ///
    /// Returns whether the reader must pause after this delivery. Frames for
    /// a cancelled or closed request are dropped.
    pub(crate) async fn deliver(&self, frame: Frame) -> bool {
        if self.state() != RequestState::Open {
            tracing::trace!(msg_id = self.msg_id, "deliver: request already terminated");
            return false;
        }
        if frame.is_final() {
            self.completed.store(true, Ordering::Release);
        }
        match &self.tx {
            ReplyTx::Unbounded(tx) => {
                let _ = tx.send(Reply::Frame(frame));
            }
            ReplyTx::Bounded(tx) => {
                let mut state = self.state.subscribe();
                tokio::select! {
                    // The receiver lives in `self`, so the send cannot fail.
                    _ = tx.send(Reply::Frame(frame)) => {}
                    _ = state.wait_for(|s| *s != RequestState::Open) => {
                        tracing::debug!(
                            msg_id = self.msg_id,
                            "deliver: request terminated while waiting for queue space"
                        );
                        return false;
                    }
                }
            }
        }
        self.pause_after_receipt
    }

    /// Consumer side: wait for the next reply.
    ///
    /// `timeout` of `None` waits indefinitely. The timeout also covers
    /// waiting behind another consumer of the same request. An empty queue
    /// on a terminated request fails immediately without waiting.
    pub async fn get_reply(&self, timeout: Option<Duration>) -> Result<Frame, LdapError> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.next_reply())
                .await
                .map_err(|_| LdapError::ReadTimeout(limit))?,
            None => self.next_reply().await,
        }
    }

    async fn next_reply(&self) -> Result<Frame, LdapError> {
        let mut rx = self.rx.lock().await;
        let reply = match rx.try_recv() {
            Some(reply) => reply,
            None => {
                match self.state() {
                    RequestState::Cancelled => return Err(LdapError::Cancelled),
                    RequestState::Closed => return Err(LdapError::Closed),
                    RequestState::Open => {}
                }
                rx.recv().await.unwrap_or(Reply::Closed)
            }
        };
        match reply {
            Reply::Frame(frame) => Ok(frame),
            Reply::Cancelled => Err(LdapError::Cancelled),
            Reply::Closed => Err(LdapError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ber::{TAG_SEARCH_RESULT_DONE, TAG_SEARCH_RESULT_ENTRY, encode_message};

    fn reply(msg_id: u32, tag: u8) -> Frame {
        Frame::decode(encode_message(msg_id, &[tag, 0x00])).unwrap()
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let req = Request::new(1, RequestOptions::default());
        assert!(!req.deliver(reply(1, TAG_SEARCH_RESULT_ENTRY)).await);
        assert!(!req.is_completed());
        assert!(!req.deliver(reply(1, TAG_SEARCH_RESULT_DONE)).await);
        assert!(req.is_completed());

        let first = req.get_reply(None).await.unwrap();
        assert_eq!(first.op_tag(), Some(TAG_SEARCH_RESULT_ENTRY));
        let second = req.get_reply(None).await.unwrap();
        assert_eq!(second.op_tag(), Some(TAG_SEARCH_RESULT_DONE));
    }

    #[tokio::test]
    async fn late_frames_are_still_queued() {
        let req = Request::new(1, RequestOptions::default());
        req.deliver(reply(1, TAG_SEARCH_RESULT_DONE)).await;
        req.deliver(reply(1, TAG_SEARCH_RESULT_ENTRY)).await;
        req.get_reply(None).await.unwrap();
        let late = req.get_reply(None).await.unwrap();
        assert_eq!(late.op_tag(), Some(TAG_SEARCH_RESULT_ENTRY));
    }

    #[tokio::test]
    async fn reports_pause_after_receipt() {
        let req = Request::new(1, RequestOptions::default().pause_after_receipt());
        assert!(req.deliver(reply(1, 0x78)).await);
    }

    #[tokio::test]
    async fn timeout_is_distinguishable() {
        let req = Request::new(1, RequestOptions::default());
        let err = req
            .get_reply(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::ReadTimeout(d) if d == Duration::from_millis(20)));
        assert_eq!(req.state(), RequestState::Open);
    }

    #[tokio::test]
    async fn timeout_covers_waiting_behind_another_consumer() {
        let req = Arc::new(Request::new(1, RequestOptions::default()));
        let first = tokio::spawn({
            let req = req.clone();
            async move { req.get_reply(None).await }
        });
        tokio::task::yield_now().await;

        let started = std::time::Instant::now();
        let err = req
            .get_reply(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::ReadTimeout(d) if d == Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(1));

        req.deliver(reply(1, TAG_SEARCH_RESULT_DONE)).await;
        let frame = first.await.unwrap().unwrap();
        assert_eq!(frame.op_tag(), Some(TAG_SEARCH_RESULT_DONE));
    }

    #[tokio::test]
    async fn cancel_wakes_blocked_consumer() {
        let req = Arc::new(Request::new(1, RequestOptions::default()));
        let waiter = tokio::spawn({
            let req = req.clone();
            async move { req.get_reply(None).await }
        });
        tokio::task::yield_now().await;
        req.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(LdapError::Cancelled)));
    }

    #[tokio::test]
    async fn first_terminal_transition_wins() {
        let req = Request::new(1, RequestOptions::default());
        req.close();
        req.cancel();
        req.close();
        assert!(req.is_closed());
        assert!(matches!(req.get_reply(None).await, Err(LdapError::Closed)));
        // Queue is empty now; the state answers without waiting.
        assert!(matches!(
            req.get_reply(Some(Duration::from_secs(60))).await,
            Err(LdapError::Closed)
        ));
    }

    #[tokio::test]
    async fn terminated_requests_refuse_frames() {
        let req = Request::new(1, RequestOptions::default().pause_after_receipt());
        req.cancel();
        assert!(!req.deliver(reply(1, TAG_SEARCH_RESULT_DONE)).await);
        assert!(matches!(req.get_reply(None).await, Err(LdapError::Cancelled)));
        assert!(matches!(req.get_reply(None).await, Err(LdapError::Cancelled)));
    }

    #[tokio::test]
    async fn full_bounded_queue_still_terminates() {
        let req = Arc::new(Request::new(
            1,
            RequestOptions::default().with_reply_capacity(1),
        ));
        req.deliver(reply(1, TAG_SEARCH_RESULT_ENTRY)).await;

        // Second delivery blocks on the full queue until the request closes.
        let blocked = tokio::spawn({
            let req = req.clone();
            async move { req.deliver(reply(1, TAG_SEARCH_RESULT_ENTRY)).await }
        });
        tokio::task::yield_now().await;
        req.close();
        assert!(!blocked.await.unwrap());

        assert!(req.get_reply(None).await.is_ok());
        assert!(matches!(req.get_reply(None).await, Err(LdapError::Closed)));
    }
}
