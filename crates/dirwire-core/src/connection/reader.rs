//! The connection's single reader task: frames bytes off the stream and
//! routes each frame to its request.

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;

use super::Connection;
use crate::framing::read_frame;
use crate::{Direction, Frame};

enum ReadOutcome {
    Frame(Bytes),
    Eof,
    Failed(io::Error),
    /// Teardown asked the reader to stop.
    Stopped,
}

impl Connection {
    pub(super) async fn run_reader(self: Arc<Self>) {
        tracing::debug!(endpoint = %self.config.endpoint(), "reader started");
        let reason = loop {
            match self.next_frame().await {
                ReadOutcome::Frame(bytes) => self.dispatch(bytes).await,
                ReadOutcome::Eof => {
                    tracing::debug!("reader reached end of stream");
                    break Some("connection closed by peer".to_owned());
                }
                ReadOutcome::Failed(e) => {
                    tracing::error!(error = %e, "reader failed");
                    break Some(e.to_string());
                }
                ReadOutcome::Stopped => break None,
            }
        };
        self.teardown(&[], true, reason).await;
        tracing::debug!("reader exited");
    }

    /// Read one frame from the current stream.
    ///
    /// A stream swap interrupts a read in flight; reading resumes on the new
    /// stream once the swap is done. End of stream or an error that races
    /// with a swap is retried once on the new stream.
    async fn next_frame(&self) -> ReadOutcome {
        let mut shutdown = self.shutdown.subscribe();
        let mut swaps = self.swaps.subscribe();
        let mut retried = false;
        loop {
            if *shutdown.borrow_and_update() {
                return ReadOutcome::Stopped;
            }
            // Pending swaps take the reader lock first.
            tokio::select! {
                _ = swaps.wait_for(|n| *n == 0) => {}
                _ = shutdown.wait_for(|stop| *stop) => return ReadOutcome::Stopped,
            }
            let generation = self.generation.load(Ordering::Acquire);
            let result = {
                let mut reader = self.reader.lock().await;
                let Some(reader) = reader.as_mut() else {
                    return ReadOutcome::Stopped;
                };
                tokio::select! {
                    res = read_frame(reader, self.config.max_frame_len) => Some(res),
                    _ = shutdown.wait_for(|stop| *stop) => return ReadOutcome::Stopped,
                    _ = swaps.wait_for(|n| *n > 0) => None,
                }
            };
            let error = match result {
                None => {
                    tracing::debug!("stream swap requested during read, resuming on new stream");
                    continue;
                }
                Some(Ok(Some(bytes))) => return ReadOutcome::Frame(bytes),
                Some(Ok(None)) => None,
                Some(Err(e)) => Some(e),
            };
            let swapped = *swaps.borrow() > 0
                || self.generation.load(Ordering::Acquire) != generation;
            if swapped && !retried {
                retried = true;
                tracing::debug!("stream replaced during read, retrying");
                continue;
            }
            return match error {
                Some(e) => ReadOutcome::Failed(e),
                None => ReadOutcome::Eof,
            };
        }
    }

    async fn dispatch(&self, bytes: Bytes) {
        if let Some(trace) = &self.config.trace {
            trace.record(Direction::Received, &bytes);
        }
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed frame");
                return;
            }
        };
        let msg_id = frame.msg_id();
        tracing::trace!(msg_id, payload_len = frame.len(), "frame received");

        if frame.is_unsolicited() {
            match self.owner() {
                Some(owner) => owner.unsolicited(frame),
                None => tracing::debug!("unsolicited notification dropped, no owner"),
            }
            return;
        }

        let Some(request) = self.find_request(msg_id) else {
            tracing::trace!(msg_id, "no pending request, frame dropped");
            return;
        };

        // Armed before delivery: the caller may react to this frame (and
        // unpause) before `deliver` returns.
        let pause = request.pauses_after_receipt();
        if pause {
            self.gate.arm();
        }
        if request.deliver(frame).await {
            let mut shutdown = self.shutdown.subscribe();
            tokio::select! {
                () = self.gate.wait() => {}
                _ = shutdown.wait_for(|stop| *stop) => {}
            }
        } else if pause {
            self.gate.unpause();
        }
    }
}
