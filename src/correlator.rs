//! Request correlator.
//!
//! Owns the table of in-flight commando requests for one session. Every
//! request gets a session-unique id; reply chunks are reassembled per id and
//! the final chunk completes the request's slot. The table is only touched
//! from the loop thread.
//!
//! # Example
//!
//! ```
//! use lnlink::correlator::{Correlator, Delivery};
//! use lnlink::protocol::{msg_type, Frame};
//! use serde_json::json;
//!
//! let mut correlator = Correlator::new("rune", 1 << 20);
//! let (tx, mut rx) = tokio::sync::oneshot::channel();
//! let id = correlator.submit(1, "getinfo", json!([]), None, tx).unwrap();
//!
//! let reply = Frame::new(msg_type::COMMANDO_REPLY_TERM, Some(id), r#"{"result":{}}"#.into());
//! assert_eq!(correlator.on_frame(&reply).unwrap(), Delivery::Completed(id));
//! assert_eq!(rx.try_recv().unwrap(), Ok(json!({})));
//! ```

use std::collections::HashMap;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{CallError, ProtocolError};
use crate::protocol::{parse_reply, CommandoRequest, Frame};

/// Where a request's outcome is delivered. Sending consumes it.
pub type Completion = oneshot::Sender<Result<Value, CallError>>;

/// One in-flight request.
#[derive(Debug)]
pub struct PendingRequest {
    /// Caller-side handle used for cancellation.
    ticket: u64,
    /// Encoded frames, kept until written.
    encoded: Bytes,
    /// Whether the frames were handed to the outbound buffer.
    sent: bool,
    deadline: Option<Instant>,
    /// Reply chunks received so far.
    reply: BytesMut,
    slot: Completion,
}

impl PendingRequest {
    fn complete(self, id: u64, result: Result<Value, CallError>) {
        if self.slot.send(result).is_err() {
            tracing::debug!("Caller for request {} went away before completion", id);
        }
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// What [`Correlator::on_frame`] did with a reply chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Chunk appended; more are expected.
    Partial(u64),
    /// Final chunk; the request's slot was completed.
    Completed(u64),
    /// No pending request has this id. The chunk was dropped.
    Unmatched(u64),
}

/// Tracks pending requests and matches replies to them.
#[derive(Debug)]
pub struct Correlator {
    pending: HashMap<u64, PendingRequest>,
    /// Next id to try. 0 is never handed out.
    next_id: u64,
    rune: String,
    max_reply_size: usize,
}

impl Correlator {
    /// Create an empty correlator that signs requests with `rune`.
    pub fn new(rune: impl Into<String>, max_reply_size: usize) -> Self {
        Self {
            pending: HashMap::new(),
            next_id: 1,
            rune: rune.into(),
            max_reply_size,
        }
    }

    /// Register a request and encode it.
    ///
    /// Returns the assigned request id. The frames stay queued inside the
    /// correlator until [`take_unsent`](Self::take_unsent) hands them out.
    ///
    /// # Errors
    ///
    /// If the request cannot be encoded the slot is completed with the
    /// error, nothing is tracked, and the same error is returned.
    pub fn submit(
        &mut self,
        ticket: u64,
        method: &str,
        params: Value,
        deadline: Option<Instant>,
        slot: Completion,
    ) -> Result<u64, CallError> {
        let id = self.allocate_id();
        let encoded = match CommandoRequest::new(id, method, params, &self.rune).encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                let _ = slot.send(Err(e.clone()));
                return Err(e);
            }
        };

        tracing::debug!("Submitted {} as request {} ({} bytes)", method, id, encoded.len());
        self.pending.insert(
            id,
            PendingRequest {
                ticket,
                encoded,
                sent: false,
                deadline,
                reply: BytesMut::new(),
                slot,
            },
        );
        Ok(id)
    }

    /// Pick the next id that is non-zero and not pending.
    fn allocate_id(&mut self) -> u64 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Mark request `id` as written and return its frames.
    ///
    /// `None` if the request is gone (timed out or cancelled while queued)
    /// or was already taken.
    pub fn take_unsent(&mut self, id: u64) -> Option<Bytes> {
        let request = self.pending.get_mut(&id)?;
        if request.sent {
            return None;
        }
        request.sent = true;
        Some(std::mem::take(&mut request.encoded))
    }

    /// Feed one commando reply chunk.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ReplyTooLarge`] when the reassembled reply would
    /// exceed the configured maximum, and [`ProtocolError::Malformed`] for a
    /// frame that is not a reply chunk. Both end the session.
    pub fn on_frame(&mut self, frame: &Frame) -> Result<Delivery, ProtocolError> {
        let id = match (frame.is_reply(), frame.request_id) {
            (true, Some(id)) => id,
            _ => {
                return Err(ProtocolError::Malformed(format!(
                    "type {:#06x} is not a commando reply",
                    frame.msg_type
                )))
            }
        };

        let Some(request) = self.pending.get_mut(&id) else {
            tracing::warn!("Unmatched reply for request {}, dropping", id);
            return Ok(Delivery::Unmatched(id));
        };

        if request.reply.len() + frame.payload().len() > self.max_reply_size {
            return Err(ProtocolError::ReplyTooLarge {
                id,
                max: self.max_reply_size,
            });
        }
        request.reply.extend_from_slice(frame.payload());

        if !frame.is_terminal() {
            return Ok(Delivery::Partial(id));
        }

        let Some(request) = self.pending.remove(&id) else {
            return Ok(Delivery::Unmatched(id));
        };
        let result = parse_reply(&request.reply);
        tracing::debug!("Request {} completed (ok={})", id, result.is_ok());
        request.complete(id, result);
        Ok(Delivery::Completed(id))
    }

    /// Fail every request whose deadline is at or before `now`.
    ///
    /// Returns the ids that timed out.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<u64> {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, r)| r.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(request) = self.pending.remove(id) {
                tracing::debug!("Request {} timed out", id);
                request.complete(*id, Err(CallError::Timeout));
            }
        }
        expired
    }

    /// Cancel request `id` locally. Returns whether it was pending.
    pub fn cancel(&mut self, id: u64) -> bool {
        match self.pending.remove(&id) {
            Some(request) => {
                tracing::debug!("Request {} cancelled", id);
                request.complete(id, Err(CallError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Cancel the request submitted under `ticket`, returning its id.
    pub fn cancel_ticket(&mut self, ticket: u64) -> Option<u64> {
        let id = self
            .pending
            .iter()
            .find(|(_, r)| r.ticket == ticket)
            .map(|(id, _)| *id)?;
        self.cancel(id);
        Some(id)
    }

    /// Complete every pending request with `reason`. Returns how many.
    pub fn fail_all(&mut self, reason: CallError) -> usize {
        let count = self.pending.len();
        for (id, request) in self.pending.drain() {
            request.complete(id, Err(reason.clone()));
        }
        count
    }

    /// Earliest deadline among pending requests.
    pub fn nearest_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|r| r.deadline).min()
    }

    pub fn get(&self, id: u64) -> Option<&PendingRequest> {
        self.pending.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::msg_type;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    type Rx = oneshot::Receiver<Result<Value, CallError>>;

    fn submit(correlator: &mut Correlator, ticket: u64, deadline: Option<Instant>) -> (u64, Rx) {
        let (tx, rx) = oneshot::channel();
        let id = correlator
            .submit(ticket, "getinfo", json!([]), deadline, tx)
            .unwrap();
        (id, rx)
    }

    fn reply(kind: u16, id: u64, body: &str) -> Frame {
        Frame::new(kind, Some(id), Bytes::copy_from_slice(body.as_bytes()))
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let mut correlator = Correlator::new("r", 1024);
        let (a, _ra) = submit(&mut correlator, 1, None);
        let (b, _rb) = submit(&mut correlator, 2, None);
        assert_eq!((a, b), (1, 2));
        assert_eq!(correlator.len(), 2);
    }

    #[test]
    fn test_out_of_order_replies_match_their_slots() {
        let mut correlator = Correlator::new("r", 1024);
        let (a, mut ra) = submit(&mut correlator, 1, None);
        let (b, mut rb) = submit(&mut correlator, 2, None);

        let frame = reply(msg_type::COMMANDO_REPLY_TERM, b, r#"{"result":"B"}"#);
        assert_eq!(correlator.on_frame(&frame).unwrap(), Delivery::Completed(b));
        let frame = reply(msg_type::COMMANDO_REPLY_TERM, a, r#"{"result":"A"}"#);
        assert_eq!(correlator.on_frame(&frame).unwrap(), Delivery::Completed(a));

        assert_eq!(ra.try_recv().unwrap(), Ok(json!("A")));
        assert_eq!(rb.try_recv().unwrap(), Ok(json!("B")));
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_chunked_reply_reassembled() {
        let mut correlator = Correlator::new("r", 1024);
        let (id, mut rx) = submit(&mut correlator, 1, None);

        let first = reply(msg_type::COMMANDO_REPLY_CONTINUES, id, r#"{"resu"#);
        let last = reply(msg_type::COMMANDO_REPLY_TERM, id, r#"lt":[1,2]}"#);
        assert_eq!(correlator.on_frame(&first).unwrap(), Delivery::Partial(id));
        assert!(rx.try_recv().is_err());
        assert_eq!(correlator.on_frame(&last).unwrap(), Delivery::Completed(id));
        assert_eq!(rx.try_recv().unwrap(), Ok(json!([1, 2])));
    }

    #[test]
    fn test_unmatched_reply_is_dropped() {
        let mut correlator = Correlator::new("r", 1024);
        let (_id, mut rx) = submit(&mut correlator, 1, None);

        let stray = reply(msg_type::COMMANDO_REPLY_TERM, 99, r#"{"result":1}"#);
        assert_eq!(correlator.on_frame(&stray).unwrap(), Delivery::Unmatched(99));
        assert_eq!(correlator.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_second_terminal_chunk_is_unmatched() {
        let mut correlator = Correlator::new("r", 1024);
        let (id, _rx) = submit(&mut correlator, 1, None);

        let frame = reply(msg_type::COMMANDO_REPLY_TERM, id, r#"{"result":1}"#);
        assert_eq!(correlator.on_frame(&frame).unwrap(), Delivery::Completed(id));
        assert_eq!(correlator.on_frame(&frame).unwrap(), Delivery::Unmatched(id));
    }

    #[test]
    fn test_rpc_error_reply() {
        let mut correlator = Correlator::new("r", 1024);
        let (id, mut rx) = submit(&mut correlator, 1, None);

        let frame = reply(
            msg_type::COMMANDO_REPLY_TERM,
            id,
            r#"{"error":{"code":19537,"message":"Not authorized"}}"#,
        );
        correlator.on_frame(&frame).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(CallError::Rpc {
                code: 19537,
                message: "Not authorized".into()
            })
        );
    }

    #[test]
    fn test_reply_too_large() {
        let mut correlator = Correlator::new("r", 8);
        let (id, _rx) = submit(&mut correlator, 1, None);

        let frame = reply(msg_type::COMMANDO_REPLY_CONTINUES, id, "0123456789");
        let err = correlator.on_frame(&frame).unwrap_err();
        assert_eq!(err, ProtocolError::ReplyTooLarge { id, max: 8 });
    }

    #[test]
    fn test_non_reply_frame_rejected() {
        let mut correlator = Correlator::new("r", 8);
        let frame = Frame::new(msg_type::PING, None, Bytes::new());
        assert!(matches!(
            correlator.on_frame(&frame),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_timeout_only_affects_expired() {
        let mut correlator = Correlator::new("r", 1024);
        let now = Instant::now();
        let (a, mut ra) = submit(&mut correlator, 1, Some(now));
        let (b, mut rb) = submit(&mut correlator, 2, Some(now + Duration::from_secs(60)));
        let (c, _rc) = submit(&mut correlator, 3, None);

        assert_eq!(correlator.nearest_deadline(), Some(now));
        assert_eq!(correlator.on_timeout(now), vec![a]);
        assert_eq!(ra.try_recv().unwrap(), Err(CallError::Timeout));
        assert!(rb.try_recv().is_err());
        assert!(correlator.contains(b));
        assert!(correlator.contains(c));
        assert_eq!(correlator.nearest_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_cancel_by_ticket() {
        let mut correlator = Correlator::new("r", 1024);
        let (_a, _ra) = submit(&mut correlator, 10, None);
        let (b, mut rb) = submit(&mut correlator, 11, None);

        assert_eq!(correlator.cancel_ticket(11), Some(b));
        assert_eq!(rb.try_recv().unwrap(), Err(CallError::Cancelled));
        assert_eq!(correlator.cancel_ticket(11), None);
        assert!(!correlator.cancel(b));
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn test_fail_all_completes_everything_once() {
        let mut correlator = Correlator::new("r", 1024);
        let (_a, mut ra) = submit(&mut correlator, 1, None);
        let (_b, mut rb) = submit(&mut correlator, 2, None);

        assert_eq!(correlator.fail_all(CallError::ConnectionClosed), 2);
        assert_eq!(ra.try_recv().unwrap(), Err(CallError::ConnectionClosed));
        assert_eq!(rb.try_recv().unwrap(), Err(CallError::ConnectionClosed));
        assert_eq!(correlator.fail_all(CallError::ConnectionClosed), 0);
    }

    #[test]
    fn test_take_unsent_once() {
        let mut correlator = Correlator::new("r", 1024);
        let (id, _rx) = submit(&mut correlator, 1, None);

        let bytes = correlator.take_unsent(id).unwrap();
        assert!(!bytes.is_empty());
        assert!(correlator.get(id).unwrap().is_sent());
        assert!(correlator.take_unsent(id).is_none());
        assert!(correlator.take_unsent(42).is_none());
    }

    #[test]
    fn test_id_wrap_skips_zero_and_pending() {
        let mut correlator = Correlator::new("r", 1024);
        let (_one, _r1) = submit(&mut correlator, 1, None);

        correlator.next_id = u64::MAX;
        let (max, _rmax) = submit(&mut correlator, 2, None);
        let (after, _rafter) = submit(&mut correlator, 3, None);

        assert_eq!(max, u64::MAX);
        // 0 is reserved and 1 is still pending.
        assert_eq!(after, 2);
    }

    #[test]
    fn test_pending_ids_unique() {
        let mut correlator = Correlator::new("r", 1024);
        let mut receivers = Vec::new();
        let mut ids = HashSet::new();
        for ticket in 0..100 {
            let (id, rx) = submit(&mut correlator, ticket, None);
            assert!(ids.insert(id));
            receivers.push(rx);
        }
    }

    #[test]
    fn test_dropped_caller_does_not_panic() {
        let mut correlator = Correlator::new("r", 1024);
        let (id, rx) = submit(&mut correlator, 1, None);
        drop(rx);

        let frame = reply(msg_type::COMMANDO_REPLY_TERM, id, r#"{"result":1}"#);
        assert_eq!(correlator.on_frame(&frame).unwrap(), Delivery::Completed(id));
    }
}
