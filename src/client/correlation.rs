//! Request/reply correlation for a single connection.
//!
//! Every `send()` mints a [`RequestId`] and installs a one-shot interceptor
//! for it in the registry owned by the request's connection. Inbound bytes
//! from that connection are fed through [`CorrelationRegistry::dispatch`],
//! which buffers them until a full `\r\n`-terminated line is present,
//! detaches the interceptor and only then resolves its reply slot.
//!
//! Because resolving consumes the [`PendingRequest`], a slot can be written
//! at most once. Bytes arriving after resolution find no interceptor and
//! are counted as stray instead of overwriting anything.

use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::protocols::echo::parser::{self, ParseResult};

/// Correlation id minted per request. Random 128-bit token, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Producer half of a request's result slot.
pub type ReplySlot = oneshot::Sender<Result<String>>;

/// A request waiting for its reply.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    slot: ReplySlot,
    created_at: Instant,
}

impl PendingRequest {
    pub fn new(id: RequestId, slot: ReplySlot) -> Self {
        Self {
            id,
            slot,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Time since the request was created.
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Resolve with the decoded reply.
    ///
    /// Returns false if the caller already dropped its future.
    pub fn resolve(self, reply: String) -> bool {
        self.complete(Ok(reply))
    }

    /// Fail with `err`.
    pub fn fail(self, err: ClientError) -> bool {
        self.complete(Err(err))
    }

    fn complete(self, result: Result<String>) -> bool {
        let id = self.id;
        let elapsed = self.elapsed();
        let ok = result.is_ok();
        match self.slot.send(result) {
            Ok(()) => {
                debug!(
                    id = %id,
                    ok,
                    elapsed_us = elapsed.as_micros() as u64,
                    "Completed pending request"
                );
                true
            }
            Err(_) => {
                debug!(id = %id, "Pending request receiver dropped");
                false
            }
        }
    }
}

/// One-shot reply interceptor: a pending request plus its partial reply.
#[derive(Debug)]
struct Interceptor {
    pending: PendingRequest,
    buffer: BytesMut,
}

/// Outcome of feeding inbound bytes to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A complete reply was decoded and delivered.
    Resolved(RequestId),
    /// Bytes were buffered; the reply is not complete yet.
    Buffering(RequestId),
    /// The reply could not be delivered (bad UTF-8 or too large).
    Failed(RequestId),
    /// No interceptor was installed; this many bytes were discarded.
    Stray(usize),
}

/// Interceptors installed on one connection, keyed by request id.
///
/// Replies are matched to interceptors in installation order, since the
/// echo peer returns bytes in the order it received them.
#[derive(Debug)]
pub struct CorrelationRegistry {
    interceptors: HashMap<RequestId, Interceptor>,
    order: VecDeque<RequestId>,
    max_reply_size: usize,
    stray_bytes: u64,
}

impl CorrelationRegistry {
    /// Create an empty registry that rejects replies longer than `max_reply_size`.
    pub fn new(max_reply_size: usize) -> Self {
        Self {
            interceptors: HashMap::new(),
            order: VecDeque::new(),
            max_reply_size,
            stray_bytes: 0,
        }
    }

    /// Install a one-shot interceptor for `id`.
    ///
    /// An id that is already installed is rejected, never replaced.
    pub fn install(&mut self, id: RequestId, slot: ReplySlot) -> Result<()> {
        if self.interceptors.contains_key(&id) {
            warn!(id = %id, "Rejecting duplicate request id");
            return Err(ClientError::DuplicateRequest(id));
        }

        self.interceptors.insert(
            id,
            Interceptor {
                pending: PendingRequest::new(id, slot),
                buffer: BytesMut::new(),
            },
        );
        self.order.push_back(id);
        trace!(id = %id, "Installed reply interceptor");
        Ok(())
    }

    /// Feed bytes read from the connection.
    ///
    /// A reply split across several reads resolves once, on the read that
    /// completes its line. Bytes past the end of a reply go to the next
    /// installed interceptor, or are discarded if there is none.
    pub fn dispatch(&mut self, mut bytes: &[u8]) -> Vec<Dispatch> {
        let mut outcomes = Vec::new();

        while !bytes.is_empty() {
            let id = match self.order.front() {
                Some(&id) => id,
                None => {
                    self.stray_bytes += bytes.len() as u64;
                    trace!(bytes = bytes.len(), "Discarding bytes with no pending request");
                    outcomes.push(Dispatch::Stray(bytes.len()));
                    break;
                }
            };

            let interceptor = match self.interceptors.get_mut(&id) {
                Some(interceptor) => interceptor,
                None => {
                    self.order.pop_front();
                    continue;
                }
            };

            let buffered = interceptor.buffer.len();
            interceptor.buffer.extend_from_slice(bytes);
            let complete = match parser::parse(&interceptor.buffer) {
                ParseResult::Complete(_, consumed) => Some(consumed),
                ParseResult::Incomplete => None,
            };
            let total = interceptor.buffer.len();
            // A trailing '\r' may be the first half of the terminator.
            let line_len = total - usize::from(interceptor.buffer.ends_with(b"\r"));

            match complete {
                Some(consumed) => {
                    // The buffer held no terminator before this chunk.
                    bytes = &bytes[consumed - buffered..];
                    outcomes.push(self.complete(id, consumed));
                }
                None if line_len > self.max_reply_size => {
                    outcomes.push(self.reject_oversize(id));
                    break;
                }
                None => {
                    trace!(id = %id, buffered = total, "Reply incomplete");
                    outcomes.push(Dispatch::Buffering(id));
                    break;
                }
            }
        }

        outcomes
    }

    /// Detach the interceptor for `id` without resolving it.
    pub fn detach(&mut self, id: RequestId) -> Option<PendingRequest> {
        let interceptor = self.interceptors.remove(&id)?;
        self.order.retain(|queued| *queued != id);
        trace!(id = %id, "Detached reply interceptor");
        Some(interceptor.pending)
    }

    /// Detach every remaining interceptor and fail it.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all<F>(&mut self, mut make_error: F) -> usize
    where
        F: FnMut(RequestId) -> ClientError,
    {
        let ids: Vec<RequestId> = self.order.drain(..).collect();
        let mut failed = 0;
        for id in ids {
            if let Some(interceptor) = self.interceptors.remove(&id) {
                interceptor.pending.fail(make_error(id));
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.interceptors.contains_key(&id)
    }

    /// Number of installed interceptors.
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Bytes received while no interceptor was installed.
    pub fn stray_bytes(&self) -> u64 {
        self.stray_bytes
    }

    fn complete(&mut self, id: RequestId, consumed: usize) -> Dispatch {
        let mut interceptor = match self.take(id) {
            Some(interceptor) => interceptor,
            None => return Dispatch::Stray(0),
        };

        let line_len = consumed - parser::TERMINATOR.len();
        if line_len > self.max_reply_size {
            let limit = self.max_reply_size;
            interceptor
                .pending
                .fail(ClientError::ReplyTooLarge { id, limit });
            return Dispatch::Failed(id);
        }

        let mut line = interceptor.buffer.split_to(consumed);
        line.truncate(line_len);

        match String::from_utf8(line.to_vec()) {
            Ok(reply) => {
                interceptor.pending.resolve(reply);
                Dispatch::Resolved(id)
            }
            Err(_) => {
                warn!(id = %id, "Reply is not valid UTF-8");
                interceptor.pending.fail(ClientError::Decode { id });
                Dispatch::Failed(id)
            }
        }
    }

    fn reject_oversize(&mut self, id: RequestId) -> Dispatch {
        let limit = self.max_reply_size;
        if let Some(interceptor) = self.take(id) {
            warn!(id = %id, limit, "Reply exceeds size limit");
            interceptor
                .pending
                .fail(ClientError::ReplyTooLarge { id, limit });
        }
        Dispatch::Failed(id)
    }

    fn take(&mut self, id: RequestId) -> Option<Interceptor> {
        let interceptor = self.interceptors.remove(&id)?;
        self.order.retain(|queued| *queued != id);
        Some(interceptor)
    }
}
