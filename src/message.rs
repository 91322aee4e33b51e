use crate::connection::{send_command, ConnectionEvent, StateCell};
use crate::error::{NsqError, Result};
use crate::protocol::{Command, MessageId, RawMessage};
use crate::reader::ReaderEvent;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Called with a message whose attempts are exhausted, right before it is
/// finished automatically.
pub type DiscardHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Lifecycle of a delivered message.
///
/// Messages start as `Delivered` and move to exactly one terminal state:
/// - `Delivered` → `Finished` (FIN sent)
/// - `Delivered` → `Requeued` (REQ sent)
/// - `Delivered` → `TimedOut` (answered after the soft deadline, or the
///   connection was gone and the daemon will redeliver it)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Delivered,
    Finished,
    Requeued,
    TimedOut,
}

impl MessageState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MessageState::Delivered,
            1 => MessageState::Finished,
            2 => MessageState::Requeued,
            _ => MessageState::TimedOut,
        }
    }
}

/// How a message left the in-flight set, as reported to the reader's coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Finished,
    Requeued { backoff: bool },
    TimedOut,
}

/// The connection side of a message: where its responses go.
pub(crate) struct Responder {
    pub(crate) conn: u64,
    pub(crate) addr: Arc<str>,
    pub(crate) state: StateCell,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) events: mpsc::UnboundedSender<ConnectionEvent>,
    pub(crate) msg_timeout: Duration,
    pub(crate) max_msg_timeout: Duration,
}

impl Responder {
    fn send(&self, command: Command) -> Result<()> {
        send_command(&self.state, &self.commands, command)
    }

    fn complete(&self, completion: Completion) {
        // the reader may already be shut down; nothing left to account for then
        let _ = self.events.send(ConnectionEvent::Completed {
            conn: self.conn,
            completion,
        });
    }
}

/// Reader-wide settings every message consults when it is answered.
pub(crate) struct MessagePolicy {
    pub(crate) max_attempts: u16,
    pub(crate) requeue_delay: Duration,
    pub(crate) discard: Option<DiscardHandler>,
    pub(crate) notify: Option<mpsc::WeakUnboundedSender<ReaderEvent>>,
}

impl MessagePolicy {
    pub(crate) fn attempts_exhausted(&self, attempts: u16) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

/// A message delivered by nsqd.
///
/// `Message` is a cheap handle; clones refer to the same delivery and share its
/// state, so only one of them can answer it.
#[derive(Clone)]
pub struct Message {
    inner: Arc<Inner>,
}

struct Inner {
    raw: RawMessage,
    received_at: Instant,
    hard_deadline: Instant,
    /// Soft deadline as nanoseconds after `received_at`.
    soft_offset_nanos: AtomicU64,
    state: AtomicU8,
    /// Set by the first discard so the handler runs once per delivery.
    discarded: AtomicBool,
    responder: Arc<Responder>,
    policy: Arc<MessagePolicy>,
}

impl Message {
    pub(crate) fn new(
        raw: RawMessage,
        responder: Arc<Responder>,
        policy: Arc<MessagePolicy>,
        received_at: Instant,
    ) -> Self {
        let hard_deadline = received_at + responder.max_msg_timeout;
        let soft = responder.msg_timeout.min(responder.max_msg_timeout);
        Self {
            inner: Arc::new(Inner {
                raw,
                received_at,
                hard_deadline,
                soft_offset_nanos: AtomicU64::new(soft.as_nanos() as u64),
                state: AtomicU8::new(MessageState::Delivered as u8),
                discarded: AtomicBool::new(false),
                responder,
                policy,
            }),
        }
    }

    pub fn id(&self) -> MessageId {
        self.inner.raw.id
    }

    /// Nanoseconds since the Unix epoch at which nsqd accepted the message.
    pub fn timestamp(&self) -> i64 {
        self.inner.raw.timestamp
    }

    pub fn attempts(&self) -> u16 {
        self.inner.raw.attempts
    }

    pub fn body(&self) -> &Bytes {
        &self.inner.raw.body
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.inner.raw.body).map_err(Into::into)
    }

    /// Address of the nsqd that delivered the message.
    pub fn address(&self) -> &str {
        &self.inner.responder.addr
    }

    pub fn received_at(&self) -> Instant {
        self.inner.received_at
    }

    pub fn state(&self) -> MessageState {
        MessageState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn has_responded(&self) -> bool {
        self.state() != MessageState::Delivered
    }

    pub fn soft_deadline(&self) -> Instant {
        let offset = self.inner.soft_offset_nanos.load(Ordering::Acquire);
        self.inner.received_at + Duration::from_nanos(offset)
    }

    /// The deadline after which nsqd requeues the message regardless of touches.
    pub fn hard_deadline(&self) -> Instant {
        self.inner.hard_deadline
    }

    /// Time left before nsqd times the message out, or `None` once it has been
    /// answered. With `hard` set, the touch-independent deadline is used.
    pub fn time_until_timeout(&self, hard: bool) -> Option<Duration> {
        self.time_until_timeout_at(hard, Instant::now())
    }

    fn time_until_timeout_at(&self, hard: bool, now: Instant) -> Option<Duration> {
        if self.has_responded() {
            return None;
        }
        let deadline = if hard {
            self.hard_deadline()
        } else {
            self.soft_deadline()
        };
        Some(deadline.saturating_duration_since(now))
    }

    /// Marks the message as successfully processed.
    pub fn finish(&self) -> Result<()> {
        self.respond(
            Command::Fin(self.id()),
            MessageState::Finished,
            Completion::Finished,
        )
    }

    /// Asks nsqd to redeliver the message after `delay` (the reader's
    /// `requeue_delay` when `None`).
    ///
    /// With `backoff` set, the failure also slows the reader down. Once the
    /// message has used up `max_attempts`, it is handed to the discard handler
    /// and finished instead.
    pub fn requeue(&self, delay: Option<Duration>, backoff: bool) -> Result<()> {
        if self.inner.policy.attempts_exhausted(self.attempts()) {
            return self.discard();
        }
        let delay = delay.unwrap_or(self.inner.policy.requeue_delay);
        self.respond(
            Command::Req {
                id: self.id(),
                delay,
            },
            MessageState::Requeued,
            Completion::Requeued { backoff },
        )
    }

    /// Extends the soft timeout by nsqd's message timeout; the hard deadline
    /// is unaffected. Does nothing once the message has been answered.
    pub fn touch(&self) -> Result<()> {
        if self.has_responded() {
            return Ok(());
        }
        self.inner.responder.send(Command::Touch(self.id()))?;
        self.extend_soft_deadline(Instant::now());
        Ok(())
    }

    fn extend_soft_deadline(&self, now: Instant) {
        let extended = (now + self.inner.responder.msg_timeout).min(self.inner.hard_deadline);
        let offset = extended.saturating_duration_since(self.inner.received_at);
        self.inner
            .soft_offset_nanos
            .fetch_max(offset.as_nanos() as u64, Ordering::AcqRel);
    }

    /// Runs the discard handler, notifies the reader and finishes the message.
    pub(crate) fn discard(&self) -> Result<()> {
        if self.has_responded() || self.inner.discarded.swap(true, Ordering::AcqRel) {
            return Err(NsqError::AlreadyResponded {
                id: self.id().to_string(),
            });
        }
        let reason = NsqError::DiscardThresholdReached {
            attempts: self.attempts(),
        };
        match &self.inner.policy.discard {
            Some(handler) => handler(self),
            None => tracing::debug!(id = %self.id(), "{reason}, finishing without a discard handler"),
        }
        let finished = self.finish();
        if let Some(events) = self
            .inner
            .policy
            .notify
            .as_ref()
            .and_then(|weak| weak.upgrade())
        {
            let _ = events.send(ReaderEvent::Discard(self.clone()));
        }
        finished
    }

    fn respond(&self, command: Command, target: MessageState, completion: Completion) -> Result<()> {
        let timed_out = Instant::now() >= self.soft_deadline();
        let (target, completion) = if timed_out {
            (MessageState::TimedOut, Completion::TimedOut)
        } else {
            (target, completion)
        };

        if let Err(current) = self.inner.state.compare_exchange(
            MessageState::Delivered as u8,
            target as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            tracing::warn!(
                id = %self.id(),
                state = ?MessageState::from_u8(current),
                command = command.name(),
                "message already responded"
            );
            return Err(NsqError::AlreadyResponded {
                id: self.id().to_string(),
            });
        }

        if let Err(err) = self.inner.responder.send(command) {
            // abandoned: nsqd times it out and redelivers elsewhere
            self.inner
                .state
                .store(MessageState::TimedOut as u8, Ordering::Release);
            return Err(err);
        }
        if timed_out {
            tracing::warn!(
                id = %self.id(),
                addr = %self.address(),
                "message answered after its soft timeout; nsqd has already requeued it"
            );
        }
        self.inner.responder.complete(completion);
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id())
            .field("attempts", &self.attempts())
            .field("timestamp", &self.timestamp())
            .field("body_len", &self.body().len())
            .field("state", &self.state())
            .finish()
    }
}
