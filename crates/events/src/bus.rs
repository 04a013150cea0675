//! Event publishing/subscription abstraction (mechanics only).
//!
//! The event bus is the **transport** for job status notifications. It is
//! deliberately lightweight:
//!
//! - **Transport-agnostic**: in-memory channels, Redis pub/sub, ...
//! - **Best-effort delivery**: events may be dropped, duplicated or reordered
//! - **No persistence**: the image record in the repository is the source of truth
//!
//! Subscribers must treat every message as an idempotent status hint, not as an
//! audit log. A missed event self-heals on the client's next read of the image.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// Messages that carry a routing key (the image id for job updates), so a bus
/// can hand them only to subscribers of that key.
pub trait Keyed {
    fn key(&self) -> &str;
}

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every message published after it was
/// created, either all of them or only those for one key, depending on how
/// it was obtained.
///
/// ```ignore
/// let sub = bus.subscribe();
/// loop {
///     match sub.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => forward(event),
///         Err(RecvTimeoutError::Timeout) => continue,      // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,    // bus closed
///     }
/// }
/// ```
///
/// Subscriptions are meant to be consumed by a single thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Domain-agnostic pub/sub abstraction.
///
/// `publish()` may fail (lock poisoned, network error). Failures are surfaced to
/// the caller, which decides whether to retry; see
/// [`EventPublisher`](crate::EventPublisher) for the bounded-retry wrapper used
/// by the job processor.
///
/// Implementations must be `Send + Sync`: job workers publish concurrently.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
