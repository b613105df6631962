//! Channels for communications between coroutines and threads.

pub mod error;
mod shared;
pub mod stats;

use std::sync::Arc;
use std::time::{Duration, Instant};

use static_assertions::assert_impl_all;
use strum::Display;

use self::error::{RecvError, RecvTimeoutError, SendError, SendTimeoutError, TryRecvError, TrySendError};
pub(crate) use self::shared::Chan;
pub use self::stats::{ChannelStats, MetricsConfig, Throughput};
use crate::cancel::CancelToken;
use crate::select::{self, Identifier, Selectable, Selector};

/// Buffering discipline of a channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    /// No buffer, every send pairs with a receive.
    Rendezvous,
    /// Fixed capacity buffer, rounded up to a power of two.
    Bounded,
    /// Single slot keeping only the latest value.
    Conflated,
    /// Unbounded buffer, sends never block.
    Unlimited,
}

/// How long an operation is willing to block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wait {
    NonBlocking,
    Forever,
    Deadline(Instant),
}

impl Wait {
    /// Deadline the given duration from now.
    pub fn timeout(timeout: Duration) -> Wait {
        Wait::Deadline(Instant::now() + timeout)
    }
}

/// Sending endpoint of a channel.
///
/// The channel closes when all senders are dropped.
pub struct Sender<T: Send + 'static> {
    chan: Arc<Chan<T>>,
}

/// Receiving endpoint of a channel.
///
/// The channel closes when all receivers are dropped. Values buffered or
/// promised by reserved permits stay receivable after a close.
pub struct Receiver<T: Send + 'static> {
    chan: Arc<Chan<T>>,
}

assert_impl_all!(Sender<()>: Send, Sync);
assert_impl_all!(Receiver<()>: Send, Sync);

fn channel<T: Send + 'static>(kind: Kind, capacity: usize) -> (Sender<T>, Receiver<T>) {
    let chan = Arc::new(Chan::new(kind, capacity));
    (Sender { chan: chan.clone() }, Receiver { chan })
}

/// Constructs a rendezvous channel, sends block until paired with receives.
pub fn rendezvous<T: Send + 'static>() -> (Sender<T>, Receiver<T>) {
    channel(Kind::Rendezvous, 0)
}

/// Constructs a bounded channel. The capacity must not be zero and rounds
/// up to the next power of two.
pub fn bounded<T: Send + 'static>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    channel(Kind::Bounded, capacity)
}

/// Constructs a conflated channel where a newer value replaces an
/// unconsumed older one.
pub fn conflated<T: Send + 'static>() -> (Sender<T>, Receiver<T>) {
    channel(Kind::Conflated, 0)
}

/// Constructs a channel with unlimited buffer, sends never block.
pub fn unbounded<T: Send + 'static>() -> (Sender<T>, Receiver<T>) {
    channel(Kind::Unlimited, 0)
}

impl<T: Send + 'static> Sender<T> {
    /// Sends a value, blocking while the channel is full.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.chan.send(value)
    }

    /// Sends a value if it would not block.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.chan.try_send(value)
    }

    /// Same as [Sender::send] but gives up after `timeout`.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
        self.chan.send_deadline(value, Some(Instant::now() + timeout), None)
    }

    /// Same as [Sender::send] but aborts once `token` triggers.
    pub fn send_cancelable(&self, value: T, token: &CancelToken) -> Result<(), SendTimeoutError<T>> {
        self.chan.send_deadline(value, None, Some(token))
    }

    /// Completes a selected send with the given permit.
    pub fn complete_send(&self, permit: select::Permit, value: T) -> Result<(), SendError<T>> {
        match shared::Permit::from(permit) {
            shared::Permit::Send => {
                self.chan.consume_send_permit(value);
                Ok(())
            },
            shared::Permit::Closed => {
                self.chan.note_closed();
                Err(SendError::Closed(value))
            },
            shared::Permit::Recv => panic!("send completed with recv permit"),
        }
    }

    /// Closes the channel. Idempotent, buffered values stay receivable.
    pub fn close(&self) {
        self.chan.close();
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    pub fn kind(&self) -> Kind {
        self.chan.kind()
    }

    pub fn capacity(&self) -> usize {
        self.chan.capacity()
    }

    pub fn stats(&self) -> ChannelStats {
        self.chan.stats()
    }
}

impl<T: Send + 'static> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.chan.add_sender();
        Sender { chan: self.chan.clone() }
    }
}

impl<T: Send + 'static> Drop for Sender<T> {
    fn drop(&mut self) {
        self.chan.remove_sender();
    }
}

impl<T: Send + 'static> Selectable for Sender<T> {
    fn select_permit(&self) -> Option<select::Permit> {
        self.chan.select_send_permit()
    }

    fn watch_permit(&self, selector: Selector) -> bool {
        self.chan.watch_send_permit(selector)
    }

    fn unwatch_permit(&self, identifier: &Identifier) {
        self.chan.unwatch_send_permit(identifier)
    }
}

impl<T: Send + 'static> Receiver<T> {
    /// Receives a value, blocking while the channel is empty.
    pub fn recv(&self) -> Result<T, RecvError> {
        self.chan.recv()
    }

    /// Receives a value if one is ready.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.chan.try_recv()
    }

    /// Same as [Receiver::recv] but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.chan.recv_deadline(Some(Instant::now() + timeout), None)
    }

    /// Same as [Receiver::recv] but aborts once `token` triggers.
    pub fn recv_cancelable(&self, token: &CancelToken) -> Result<T, RecvTimeoutError> {
        self.chan.recv_deadline(None, Some(token))
    }

    /// Completes a selected receive with the given permit.
    pub fn complete_recv(&self, permit: select::Permit) -> Result<T, RecvError> {
        match shared::Permit::from(permit) {
            shared::Permit::Recv => self.chan.consume_recv_permit().ok_or(RecvError::Closed),
            shared::Permit::Closed => {
                self.chan.note_closed();
                Err(RecvError::Closed)
            },
            shared::Permit::Send => panic!("recv completed with send permit"),
        }
    }

    /// Closes the channel. Idempotent, buffered values stay receivable.
    pub fn close(&self) {
        self.chan.close();
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    pub fn kind(&self) -> Kind {
        self.chan.kind()
    }

    pub fn capacity(&self) -> usize {
        self.chan.capacity()
    }

    pub fn stats(&self) -> ChannelStats {
        self.chan.stats()
    }
}

impl<T: Send + 'static> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.chan.add_receiver();
        Receiver { chan: self.chan.clone() }
    }
}

impl<T: Send + 'static> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.chan.remove_receiver();
    }
}

impl<T: Send + 'static> Selectable for Receiver<T> {
    fn select_permit(&self) -> Option<select::Permit> {
        self.chan.select_recv_permit()
    }

    fn watch_permit(&self, selector: Selector) -> bool {
        self.chan.watch_recv_permit(selector)
    }

    fn unwatch_permit(&self, identifier: &Identifier) {
        self.chan.unwatch_recv_permit(identifier)
    }
}

/// Iterator draining a receiver until its channel closes.
pub struct IntoIter<T: Send + 'static> {
    receiver: Receiver<T>,
}

impl<T: Send + 'static> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.recv().ok()
    }
}

impl<T: Send + 'static> IntoIterator for Receiver<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { receiver: self }
    }
}
