//! Errors for channel operations.
//!
//! Errors carrying the undelivered value hand it back to the caller, a
//! failed send never loses data silently.

use thiserror::Error;

/// Error for blocking send.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum SendError<T> {
    #[error("sending on a closed channel")]
    Closed(T),
}

/// Error for nonblocking send.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum TrySendError<T> {
    #[error("channel is full")]
    Full(T),
    #[error("sending on a closed channel")]
    Closed(T),
}

/// Error for timed or cancelable send.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum SendTimeoutError<T> {
    #[error("send timed out")]
    Timeout(T),
    #[error("sending on a closed channel")]
    Closed(T),
    #[error("send canceled")]
    Canceled(T),
}

/// Error for blocking receive.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("receiving on a closed and drained channel")]
    Closed,
}

/// Error for nonblocking receive.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum TryRecvError {
    #[error("channel is empty")]
    Empty,
    #[error("receiving on a closed and drained channel")]
    Closed,
}

/// Error for timed or cancelable receive.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum RecvTimeoutError {
    #[error("receive timed out")]
    Timeout,
    #[error("receiving on a closed and drained channel")]
    Closed,
    #[error("receive canceled")]
    Canceled,
}

/// Error for sends taking an explicit wait mode, the zero copy backend surface.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum SendWaitError<T> {
    #[error("channel would block")]
    WouldBlock(T),
    #[error("send timed out")]
    Timeout(T),
    #[error("sending on a closed channel")]
    Closed(T),
    #[error("send canceled")]
    Canceled(T),
}

/// Error for receives taking an explicit wait mode, the zero copy backend surface.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum RecvWaitError {
    #[error("channel would block")]
    WouldBlock,
    #[error("receive timed out")]
    Timeout,
    #[error("receiving on a closed and drained channel")]
    Closed,
    #[error("receive canceled")]
    Canceled,
}

impl<T> From<SendError<T>> for TrySendError<T> {
    fn from(err: SendError<T>) -> Self {
        let SendError::Closed(value) = err;
        TrySendError::Closed(value)
    }
}

impl<T> From<TrySendError<T>> for SendError<T> {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Closed(value) => SendError::Closed(value),
            TrySendError::Full(_) => panic!("got full error in blocking send"),
        }
    }
}

impl<T> From<SendError<T>> for SendWaitError<T> {
    fn from(err: SendError<T>) -> Self {
        let SendError::Closed(value) = err;
        SendWaitError::Closed(value)
    }
}

impl<T> From<TrySendError<T>> for SendWaitError<T> {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(value) => SendWaitError::WouldBlock(value),
            TrySendError::Closed(value) => SendWaitError::Closed(value),
        }
    }
}

impl<T> From<SendTimeoutError<T>> for SendWaitError<T> {
    fn from(err: SendTimeoutError<T>) -> Self {
        match err {
            SendTimeoutError::Timeout(value) => SendWaitError::Timeout(value),
            SendTimeoutError::Closed(value) => SendWaitError::Closed(value),
            SendTimeoutError::Canceled(value) => SendWaitError::Canceled(value),
        }
    }
}

impl From<RecvError> for RecvWaitError {
    fn from(_: RecvError) -> Self {
        RecvWaitError::Closed
    }
}

impl From<TryRecvError> for RecvWaitError {
    fn from(err: TryRecvError) -> Self {
        match err {
            TryRecvError::Empty => RecvWaitError::WouldBlock,
            TryRecvError::Closed => RecvWaitError::Closed,
        }
    }
}

impl From<RecvTimeoutError> for RecvWaitError {
    fn from(err: RecvTimeoutError) -> Self {
        match err {
            RecvTimeoutError::Timeout => RecvWaitError::Timeout,
            RecvTimeoutError::Closed => RecvWaitError::Closed,
            RecvTimeoutError::Canceled => RecvWaitError::Canceled,
        }
    }
}
