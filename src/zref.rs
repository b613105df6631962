//! Zero copy transfer of payload descriptors over channels.
//!
//! A [Zref] describes a payload buffer without owning copies of it. Sends
//! move the descriptor, never the payload. Backends decide how descriptors
//! travel, the builtin [HANDOFF] backend runs over in-process channels.

use std::fmt;
use std::ptr;
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use lazy_static::lazy_static;
use log::debug;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::channel::error::{RecvWaitError, SendWaitError};
use crate::channel::{Chan, ChannelStats, Kind, Wait};

struct Record {
    addr: *mut u8,
    len: usize,
    owning: bool,
}

// A record is an address and a length, the payload behind it is only
// touched through explicit unsafe accessors.
unsafe impl Send for Record {}
unsafe impl Sync for Record {}

/// Reference counted payload descriptor.
///
/// Dropping handles never frees the payload, reclaiming it is an explicit
/// operation of the last owning handle.
#[derive(Clone)]
pub struct Zref {
    record: Arc<Record>,
}

impl Zref {
    /// Describes `len` bytes at `addr`.
    ///
    /// # Safety
    /// The range must stay valid for as long as any handle exists. With
    /// `owning` the range must come from a leaked `Box<[u8]>`, that is what
    /// [Zref::reclaim] rebuilds.
    pub unsafe fn from_raw(addr: *mut u8, len: usize, owning: bool) -> Zref {
        Zref { record: Arc::new(Record { addr, len, owning }) }
    }

    /// Takes ownership of a boxed payload, leaking it behind a descriptor.
    pub fn from_box(payload: Box<[u8]>) -> Zref {
        let len = payload.len();
        let addr = Box::into_raw(payload) as *mut u8;
        unsafe { Zref::from_raw(addr, len, true) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.record.addr
    }

    pub fn len(&self) -> usize {
        self.record.len
    }

    pub fn is_empty(&self) -> bool {
        self.record.len == 0
    }

    pub fn is_owning(&self) -> bool {
        self.record.owning
    }

    /// Number of live handles to this descriptor.
    pub fn handles(&self) -> usize {
        Arc::strong_count(&self.record)
    }

    /// Views the payload bytes.
    ///
    /// # Safety
    /// The caller must ensure nobody writes the payload concurrently.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.record.addr, self.record.len)
    }

    /// Rebuilds the boxed payload from the last owning handle. Fails when
    /// other handles remain or the descriptor does not own its payload.
    pub fn reclaim(self) -> Result<Box<[u8]>, Zref> {
        if !self.record.owning {
            return Err(self);
        }
        match Arc::try_unwrap(self.record) {
            Ok(record) => {
                let slice = ptr::slice_from_raw_parts_mut(record.addr, record.len);
                Ok(unsafe { Box::from_raw(slice) })
            },
            Err(record) => Err(Zref { record }),
        }
    }
}

impl fmt::Debug for Zref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zref")
            .field("addr", &self.record.addr)
            .field("len", &self.record.len)
            .field("owning", &self.record.owning)
            .field("handles", &self.handles())
            .finish()
    }
}

/// Error for backend attachment.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("backend does not support {0} channels")]
    Unsupported(Kind),
}

/// Error for backend registration.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("backend {0:?} already registered")]
    Duplicate(String),
}

/// Error for binding a channel to a backend.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("no backend named {0:?}")]
    UnknownBackend(String),
    #[error(transparent)]
    Rejected(#[from] AttachError),
}

/// Transport for zero copy descriptors.
///
/// Implementations route the wait mode to the channel engine operations
/// exposed on [ZrefChannel], or to an external transport of their own.
pub trait Backend: Send + Sync {
    fn attach(&self, channel: &ZrefChannel) -> Result<(), AttachError>;

    fn detach(&self, channel: &ZrefChannel);

    fn send(&self, channel: &ZrefChannel, zref: Zref, wait: Wait) -> Result<(), SendWaitError<Zref>>;

    fn recv(&self, channel: &ZrefChannel, wait: Wait) -> Result<Zref, RecvWaitError>;

    fn send_cancelable(
        &self,
        channel: &ZrefChannel,
        zref: Zref,
        wait: Wait,
        token: &CancelToken,
    ) -> Result<(), SendWaitError<Zref>>;

    fn recv_cancelable(&self, channel: &ZrefChannel, wait: Wait, token: &CancelToken) -> Result<Zref, RecvWaitError>;
}

/// Name of the builtin in-process backend.
pub const HANDOFF: &str = "handoff";

lazy_static! {
    static ref BACKENDS: Mutex<HashMap<String, Arc<dyn Backend>>> = {
        let mut backends: HashMap<String, Arc<dyn Backend>> = HashMap::new();
        backends.insert(HANDOFF.to_string(), Arc::new(HandoffBackend));
        Mutex::new(backends)
    };
}

/// Registers a backend under a unique name.
pub fn register(name: &str, backend: Arc<dyn Backend>) -> Result<(), RegisterError> {
    let mut backends = BACKENDS.lock().unwrap();
    if backends.contains_key(name) {
        return Err(RegisterError::Duplicate(name.to_string()));
    }
    backends.insert(name.to_string(), backend);
    debug!("registered zero copy backend {name:?}");
    Ok(())
}

fn lookup(name: &str) -> Option<Arc<dyn Backend>> {
    BACKENDS.lock().unwrap().get(name).cloned()
}

/// Channel transferring [Zref] descriptors through a named backend.
#[derive(Clone)]
pub struct ZrefChannel {
    chan: Arc<Chan<Zref>>,
    backend: Arc<dyn Backend>,
}

impl ZrefChannel {
    /// Creates a channel of the given kind and binds it to a registered
    /// backend.
    pub fn bind(kind: Kind, capacity: usize, backend: &str) -> Result<ZrefChannel, BindError> {
        let backend_name = backend;
        let backend = lookup(backend).ok_or_else(|| BindError::UnknownBackend(backend.to_string()))?;
        let channel = ZrefChannel { chan: Arc::new(Chan::new(kind, capacity)), backend };
        channel.backend.attach(&channel)?;
        debug!("bound {} channel to zero copy backend {backend_name:?}", kind);
        Ok(channel)
    }

    pub fn send(&self, zref: Zref, wait: Wait) -> Result<(), SendWaitError<Zref>> {
        self.backend.send(self, zref, wait)
    }

    pub fn recv(&self, wait: Wait) -> Result<Zref, RecvWaitError> {
        self.backend.recv(self, wait)
    }

    pub fn send_cancelable(&self, zref: Zref, wait: Wait, token: &CancelToken) -> Result<(), SendWaitError<Zref>> {
        self.backend.send_cancelable(self, zref, wait, token)
    }

    pub fn recv_cancelable(&self, wait: Wait, token: &CancelToken) -> Result<Zref, RecvWaitError> {
        self.backend.recv_cancelable(self, wait, token)
    }

    /// Detaches the backend, clearing the zero copy capability bit. The
    /// channel keeps working through its queued path.
    pub fn unbind(&self) {
        self.backend.detach(self);
    }

    /// Closes the channel. Published descriptors stay receivable.
    pub fn close(&self) {
        self.chan.close();
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    pub fn kind(&self) -> Kind {
        self.chan.kind()
    }

    pub fn stats(&self) -> ChannelStats {
        self.chan.stats()
    }

    /// Flags this channel as zero copy in its snapshots, backend attach
    /// and detach hooks call this.
    pub fn mark_zerocopy(&self, on: bool) {
        self.chan.set_zerocopy(on);
    }

    /// Engine path for buffering kinds, descriptors queue like values.
    pub fn queue_send(&self, zref: Zref, wait: Wait, token: Option<&CancelToken>) -> Result<(), SendWaitError<Zref>> {
        match (wait, token) {
            (Wait::NonBlocking, _) => self.chan.try_send(zref).map_err(Into::into),
            (Wait::Forever, None) => self.chan.send(zref).map_err(Into::into),
            (Wait::Forever, Some(token)) => self.chan.send_deadline(zref, None, Some(token)).map_err(Into::into),
            (Wait::Deadline(deadline), token) => self.chan.send_deadline(zref, Some(deadline), token).map_err(Into::into),
        }
    }

    pub fn queue_recv(&self, wait: Wait, token: Option<&CancelToken>) -> Result<Zref, RecvWaitError> {
        match (wait, token) {
            (Wait::NonBlocking, _) => self.chan.try_recv().map_err(Into::into),
            (Wait::Forever, None) => self.chan.recv().map_err(Into::into),
            (Wait::Forever, Some(token)) => self.chan.recv_deadline(None, Some(token)).map_err(Into::into),
            (Wait::Deadline(deadline), token) => self.chan.recv_deadline(Some(deadline), token).map_err(Into::into),
        }
    }

    /// Engine path for rendezvous handoff, unbounded waits publish the
    /// descriptor and park until it is consumed.
    pub fn handoff_send(&self, zref: Zref, wait: Wait, token: Option<&CancelToken>) -> Result<(), SendWaitError<Zref>> {
        self.chan.zsend(zref, wait, token)
    }
}

struct HandoffBackend;

impl Backend for HandoffBackend {
    fn attach(&self, channel: &ZrefChannel) -> Result<(), AttachError> {
        channel.mark_zerocopy(true);
        Ok(())
    }

    fn detach(&self, channel: &ZrefChannel) {
        channel.mark_zerocopy(false);
    }

    fn send(&self, channel: &ZrefChannel, zref: Zref, wait: Wait) -> Result<(), SendWaitError<Zref>> {
        match channel.kind() {
            Kind::Rendezvous => channel.handoff_send(zref, wait, None),
            _ => channel.queue_send(zref, wait, None),
        }
    }

    fn recv(&self, channel: &ZrefChannel, wait: Wait) -> Result<Zref, RecvWaitError> {
        channel.queue_recv(wait, None)
    }

    fn send_cancelable(
        &self,
        channel: &ZrefChannel,
        zref: Zref,
        wait: Wait,
        token: &CancelToken,
    ) -> Result<(), SendWaitError<Zref>> {
        match channel.kind() {
            Kind::Rendezvous => channel.handoff_send(zref, wait, Some(token)),
            _ => channel.queue_send(zref, wait, Some(token)),
        }
    }

    fn recv_cancelable(&self, channel: &ZrefChannel, wait: Wait, token: &CancelToken) -> Result<Zref, RecvWaitError> {
        channel.queue_recv(wait, Some(token))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn payload(bytes: &[u8]) -> Zref {
        Zref::from_box(bytes.to_vec().into_boxed_slice())
    }

    #[test]
    fn zref_describes_payload() {
        let zref = payload(b"abc");
        assert_eq!(zref.len(), 3);
        assert!(!zref.is_empty());
        assert!(zref.is_owning());
        assert_eq!(unsafe { zref.as_slice() }, b"abc");
    }

    #[test]
    fn zref_clone_shares_payload() {
        let zref = payload(b"shared");
        let alias = zref.clone();
        assert_eq!(zref.as_ptr(), alias.as_ptr());
        assert_eq!(zref.handles(), 2);
        // Reclaim fails while another handle is alive.
        let zref = zref.reclaim().unwrap_err();
        drop(alias);
        let bytes = zref.reclaim().unwrap();
        assert_eq!(&bytes[..], b"shared");
    }

    #[test]
    fn zref_borrowed_payload_never_reclaims() {
        let mut buffer = [0u8; 8];
        let zref = unsafe { Zref::from_raw(buffer.as_mut_ptr(), buffer.len(), false) };
        assert!(!zref.is_owning());
        assert!(zref.reclaim().is_err());
    }

    #[test]
    fn bind_unknown_backend() {
        let bound = ZrefChannel::bind(Kind::Rendezvous, 0, "missing");
        assert_eq!(bound.err(), Some(BindError::UnknownBackend("missing".to_string())));
    }

    #[test]
    fn register_rejects_duplicate() {
        assert_eq!(
            register(HANDOFF, Arc::new(HandoffBackend)).err(),
            Some(RegisterError::Duplicate(HANDOFF.to_string()))
        );
    }

    #[test]
    fn handoff_nonblocking_needs_receiver() {
        let channel = ZrefChannel::bind(Kind::Rendezvous, 0, HANDOFF).unwrap();
        assert!(matches!(channel.send(payload(b"x"), Wait::NonBlocking), Err(SendWaitError::WouldBlock(_))));
        assert_eq!(channel.recv(Wait::NonBlocking).err(), Some(RecvWaitError::WouldBlock));
    }

    #[test]
    fn handoff_rendezvous_round_trip() {
        let channel = ZrefChannel::bind(Kind::Rendezvous, 0, HANDOFF).unwrap();
        let producer = {
            let channel = channel.clone();
            thread::spawn(move || channel.send(payload(b"zero copy"), Wait::Forever))
        };
        let zref = channel.recv(Wait::Forever).unwrap();
        assert_eq!(unsafe { zref.as_slice() }, b"zero copy");
        assert!(producer.join().unwrap().is_ok());
        let stats = channel.stats();
        assert!(stats.zerocopy);
        assert_eq!(stats.sends, 1);
        assert_eq!(stats.recvs, 1);
        assert_eq!(stats.bytes_sent, stats.bytes_recvd);
    }

    #[test]
    fn published_descriptor_survives_close() {
        let channel = ZrefChannel::bind(Kind::Rendezvous, 0, HANDOFF).unwrap();
        let publisher = {
            let channel = channel.clone();
            thread::spawn(move || channel.send(payload(b"late"), Wait::Forever))
        };
        // Let the publisher park with its descriptor in the channel.
        thread::sleep(Duration::from_millis(50));
        channel.close();
        assert!(matches!(publisher.join().unwrap(), Err(SendWaitError::Closed(_))));
        let zref = channel.recv(Wait::NonBlocking).unwrap();
        assert_eq!(unsafe { zref.as_slice() }, b"late");
        assert_eq!(channel.recv(Wait::NonBlocking).err(), Some(RecvWaitError::Closed));
    }

    #[test]
    fn handoff_timed_send_expires() {
        let channel = ZrefChannel::bind(Kind::Rendezvous, 0, HANDOFF).unwrap();
        let result = channel.send(payload(b"x"), Wait::timeout(Duration::from_millis(20)));
        assert!(matches!(result, Err(SendWaitError::Timeout(_))));
        assert_eq!(channel.stats().timeouts, 1);
    }

    #[test]
    fn handoff_cancelable_recv() {
        let channel = ZrefChannel::bind(Kind::Rendezvous, 0, HANDOFF).unwrap();
        let token = CancelToken::new();
        token.trigger();
        assert_eq!(channel.recv_cancelable(Wait::Forever, &token).err(), Some(RecvWaitError::Canceled));
    }

    #[test]
    fn bounded_kind_queues_descriptors() {
        let channel = ZrefChannel::bind(Kind::Bounded, 2, HANDOFF).unwrap();
        channel.send(payload(b"a"), Wait::NonBlocking).unwrap();
        channel.send(payload(b"b"), Wait::NonBlocking).unwrap();
        assert!(matches!(channel.send(payload(b"c"), Wait::NonBlocking), Err(SendWaitError::WouldBlock(_))));
        assert_eq!(unsafe { channel.recv(Wait::NonBlocking).unwrap().as_slice() }, b"a");
        assert_eq!(unsafe { channel.recv(Wait::NonBlocking).unwrap().as_slice() }, b"b");
    }

    #[test]
    fn unbind_clears_capability() {
        let channel = ZrefChannel::bind(Kind::Bounded, 2, HANDOFF).unwrap();
        assert!(channel.stats().zerocopy);
        channel.unbind();
        assert!(!channel.stats().zerocopy);
    }

    #[test]
    fn multi_producer_descriptors_balance() {
        const PER_PRODUCER: u32 = 10_000;
        let channel = ZrefChannel::bind(Kind::Rendezvous, 0, HANDOFF).unwrap();
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let channel = channel.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let bytes = (p * 100_000 + i).to_be_bytes();
                        channel.send(payload(&bytes), Wait::Forever).unwrap();
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let channel = channel.clone();
                thread::spawn(move || {
                    let mut received = Vec::with_capacity(PER_PRODUCER as usize);
                    for _ in 0..PER_PRODUCER {
                        received.push(channel.recv(Wait::Forever).unwrap());
                    }
                    received
                })
            })
            .collect();
        // Senders keep a handle until their send returns, reclaim only
        // after every producer finished.
        for producer in producers {
            producer.join().unwrap();
        }
        let mut received = Vec::with_capacity(4 * PER_PRODUCER as usize);
        for consumer in consumers {
            received.extend(consumer.join().unwrap());
        }
        channel.close();
        for zref in received {
            assert_eq!(zref.handles(), 1);
            zref.reclaim().unwrap();
        }
        let stats = channel.stats();
        assert!(stats.closed);
        assert_eq!(stats.sends, u64::from(4 * PER_PRODUCER));
        assert_eq!(stats.recvs, u64::from(4 * PER_PRODUCER));
        assert_eq!(stats.depth, 0);
    }
}
