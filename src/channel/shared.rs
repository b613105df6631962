//! Channel engine shared by all endpoints of one channel.
//!
//! All state lives behind one mutex. Wakeups are accumulated into a
//! [WakeList] under the lock and issued after it is released.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::debug;
use num_enum::{IntoPrimitive, UnsafeFromPrimitive};

use super::error::{RecvError, RecvTimeoutError, SendError, SendTimeoutError, SendWaitError, TryRecvError, TrySendError};
use super::stats::{ChannelStats, Counters};
use super::{Kind, Wait};
use crate::cancel::CancelToken;
use crate::select::{self, Identifier, Selector};
use crate::time::{self, POLL_SLICE};
use crate::wait::{WaitCell, WakeList};

/// What a granted permit entitles its holder to.
#[repr(usize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, UnsafeFromPrimitive)]
pub(crate) enum Permit {
    Send = 0,
    Recv = 1,
    Closed = 2,
}

impl From<Permit> for select::Permit {
    fn from(permit: Permit) -> Self {
        select::Permit::with_primitive(permit.into())
    }
}

impl From<select::Permit> for Permit {
    fn from(permit: select::Permit) -> Self {
        unsafe { Permit::from_unchecked(permit.into_primitive()) }
    }
}

enum SendWaiter<T: Send + 'static> {
    /// Blocking sender holding its value back until woken.
    Parked { cell: Arc<WaitCell<Result<(), SendError<T>>>>, value: T },
    /// Zero copy sender whose value is already buffered, parked until that
    /// value is consumed.
    Publisher { cell: Arc<WaitCell<Permit>> },
    Selector(Selector),
}

impl<T: Send + 'static> SendWaiter<T> {
    fn selected_by(&self, identifier: &Identifier) -> bool {
        match self {
            SendWaiter::Selector(selector) => selector.identify(identifier),
            _ => false,
        }
    }
}

enum RecvWaiter {
    Parked { cell: Arc<WaitCell<Permit>> },
    Selector(Selector),
}

impl RecvWaiter {
    fn selected_by(&self, identifier: &Identifier) -> bool {
        match self {
            RecvWaiter::Selector(selector) => selector.identify(identifier),
            _ => false,
        }
    }
}

struct State<T: Send + 'static> {
    kind: Kind,
    bound: usize,
    closed: bool,
    zerocopy: bool,
    /// Buffer slots promised to send permit holders.
    send_permits: usize,
    /// Buffered values promised to recv permit holders.
    recv_permits: usize,
    ring: VecDeque<T>,
    senders: VecDeque<SendWaiter<T>>,
    receivers: VecDeque<RecvWaiter>,
    counters: Counters,
}

impl<T: Send + 'static> State<T> {
    fn is_full(&self) -> bool {
        match self.kind {
            Kind::Rendezvous => true,
            Kind::Conflated | Kind::Unlimited => false,
            Kind::Bounded => self.ring.len() + self.send_permits >= self.bound,
        }
    }

    fn is_empty(&self) -> bool {
        self.recv_permits >= self.ring.len()
    }

    /// Whether receives can still complete, buffered values or reserved
    /// send slots remain.
    fn is_recvable(&self) -> bool {
        self.send_permits != 0 || !self.ring.is_empty()
    }

    fn note_send(&mut self) {
        self.counters.sends += 1;
        self.counters.bytes_sent += mem::size_of::<T>() as u64;
    }

    fn note_recv(&mut self) {
        self.counters.recvs += 1;
        self.counters.bytes_recvd += mem::size_of::<T>() as u64;
    }

    /// Wakes one sender. A parked sender moves its value into the buffer, a
    /// selecting sender is granted a send permit instead.
    fn wake_sender(&mut self, wakes: &mut WakeList) -> bool {
        while let Some(waiter) = self.senders.pop_front() {
            match waiter {
                SendWaiter::Parked { cell, value } => {
                    if let Ok(handle) = cell.deliver(Ok(())) {
                        self.ring.push_back(value);
                        self.note_send();
                        if let Some(handle) = handle {
                            wakes.push(handle);
                        }
                        return true;
                    }
                },
                SendWaiter::Publisher { cell } => {
                    if let Ok(handle) = cell.deliver(Permit::Send) {
                        if let Some(handle) = handle {
                            wakes.push(handle);
                        }
                        return true;
                    }
                },
                SendWaiter::Selector(selector) => {
                    self.send_permits += 1;
                    if selector.apply(Permit::Send.into(), wakes) {
                        return true;
                    }
                    // Lost to another clause of its select, revoke the slot.
                    self.send_permits -= 1;
                },
            }
        }
        false
    }

    /// Wakes one receiver and reserves a buffered value for it.
    fn wake_receiver(&mut self, wakes: &mut WakeList) -> bool {
        while let Some(waiter) = self.receivers.pop_front() {
            match waiter {
                RecvWaiter::Parked { cell } => {
                    self.recv_permits += 1;
                    if let Ok(handle) = cell.deliver(Permit::Recv) {
                        if let Some(handle) = handle {
                            wakes.push(handle);
                        }
                        return true;
                    }
                    self.recv_permits -= 1;
                },
                RecvWaiter::Selector(selector) => {
                    self.recv_permits += 1;
                    if selector.apply(Permit::Recv.into(), wakes) {
                        return true;
                    }
                    self.recv_permits -= 1;
                },
            }
        }
        false
    }

    fn close_senders(&mut self, wakes: &mut WakeList) {
        for waiter in self.senders.drain(..) {
            match waiter {
                SendWaiter::Parked { cell, value } => {
                    self.counters.closed_errors += 1;
                    if let Ok(Some(handle)) = cell.deliver(Err(SendError::Closed(value))) {
                        wakes.push(handle);
                    }
                },
                SendWaiter::Publisher { cell } => {
                    // The published value stays consumable, only the
                    // publisher itself learns about the close.
                    self.counters.closed_errors += 1;
                    if let Ok(Some(handle)) = cell.deliver(Permit::Closed) {
                        wakes.push(handle);
                    }
                },
                SendWaiter::Selector(selector) => {
                    selector.apply(Permit::Closed.into(), wakes);
                },
            }
        }
    }

    fn close_receivers(&mut self, wakes: &mut WakeList) {
        for waiter in self.receivers.drain(..) {
            match waiter {
                RecvWaiter::Parked { cell } => {
                    self.counters.closed_errors += 1;
                    if let Ok(Some(handle)) = cell.deliver(Permit::Closed) {
                        wakes.push(handle);
                    }
                },
                RecvWaiter::Selector(selector) => {
                    selector.apply(Permit::Closed.into(), wakes);
                },
            }
        }
    }

    fn close(&mut self, wakes: &mut WakeList) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!("closing {} channel with {} buffered values", self.kind, self.ring.len());
        self.close_senders(wakes);
        if !self.is_recvable() {
            self.close_receivers(wakes);
        }
    }

    fn try_send(&mut self, value: T, wakes: &mut WakeList) -> Result<(), TrySendError<T>> {
        if self.closed {
            return Err(TrySendError::Closed(value));
        }
        match self.kind {
            Kind::Conflated => {
                if self.ring.len() > self.recv_permits {
                    // Latest unclaimed value loses to the newer one.
                    *self.ring.back_mut().expect("conflated value buffered") = value;
                    self.note_send();
                } else {
                    self.ring.push_back(value);
                    self.note_send();
                    self.wake_receiver(wakes);
                }
                Ok(())
            },
            Kind::Rendezvous => {
                self.ring.push_back(value);
                if self.wake_receiver(wakes) {
                    self.note_send();
                    Ok(())
                } else {
                    let value = self.ring.pop_back().expect("pushed value present");
                    Err(TrySendError::Full(value))
                }
            },
            Kind::Bounded | Kind::Unlimited => {
                if self.is_full() {
                    return Err(TrySendError::Full(value));
                }
                self.ring.push_back(value);
                self.note_send();
                self.wake_receiver(wakes);
                Ok(())
            },
        }
    }

    fn try_recv(&mut self, wakes: &mut WakeList) -> Result<T, TryRecvError> {
        if self.is_empty() {
            if !self.senders.is_empty() && self.wake_sender(wakes) {
                if let Some(value) = self.ring.pop_front() {
                    self.note_recv();
                    return Ok(value);
                }
            }
            if self.closed && !self.is_recvable() {
                return Err(TryRecvError::Closed);
            }
            return Err(TryRecvError::Empty);
        }
        let value = self.ring.pop_front().expect("channel not empty");
        self.note_recv();
        if !self.senders.is_empty() {
            self.wake_sender(wakes);
        }
        if self.closed && !self.is_recvable() {
            self.close_receivers(wakes);
        }
        Ok(value)
    }

    fn reserve_send_permit(&mut self) -> Option<Permit> {
        if self.closed {
            return Some(Permit::Closed);
        }
        let available = match self.kind {
            // Sends complete immediately only into a waiting receiver.
            Kind::Rendezvous => !self.receivers.is_empty(),
            _ => !self.is_full(),
        };
        if available {
            self.send_permits += 1;
            Some(Permit::Send)
        } else {
            None
        }
    }

    fn reserve_recv_permit(&mut self, wakes: &mut WakeList) -> Option<Permit> {
        if !self.is_empty() {
            self.recv_permits += 1;
            return Some(Permit::Recv);
        }
        if !self.senders.is_empty() && self.wake_sender(wakes) && !self.is_empty() {
            self.recv_permits += 1;
            return Some(Permit::Recv);
        }
        if self.closed && !self.is_recvable() {
            return Some(Permit::Closed);
        }
        None
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            taken_at: Instant::now(),
            kind: self.kind,
            capacity: capacity_of(self.kind, self.bound),
            depth: self.ring.len(),
            send_waiters: self.senders.len(),
            recv_waiters: self.receivers.len(),
            zerocopy: self.zerocopy,
            closed: self.closed,
            sends: self.counters.sends,
            recvs: self.counters.recvs,
            bytes_sent: self.counters.bytes_sent,
            bytes_recvd: self.counters.bytes_recvd,
            would_blocks: self.counters.would_blocks,
            timeouts: self.counters.timeouts,
            canceled: self.counters.canceled,
            closed_errors: self.counters.closed_errors,
        }
    }
}

fn capacity_of(kind: Kind, bound: usize) -> usize {
    match kind {
        Kind::Rendezvous => 0,
        Kind::Conflated => 1,
        Kind::Unlimited => usize::MAX,
        Kind::Bounded => bound,
    }
}

pub(crate) struct Chan<T: Send + 'static> {
    kind: Kind,
    state: Mutex<State<T>>,
    senders: AtomicUsize,
    receivers: AtomicUsize,
}

impl<T: Send + 'static> Chan<T> {
    /// Constructs channel state. Bounded capacities round up to the next
    /// power of two.
    pub fn new(kind: Kind, capacity: usize) -> Chan<T> {
        let bound = match kind {
            Kind::Bounded => {
                assert!(capacity > 0, "bounded channel requires nonzero capacity");
                capacity.next_power_of_two()
            },
            _ => capacity_of(kind, 0),
        };
        let preallocated = match kind {
            Kind::Rendezvous => 4,
            Kind::Conflated => 1,
            Kind::Bounded => bound.min(256),
            Kind::Unlimited => 64,
        };
        Chan {
            kind,
            state: Mutex::new(State {
                kind,
                bound,
                closed: false,
                zerocopy: false,
                send_permits: 0,
                recv_permits: 0,
                ring: VecDeque::with_capacity(preallocated),
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
                counters: Counters::default(),
            }),
            senders: AtomicUsize::new(1),
            receivers: AtomicUsize::new(1),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        match self.kind {
            Kind::Bounded => self.state.lock().unwrap().bound,
            kind => capacity_of(kind, 0),
        }
    }

    pub fn stats(&self) -> ChannelStats {
        self.state.lock().unwrap().stats()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn set_zerocopy(&self, on: bool) {
        self.state.lock().unwrap().zerocopy = on;
    }

    pub fn add_sender(&self) {
        self.senders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_sender(&self) {
        if self.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.close();
        }
    }

    pub fn add_receiver(&self) {
        self.receivers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_receiver(&self) {
        if self.receivers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.close();
        }
    }

    pub fn close(&self) {
        let mut wakes = WakeList::new();
        let mut state = self.state.lock().unwrap();
        state.close(&mut wakes);
        drop(state);
        wakes.flush();
    }

    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut wakes = WakeList::new();
        let mut state = self.state.lock().unwrap();
        let result = state.try_send(value, &mut wakes);
        match &result {
            Err(TrySendError::Full(_)) => state.counters.would_blocks += 1,
            Err(TrySendError::Closed(_)) => state.counters.closed_errors += 1,
            Ok(()) => {},
        }
        result
    }

    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut wakes = WakeList::new();
        let mut state = self.state.lock().unwrap();
        match state.try_send(value, &mut wakes) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(value)) => {
                state.counters.closed_errors += 1;
                Err(SendError::Closed(value))
            },
            Err(TrySendError::Full(value)) => {
                let cell = Arc::new(WaitCell::new());
                state.senders.push_back(SendWaiter::Parked { cell: cell.clone(), value });
                drop(state);
                wakes.flush();
                cell.wait()
            },
        }
    }

    /// Sends with an optional deadline and cancellation token, retrying in
    /// [POLL_SLICE] steps while the channel stays full.
    pub fn send_deadline(
        &self,
        value: T,
        deadline: Option<Instant>,
        token: Option<&CancelToken>,
    ) -> Result<(), SendTimeoutError<T>> {
        let mut value = value;
        loop {
            {
                let mut wakes = WakeList::new();
                let mut state = self.state.lock().unwrap();
                match state.try_send(value, &mut wakes) {
                    Ok(()) => return Ok(()),
                    Err(TrySendError::Closed(returned)) => {
                        state.counters.closed_errors += 1;
                        return Err(SendTimeoutError::Closed(returned));
                    },
                    Err(TrySendError::Full(returned)) => {
                        if token.map_or(false, |token| token.is_set()) {
                            state.counters.canceled += 1;
                            return Err(SendTimeoutError::Canceled(returned));
                        }
                        if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                            state.counters.timeouts += 1;
                            return Err(SendTimeoutError::Timeout(returned));
                        }
                        value = returned;
                    },
                }
            }
            time::sleep(POLL_SLICE);
        }
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut wakes = WakeList::new();
        let mut state = self.state.lock().unwrap();
        let result = state.try_recv(&mut wakes);
        match &result {
            Err(TryRecvError::Empty) => state.counters.would_blocks += 1,
            Err(TryRecvError::Closed) => state.counters.closed_errors += 1,
            Ok(_) => {},
        }
        result
    }

    pub fn recv(&self) -> Result<T, RecvError> {
        let cell = {
            let mut wakes = WakeList::new();
            let mut state = self.state.lock().unwrap();
            match state.try_recv(&mut wakes) {
                Ok(value) => return Ok(value),
                Err(TryRecvError::Closed) => {
                    state.counters.closed_errors += 1;
                    return Err(RecvError::Closed);
                },
                Err(TryRecvError::Empty) => {},
            }
            let cell = Arc::new(WaitCell::new());
            state.receivers.push_back(RecvWaiter::Parked { cell: cell.clone() });
            cell
        };
        match cell.wait() {
            Permit::Recv => self.consume_recv_permit().ok_or(RecvError::Closed),
            Permit::Closed => Err(RecvError::Closed),
            Permit::Send => unreachable!("receiver granted send permit"),
        }
    }

    /// Receives with an optional deadline and cancellation token, retrying
    /// in [POLL_SLICE] steps while the channel stays empty.
    pub fn recv_deadline(&self, deadline: Option<Instant>, token: Option<&CancelToken>) -> Result<T, RecvTimeoutError> {
        loop {
            {
                let mut wakes = WakeList::new();
                let mut state = self.state.lock().unwrap();
                match state.try_recv(&mut wakes) {
                    Ok(value) => return Ok(value),
                    Err(TryRecvError::Closed) => {
                        state.counters.closed_errors += 1;
                        return Err(RecvTimeoutError::Closed);
                    },
                    Err(TryRecvError::Empty) => {
                        if token.map_or(false, |token| token.is_set()) {
                            state.counters.canceled += 1;
                            return Err(RecvTimeoutError::Canceled);
                        }
                        if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                            state.counters.timeouts += 1;
                            return Err(RecvTimeoutError::Timeout);
                        }
                    },
                }
            }
            time::sleep(POLL_SLICE);
        }
    }

    /// Counts one closed observation from a permit holder.
    pub fn note_closed(&self) {
        self.state.lock().unwrap().counters.closed_errors += 1;
    }

    pub fn consume_send_permit(&self, value: T) {
        let mut wakes = WakeList::new();
        let mut state = self.state.lock().unwrap();
        assert!(state.send_permits > 0, "no send permit reserved");
        state.send_permits -= 1;
        state.ring.push_back(value);
        state.note_send();
        state.wake_receiver(&mut wakes);
    }

    pub fn consume_recv_permit(&self) -> Option<T> {
        let mut wakes = WakeList::new();
        let mut state = self.state.lock().unwrap();
        assert!(state.recv_permits > 0, "no recv permit reserved");
        state.recv_permits -= 1;
        let value = state.ring.pop_front();
        if value.is_some() {
            state.note_recv();
            if state.closed {
                if !state.is_recvable() {
                    state.close_receivers(&mut wakes);
                }
            } else if !state.senders.is_empty() {
                state.wake_sender(&mut wakes);
            }
        }
        value
    }

    pub fn select_send_permit(&self) -> Option<select::Permit> {
        let mut state = self.state.lock().unwrap();
        state.reserve_send_permit().map(Into::into)
    }

    pub fn watch_send_permit(&self, selector: Selector) -> bool {
        let mut wakes = WakeList::new();
        let mut state = self.state.lock().unwrap();
        match state.reserve_send_permit() {
            Some(permit) => {
                if !selector.apply(permit.into(), &mut wakes) && permit == Permit::Send {
                    state.send_permits -= 1;
                }
                true
            },
            None => {
                state.senders.push_back(SendWaiter::Selector(selector));
                false
            },
        }
    }

    pub fn unwatch_send_permit(&self, identifier: &Identifier) {
        let mut state = self.state.lock().unwrap();
        state.senders.retain(|waiter| !waiter.selected_by(identifier));
    }

    pub fn select_recv_permit(&self) -> Option<select::Permit> {
        let mut wakes = WakeList::new();
        let mut state = self.state.lock().unwrap();
        state.reserve_recv_permit(&mut wakes).map(Into::into)
    }

    pub fn watch_recv_permit(&self, selector: Selector) -> bool {
        let mut wakes = WakeList::new();
        let mut state = self.state.lock().unwrap();
        match state.reserve_recv_permit(&mut wakes) {
            Some(permit) => {
                if !selector.apply(permit.into(), &mut wakes) && permit == Permit::Recv {
                    state.recv_permits -= 1;
                }
                true
            },
            None => {
                state.receivers.push_back(RecvWaiter::Selector(selector));
                false
            },
        }
    }

    pub fn unwatch_recv_permit(&self, identifier: &Identifier) {
        let mut state = self.state.lock().unwrap();
        state.receivers.retain(|waiter| !waiter.selected_by(identifier));
    }
}

impl<T: Send + Clone + 'static> Chan<T> {
    /// Zero copy send dispatching on the wait mode.
    ///
    /// Rendezvous sends waiting without bound publish the value and park
    /// until it is consumed, the published value outlives a close. Timed and
    /// cancelable sends never publish, they retry direct handoff instead.
    pub fn zsend(&self, value: T, wait: Wait, token: Option<&CancelToken>) -> Result<(), SendWaitError<T>> {
        match wait {
            Wait::NonBlocking => self.try_send(value).map_err(Into::into),
            Wait::Forever if token.is_none() => self.publish(value),
            Wait::Forever => self.send_deadline(value, None, token).map_err(Into::into),
            Wait::Deadline(deadline) => self.send_deadline(value, Some(deadline), token).map_err(Into::into),
        }
    }

    fn publish(&self, value: T) -> Result<(), SendWaitError<T>> {
        let retained = value.clone();
        let cell = {
            let mut wakes = WakeList::new();
            let mut state = self.state.lock().unwrap();
            if state.closed {
                state.counters.closed_errors += 1;
                return Err(SendWaitError::Closed(value));
            }
            state.ring.push_back(value);
            state.note_send();
            // Direct handoff when a receiver is already waiting.
            if state.wake_receiver(&mut wakes) {
                return Ok(());
            }
            let cell = Arc::new(WaitCell::new());
            state.senders.push_back(SendWaiter::Publisher { cell: cell.clone() });
            cell
        };
        match cell.wait() {
            Permit::Send => Ok(()),
            Permit::Closed => Err(SendWaitError::Closed(retained)),
            Permit::Recv => unreachable!("publisher granted recv permit"),
        }
    }
}
