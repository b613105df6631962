//! Waiting on multiple channel operations at once.
//!
//! A select commits to exactly one clause. Every watched channel holds a
//! [Selector] pointing at one shared single-winner cell, the first permit
//! delivered into that cell wins and all later applications bounce.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::cancel::CancelToken;
use crate::time::{self, POLL_SLICE};
use crate::wait::{WaitCell, WakeList};

/// Permit promises that a channel operation will not block.
///
/// A permit reserves channel capacity, it must be completed against the
/// endpoint it was selected from.
#[must_use = "a permit reserves channel capacity until completed"]
#[derive(Debug, PartialEq, Eq)]
pub struct Permit {
    primitive: usize,
}

impl Permit {
    /// Constructs a permit with primitive value.
    pub const fn with_primitive(primitive: usize) -> Self {
        Permit { primitive }
    }

    /// Turns this permit to primitive value.
    pub fn into_primitive(self) -> usize {
        self.primitive
    }
}

/// [Selector] identifier.
pub struct Identifier {
    raw: *const (),
}

unsafe impl Send for Identifier {}

impl Identifier {
    fn new(raw: *const ()) -> Self {
        Identifier { raw }
    }

    fn equals(&self, other: &Identifier) -> bool {
        self.raw == other.raw
    }

    fn copy(&self) -> Self {
        Identifier { raw: self.raw }
    }
}

/// Selector waits permit application from one [Selectable] clause.
pub struct Selector {
    index: usize,
    cell: Arc<WaitCell<(usize, Permit)>>,
    identifier: Identifier,
}

impl Selector {
    fn new(index: usize, cell: Arc<WaitCell<(usize, Permit)>>, identifier: Identifier) -> Self {
        Selector { index, cell, identifier }
    }

    /// Applies a permit if no other clause applied one before. Returns
    /// false on a lost race, the caller must revoke whatever the permit
    /// reserved.
    pub fn apply(self, permit: Permit, wakes: &mut WakeList) -> bool {
        match self.cell.deliver((self.index, permit)) {
            Ok(handle) => {
                if let Some(handle) = handle {
                    wakes.push(handle);
                }
                true
            },
            Err(_) => false,
        }
    }

    /// Identifies this selector as given identifier.
    pub fn identify(&self, identifier: &Identifier) -> bool {
        self.identifier.equals(identifier)
    }
}

/// Select clause candidate.
pub trait Selectable {
    /// Reserves an available permit without blocking.
    fn select_permit(&self) -> Option<Permit>;

    /// Watches for an available permit. Returns true if a permit was
    /// applied during the watch, false if the selector was enqueued.
    fn watch_permit(&self, selector: Selector) -> bool;

    /// Removes selectors enqueued under the given identifier.
    fn unwatch_permit(&self, identifier: &Identifier);
}

impl<T: Selectable> Selectable for &T {
    fn select_permit(&self) -> Option<Permit> {
        (**self).select_permit()
    }

    fn watch_permit(&self, selector: Selector) -> bool {
        (**self).watch_permit(selector)
    }

    fn unwatch_permit(&self, identifier: &Identifier) {
        (**self).unwatch_permit(identifier)
    }
}

/// Error for timed or cancelable select.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("select timed out")]
    TimedOut,
    #[error("select canceled")]
    Canceled,
}

struct Witness<'a> {
    selectables: &'a [&'a dyn Selectable],
    identifier: Identifier,
}

impl Drop for Witness<'_> {
    fn drop(&mut self) {
        for selectable in self.selectables {
            selectable.unwatch_permit(&self.identifier);
        }
    }
}

/// Tries each clause in order and reserves the first ready permit.
pub fn try_select(selectables: &[&dyn Selectable]) -> Option<(usize, Permit)> {
    for (index, selectable) in selectables.iter().enumerate() {
        if let Some(permit) = selectable.select_permit() {
            return Some((index, permit));
        }
    }
    None
}

/// Blocks until one clause turns ready and commits to it.
///
/// Clauses are tried in order, an earlier ready clause wins over later
/// ones. The returned permit must be completed against the endpoint at the
/// returned index.
pub fn select(selectables: &[&dyn Selectable]) -> (usize, Permit) {
    assert!(!selectables.is_empty(), "select on no selectables");
    if let Some(selection) = try_select(selectables) {
        return selection;
    }
    let cell: Arc<WaitCell<(usize, Permit)>> = Arc::new(WaitCell::new());
    let identifier = Identifier::new(Arc::as_ptr(&cell) as *const ());
    let witness = Witness { selectables, identifier: identifier.copy() };
    for (index, selectable) in selectables.iter().enumerate() {
        let selector = Selector::new(index, cell.clone(), identifier.copy());
        if selectable.watch_permit(selector) && cell.is_delivered() {
            break;
        }
    }
    let selection = cell.wait();
    drop(witness);
    selection
}

/// Same as [select] but gives up after `timeout`.
pub fn select_timeout(selectables: &[&dyn Selectable], timeout: Duration) -> Result<(usize, Permit), SelectError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(selection) = try_select(selectables) {
            return Ok(selection);
        }
        if Instant::now() >= deadline {
            return Err(SelectError::TimedOut);
        }
        time::sleep(POLL_SLICE);
    }
}

/// Same as [select] but aborts once `token` triggers.
pub fn select_cancelable(selectables: &[&dyn Selectable], token: &CancelToken) -> Result<(usize, Permit), SelectError> {
    loop {
        if let Some(selection) = try_select(selectables) {
            return Ok(selection);
        }
        if token.is_set() {
            return Err(SelectError::Canceled);
        }
        time::sleep(POLL_SLICE);
    }
}
