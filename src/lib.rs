//! # Multi-threading concurrency runtime building on cooperative stackful coroutine
//! `spindle` schedules lightweight coroutines across worker threads and
//! connects them with channels, multi-channel select, cancellation tokens
//! and zero copy payload transfer.
//!
//! ## Usage
//! Construct a [runtime::Runtime] to [runtime::Runtime::spawn] coroutines.
//!
//! ### Coroutine
//! * Use [coroutine::spawn] to spawn a coroutine from inside a running one.
//! * Use [coroutine::yield_now] to yield execution cooperatively.
//! * Use [coroutine::JoinHandle] to join a coroutine result.
//!
//! ### Channel
//! * Use [channel::rendezvous], [channel::bounded], [channel::conflated] or
//!   [channel::unbounded] to construct channels of different buffering kinds.
//! * Use [select::select] to wait on multiple channel clauses and commit to
//!   exactly one.
//! * Use [cancel::CancelToken] to abort blocked operations.
//! * Use [zref::ZrefChannel] to transfer payload descriptors without copying.
//!
//! ## Example
//! ```rust
//! use spindle::channel;
//! use spindle::runtime::Runtime;
//!
//! fn main() {
//!     let runtime = Runtime::new();
//!     let (sender, receiver) = channel::bounded(4);
//!     let consumer = runtime.spawn(move || {
//!         let mut total = 0;
//!         for value in receiver {
//!             total += value;
//!         }
//!         total
//!     });
//!     let producer = runtime.spawn(move || {
//!         for i in 1..=10 {
//!             sender.send(i).unwrap();
//!         }
//!     });
//!     producer.join().unwrap();
//!     assert_eq!(consumer.join().unwrap(), 55);
//! }
//! ```

pub mod cancel;
pub mod channel;
pub mod coroutine;
mod error;
pub mod runtime;
pub mod select;
pub mod time;
pub mod wait;
pub mod zref;

pub use coroutine::stack::StackSize;
pub use error::JoinError;
