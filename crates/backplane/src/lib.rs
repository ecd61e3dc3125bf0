//! Distributed work queue and liveness polling over the shared backplane.
//!
//! Architecture role:
//! - [`store`]: the opaque list surface the backplane exposes (Redis in
//!   production, an in-process store for tests/embedded use)
//! - [`queue`]: the at-least-once work queue built from an atomic list move
//!   into an in-flight `_dequeue` sibling list
//! - [`poller`]: periodic liveness re-assertion for held queue entries
//!
//! The queue owns no durable state beyond its two lists; entries stranded in
//! the `_dequeue` list by a crashed worker are recovered by an external sweep
//! that inspects the list by name.

pub mod poller;
pub mod queue;
pub mod store;

pub use poller::{PollSink, Poller, PollerState};
pub use queue::WorkQueue;
pub use store::{Direction, ListStore, MemoryListStore, RedisListStore};
