//! warpfleet-state: embedded state store for WarpFleet.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for member clusters, placement policies, and bindings.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Every record carries a `resource_version`; updates are compare-and-swap
//! inside a single write transaction, so concurrent reconcilers racing on
//! the same record see [`StateError::Conflict`] and re-read.
//!
//! Successful writes are published as [`StoreEvent`]s on a broadcast
//! channel, which the failover controller uses as its watch stream.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod clock;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{StateError, StateResult};
pub use store::{StateStore, StoreEvent};
pub use types::*;
