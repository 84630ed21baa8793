//! # tessera-core
//!
//! The in-process core of the tessera audit log.
//!
//! This crate provides:
//! - The collaborator traits (`RecordStore`, `ConfigStore`, `TimeSource`, `Scheduler`)
//! - The canonical record serialization shared by signer and validator
//! - The `SequenceQueue` that allocates gap-free sequence numbers and tracks
//!   dependencies between concurrent writes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessera_core::{SequenceQueue, traits::{RecordStore, TimeSource}};
//!
//! let queue = SequenceQueue::initialize("node-a", store, &clock)?;
//! let handle = queue.push(&clock, record);
//! queue.persist(&handle, |r| store.insert(r))?;
//! queue.pull(handle);
//! ```

pub mod canonical;
pub mod latch;
pub mod queue;
pub mod traits;

pub use canonical::{canonical_bytes, chain_input};
pub use latch::Latch;
pub use queue::{QueueHandle, SequenceQueue};
