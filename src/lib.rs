//! Real-time document collaboration core.
//!
//! Clients submit edit operations for a document; the operations are queued
//! per document, applied one at a time under a distributed lock with
//! optimistic version checks, and broadcast to every process so each can
//! forward them to its own connections.
//!
//! - [`lock`]: distributed lock plus the in-process FIFO in front of it
//! - [`updates`]: per-document queue, flush worker, scheduler, dispatcher
//! - [`broadcast`]: pub/sub fan-out of applied updates
//! - [`router`]: per-process delivery to client connections
//! - [`ranges`]: comment and tracked-change remapping for history views

pub mod broadcast;
pub mod config;
pub mod document;
pub mod error;
pub mod lock;
pub mod ranges;
pub mod router;
pub mod simulate;
pub mod store;
pub mod updates;

pub use config::SyncConfig;
pub use document::{ConnectionId, DocumentId, EditOperation};
pub use error::{SyncError, SyncResult};
pub use lock::{DistributedLock, LockManager};
pub use router::ConnectionRouter;
pub use updates::{AppliedUpdate, FlushWorker, UpdateQueue};
