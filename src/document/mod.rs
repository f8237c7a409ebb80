//! Document identity, edit operations and the persistence seam.

mod ids;
mod memory;
mod operation;
mod persistence;

pub use ids::{ConnectionId, DocumentId};
pub use memory::MemoryDocumentStore;
pub use operation::{EditOperation, OpComponent, OpMeta};
pub(crate) use operation::byte_index;
pub use persistence::{DocumentSnapshot, DocumentStore, PersistenceError};
