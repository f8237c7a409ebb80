//! Cross-process fan-out of applied operations.
//!
//! Each document has its own topic. The flush worker publishes every
//! applied update while it still holds the document lock, so a topic's
//! message order is the document's commit order.

mod bus;
mod channel;
mod wire;

pub use bus::{BusMessage, BusSubscription, MemoryPubSub, MemorySubscription, PubSub};
pub use channel::{BroadcastChannel, BroadcastEvent, UpdateStream, topic_for};
pub use wire::BroadcastDecodeError;
