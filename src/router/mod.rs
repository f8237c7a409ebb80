//! Fan-out of broadcast events to the client connections of one process.

mod connection_router;
mod sink;

pub use connection_router::{ConnectionRouter, DeliveryReport};
pub use sink::{ClientMessage, ConnectionSink, DeliveryError};
