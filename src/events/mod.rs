//! Event propagation — bus, server push channel, and subscriber client.

pub mod bus;
pub mod client;
pub mod ws;

pub use bus::{EventBus, EventSubscription};
pub use client::{
    ConnectionState, EventStreamClient, EventTransport, FrameStream, StreamMessage, WsTransport,
};
pub use ws::{KEEP_ALIVE_MARKER, event_routes};
