//! WebSocket collaboration hub
//!
//! Multiplexes clients onto documents: every connection joins the room named
//! by the first path segment, receives a welcome frame, the current snapshot
//! and the ephemeral blob, then enters the receive loop. Updates fan out to
//! every other client in the room with per-document FIFO ordering; slow or
//! dead clients are evicted instead of blocking the sender.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod connection;
pub mod room;
pub mod tasks;

mod prelude;

pub use connection::{HubState, get_ws_collab, handle_collab_connection};
pub use room::{Room, RoomManager};

// vim: ts=4
