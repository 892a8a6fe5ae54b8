//! Client for the kubedash watch multiplexer.
//!
//! [`DashboardClient`] keeps one WebSocket open to the server, reconnects
//! forever with bounded backoff, and restores every subscription once the
//! server says `ready` again. Applications only register ids and callbacks;
//! the connection itself is disposable.

pub mod protocol;
pub mod reconnect;

pub use protocol::{MessageType, ServerMessage};
pub use reconnect::{Backoff, ClientError, ClientState, DashboardClient, ReconnectPolicy};
