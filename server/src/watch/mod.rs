//! Subscription bookkeeping and the relays that feed it.

pub mod poll;
pub mod registry;
pub mod relay;

pub use registry::Registry;
pub use relay::{Relay, RelaySettings};
