#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! kubedash library: the watch multiplexer behind the `kubedash` binary.
//!
//! - `config` — configuration loading
//! - `protocol` — client/server frame types
//! - `projection` — field projection of outbound events
//! - `stats` — per-connection traffic counters
//! - `upstream` — cluster API client and the `Upstream` trait
//! - `watch` — subscription registry, relays, Helm polling
//! - `ws` — WebSocket connection handling
//! - `routes` — HTTP router and health endpoint

pub mod config;
pub mod projection;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod stats;
pub mod upstream;
pub mod watch;
pub mod ws;

pub use config::Config;
pub use state::AppState;
