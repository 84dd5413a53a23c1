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
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! shroud library: the relay and agent halves of a polling HTTP tunnel.
//!
//! - `frame`, `messages`: wire units and gRPC-Web framing
//! - `obfuscation`: payload codecs and method rotation
//! - `registry`, `queue`, `correlation`: relay state for clients, outbound frames, pending requests
//! - `cookies`, `html`, `assets`: response shaping for browsers
//! - `relay`: the relay service and its HTTP surface
//! - `agent`: the client that replays requests against a local app
//! - `config`, `clock`, `dedup`: shared plumbing

pub mod agent;
pub mod assets;
pub mod clock;
pub mod config;
pub mod cookies;
pub mod correlation;
pub mod dedup;
pub mod frame;
pub mod html;
pub mod messages;
pub mod obfuscation;
pub mod queue;
pub mod registry;
pub mod relay;

// Re-export key types at crate root for convenience.
pub use agent::Agent;
pub use config::Config;
pub use frame::{Frame, FrameType};
pub use relay::{Relay, RelayError};
