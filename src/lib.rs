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

//! ntctl library — a ground-side controller for cellular/NTN IoT endpoints
//! that speak AT commands over a serial line.
//!
//! This library re-exports the key building blocks:
//! - `transport` — serial line framing, raw-tap logging (C1)
//! - `engine` — command/URC demultiplexing and transaction serialization (C2)
//! - `urc` — unsolicited result code dispatch (C3)
//! - `profile` — device bring-up and data-path behavior per modem family (C4/C5/C6)
//! - `session` — orchestrates one engine + profile, fans events out (C7)
//! - `config` — configuration loading
//! - `message` — the Location Message wire format
//! - `framing` — hex payload framing used by Profile B's socket commands
//! - `error` — the transport/engine/profile error taxonomy

pub mod config;
pub mod engine;
pub mod error;
pub mod framing;
pub mod message;
pub mod profile;
pub mod session;
pub mod transport;
pub mod urc;

pub use config::Config;
pub use engine::Engine;
pub use error::{EngineError, ProfileError};
pub use session::{Session, SessionEvent};
