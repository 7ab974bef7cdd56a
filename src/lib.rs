//! # retrojsvice
//!
//! A vice-plugin implementation letting vintage/text-only browsers drive a
//! modern headless browser through plain HTML and images served over HTTP.
//! Exposes a versioned C ABI (`ffi`) wrapping a single-threaded [`Context`]
//! that the host pumps externally: the host owns every thread that calls
//! into this crate, and this crate owns every thread it spawns internally
//! (HTTP workers, the upload scratch directory's lifetime).
//!
//! ## Architecture
//!
//! - [`task_queue`] (C1) is the only place ordinary work actually runs; the
//!   host drains it via `Context::pump_events`.
//! - [`http`] (C2) accepts HTTP connections on worker threads but posts each
//!   request onto the task queue rather than handling it inline, so all
//!   session state is only ever touched from the API thread.
//! - [`image_compressor`] and [`png`] (C3) turn fetched frames into
//!   long-poll HTTP responses, PNG or JPEG depending on negotiated quality.
//! - [`secrets`] (C4) generates the CSRF tokens and snake-oil key cipher
//!   used to distinguish browser sessions and obfuscate key codes.
//! - [`window`] (C5) and [`window_manager`] (C6) hold the actual per-session
//!   state machine and the handle-to-session directory/HTTP router.
//! - [`context`] (C7) owns all of the above and runs the three-phase
//!   shutdown sequence; [`ffi`] is the `extern "C"` surface the host links
//!   against.
//!
//! Logging goes through `tracing`; a host-installed callback
//! ([`logging::set_log_callback`]) can additionally mirror every record.

/// Startup option parsing.
pub mod config;

/// Error types shared across the crate.
pub mod error;

/// Global log and panic callback plumbing.
pub mod logging;

/// C1: the single-threaded cooperative task queue.
pub mod task_queue;

/// C4: CSRF token and snake-oil key generation.
pub mod secrets;

/// Non-character key whitelist and key-code decoding.
pub mod key;

/// Quality-range constants and PNG-capability sniffing.
pub mod quality;

/// Upload-modal overlay rendering.
pub mod gui;

/// C3's hand-rolled multi-threaded PNG encoder.
pub mod png;

/// C3: per-Window image compression pipeline.
pub mod image_compressor;

/// Host-provided file downloads served back through HTTP.
pub mod download;

/// File uploads from the browser's upload-modal flow.
pub mod upload;

/// C2: the HTTP server and its request/response plumbing.
pub mod http;

/// C5: the per-session window state machine.
pub mod window;

/// C6: the handle-to-window directory and HTTP router.
pub mod window_manager;

/// C7: lifecycle orchestration, option validation, and shutdown sequencing.
pub mod context;

/// C8: the versioned `extern "C"` surface and panic firewall.
pub mod ffi;

pub use config::*;
pub use context::{Context, ContextCallbacks, UriNavigationCallbacks};
pub use download::*;
pub use error::*;
pub use http::*;
pub use image_compressor::*;
pub use key::*;
pub use logging::*;
pub use quality::*;
pub use secrets::*;
pub use task_queue::*;
pub use upload::*;
pub use window::*;
pub use window_manager::*;
