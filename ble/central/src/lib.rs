//! Request/response layer for a Bluetooth LE central.
//!
//! Platform BLE stacks are delegate based: a native call starts an operation and its
//! outcome arrives later as a callback. This library wraps such a stack (abstracted as
//! [`interfaces::BleTransport`] plus a stream of [`interfaces::TransportEvent`]s) in a
//! [`service::Central`] that correlates every outcome with the callers waiting for it,
//! coalesces identical concurrent requests into one native operation, enforces
//! per-request timeouts and caches read values.

pub mod config;
pub(crate) mod engine;
pub mod errors;
pub mod events;
pub mod interfaces;
pub mod service;

pub use config::{CentralConfig, Timeout};
pub use engine::cache::{CachePolicy, CacheRecord};
pub use errors::{CentralError, TransportError};
pub use service::Central;
