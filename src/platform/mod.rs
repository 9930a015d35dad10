//! Platform Abstraction Layer
//!
//! The pipeline, the worker and the filesystem are platform-agnostic; they
//! reach the host only through the `Engine`, `HostChannel` and
//! `StdinSource` seams. This module supplies the browser implementations of
//! those seams plus the few helpers every platform needs.
//!
//! - Browser (wasm32-unknown-unknown): `WebAssembly` engine, `MessagePort`
//!   channel, `SharedArrayBuffer` stdin mailbox
//! - Native: `HeapFsEngine` and the in-process mailbox, used by tools and tests

#[cfg(target_arch = "wasm32")]
#[cfg(target_os = "unknown")] // Browser WASM (no WASI)
pub mod web;

/// Milliseconds since some fixed epoch, for elapsed-time logging
#[cfg(target_arch = "wasm32")]
pub fn now_ms() -> f64 {
    js_sys::Date::now()
}

/// Milliseconds since the Unix epoch, for elapsed-time logging
#[cfg(not(target_arch = "wasm32"))]
pub fn now_ms() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}
