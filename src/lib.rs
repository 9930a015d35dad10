//! webcc - C and C++ in the browser, compiled to WASM
//!
//! The compiler front-end, the linker and the user's program all run as
//! WebAssembly guests inside one worker. This crate is the host they run
//! against:
//! - a filesystem shared by every guest, seeded from a sysroot archive
//! - the small process surface the toolchain needs (argv, environ, exit)
//! - stdio bridged to the page, with blocking stdin
//! - the compile → link → run pipeline
//!
//! Platform support:
//! - Browser (wasm32-unknown-unknown): dedicated worker, `WebAssembly` JS API
//! - Native: in-process filesystem engine, used by the tools and tests

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod guest;
pub mod mailbox;
pub mod memory;
pub mod pipeline;
pub mod platform;
pub mod vfs;
pub mod worker;

pub use error::{RuntimeError, RuntimeResult};

/// Initialize panic hook for better error messages in browser console
#[cfg(target_arch = "wasm32")]
fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Worker entry point
#[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
#[wasm_bindgen(start)]
pub fn main() {
    init_panic_hook();
    platform::web::start();
}

/// Console logging helper
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);
}

/// Log to browser console (WASM)
#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        $crate::log(&format!($($t)*))
    };
}

/// Log to stderr (native)
#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        eprintln!($($t)*)
    };
}
