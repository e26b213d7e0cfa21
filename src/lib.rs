//! pepperbridge - POSIX-style syscalls for a browser-hosted plugin sandbox
//!
//! Application code expects open/read/write/socket/getenv. The sandbox
//! offers a console, asynchronous network resources and a stream of
//! lifecycle callbacks. This crate sits in between:
//! - A descriptor table over a closed set of file kinds
//! - An in-memory filesystem: temp files, symlinks, a few synthetic paths
//! - TCP/UDP sockets emulated on the host's dial/listen/accept
//! - A swappable syscall implementation, installed at init
//! - Host events held back until the application registers its handlers
//!
//! Platform support:
//! - Browser (wasm32-unknown-unknown): `#[wasm_bindgen]` event entry points
//! - Native: the loopback host, used by the test suite

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod kernel;
pub mod platform;
pub mod vfs;

#[cfg(target_arch = "wasm32")]
mod boot;

#[cfg(target_arch = "wasm32")]
pub mod runtime;

pub use config::BridgeConfig;
pub use kernel::Bridge;

/// Lock a mutex, carrying on if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Initialize panic hook for better error messages in browser console
#[cfg(target_arch = "wasm32")]
fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// WASM entry point
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn main() {
    init_panic_hook();
    boot::boot();
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
