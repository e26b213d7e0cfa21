//! Boot sequence
//!
//! Nothing can be built at module load: the configuration lives in the
//! embed tag, which only arrives with the creation event. `start` builds
//! the bridge at that point and keeps it for the rest of the page's life.

use crate::config::BridgeConfig;
use crate::console_log;
use crate::kernel::Bridge;
use crate::platform::web::WebHost;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

thread_local! {
    /// The bridge, once the host has created the instance
    static BRIDGE: RefCell<Option<Arc<Bridge>>> = const { RefCell::new(None) };
}

/// Module loaded
pub fn boot() {
    console_log!("[boot] pepperbridge {} loaded", env!("CARGO_PKG_VERSION"));
}

/// Build the bridge from the creation arguments
pub fn start(args: &HashMap<String, String>) -> Arc<Bridge> {
    let config = BridgeConfig::from_args(args).unwrap_or_else(|e| {
        console_log!("[boot] {}, using defaults", e);
        BridgeConfig::default()
    });
    console_log!("[boot] tmp_dir={} chunk={}", config.tmp_dir, config.log_chunk_size);

    let bridge = Arc::new(Bridge::new(Arc::new(WebHost::new()), config));
    BRIDGE.with(|b| *b.borrow_mut() = Some(Arc::clone(&bridge)));
    bridge
}

/// The running bridge, if the instance exists
pub fn bridge() -> Option<Arc<Bridge>> {
    BRIDGE.with(|b| b.borrow().clone())
}
