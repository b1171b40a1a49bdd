// Not every test needs every helper.
#![allow(dead_code)]

use std::sync::Once;

/// Initialize `env_logger` once per test binary, so `RUST_LOG=msocket=debug
/// cargo test -- --nocapture` shows worker activity.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}
