/// Tab Warden - Chrome Extension for Site Blocking
/// Built with Rust + WASM

pub mod api;
pub mod auth;
pub mod blocking;
pub mod blocklist;
pub mod matcher;
pub mod stats;
pub mod storage;
pub mod sync;

#[cfg(target_arch = "wasm32")]
pub mod extension;

use wasm_bindgen::prelude::*;

// Set up panic hook for better error messages in the browser console
#[wasm_bindgen(start)]
pub fn main() {
    console_error_panic_hook::set_once();
    wasm_logger::init(wasm_logger::Config::default());
}

// Re-export the matcher for direct JavaScript access
#[wasm_bindgen]
pub fn matches_wildcard(url: &str, pattern: &str) -> bool {
    matcher::matches_wildcard(url, pattern)
}

// Pattern for "block this whole domain", or empty for an unusable URL
#[wasm_bindgen]
pub fn quick_block_pattern(url: &str) -> String {
    blocklist::quick_block_pattern(url).unwrap_or_default()
}
