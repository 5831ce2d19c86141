//! FaultViT Configuration Module
//!
//! Model geometry, pretraining and fine-tuning hyperparameters loaded from a
//! TOML file, with built-in defaults for every field.
//!
//! ## Loading Order
//!
//! 1. `FAULTVIT_CONFIG` environment variable (path to TOML file)
//! 2. `faultvit.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! ## Usage
//!
//! ```ignore
//! // In main():
//! config::init(FaultVitConfig::load()?);
//!
//! // Anywhere in the binary:
//! let ratio = config::get().pretrain.mask_ratio;
//! ```

mod app_config;
pub mod defaults;
pub mod validation;

pub use app_config::*;

use std::sync::OnceLock;

/// Global configuration, initialized once at startup.
static FAULTVIT_CONFIG: OnceLock<FaultVitConfig> = OnceLock::new();

/// Initialize the global configuration.
///
/// A second call is ignored with a warning.
pub fn init(config: FaultVitConfig) {
    if FAULTVIT_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get a reference to the global configuration.
///
/// Panics if `init()` has not been called: a missing config is a fatal
/// startup error.
#[allow(clippy::expect_used)]
pub fn get() -> &'static FaultVitConfig {
    FAULTVIT_CONFIG
        .get()
        .expect("config::get() called before config::init(), this is a startup bug")
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    FAULTVIT_CONFIG.get().is_some()
}
