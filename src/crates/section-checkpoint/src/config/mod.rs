//! Engine configuration
//!
//! Timings, thresholds and storage location are read from an optional TOML
//! file layered over built-in defaults. The defaults reproduce the observed
//! behaviour of the section screens: 1s sampling for local media, 2s for
//! remote player SDKs, a 1s minimum position delta, 100ms restore grace for
//! textual state and 3s for a remote media player.

mod loader;
mod schema;

pub use loader::{ConfigLoader, CONFIG_PATH_ENV};
pub use schema::{EngineConfig, ExpiryConfig, LoggingConfig, MediaConfig, StorageConfig, TextualConfig};

use crate::error::Result;

/// Load configuration from the default location, falling back to defaults
pub async fn load_config() -> Result<EngineConfig> {
    ConfigLoader::new().load().await
}
