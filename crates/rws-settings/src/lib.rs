//! # rws-settings
//!
//! Configuration for the remote `WebSocket` scripting gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RwsSettings::default()`]
//! 2. **User file**: `~/.rws/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `RWS_*` overrides (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use rws_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("listening on {}:{}", settings.server.host, settings.server.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{LogLevel, LoggingSettings, RwsSettings, ServerSettings};
