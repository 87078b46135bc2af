pub mod config;
pub mod echo;
pub mod logging;
pub mod paths;
pub mod reencode;

pub use config::{Config, ConfigError, EncoderConfig, LogLevel, LoggingConfig, ValidationError};
pub use echo::echo;
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use paths::{AppDirs, DirsError};
pub use reencode::{BitrateLimits, ReencodeError, ReencodeJob, ReencodeRequest};

pub const APP_NAME: &str = "capffmpeg";
pub const APP_AUTHOR: &str = "Capgo";
pub const APP_QUALIFIER: &str = "app";

/// Name the host uses to route calls to this plugin.
pub const PLUGIN_NAME: &str = "CapacitorFFmpeg";
/// Native class identifier registered alongside [`PLUGIN_NAME`].
pub const PLUGIN_IDENTIFIER: &str = "CapacitorFFmpegPlugin";
/// Version reported by `getPluginVersion`. Fixed at build time.
pub const PLUGIN_VERSION: &str = "0.0.2";
