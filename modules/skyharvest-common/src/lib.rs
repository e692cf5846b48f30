pub mod config;
pub mod error;
pub mod settings;
pub mod types;

pub use config::Config;
pub use error::ConfigError;
pub use settings::CollectorSettings;
pub use types::*;
