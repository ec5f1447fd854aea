pub mod data;
pub mod defaults;
pub mod io;

pub use data::{CacheSettings, Config, OAuthSettings, ServerDescriptor};
pub use io::ConfigError;
