mod env;
mod loader;
pub mod error;

pub use env::HarnessConfig;
pub use error::ConfigError;
pub use loader::{load_setup_file, write_setup_file};
