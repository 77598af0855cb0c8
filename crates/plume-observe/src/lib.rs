//! Logger initialisation shared by the plume binaries.

mod config;
mod error;
mod format;
mod init;

pub use config::{ENV_FORMAT, ENV_LEVEL, LoggerConfig};
pub use error::LoggerError;
pub use format::LoggerFormat;
pub use init::logger_init;
