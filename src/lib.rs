//! GridFTP client session engine.
//!
//! A [`Handle`] runs one file operation at a time against `ftp://`,
//! `gsiftp://` and `sshftp://` servers: it opens and authenticates control
//! connections, negotiates transfer parameters, drives the data channel and
//! reports the outcome through a completion callback. Connections can be
//! cached between operations, plugins observe every protocol event and may
//! restart or abort the operation in flight.

pub mod attr;
pub mod cache;
pub mod cli;
pub mod command;
pub mod config;
pub mod control;
pub mod data;
pub mod error;
pub mod features;
pub mod handle;
pub mod logging;
pub mod plugin;
pub mod plugins;
pub mod reactor;
pub mod reply;
pub mod restart_marker;
pub mod shutdown;
pub mod target;
pub mod url;

pub use attr::OperationAttributes;
pub use cli::parse_args;
pub use config::EngineConfig;
pub use error::ClientError;
pub use handle::{Completion, Handle, HandleState, Operation};
pub use logging::{log, log_handle, set_log_file};
pub use plugin::{Plugin, PluginEvent};
pub use restart_marker::RestartMarker;

/// Name used in usage and version output
pub const PROGRAM_NAME: &str = "gridftp-client";

/// Current version of the program (from Cargo.toml)
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");
