//! Plugins shipped with the client.

pub mod debug;
pub mod restart;

pub use debug::DebugPlugin;
pub use restart::RestartPlugin;
