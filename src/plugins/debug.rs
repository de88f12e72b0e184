use crate::handle::Handle;
use crate::logging::{self, Level};
use crate::plugin::{EventSet, Plugin, PluginEvent};

/// Writes every event of the handle it is attached to into the log at
/// debug level.
#[derive(Debug, Default)]
pub struct DebugPlugin {
    prefix: String,
}

impl DebugPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepends `prefix` to every line, to tell several handles apart.
    pub fn with_prefix(prefix: &str) -> Self {
        DebugPlugin {
            prefix: prefix.to_string(),
        }
    }

    fn line(&self, event: &PluginEvent) -> String {
        if self.prefix.is_empty() {
            event.to_string()
        } else {
            format!("{}: {}", self.prefix, event)
        }
    }
}

impl Plugin for DebugPlugin {
    fn name(&self) -> &str {
        "debug"
    }

    fn interests(&self) -> EventSet {
        EventSet::all()
    }

    fn on_event(&self, handle: &Handle, event: &PluginEvent) {
        let _ = logging::log_handle(handle.id(), Level::Debug, &self.line(event));
    }
}
