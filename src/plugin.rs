//! Plugin notification bus.
//!
//! Plugins observe every protocol event of the handles they are attached
//! to. The handle lock is never held while a plugin runs, so a plugin may
//! call back into the handle (restart, abort, marker queries) from inside
//! `on_event`.

use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::sync::Arc;

use crate::attr::{AuthInfo, OperationAttributes};
use crate::error::ClientError;
use crate::handle::{Handle, Operation};
use crate::reply::Reply;
use crate::url::FtpUrl;

/// Classes of control-channel commands, used to filter command, response,
/// connect and authenticate events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandMask(u32);

impl CommandMask {
    pub const NONE: CommandMask = CommandMask(0);
    pub const CONTROL_ESTABLISHMENT: CommandMask = CommandMask(1 << 0);
    pub const DATA_ESTABLISHMENT: CommandMask = CommandMask(1 << 1);
    pub const TRANSFER_PARAMETERS: CommandMask = CommandMask(1 << 2);
    pub const TRANSFER_MODIFIERS: CommandMask = CommandMask(1 << 3);
    pub const FILE_ACTIONS: CommandMask = CommandMask(1 << 4);
    pub const INFORMATION: CommandMask = CommandMask(1 << 5);
    pub const MISC: CommandMask = CommandMask(1 << 6);
    pub const BUFFER: CommandMask = CommandMask(1 << 7);
    pub const ALL: CommandMask = CommandMask(0x7fff_ffff);

    pub fn intersects(self, other: CommandMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for CommandMask {
    type Output = CommandMask;
    fn bitor(self, rhs: CommandMask) -> CommandMask {
        CommandMask(self.0 | rhs.0)
    }
}

impl BitAnd for CommandMask {
    type Output = CommandMask;
    fn bitand(self, rhs: CommandMask) -> CommandMask {
        CommandMask(self.0 & rhs.0)
    }
}

/// Event classes a plugin can subscribe to. Verb events are covered by
/// `EventKind::Verb` per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connect,
    Authenticate,
    Command,
    Response,
    Read,
    Write,
    Data,
    Fault,
    Complete,
    Abort,
    Verb(Operation),
}

impl EventKind {
    fn bit(self) -> u64 {
        match self {
            EventKind::Connect => 1 << 0,
            EventKind::Authenticate => 1 << 1,
            EventKind::Command => 1 << 2,
            EventKind::Response => 1 << 3,
            EventKind::Read => 1 << 4,
            EventKind::Write => 1 << 5,
            EventKind::Data => 1 << 6,
            EventKind::Fault => 1 << 7,
            EventKind::Complete => 1 << 8,
            EventKind::Abort => 1 << 9,
            EventKind::Verb(op) => 1 << (16 + op as u32),
        }
    }
}

/// Set of `EventKind`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u64);

impl EventSet {
    pub const EMPTY: EventSet = EventSet(0);

    pub fn all() -> EventSet {
        let mut set = EventSet(0);
        for kind in [
            EventKind::Connect,
            EventKind::Authenticate,
            EventKind::Command,
            EventKind::Response,
            EventKind::Read,
            EventKind::Write,
            EventKind::Data,
            EventKind::Fault,
            EventKind::Complete,
            EventKind::Abort,
        ] {
            set = set | kind;
        }
        set | EventSet::all_verbs()
    }

    /// Every verb except `Idle`.
    pub fn all_verbs() -> EventSet {
        Operation::VERBS
            .iter()
            .fold(EventSet::EMPTY, |set, op| set | EventKind::Verb(*op))
    }

    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl BitOr<EventKind> for EventSet {
    type Output = EventSet;
    fn bitor(self, rhs: EventKind) -> EventSet {
        EventSet(self.0 | rhs.bit())
    }
}

impl BitOr for EventSet {
    type Output = EventSet;
    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl From<EventKind> for EventSet {
    fn from(kind: EventKind) -> EventSet {
        EventSet(kind.bit())
    }
}

/// A URL together with the attributes an operation uses for it.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: FtpUrl,
    pub attr: OperationAttributes,
}

/// Verb-specific arguments carried on a verb event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VerbArgs {
    #[default]
    None,
    Chmod {
        mode: u32,
    },
    Cksm {
        algorithm: String,
        offset: u64,
        length: i64,
    },
}

/// Announces the verb a handle is about to run.
///
/// `restart` is set when the verb is being re-run because a restart was
/// requested; `source`/`dest` then hold the replacement endpoints.
#[derive(Debug, Clone)]
pub struct VerbEvent {
    pub operation: Operation,
    pub source: Option<Endpoint>,
    pub dest: Option<Endpoint>,
    pub args: VerbArgs,
    pub restart: bool,
}

#[derive(Debug, Clone)]
pub enum PluginEvent {
    Verb(VerbEvent),
    Connect {
        url: FtpUrl,
    },
    Authenticate {
        url: FtpUrl,
        auth: AuthInfo,
    },
    Command {
        url: FtpUrl,
        command: String,
    },
    Response {
        url: FtpUrl,
        result: Result<Reply, ClientError>,
    },
    /// The retrieve data channel is about to start.
    Read {
        url: FtpUrl,
    },
    /// The store data channel is about to start.
    Write {
        url: FtpUrl,
    },
    Data {
        url: FtpUrl,
        offset: u64,
        length: u64,
        eof: bool,
    },
    Fault {
        url: Option<FtpUrl>,
        error: ClientError,
    },
    Complete,
    Abort,
}

impl PluginEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PluginEvent::Verb(v) => EventKind::Verb(v.operation),
            PluginEvent::Connect { .. } => EventKind::Connect,
            PluginEvent::Authenticate { .. } => EventKind::Authenticate,
            PluginEvent::Command { .. } => EventKind::Command,
            PluginEvent::Response { .. } => EventKind::Response,
            PluginEvent::Read { .. } => EventKind::Read,
            PluginEvent::Write { .. } => EventKind::Write,
            PluginEvent::Data { .. } => EventKind::Data,
            PluginEvent::Fault { .. } => EventKind::Fault,
            PluginEvent::Complete => EventKind::Complete,
            PluginEvent::Abort => EventKind::Abort,
        }
    }
}

impl fmt::Display for PluginEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginEvent::Verb(v) => {
                write!(f, "{}", v.operation)?;
                if let Some(source) = &v.source {
                    write!(f, " {}", source.url)?;
                }
                if let Some(dest) = &v.dest {
                    write!(f, " {}", dest.url)?;
                }
                if v.restart {
                    f.write_str(" (restart)")?;
                }
                Ok(())
            }
            PluginEvent::Connect { url } => write!(f, "connect {}", url.endpoint()),
            PluginEvent::Authenticate { url, auth } => write!(
                f,
                "authenticate {} as {}",
                url.endpoint(),
                auth.user_or_anonymous()
            ),
            PluginEvent::Command { url, command } => {
                write!(f, "{} <- {}", url.endpoint(), command)
            }
            PluginEvent::Response { url, result } => match result {
                Ok(reply) => write!(f, "{} -> {}", url.endpoint(), reply.text),
                Err(e) => write!(f, "{} -> error: {}", url.endpoint(), e),
            },
            PluginEvent::Read { url } => write!(f, "read {}", url),
            PluginEvent::Write { url } => write!(f, "write {}", url),
            PluginEvent::Data {
                url,
                offset,
                length,
                eof,
            } => write!(
                f,
                "data {} offset={} length={}{}",
                url.endpoint(),
                offset,
                length,
                if *eof { " eof" } else { "" }
            ),
            PluginEvent::Fault { url, error } => match url {
                Some(url) => write!(f, "fault {}: {}", url.endpoint(), error),
                None => write!(f, "fault: {}", error),
            },
            PluginEvent::Complete => f.write_str("complete"),
            PluginEvent::Abort => f.write_str("abort"),
        }
    }
}

/// Observer attached to a handle.
pub trait Plugin: Send + Sync {
    /// Unique per handle; a second plugin with the same name is refused.
    fn name(&self) -> &str;

    /// Command classes this plugin wants to hear about.
    fn command_mask(&self) -> CommandMask {
        CommandMask::ALL
    }

    fn interests(&self) -> EventSet;

    fn on_event(&self, handle: &Handle, event: &PluginEvent);
}

/// Decides whether `plugin` receives `event`.
///
/// Command-channel events also need the plugin's command mask to overlap
/// `mask`, the class of the command that produced them. Operation-scoped
/// events only reach plugins that handle the running verb.
pub(crate) fn accepts(
    plugin: &dyn Plugin,
    event: &PluginEvent,
    mask: CommandMask,
    operation: Operation,
) -> bool {
    let interests = plugin.interests();
    let kind = event.kind();
    if !interests.contains(kind) {
        return false;
    }
    match kind {
        EventKind::Verb(_) => true,
        EventKind::Connect
        | EventKind::Authenticate
        | EventKind::Command
        | EventKind::Response => plugin.command_mask().intersects(mask),
        EventKind::Read
        | EventKind::Write
        | EventKind::Data
        | EventKind::Fault
        | EventKind::Complete
        | EventKind::Abort => interests.contains(EventKind::Verb(operation)),
    }
}

pub type PluginRef = Arc<dyn Plugin>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        interests: EventSet,
        mask: CommandMask,
    }

    impl Plugin for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        fn command_mask(&self) -> CommandMask {
            self.mask
        }

        fn interests(&self) -> EventSet {
            self.interests
        }

        fn on_event(&self, _handle: &Handle, _event: &PluginEvent) {}
    }

    fn url() -> FtpUrl {
        FtpUrl::parse("ftp://h/x").unwrap()
    }

    #[test]
    fn test_command_events_need_mask_overlap() {
        let probe = Probe {
            interests: EventSet::from(EventKind::Command),
            mask: CommandMask::FILE_ACTIONS,
        };
        let event = PluginEvent::Command {
            url: url(),
            command: "PASV".into(),
        };
        assert!(!accepts(&probe, &event, CommandMask::DATA_ESTABLISHMENT, Operation::Get));
        assert!(accepts(
            &probe,
            &event,
            CommandMask::DATA_ESTABLISHMENT | CommandMask::FILE_ACTIONS,
            Operation::Get
        ));
    }

    #[test]
    fn test_fault_needs_verb_support() {
        let probe = Probe {
            interests: EventSet::from(EventKind::Fault) | EventKind::Verb(Operation::Get),
            mask: CommandMask::ALL,
        };
        let event = PluginEvent::Fault {
            url: None,
            error: ClientError::OperationAborted,
        };
        assert!(accepts(&probe, &event, CommandMask::NONE, Operation::Get));
        assert!(!accepts(&probe, &event, CommandMask::NONE, Operation::Put));
    }

    #[test]
    fn test_all_covers_every_verb() {
        let all = EventSet::all();
        for op in Operation::VERBS {
            assert!(all.contains(EventKind::Verb(op)));
        }
        assert!(all.contains(EventKind::Abort));
        assert!(!EventSet::EMPTY.contains(EventKind::Complete));
    }
}
