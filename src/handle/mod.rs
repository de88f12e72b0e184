//! The client handle: one operation at a time over up to two targets.
//!
//! Every entry point only validates its arguments, checks out the targets
//! it needs and starts them; the rest of the operation is driven by reply,
//! data and timer callbacks arriving on driver and reactor threads. All of
//! them serialize on the handle lock, and none of them holds it while a
//! plugin or the completion callback runs.

mod ops;
mod restart;
mod state;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::attr::OperationAttributes;
use crate::cache::Cache;
use crate::config::EngineConfig;
use crate::control::{ControlFactory, DefaultControlFactory};
use crate::data::{SharedSink, SharedSource};
use crate::error::ClientError;
use crate::features::Features;
use crate::logging::{self, Level};
use crate::plugin::{self, CommandMask, Endpoint, PluginEvent, PluginRef, VerbArgs, VerbEvent};
use crate::reactor::{Reactor, ThreadReactor, TimerId};
use crate::restart_marker::RestartMarker;
use crate::target::{Target, TargetId, TargetState};
use crate::url::FtpUrl;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// The verb a handle is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Idle,
    Get,
    Put,
    Transfer,
    Mkdir,
    Rmdir,
    Delete,
    Move,
    Chmod,
    /// `NLST`
    List,
    /// `LIST`
    VerboseList,
    /// `MLSD`
    MachineList,
    Mlst,
    Stat,
    Cwd,
    Size,
    Mdtm,
    Cksm,
    Feat,
}

impl Operation {
    pub const VERBS: [Operation; 18] = [
        Operation::Get,
        Operation::Put,
        Operation::Transfer,
        Operation::Mkdir,
        Operation::Rmdir,
        Operation::Delete,
        Operation::Move,
        Operation::Chmod,
        Operation::List,
        Operation::VerboseList,
        Operation::MachineList,
        Operation::Mlst,
        Operation::Stat,
        Operation::Cwd,
        Operation::Size,
        Operation::Mdtm,
        Operation::Cksm,
        Operation::Feat,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operation::Idle => "idle",
            Operation::Get => "get",
            Operation::Put => "put",
            Operation::Transfer => "third_party_transfer",
            Operation::Mkdir => "mkdir",
            Operation::Rmdir => "rmdir",
            Operation::Delete => "delete",
            Operation::Move => "move",
            Operation::Chmod => "chmod",
            Operation::List => "list",
            Operation::VerboseList => "verbose_list",
            Operation::MachineList => "machine_list",
            Operation::Mlst => "mlst",
            Operation::Stat => "stat",
            Operation::Cwd => "cwd",
            Operation::Size => "size",
            Operation::Mdtm => "modification_time",
            Operation::Cksm => "cksm",
            Operation::Feat => "feat",
        }
    }

    /// Verbs whose data comes back to the client over a data channel.
    pub fn is_retrieve(self) -> bool {
        matches!(
            self,
            Operation::Get | Operation::List | Operation::VerboseList | Operation::MachineList
        )
    }

    pub fn uses_data_channel(self) -> bool {
        self.is_retrieve() || matches!(self, Operation::Put | Operation::Transfer)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the current operation is, seen from the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Start,
    SourceConnect,
    SourceSetupConnection,
    SourceListOrRetrieve,
    DestConnect,
    DestSetupConnection,
    DestStoreOrEsto,
    ThirdPartyTransfer,
    /// One side of a third-party transfer has answered; waiting on the other.
    ThirdPartyTransferOneComplete,
    Abort,
    Restart,
    Failure,
    Finalize,
}

/// What a successful operation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Done,
    Size(u64),
    ModificationTime(DateTime<Utc>),
    Checksum(String),
    /// The MLST fact line.
    Mlst(String),
    Stat(String),
    /// Directory the server reported, when it quoted one.
    Cwd(Option<String>),
    Features(Features),
}

pub type CompletionCallback = Box<dyn FnOnce(Result<Completion, ClientError>) + Send>;

/// Arguments of a pending restart, consumed once by the restart timer.
#[derive(Debug, Clone)]
struct RestartInfo {
    source_url: Option<FtpUrl>,
    source_attr: Option<OperationAttributes>,
    dest_url: Option<FtpUrl>,
    dest_attr: Option<OperationAttributes>,
    marker: RestartMarker,
    when: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Source,
    Dest,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Source => Side::Dest,
            Side::Dest => Side::Source,
        }
    }
}

/// Handle state guarded by the handle lock.
struct Inner {
    op: Operation,
    state: HandleState,
    source: Option<Target>,
    dest: Option<Target>,
    source_url: Option<FtpUrl>,
    source_attr: Option<OperationAttributes>,
    dest_url: Option<FtpUrl>,
    dest_attr: Option<OperationAttributes>,
    args: VerbArgs,
    marker: RestartMarker,
    /// Byte range of a partial get, put or transfer: start offset and optional end.
    partial: Option<(u64, Option<u64>)>,
    sink: Option<SharedSink>,
    data_source: Option<SharedSource>,
    callback: Option<CompletionCallback>,
    /// First error of the operation; it wins over anything later.
    err: Option<ClientError>,
    output: Option<Completion>,
    /// Completion waiting to be delivered once the lock is dropped.
    completed: Option<(CompletionCallback, Result<Completion, ClientError>)>,
    plugins: Vec<PluginRef>,
    notify_in_progress: u32,
    notify_abort: bool,
    notify_restart: bool,
    restart_info: Option<RestartInfo>,
    restart_timer: Option<TimerId>,
    cache: Cache,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl Inner {
    fn new() -> Inner {
        Inner {
            op: Operation::Idle,
            state: HandleState::Start,
            source: None,
            dest: None,
            source_url: None,
            source_attr: None,
            dest_url: None,
            dest_attr: None,
            args: VerbArgs::None,
            marker: RestartMarker::new(),
            partial: None,
            sink: None,
            data_source: None,
            callback: None,
            err: None,
            output: None,
            completed: None,
            plugins: Vec::new(),
            notify_in_progress: 0,
            notify_abort: false,
            notify_restart: false,
            restart_info: None,
            restart_timer: None,
            cache: Cache::new(),
            user_data: None,
        }
    }

    fn target(&self, side: Side) -> Option<&Target> {
        match side {
            Side::Source => self.source.as_ref(),
            Side::Dest => self.dest.as_ref(),
        }
    }

    fn target_mut(&mut self, side: Side) -> Option<&mut Target> {
        match side {
            Side::Source => self.source.as_mut(),
            Side::Dest => self.dest.as_mut(),
        }
    }

    fn slot(&mut self, side: Side) -> &mut Option<Target> {
        match side {
            Side::Source => &mut self.source,
            Side::Dest => &mut self.dest,
        }
    }

    /// Which side `id` is on in the current operation, if it is still part
    /// of it.
    fn side_of(&self, id: TargetId) -> Option<Side> {
        if self.source.as_ref().is_some_and(|t| t.id == id) {
            Some(Side::Source)
        } else if self.dest.as_ref().is_some_and(|t| t.id == id) {
            Some(Side::Dest)
        } else {
            None
        }
    }

    fn target_state(&self, side: Side) -> Option<TargetState> {
        self.target(side).map(|t| t.state)
    }

    fn set_error(&mut self, err: ClientError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// Stopped by abort, restart or failure; callbacks leave such a handle
    /// alone.
    fn interrupted(&self) -> bool {
        matches!(
            self.state,
            HandleState::Abort | HandleState::Restart | HandleState::Failure
        )
    }

    fn verb_event(&self) -> VerbEvent {
        VerbEvent {
            operation: self.op,
            source: endpoint(self.source_url.as_ref(), self.source_attr.as_ref()),
            dest: endpoint(self.dest_url.as_ref(), self.dest_attr.as_ref()),
            args: self.args.clone(),
            restart: false,
        }
    }

    fn restart_event(&self) -> Option<VerbEvent> {
        let info = self.restart_info.as_ref()?;
        Some(VerbEvent {
            operation: self.op,
            source: endpoint(info.source_url.as_ref(), info.source_attr.as_ref()),
            dest: endpoint(info.dest_url.as_ref(), info.dest_attr.as_ref()),
            args: self.args.clone(),
            restart: true,
        })
    }

    /// Back to idle. Targets must already have been released.
    fn reset(&mut self) {
        self.op = Operation::Idle;
        self.state = HandleState::Start;
        self.source = None;
        self.dest = None;
        self.source_url = None;
        self.source_attr = None;
        self.dest_url = None;
        self.dest_attr = None;
        self.args = VerbArgs::None;
        self.marker = RestartMarker::new();
        self.partial = None;
        self.sink = None;
        self.data_source = None;
        self.callback = None;
        self.err = None;
        self.output = None;
        self.restart_info = None;
        self.restart_timer = None;
    }
}

fn endpoint(url: Option<&FtpUrl>, attr: Option<&OperationAttributes>) -> Option<Endpoint> {
    url.map(|url| Endpoint {
        url: url.clone(),
        attr: attr.cloned().unwrap_or_default(),
    })
}

struct Shared {
    id: u64,
    inner: Mutex<Inner>,
    reactor: Arc<dyn Reactor>,
    factory: Arc<dyn ControlFactory>,
    config: Arc<EngineConfig>,
}

type Guard<'a> = MutexGuard<'a, Inner>;

impl Shared {
    fn lock(&self) -> Guard<'_> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self, level: Level, message: &str) {
        let _ = logging::log_handle(self.id, level, message);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = inner.restart_timer.take() {
            self.reactor.unregister(timer);
        }
        for mut target in inner.source.take().into_iter().chain(inner.dest.take()) {
            if !target.state.is_quiet() {
                target.state = TargetState::Fault;
            }
            state::shutdown_target(target);
        }
        for target in inner.cache.drain() {
            state::shutdown_target(target);
        }
    }
}

/// Client session. Cheap to clone; clones drive the same session.
///
/// Only one operation runs at a time. Every entry point returns as soon as
/// the operation is under way; its result arrives through the completion
/// callback, exactly once, from a background thread.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("id", &self.shared.id).finish()
    }
}

impl Handle {
    /// Handle using real control connections and thread-backed timers.
    pub fn new(config: Arc<EngineConfig>) -> Handle {
        Handle::with_parts(
            config,
            Arc::new(ThreadReactor::new()),
            Arc::new(DefaultControlFactory),
        )
    }

    pub fn with_parts(
        config: Arc<EngineConfig>,
        reactor: Arc<dyn Reactor>,
        factory: Arc<dyn ControlFactory>,
    ) -> Handle {
        Handle {
            shared: Arc::new(Shared {
                id: NEXT_HANDLE.fetch_add(1, Ordering::SeqCst),
                inner: Mutex::new(Inner::new()),
                reactor,
                factory,
                config,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.shared.config
    }

    /// The verb in flight, `Idle` when none.
    pub fn operation(&self) -> Operation {
        self.shared.lock().op
    }

    pub fn state(&self) -> HandleState {
        self.shared.lock().state
    }

    /// Attaches a plugin. Only allowed while idle; names are unique.
    pub fn add_plugin(&self, plugin: PluginRef) -> Result<(), ClientError> {
        let mut g = self.shared.lock();
        if g.op != Operation::Idle {
            return Err(ClientError::ObjectInUse("handle"));
        }
        if g.plugins.iter().any(|p| p.name() == plugin.name()) {
            return Err(ClientError::AlreadyDone);
        }
        g.plugins.push(plugin);
        Ok(())
    }

    pub fn remove_plugin(&self, name: &str) -> Result<PluginRef, ClientError> {
        let mut g = self.shared.lock();
        if g.op != Operation::Idle {
            return Err(ClientError::ObjectInUse("handle"));
        }
        let index = g
            .plugins
            .iter()
            .position(|p| p.name() == name)
            .ok_or(ClientError::InvalidParameter("plugin"))?;
        Ok(g.plugins.remove(index))
    }

    /// Keeps the connection to `url`'s server open between operations.
    pub fn cache_url_state(&self, url: &str) -> Result<(), ClientError> {
        let url = FtpUrl::parse(url)?;
        self.shared.lock().cache.add(&url)
    }

    /// Stops caching `url`'s server and closes its idle connection.
    pub fn flush_url_state(&self, url: &str) -> Result<(), ClientError> {
        let url = FtpUrl::parse(url)?;
        let evicted = self.shared.lock().cache.remove(&url)?;
        for target in evicted {
            state::shutdown_target(target);
        }
        Ok(())
    }

    /// Copy of the marker of the current (or last started) operation.
    pub fn restart_marker(&self) -> RestartMarker {
        self.shared.lock().marker.clone()
    }

    pub fn set_user_data(&self, data: Option<Arc<dyn Any + Send + Sync>>) {
        self.shared.lock().user_data = data;
    }

    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.shared.lock().user_data.clone()
    }

    /// Cancels the operation in flight. Its callback reports
    /// `OperationAborted` unless the outcome was already decided.
    pub fn abort(&self) -> Result<(), ClientError> {
        state::abort(&self.shared)
    }

    /// `abort` for use from inside a plugin callback.
    pub fn plugin_abort(&self) -> Result<(), ClientError> {
        self.abort()
    }
}

/// Delivers a pending completion after the lock is released.
fn finish(mut g: Guard<'_>) {
    let completed = g.completed.take();
    drop(g);
    if let Some((callback, result)) = completed {
        callback(result);
    }
}

/// Runs `event` past every interested plugin with the lock released.
fn fan_out<'a>(
    shared: &'a Arc<Shared>,
    mut g: Guard<'a>,
    event: &PluginEvent,
    mask: CommandMask,
) -> Guard<'a> {
    let op = g.op;
    let plugins: Vec<PluginRef> = g
        .plugins
        .iter()
        .filter(|p| plugin::accepts(p.as_ref(), event, mask, op))
        .cloned()
        .collect();
    if plugins.is_empty() {
        return g;
    }
    g.notify_in_progress += 1;
    drop(g);
    let handle = Handle {
        shared: Arc::clone(shared),
    };
    for plugin in &plugins {
        plugin.on_event(&handle, event);
    }
    let mut g = shared.lock();
    g.notify_in_progress -= 1;
    g
}

/// Fans `event` out, then handles any restart or abort a plugin asked for
/// while it ran; restart goes first.
fn notify<'a>(
    shared: &'a Arc<Shared>,
    g: Guard<'a>,
    event: PluginEvent,
    mask: CommandMask,
) -> Guard<'a> {
    let g = fan_out(shared, g, &event, mask);
    drain_deferred(shared, g)
}

fn drain_deferred<'a>(shared: &'a Arc<Shared>, mut g: Guard<'a>) -> Guard<'a> {
    if g.notify_restart {
        g.notify_restart = false;
        g = notify_restart(shared, g);
    }
    if g.notify_abort {
        g.notify_abort = false;
        g = notify_abort(shared, g);
    }
    g
}

/// Re-announces the verb with the restart arguments.
fn notify_restart<'a>(shared: &'a Arc<Shared>, mut g: Guard<'a>) -> Guard<'a> {
    if g.notify_in_progress > 0 {
        g.notify_restart = true;
        return g;
    }
    let Some(event) = g.restart_event() else {
        return g;
    };
    let g = fan_out(shared, g, &PluginEvent::Verb(event), CommandMask::ALL);
    drain_deferred(shared, g)
}

fn notify_abort<'a>(shared: &'a Arc<Shared>, mut g: Guard<'a>) -> Guard<'a> {
    if g.notify_in_progress > 0 {
        g.notify_abort = true;
        return g;
    }
    let g = fan_out(shared, g, &PluginEvent::Abort, CommandMask::ALL);
    drain_deferred(shared, g)
}
