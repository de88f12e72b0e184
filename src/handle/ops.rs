//! Operation entry points.
//!
//! Each one validates its arguments, records them on the handle, checks
//! out the targets it needs and starts the first one. Errors found here
//! are returned directly and the completion callback is dropped unused;
//! everything after that is reported through the callback.

use std::sync::Arc;

use super::{
    finish, notify, restart, state, Completion, CompletionCallback, Guard, Handle, HandleState,
    Inner, Operation, Shared, Side,
};
use crate::attr::{Mode, OperationAttributes};
use crate::data::{SharedSink, SharedSource};
use crate::error::ClientError;
use crate::logging::Level;
use crate::plugin::{CommandMask, PluginEvent, VerbArgs};
use crate::restart_marker::RestartMarker;
use crate::url::FtpUrl;

/// Arguments of one entry point call.
struct Request<'a> {
    op: Operation,
    source: Option<(&'a str, Option<OperationAttributes>)>,
    dest: Option<(&'a str, Option<OperationAttributes>)>,
    args: VerbArgs,
    marker: Option<RestartMarker>,
    partial: Option<(u64, Option<u64>)>,
    sink: Option<SharedSink>,
    data_source: Option<SharedSource>,
}

impl<'a> Request<'a> {
    fn new(op: Operation) -> Self {
        Request {
            op,
            source: None,
            dest: None,
            args: VerbArgs::None,
            marker: None,
            partial: None,
            sink: None,
            data_source: None,
        }
    }

    fn source(mut self, url: &'a str, attr: Option<OperationAttributes>) -> Self {
        self.source = Some((url, attr));
        self
    }

    fn dest(mut self, url: &'a str, attr: Option<OperationAttributes>) -> Self {
        self.dest = Some((url, attr));
        self
    }

    fn args(mut self, args: VerbArgs) -> Self {
        self.args = args;
        self
    }

    fn marker(mut self, marker: Option<RestartMarker>) -> Self {
        self.marker = marker;
        self
    }

    fn partial(mut self, offset: u64, end_offset: Option<u64>) -> Self {
        self.partial = Some((offset, end_offset));
        self
    }

    fn sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    fn data_source(mut self, source: SharedSource) -> Self {
        self.data_source = Some(source);
        self
    }
}

type Parsed = Option<(FtpUrl, Option<OperationAttributes>)>;

fn parse_endpoint(endpoint: Option<(&str, Option<OperationAttributes>)>) -> Result<Parsed, ClientError> {
    endpoint
        .map(|(url, attr)| Ok((FtpUrl::parse(url)?, attr)))
        .transpose()
}

/// Both sides of a third-party transfer must use the same mode, and a
/// transfer between two schemes can't authenticate its data channel.
pub(super) fn normalize_third_party(
    source_url: &FtpUrl,
    source_attr: &mut Option<OperationAttributes>,
    dest_url: &FtpUrl,
    dest_attr: &mut Option<OperationAttributes>,
) -> Result<(), ClientError> {
    let mode = |attr: &Option<OperationAttributes>| attr.clone().unwrap_or_default().mode;
    if mode(source_attr) != mode(dest_attr) {
        return Err(ClientError::InvalidParameter("mode"));
    }
    if source_url.scheme != dest_url.scheme {
        *source_attr = Some(source_attr.clone().unwrap_or_default().without_dcau());
        *dest_attr = Some(dest_attr.clone().unwrap_or_default().without_dcau());
    }
    Ok(())
}

/// Takes the targets for the current urls out of the cache (or creates
/// them). `Move` only talks to the source server.
pub(super) fn check_out_targets(shared: &Arc<Shared>, g: &mut Inner) {
    if g.op != Operation::Put {
        if let Some(url) = g.source_url.clone() {
            let attr = g.source_attr.clone();
            g.source = Some(g.cache.find_or_create(&url, attr.as_ref(), &shared.config));
        }
    }
    if matches!(g.op, Operation::Put | Operation::Transfer) {
        if let Some(url) = g.dest_url.clone() {
            let attr = g.dest_attr.clone();
            g.dest = Some(g.cache.find_or_create(&url, attr.as_ref(), &shared.config));
        }
    }
}

/// Starts the first target: the destination of a store, else the source.
pub(super) fn activate_operation<'a>(
    shared: &'a Arc<Shared>,
    g: Guard<'a>,
) -> (Guard<'a>, Result<(), ClientError>) {
    let side = match g.op {
        Operation::Put | Operation::Transfer => Side::Dest,
        _ => Side::Source,
    };
    state::target_activate(shared, g, side)
}

/// Drops a synchronously failed operation without a callback.
fn abandon(g: &mut Inner) {
    state::release_targets(g);
    g.reset();
}

/// Resume point for a partial transfer with no end: the bytes before
/// `offset` are marked done.
fn open_ended_marker(
    marker: Option<&RestartMarker>,
    mode: Mode,
    offset: u64,
) -> Result<RestartMarker, ClientError> {
    let mut marker = marker.cloned().unwrap_or_default();
    if offset > 0 {
        match mode {
            Mode::ExtendedBlock => marker.insert_range(0, offset - 1)?,
            Mode::Stream => marker.set_offset(offset),
        }
    }
    Ok(marker)
}

fn check_range(offset: u64, end_offset: Option<u64>) -> Result<(), ClientError> {
    match end_offset {
        Some(end) if end < offset => Err(ClientError::InvalidParameter("partial_end_offset")),
        _ => Ok(()),
    }
}

fn with_alg(attr: Option<&OperationAttributes>, alg: &str) -> OperationAttributes {
    let mut attr = attr.cloned().unwrap_or_default();
    attr.module_alg_str = Some(alg.to_string());
    attr
}

fn mode_of(attr: Option<&OperationAttributes>) -> Mode {
    attr.cloned().unwrap_or_default().mode
}

impl Handle {
    fn begin(&self, request: Request<'_>, callback: CompletionCallback) -> Result<(), ClientError> {
        let shared = &self.shared;
        let mut g = shared.lock();
        if g.op != Operation::Idle {
            return Err(ClientError::ObjectInUse("handle"));
        }
        let mut source = parse_endpoint(request.source)?;
        let mut dest = parse_endpoint(request.dest)?;
        if request.op == Operation::Transfer {
            if let (Some((su, sa)), Some((du, da))) = (source.as_mut(), dest.as_mut()) {
                normalize_third_party(su, sa, du, da)?;
            }
        }
        let (source_url, source_attr) = source.map_or((None, None), |(u, a)| (Some(u), a));
        let (dest_url, dest_attr) = dest.map_or((None, None), |(u, a)| (Some(u), a));

        g.op = request.op;
        g.state = HandleState::Start;
        g.source_url = source_url;
        g.source_attr = source_attr;
        g.dest_url = dest_url;
        g.dest_attr = dest_attr;
        g.args = request.args;
        g.marker = request.marker.unwrap_or_default();
        g.partial = request.partial;
        g.sink = request.sink;
        g.data_source = request.data_source;
        g.callback = Some(callback);
        g.err = None;
        g.output = None;
        check_out_targets(shared, &mut g);

        let event = g.verb_event();
        shared.log(Level::Debug, &format!("starting {}", PluginEvent::Verb(event.clone())));
        g = notify(shared, g, PluginEvent::Verb(event), CommandMask::ALL);
        match g.state {
            HandleState::Abort => {
                abandon(&mut g);
                return Err(ClientError::OperationAborted);
            }
            HandleState::Restart => {
                let g = restart::resume_after_close(shared, g);
                finish(g);
                return Ok(());
            }
            _ => {}
        }

        let (mut g, result) = activate_operation(shared, g);
        if result.is_err() {
            abandon(&mut g);
        }
        finish(g);
        result
    }

    /// Retrieves `url` into `sink`, resuming from `marker` when given.
    pub fn get<F>(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        marker: Option<&RestartMarker>,
        sink: SharedSink,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        let request = Request::new(Operation::Get)
            .source(url, attr.cloned())
            .marker(marker.cloned())
            .sink(sink);
        self.begin(request, Box::new(done))
    }

    /// `get` with a server-side `ERET` algorithm string.
    pub fn extended_get<F>(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        marker: Option<&RestartMarker>,
        eret_alg: &str,
        sink: SharedSink,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        if eret_alg.is_empty() {
            return Err(ClientError::NullParameter("eret_alg"));
        }
        let request = Request::new(Operation::Get)
            .source(url, Some(with_alg(attr, eret_alg)))
            .marker(marker.cloned())
            .sink(sink);
        self.begin(request, Box::new(done))
    }

    /// Retrieves bytes `offset..end_offset` of `url`, or everything from
    /// `offset` on when there is no end.
    pub fn partial_get<F>(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        marker: Option<&RestartMarker>,
        offset: u64,
        end_offset: Option<u64>,
        sink: SharedSink,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        check_range(offset, end_offset)?;
        let request = match end_offset {
            Some(end) => {
                let alg = format!("P {} {}", offset, end - offset);
                Request::new(Operation::Get)
                    .source(url, Some(with_alg(attr, &alg)))
                    .marker(marker.cloned())
                    .partial(offset, Some(end))
            }
            None => Request::new(Operation::Get)
                .source(url, attr.cloned())
                .marker(Some(open_ended_marker(marker, mode_of(attr), offset)?)),
        };
        self.begin(request.sink(sink), Box::new(done))
    }

    /// Stores the contents of `source` as `url`.
    pub fn put<F>(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        marker: Option<&RestartMarker>,
        source: SharedSource,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        let request = Request::new(Operation::Put)
            .dest(url, attr.cloned())
            .marker(marker.cloned())
            .data_source(source);
        self.begin(request, Box::new(done))
    }

    /// `put` with a server-side `ESTO` algorithm string.
    pub fn extended_put<F>(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        marker: Option<&RestartMarker>,
        esto_alg: &str,
        source: SharedSource,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        if esto_alg.is_empty() {
            return Err(ClientError::NullParameter("esto_alg"));
        }
        let request = Request::new(Operation::Put)
            .dest(url, Some(with_alg(attr, esto_alg)))
            .marker(marker.cloned())
            .data_source(source);
        self.begin(request, Box::new(done))
    }

    /// Stores bytes `offset..end_offset` of `source` at the same offsets of
    /// `url`, or everything from `offset` on when there is no end.
    pub fn partial_put<F>(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        marker: Option<&RestartMarker>,
        offset: u64,
        end_offset: Option<u64>,
        source: SharedSource,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        check_range(offset, end_offset)?;
        let request = match end_offset {
            Some(end) => Request::new(Operation::Put)
                .dest(url, Some(with_alg(attr, &format!("A {}", offset))))
                .marker(marker.cloned())
                .partial(offset, Some(end)),
            None => Request::new(Operation::Put)
                .dest(url, attr.cloned())
                .marker(Some(open_ended_marker(marker, mode_of(attr), offset)?)),
        };
        self.begin(request.data_source(source), Box::new(done))
    }

    /// Server-to-server copy from `source_url` to `dest_url`.
    pub fn third_party_transfer<F>(
        &self,
        source_url: &str,
        source_attr: Option<&OperationAttributes>,
        dest_url: &str,
        dest_attr: Option<&OperationAttributes>,
        marker: Option<&RestartMarker>,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        let request = Request::new(Operation::Transfer)
            .source(source_url, source_attr.cloned())
            .dest(dest_url, dest_attr.cloned())
            .marker(marker.cloned());
        self.begin(request, Box::new(done))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn extended_third_party_transfer<F>(
        &self,
        source_url: &str,
        source_attr: Option<&OperationAttributes>,
        eret_alg: Option<&str>,
        dest_url: &str,
        dest_attr: Option<&OperationAttributes>,
        esto_alg: Option<&str>,
        marker: Option<&RestartMarker>,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        let source_attr = match eret_alg {
            Some(alg) => Some(with_alg(source_attr, alg)),
            None => source_attr.cloned(),
        };
        let dest_attr = match esto_alg {
            Some(alg) => Some(with_alg(dest_attr, alg)),
            None => dest_attr.cloned(),
        };
        let request = Request::new(Operation::Transfer)
            .source(source_url, source_attr)
            .dest(dest_url, dest_attr)
            .marker(marker.cloned());
        self.begin(request, Box::new(done))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn partial_third_party_transfer<F>(
        &self,
        source_url: &str,
        source_attr: Option<&OperationAttributes>,
        dest_url: &str,
        dest_attr: Option<&OperationAttributes>,
        marker: Option<&RestartMarker>,
        offset: u64,
        end_offset: Option<u64>,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        check_range(offset, end_offset)?;
        let request = match end_offset {
            Some(end) => Request::new(Operation::Transfer)
                .source(
                    source_url,
                    Some(with_alg(source_attr, &format!("P {} {}", offset, end - offset))),
                )
                .dest(dest_url, Some(with_alg(dest_attr, &format!("A {}", offset))))
                .marker(marker.cloned())
                .partial(offset, Some(end)),
            None => Request::new(Operation::Transfer)
                .source(source_url, source_attr.cloned())
                .dest(dest_url, dest_attr.cloned())
                .marker(Some(open_ended_marker(marker, mode_of(source_attr), offset)?)),
        };
        self.begin(request, Box::new(done))
    }

    pub fn mkdir<F>(&self, url: &str, attr: Option<&OperationAttributes>, done: F) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.simple(Operation::Mkdir, url, attr, done)
    }

    pub fn rmdir<F>(&self, url: &str, attr: Option<&OperationAttributes>, done: F) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.simple(Operation::Rmdir, url, attr, done)
    }

    pub fn delete<F>(&self, url: &str, attr: Option<&OperationAttributes>, done: F) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.simple(Operation::Delete, url, attr, done)
    }

    /// Renames `source_url` to the path of `dest_url` on the source server.
    pub fn rename<F>(
        &self,
        source_url: &str,
        dest_url: &str,
        attr: Option<&OperationAttributes>,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        let request = Request::new(Operation::Move)
            .source(source_url, attr.cloned())
            .dest(dest_url, attr.cloned());
        self.begin(request, Box::new(done))
    }

    /// `SITE CHMOD`; `mode` is the octal permission bits.
    pub fn chmod<F>(
        &self,
        url: &str,
        mode: u32,
        attr: Option<&OperationAttributes>,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        let request = Request::new(Operation::Chmod)
            .source(url, attr.cloned())
            .args(VerbArgs::Chmod { mode });
        self.begin(request, Box::new(done))
    }

    /// Name list (`NLST`) of `url` into `sink`.
    pub fn list<F>(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        sink: SharedSink,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.listing(Operation::List, url, attr, sink, done)
    }

    /// `LIST`
    pub fn verbose_list<F>(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        sink: SharedSink,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.listing(Operation::VerboseList, url, attr, sink, done)
    }

    /// `MLSD`
    pub fn machine_list<F>(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        sink: SharedSink,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.listing(Operation::MachineList, url, attr, sink, done)
    }

    /// Facts about one file; completes with `Completion::Mlst`.
    pub fn mlst<F>(&self, url: &str, attr: Option<&OperationAttributes>, done: F) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.simple(Operation::Mlst, url, attr, done)
    }

    pub fn stat<F>(&self, url: &str, attr: Option<&OperationAttributes>, done: F) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.simple(Operation::Stat, url, attr, done)
    }

    pub fn cwd<F>(&self, url: &str, attr: Option<&OperationAttributes>, done: F) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.simple(Operation::Cwd, url, attr, done)
    }

    pub fn size<F>(&self, url: &str, attr: Option<&OperationAttributes>, done: F) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.simple(Operation::Size, url, attr, done)
    }

    pub fn modification_time<F>(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.simple(Operation::Mdtm, url, attr, done)
    }

    /// Checksum of `length` bytes from `offset` (`-1` for the rest of the
    /// file) computed by the server with `algorithm`.
    #[allow(clippy::too_many_arguments)]
    pub fn cksm<F>(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        algorithm: &str,
        offset: u64,
        length: i64,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        if algorithm.is_empty() {
            return Err(ClientError::NullParameter("algorithm"));
        }
        if length < -1 {
            return Err(ClientError::InvalidParameter("length"));
        }
        let request = Request::new(Operation::Cksm)
            .source(url, attr.cloned())
            .args(VerbArgs::Cksm {
                algorithm: algorithm.to_string(),
                offset,
                length,
            });
        self.begin(request, Box::new(done))
    }

    /// Connects (or reuses a cached connection) and completes with the
    /// server's feature table.
    pub fn feat<F>(&self, url: &str, attr: Option<&OperationAttributes>, done: F) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.simple(Operation::Feat, url, attr, done)
    }

    fn simple<F>(
        &self,
        op: Operation,
        url: &str,
        attr: Option<&OperationAttributes>,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        self.begin(Request::new(op).source(url, attr.cloned()), Box::new(done))
    }

    fn listing<F>(
        &self,
        op: Operation,
        url: &str,
        attr: Option<&OperationAttributes>,
        sink: SharedSink,
        done: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Completion, ClientError>) + Send + 'static,
    {
        let request = Request::new(op).source(url, attr.cloned()).sink(sink);
        self.begin(request, Box::new(done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> FtpUrl {
        FtpUrl::parse(s).unwrap()
    }

    #[test]
    fn test_cross_scheme_drops_dcau() {
        let mut sa = None;
        let mut da = None;
        normalize_third_party(&url("ftp://a/x"), &mut sa, &url("gsiftp://b/y"), &mut da).unwrap();
        assert_eq!(sa.unwrap().dcau, crate::attr::Dcau::None);
        assert_eq!(da.unwrap().dcau, crate::attr::Dcau::None);

        let mut sa = None;
        let mut da = None;
        normalize_third_party(&url("gsiftp://a/x"), &mut sa, &url("gsiftp://b/y"), &mut da).unwrap();
        assert!(sa.is_none() && da.is_none());
    }

    #[test]
    fn test_third_party_modes_must_match() {
        let mut eb = OperationAttributes::new();
        eb.set_mode(Mode::ExtendedBlock);
        let mut sa = Some(eb);
        let mut da = None;
        let err = normalize_third_party(&url("gsiftp://a/x"), &mut sa, &url("gsiftp://b/y"), &mut da);
        assert!(matches!(err, Err(ClientError::InvalidParameter("mode"))));
    }

    #[test]
    fn test_open_ended_marker() {
        let stream = open_ended_marker(None, Mode::Stream, 100).unwrap();
        assert_eq!(stream.stream_offset(false), Some(100));
        let eb = open_ended_marker(None, Mode::ExtendedBlock, 100).unwrap();
        assert_eq!(eb.total(), 100);
        assert!(open_ended_marker(None, Mode::ExtendedBlock, 0).unwrap().is_empty());
        assert!(check_range(10, Some(5)).is_err());
        assert!(check_range(10, Some(10)).is_ok());
    }
}
