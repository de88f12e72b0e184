//! Reply-driven state machine.
//!
//! Every driver callback lands in one of the `on_*` functions below, which
//! take the handle lock, look the target up by id (a target that is no
//! longer part of the operation is ignored), advance its state and issue
//! the next request. Functions that may run plugins take the guard by
//! value and hand back the re-acquired one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::{
    finish, notify, notify_abort, restart, Completion, Guard, HandleState, Inner, Operation,
    Shared, Side,
};
use crate::attr::{DataType, Mode};
use crate::command::Command;
use crate::control::{BlockCallback, CloseCallback, ControlConnection, DataRequest, Direction, ReplyCallback};
use crate::data::Block;
use crate::error::ClientError;
use crate::features::{Feature, Tristate};
use crate::logging::Level;
use crate::plugin::{CommandMask, PluginEvent, VerbArgs};
use crate::reply::{self, Reply, ReplyClass};
use crate::target::{CachedDataConn, Setting, Step, Target, TargetId, TargetState};
use crate::cache::Released;

/// A reply (or its absence) sorted by what the state machine does with it.
enum Outcome {
    /// Preliminary reply; the final one is still to come.
    Pending(Reply),
    /// `None` for a faked reply.
    Positive(Option<Reply>),
    Negative(Reply),
    Failed(ClientError),
}

fn classify(result: Result<Option<Reply>, ClientError>, intermediate_ok: bool) -> Outcome {
    match result {
        Err(e) => Outcome::Failed(e),
        Ok(None) => Outcome::Positive(None),
        Ok(Some(r)) => match r.class() {
            ReplyClass::Preliminary => Outcome::Pending(r),
            ReplyClass::Completion => Outcome::Positive(Some(r)),
            ReplyClass::Intermediate if intermediate_ok => Outcome::Positive(Some(r)),
            _ => Outcome::Negative(r),
        },
    }
}

pub(super) fn reply_callback(shared: &Arc<Shared>, id: TargetId) -> ReplyCallback {
    let weak = Arc::downgrade(shared);
    Box::new(move |result| {
        if let Some(shared) = weak.upgrade() {
            on_reply(&shared, id, result.map(Some));
        }
    })
}

fn close_callback(shared: &Arc<Shared>, id: TargetId) -> CloseCallback {
    let weak = Arc::downgrade(shared);
    Box::new(move || {
        if let Some(shared) = weak.upgrade() {
            force_close_callback(&shared, id);
        }
    })
}

fn block_callback(shared: &Arc<Shared>, id: TargetId) -> BlockCallback {
    let weak = Arc::downgrade(shared);
    Box::new(move |block| {
        if let Some(shared) = weak.upgrade() {
            on_data(&shared, id, block);
        }
    })
}

/// Entry point for every reply; `None` is the faked NOOP success.
pub(super) fn on_reply(shared: &Arc<Shared>, id: TargetId, result: Result<Option<Reply>, ClientError>) {
    let mut g = shared.lock();
    let Some(side) = g.side_of(id) else {
        return finish(g);
    };
    let (url, mask) = match g.target_mut(side) {
        Some(t) => {
            t.touch();
            (t.url.clone(), t.mask)
        }
        None => return finish(g),
    };
    let response = match &result {
        Ok(Some(r)) => Some(Ok(r.clone())),
        Ok(None) => None,
        Err(e) => Some(Err(e.clone())),
    };
    if let Some(result) = response {
        g = notify(shared, g, PluginEvent::Response { url, result }, mask);
    }
    if g.interrupted() || g.side_of(id) != Some(side) {
        return finish(g);
    }
    let g = dispatch(shared, g, side, result);
    finish(g);
}

fn dispatch<'a>(
    shared: &'a Arc<Shared>,
    g: Guard<'a>,
    side: Side,
    result: Result<Option<Reply>, ClientError>,
) -> Guard<'a> {
    let Some(state) = g.target_state(side) else {
        return g;
    };
    match state {
        TargetState::Connect => on_connect(shared, g, side, result),
        TargetState::Authenticate => on_authenticate(shared, g, side, result),
        TargetState::SiteHelp => on_site_help(shared, g, side, result),
        TargetState::Feat => on_feat(shared, g, side, result),
        TargetState::Noop => on_noop(shared, g, side, result),
        TargetState::Type
        | TargetState::Mode
        | TargetState::Bufsize
        | TargetState::RetrOpts
        | TargetState::Dcau
        | TargetState::Pbsz
        | TargetState::Prot
        | TargetState::Pasv
        | TargetState::Port
        | TargetState::Allo
        | TargetState::Rest
        | TargetState::Rnfr => on_step_reply(shared, g, side, result),
        TargetState::ReadyForData => on_transfer_reply(shared, g, side, result),
        TargetState::NeedComplete => on_need_complete(shared, g, side, result),
        _ => g,
    }
}

fn on_connect<'a>(
    shared: &'a Arc<Shared>,
    mut g: Guard<'a>,
    side: Side,
    result: Result<Option<Reply>, ClientError>,
) -> Guard<'a> {
    match classify(result, false) {
        Outcome::Pending(_) => g,
        Outcome::Failed(e) => fault(shared, g, side, e),
        Outcome::Negative(r) => fault(shared, g, side, ClientError::from_reply(&r)),
        Outcome::Positive(_) => {
            let Some(t) = g.target_mut(side) else {
                return g;
            };
            t.state = TargetState::Authenticate;
            t.mask = CommandMask::CONTROL_ESTABLISHMENT;
            let (id, url, auth) = (t.id, t.url.clone(), t.attr.auth.clone());
            g = notify(
                shared,
                g,
                PluginEvent::Authenticate {
                    url,
                    auth: auth.clone(),
                },
                CommandMask::CONTROL_ESTABLISHMENT,
            );
            let Some(control) = live_control(&g, side, id) else {
                return g;
            };
            match control.authenticate(&auth, reply_callback(shared, id)) {
                Ok(()) => g,
                Err(e) => fault(shared, g, side, e),
            }
        }
    }
}

fn on_authenticate<'a>(
    shared: &'a Arc<Shared>,
    g: Guard<'a>,
    side: Side,
    result: Result<Option<Reply>, ClientError>,
) -> Guard<'a> {
    match classify(result, false) {
        Outcome::Pending(_) => g,
        Outcome::Failed(e) => fault(shared, g, side, e),
        Outcome::Negative(r) => fault(shared, g, side, ClientError::from_reply(&r)),
        Outcome::Positive(_) => {
            let probed = g.target(side).is_some_and(|t| t.features.probed);
            if probed {
                setup(shared, g, side)
            } else {
                send_command(
                    shared,
                    g,
                    side,
                    TargetState::SiteHelp,
                    CommandMask::INFORMATION,
                    Command::SiteHelp,
                )
            }
        }
    }
}

fn on_site_help<'a>(
    shared: &'a Arc<Shared>,
    mut g: Guard<'a>,
    side: Side,
    result: Result<Option<Reply>, ClientError>,
) -> Guard<'a> {
    match classify(result, false) {
        Outcome::Pending(_) => g,
        Outcome::Failed(e) => fault(shared, g, side, e),
        outcome => {
            if let (Outcome::Positive(Some(r)), Some(t)) = (&outcome, g.target_mut(side)) {
                t.features.parse_site_help(r);
            }
            send_command(
                shared,
                g,
                side,
                TargetState::Feat,
                CommandMask::INFORMATION,
                Command::Feat,
            )
        }
    }
}

fn on_feat<'a>(
    shared: &'a Arc<Shared>,
    mut g: Guard<'a>,
    side: Side,
    result: Result<Option<Reply>, ClientError>,
) -> Guard<'a> {
    match classify(result, false) {
        Outcome::Pending(_) => g,
        Outcome::Failed(e) => fault(shared, g, side, e),
        outcome => {
            if let Some(t) = g.target_mut(side) {
                if let Outcome::Positive(Some(r)) = &outcome {
                    t.features.parse_feat(r);
                }
                // a refused FEAT leaves the table unknown
                t.features.probed = true;
            }
            setup(shared, g, side)
        }
    }
}

/// Answer to the liveness probe of a cached connection.
fn on_noop<'a>(
    shared: &'a Arc<Shared>,
    mut g: Guard<'a>,
    side: Side,
    result: Result<Option<Reply>, ClientError>,
) -> Guard<'a> {
    match classify(result, false) {
        Outcome::Pending(_) => g,
        Outcome::Positive(_) => setup(shared, g, side),
        Outcome::Negative(_) | Outcome::Failed(_) => {
            // stale cached connection: drop it and start over on a new one
            let Some(mut stale) = g.slot(side).take() else {
                return g;
            };
            shared.log(
                Level::Debug,
                &format!("cached connection to {} is stale, reconnecting", stale.url.endpoint()),
            );
            stale.state = TargetState::Fault;
            shutdown_target(stale);
            let (url, attr) = match side {
                Side::Source => (g.source_url.clone(), g.source_attr.clone()),
                Side::Dest => (g.dest_url.clone(), g.dest_attr.clone()),
            };
            let Some(url) = url else {
                return g;
            };
            let fresh = g.cache.find_or_create(&url, attr.as_ref(), &shared.config);
            *g.slot(side) = Some(fresh);
            activate(shared, g, side)
        }
    }
}

/// The target is connected and probed; build and start its share of the
/// operation.
fn setup<'a>(shared: &'a Arc<Shared>, mut g: Guard<'a>, side: Side) -> Guard<'a> {
    if g.op == Operation::Feat {
        let Some(t) = g.target_mut(side) else {
            return g;
        };
        t.state = TargetState::CompletedOperation;
        let features = t.features.clone();
        g.output = Some(Completion::Features(features));
        return transfer_complete(shared, g);
    }
    let reuse = can_reuse_data_conn(&g);
    let plan = build_plan(&g, side, reuse);
    if let Some(t) = g.target_mut(side) {
        t.plan = plan;
    }
    advance(shared, g, side)
}

/// Commands the target still has to send for the current operation.
fn build_plan(g: &Inner, side: Side, reuse: bool) -> VecDeque<Step> {
    let Some(t) = g.target(side) else {
        return VecDeque::new();
    };
    let op = g.op;
    let mut plan = VecDeque::new();
    if op.uses_data_channel() {
        let retrieving = side == Side::Source;
        plan.extend(t.negotiation(retrieving).into_iter().map(Step::Negotiate));
    } else if matches!(op, Operation::Size | Operation::Cksm) {
        plan.extend(
            t.negotiation(false)
                .into_iter()
                .filter(|s| matches!(s, Setting::Type(_)))
                .map(Step::Negotiate),
        );
    }
    // an algorithm string already says which bytes to move
    let rest = (!g.marker.is_empty() && t.attr.module_alg_str.is_none())
        .then(|| Step::Rest(g.marker.wire_marker(t.attr.data_type == DataType::Ascii)));
    let allo = t.attr.allocated_size.map(Step::Allo);
    match (op, side) {
        (Operation::Get, _) => {
            if !reuse {
                plan.push_back(Step::Pasv);
            }
            plan.extend(rest);
            plan.push_back(Step::Verb);
        }
        (Operation::List | Operation::VerboseList | Operation::MachineList, _) => {
            if !reuse {
                plan.push_back(Step::Pasv);
            }
            plan.push_back(Step::Verb);
        }
        (Operation::Put, _) => {
            if !reuse {
                plan.push_back(Step::Pasv);
            }
            plan.extend(allo);
            plan.extend(rest);
            plan.push_back(Step::Verb);
        }
        (Operation::Transfer, Side::Dest) => {
            if !reuse {
                plan.push_back(Step::Pasv);
            }
            plan.extend(allo);
            plan.extend(rest);
            plan.push_back(Step::HandOff);
        }
        (Operation::Transfer, Side::Source) => {
            if !reuse {
                plan.push_back(Step::Port);
            }
            plan.extend(rest);
            plan.push_back(Step::StartThirdParty);
        }
        (Operation::Move, _) => {
            plan.push_back(Step::Rnfr(t.url.path.clone()));
            plan.push_back(Step::Verb);
        }
        _ => plan.push_back(Step::Verb),
    }
    plan
}

/// Issues the next step of the target's plan.
fn advance<'a>(shared: &'a Arc<Shared>, mut g: Guard<'a>, side: Side) -> Guard<'a> {
    let Some(step) = g.target_mut(side).and_then(|t| t.plan.pop_front()) else {
        return g;
    };
    let command = match &step {
        Step::Negotiate(setting) => setting.command(),
        Step::Pasv => Command::Pasv,
        Step::Port => {
            let address = g
                .dest
                .as_ref()
                .and_then(|d| d.pasv_addr)
                .and_then(|a| reply::format_host_port(&a));
            match address {
                Some(address) => Command::Port(address),
                None => {
                    let e = ClientError::UnsupportedFeature("PORT to this passive address".into());
                    return fault(shared, g, side, e);
                }
            }
        }
        Step::Allo(n) => Command::Allo(*n),
        Step::Rest(marker) => Command::Rest(marker.clone()),
        Step::Rnfr(path) => Command::Rnfr(path.clone()),
        Step::Verb => return run_verb(shared, g, side),
        Step::HandOff => return hand_off(shared, g, side),
        Step::StartThirdParty => return start_third_party(shared, g),
    };
    if let Some(t) = g.target_mut(side) {
        t.pending = Some(step.clone());
    }
    send_command(shared, g, side, step.state(), step.mask(), command)
}

fn on_step_reply<'a>(
    shared: &'a Arc<Shared>,
    mut g: Guard<'a>,
    side: Side,
    result: Result<Option<Reply>, ClientError>,
) -> Guard<'a> {
    let Some(step) = g.target_mut(side).and_then(|t| t.pending.take()) else {
        return g;
    };
    match classify(result, step.expects_intermediate()) {
        Outcome::Pending(_) => {
            if let Some(t) = g.target_mut(side) {
                t.pending = Some(step);
            }
            g
        }
        Outcome::Failed(e) => fault(shared, g, side, e),
        Outcome::Positive(reply) => {
            let Some(t) = g.target_mut(side) else {
                return g;
            };
            match &step {
                Step::Negotiate(setting) => setting.record(&mut t.current),
                Step::Pasv => match reply.as_ref().and_then(reply::parse_pasv) {
                    Some(address) => t.pasv_addr = Some(address),
                    None => {
                        let e = ClientError::Protocol("unparsable PASV reply".into());
                        return fault(shared, g, side, e);
                    }
                },
                _ => {}
            }
            advance(shared, g, side)
        }
        Outcome::Negative(r) => match step {
            Step::Negotiate(Setting::Sbuf(n)) => {
                if let Some(t) = g.target_mut(side) {
                    t.features.set(Feature::Sbuf, Tristate::False);
                    t.plan.push_front(Step::Negotiate(Setting::SiteBufsize(n)));
                }
                advance(shared, g, side)
            }
            // the server keeps its default buffer size
            Step::Negotiate(Setting::SiteBufsize(_)) => advance(shared, g, side),
            Step::Allo(_) | Step::Rest(_) | Step::Rnfr(_) => verb_failed(shared, g, side, &r),
            _ => fault(shared, g, side, ClientError::from_reply(&r)),
        },
    }
}

/// Sends the operation's own command on a target whose plan is done.
fn run_verb<'a>(shared: &'a Arc<Shared>, g: Guard<'a>, side: Side) -> Guard<'a> {
    let op = g.op;
    if op.is_retrieve() || op == Operation::Put {
        return start_data_transfer(shared, g, side);
    }
    let Some(path) = g.target(side).map(|t| t.url.path.clone()) else {
        return g;
    };
    let command = match (op, &g.args) {
        (Operation::Mkdir, _) => Command::Mkd(path),
        (Operation::Rmdir, _) => Command::Rmd(path),
        (Operation::Delete, _) => Command::Dele(path),
        (Operation::Move, _) => match g.dest_url.as_ref() {
            Some(to) => Command::Rnto(to.path.clone()),
            None => return fault(shared, g, side, ClientError::NullParameter("dest_url")),
        },
        (Operation::Chmod, VerbArgs::Chmod { mode }) => Command::Chmod { mode: *mode, path },
        (
            Operation::Cksm,
            VerbArgs::Cksm {
                algorithm,
                offset,
                length,
            },
        ) => Command::Cksm {
            algorithm: algorithm.clone(),
            offset: *offset,
            length: *length,
            path,
        },
        (Operation::Mlst, _) => Command::Mlst(path),
        (Operation::Stat, _) => Command::Stat(path),
        (Operation::Cwd, _) => Command::Cwd(path),
        (Operation::Size, _) => Command::Size(path),
        (Operation::Mdtm, _) => Command::Mdtm(path),
        _ => return fault(shared, g, side, ClientError::InvalidOperation(op)),
    };
    send_command(
        shared,
        g,
        side,
        TargetState::NeedComplete,
        CommandMask::FILE_ACTIONS,
        command,
    )
}

/// Get, list and put: the data command plus the local end of the data
/// channel.
fn start_data_transfer<'a>(shared: &'a Arc<Shared>, mut g: Guard<'a>, side: Side) -> Guard<'a> {
    let op = g.op;
    let reuse = can_reuse_data_conn(&g);
    let marker = g.marker.clone();
    let partial_start = g.partial.map(|(start, _)| start);
    let partial_end = g.partial.and_then(|(_, end)| end);
    let sink = g.sink.clone();
    let data_source = g.data_source.clone();
    let Some(t) = g.target_mut(side) else {
        return g;
    };
    let (id, url) = (t.id, t.url.clone());
    let path = url.path.clone();
    let mode = t.attr.mode;
    let alg = t.attr.module_alg_str.clone();
    let address = if reuse { None } else { t.pasv_addr };

    // local offsets are binary; only REST speaks in ASCII offsets
    let resume_at = marker.stream_offset(false).unwrap_or(0);
    let (command, direction, base_offset, event) = if op.is_retrieve() {
        let Some(sink) = sink else {
            return fault(shared, g, side, ClientError::NullParameter("sink"));
        };
        let (command, base) = match (op, alg) {
            (Operation::List, _) => (Command::Nlst(path), 0),
            (Operation::VerboseList, _) => (Command::List(path), 0),
            (Operation::MachineList, _) => (Command::Mlsd(path), 0),
            (_, Some(alg)) => (Command::Eret { alg, path }, partial_start.unwrap_or(0)),
            (_, None) => (Command::Retr(path), resume_at),
        };
        (command, Direction::Receive(sink), base, PluginEvent::Read { url: url.clone() })
    } else {
        let Some(source) = data_source else {
            return fault(shared, g, side, ClientError::NullParameter("source"));
        };
        let skip = match mode {
            Mode::ExtendedBlock => marker.ranges().to_vec(),
            Mode::Stream => Vec::new(),
        };
        let (command, base, end) = match alg {
            Some(alg) => (Command::Esto { alg, path }, partial_start.unwrap_or(0), partial_end),
            None if t.attr.append => (Command::Appe(path), resume_at, None),
            None => (Command::Stor(path), resume_at, None),
        };
        let direction = Direction::Send { source, end, skip };
        (command, direction, base, PluginEvent::Write { url: url.clone() })
    };

    t.state = TargetState::ReadyForData;
    t.mask = CommandMask::FILE_ACTIONS;
    t.cached_data_conn = if op.is_retrieve() {
        CachedDataConn {
            source: Some(id),
            dest: None,
            operation: Operation::Get,
        }
    } else {
        CachedDataConn {
            source: None,
            dest: Some(id),
            operation: Operation::Put,
        }
    };
    g.state = if op.is_retrieve() {
        HandleState::SourceListOrRetrieve
    } else {
        HandleState::DestStoreOrEsto
    };
    g = notify(
        shared,
        g,
        PluginEvent::Command {
            url,
            command: command.to_string(),
        },
        CommandMask::FILE_ACTIONS,
    );
    if g.interrupted() {
        return g;
    }
    g = notify(shared, g, event, CommandMask::FILE_ACTIONS);
    let Some(control) = live_control(&g, side, id) else {
        return g;
    };
    let request = DataRequest {
        address,
        mode,
        direction,
        base_offset,
        on_block: block_callback(shared, id),
    };
    match control.transfer(&command, request, reply_callback(shared, id)) {
        Ok(()) => g,
        Err(e) => fault(shared, g, side, e),
    }
}

/// Third-party destination is listening; bring up the source.
fn hand_off<'a>(shared: &'a Arc<Shared>, mut g: Guard<'a>, side: Side) -> Guard<'a> {
    if let Some(t) = g.target_mut(side) {
        t.state = TargetState::Waiting;
    }
    activate(shared, g, Side::Source)
}

/// Both sides are set up: store on the destination, retrieve on the source.
fn start_third_party<'a>(shared: &'a Arc<Shared>, mut g: Guard<'a>) -> Guard<'a> {
    let inner = &mut *g;
    let (Some(source), Some(dest)) = (inner.source.as_mut(), inner.dest.as_mut()) else {
        return g;
    };
    let retrieve = match source.attr.module_alg_str.clone() {
        Some(alg) => Command::Eret {
            alg,
            path: source.url.path.clone(),
        },
        None => Command::Retr(source.url.path.clone()),
    };
    let store = match dest.attr.module_alg_str.clone() {
        Some(alg) => Command::Esto {
            alg,
            path: dest.url.path.clone(),
        },
        None if dest.attr.append => Command::Appe(dest.url.path.clone()),
        None => Command::Stor(dest.url.path.clone()),
    };
    let pair = CachedDataConn {
        source: Some(source.id),
        dest: Some(dest.id),
        operation: Operation::Transfer,
    };
    source.cached_data_conn = pair;
    dest.cached_data_conn = pair;
    g.state = HandleState::ThirdPartyTransfer;
    g = send_command(
        shared,
        g,
        Side::Dest,
        TargetState::ReadyForData,
        CommandMask::FILE_ACTIONS,
        store,
    );
    if g.interrupted() {
        return g;
    }
    send_command(
        shared,
        g,
        Side::Source,
        TargetState::ReadyForData,
        CommandMask::FILE_ACTIONS,
        retrieve,
    )
}

/// Replies to a data command, local or third-party.
fn on_transfer_reply<'a>(
    shared: &'a Arc<Shared>,
    mut g: Guard<'a>,
    side: Side,
    result: Result<Option<Reply>, ClientError>,
) -> Guard<'a> {
    match classify(result, false) {
        Outcome::Pending(r) => {
            if let Some(marker) = reply::parse_restart_marker(&r) {
                merge_marker(&mut g, &marker);
            }
            g
        }
        Outcome::Failed(e) => fault(shared, g, side, e),
        Outcome::Negative(r) => verb_failed(shared, g, side, &r),
        Outcome::Positive(_) => {
            if let Some(t) = g.target_mut(side) {
                t.state = TargetState::CompletedOperation;
            }
            if g.op != Operation::Transfer {
                return transfer_complete(shared, g);
            }
            match g.state {
                HandleState::ThirdPartyTransfer => {
                    g.state = HandleState::ThirdPartyTransferOneComplete;
                    g
                }
                HandleState::ThirdPartyTransferOneComplete => transfer_complete(shared, g),
                _ => g,
            }
        }
    }
}

fn merge_marker(g: &mut Inner, marker: &crate::restart_marker::RestartMarker) {
    match marker.stream_offset(false) {
        Some(offset) => g.marker.set_offset(offset),
        None => {
            for range in marker.ranges() {
                let _ = g.marker.insert_range(range.start, range.end);
            }
        }
    }
}

fn on_need_complete<'a>(
    shared: &'a Arc<Shared>,
    mut g: Guard<'a>,
    side: Side,
    result: Result<Option<Reply>, ClientError>,
) -> Guard<'a> {
    match classify(result, false) {
        Outcome::Pending(_) => g,
        Outcome::Failed(e) => fault(shared, g, side, e),
        Outcome::Negative(r) => verb_failed(shared, g, side, &r),
        Outcome::Positive(reply) => {
            match verb_output(g.op, reply.as_ref()) {
                Ok(output) => g.output = Some(output),
                Err(e) => g.set_error(e),
            }
            if let Some(t) = g.target_mut(side) {
                t.state = TargetState::CompletedOperation;
            }
            transfer_complete(shared, g)
        }
    }
}

fn verb_output(op: Operation, reply: Option<&Reply>) -> Result<Completion, ClientError> {
    let Some(reply) = reply else {
        return Ok(Completion::Done);
    };
    let unparsable = || ClientError::Protocol(format!("unexpected {} reply: {}", op, reply.text));
    match op {
        Operation::Size => reply::parse_size(reply).map(Completion::Size).ok_or_else(unparsable),
        Operation::Mdtm => reply::parse_mdtm(reply)
            .map(Completion::ModificationTime)
            .ok_or_else(unparsable),
        Operation::Cksm => reply::parse_cksm(reply)
            .map(Completion::Checksum)
            .ok_or_else(unparsable),
        Operation::Mlst => reply::parse_mlst(reply).map(Completion::Mlst).ok_or_else(unparsable),
        Operation::Stat => Ok(Completion::Stat(reply::parse_stat(reply))),
        Operation::Cwd => Ok(Completion::Cwd(reply::parse_cwd(reply))),
        _ => Ok(Completion::Done),
    }
}

/// The server refused the operation itself. The connection is fine, so
/// only a third-party transfer (whose other side must be stopped) treats
/// this as a fault.
fn verb_failed<'a>(shared: &'a Arc<Shared>, mut g: Guard<'a>, side: Side, r: &Reply) -> Guard<'a> {
    let err = ClientError::from_reply(r);
    if g.op == Operation::Transfer {
        return fault(shared, g, side, err);
    }
    g.set_error(err);
    if let Some(t) = g.target_mut(side) {
        t.state = TargetState::CompletedOperation;
    }
    g.state = HandleState::Failure;
    transfer_complete(shared, g)
}

fn on_data(shared: &Arc<Shared>, id: TargetId, block: Block) {
    let mut g = shared.lock();
    let Some(side) = g.side_of(id) else {
        return finish(g);
    };
    if g.interrupted() {
        return finish(g);
    }
    let Some((url, mode, ascii)) = g
        .target(side)
        .map(|t| (t.url.clone(), t.attr.mode, t.attr.data_type == DataType::Ascii))
    else {
        return finish(g);
    };
    if matches!(g.op, Operation::Get | Operation::Put) && block.length > 0 {
        let end = block.offset + block.length;
        match mode {
            Mode::ExtendedBlock => {
                let _ = g.marker.insert_range(block.offset, end - 1);
            }
            Mode::Stream if ascii => {
                // CRLF bytes already on the wire before this block
                let before = match (g.marker.stream_offset(false), g.marker.stream_offset(true)) {
                    (Some(offset), Some(ascii_offset)) if offset == block.offset => ascii_offset,
                    _ => block.offset,
                };
                g.marker
                    .set_ascii_offset(end, before + block.length + block.newlines);
            }
            Mode::Stream => g.marker.set_offset(end),
        }
    }
    let event = PluginEvent::Data {
        url,
        offset: block.offset,
        length: block.length,
        eof: block.eof,
    };
    g = notify(shared, g, event, CommandMask::ALL);
    finish(g);
}

/// Sets the target's state and mask, tells plugins, and sends `command`.
fn send_command<'a>(
    shared: &'a Arc<Shared>,
    mut g: Guard<'a>,
    side: Side,
    state: TargetState,
    mask: CommandMask,
    command: Command,
) -> Guard<'a> {
    let Some(t) = g.target_mut(side) else {
        return g;
    };
    t.state = state;
    t.mask = mask;
    let (id, url) = (t.id, t.url.clone());
    g = notify(
        shared,
        g,
        PluginEvent::Command {
            url,
            command: command.to_string(),
        },
        mask,
    );
    let Some(control) = live_control(&g, side, id) else {
        return g;
    };
    match control.send_command(&command, reply_callback(shared, id)) {
        Ok(()) => g,
        Err(e) => fault(shared, g, side, e),
    }
}

/// The target's connection, unless the operation stopped or moved on
/// while plugins ran.
fn live_control(g: &Inner, side: Side, id: TargetId) -> Option<Arc<dyn ControlConnection>> {
    if g.interrupted() {
        return None;
    }
    g.target(side).filter(|t| t.id == id)?.control.clone()
}

/// Starts a target: a fresh one connects, a cached one is probed with
/// `NOOP` (or a faked success when it was used recently).
pub(super) fn target_activate<'a>(
    shared: &'a Arc<Shared>,
    mut g: Guard<'a>,
    side: Side,
) -> (Guard<'a>, Result<(), ClientError>) {
    let Some(t) = g.target_mut(side) else {
        return (g, Err(ClientError::InvalidParameter("target")));
    };
    let (id, url, state, idle) = (t.id, t.url.clone(), t.state, t.last_access.elapsed());
    match state {
        TargetState::Start => {
            t.mask = CommandMask::CONTROL_ESTABLISHMENT;
            let connecting = match side {
                Side::Source => HandleState::SourceConnect,
                Side::Dest => HandleState::DestConnect,
            };
            g.state = connecting;
            shared.log(Level::Debug, &format!("connecting to {}", url.endpoint()));
            g = notify(
                shared,
                g,
                PluginEvent::Connect { url: url.clone() },
                CommandMask::CONTROL_ESTABLISHMENT,
            );
            if g.state != connecting || g.side_of(id) != Some(side) {
                return (g, Ok(()));
            }
            let control = match shared.factory.open(&url, &shared.config) {
                Ok(control) => control,
                Err(e) => return (g, Err(e)),
            };
            if let Some(t) = g.target_mut(side) {
                t.control = Some(Arc::clone(&control));
                t.state = TargetState::Connect;
            }
            let result = control.connect(&url, reply_callback(shared, id));
            (g, result)
        }
        TargetState::SetupConnection => {
            g.state = match side {
                Side::Source => HandleState::SourceSetupConnection,
                Side::Dest => HandleState::DestSetupConnection,
            };
            if idle >= shared.config.noop_idle() {
                let g = send_command(
                    shared,
                    g,
                    side,
                    TargetState::Noop,
                    CommandMask::MISC,
                    Command::Noop,
                );
                return (g, Ok(()));
            }
            if let Some(t) = g.target_mut(side) {
                t.state = TargetState::Noop;
                t.mask = CommandMask::MISC;
            }
            let weak = Arc::downgrade(shared);
            let faked = shared.reactor.register_oneshot(
                Duration::ZERO,
                Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        on_reply(&shared, id, Ok(None));
                    }
                }),
            );
            (g, faked.map(|_| ()))
        }
        _ => (g, Err(ClientError::InvalidParameter("target"))),
    }
}

/// `target_activate` from inside a callback: failures become faults.
pub(super) fn activate<'a>(shared: &'a Arc<Shared>, g: Guard<'a>, side: Side) -> Guard<'a> {
    let (g, result) = target_activate(shared, g, side);
    match result {
        Ok(()) => g,
        Err(e) => fault(shared, g, side, e),
    }
}

/// Reports a local or transport fault to plugins, then fails the
/// operation unless one of them asked for a restart.
pub(super) fn fault<'a>(
    shared: &'a Arc<Shared>,
    mut g: Guard<'a>,
    side: Side,
    err: ClientError,
) -> Guard<'a> {
    let id = g.target(side).map(|t| t.id);
    let url = g.target(side).map(|t| t.url.clone());
    let location = url.as_ref().map_or_else(|| "?".to_string(), |u| u.endpoint());
    shared.log(Level::Error, &format!("{} failed on {}: {}", g.op, location, err));
    g = notify(
        shared,
        g,
        PluginEvent::Fault {
            url,
            error: err.clone(),
        },
        CommandMask::ALL,
    );
    // a restart may have finished and replaced the target meanwhile
    if id.is_some_and(|id| g.side_of(id) != Some(side)) {
        return g;
    }
    connection_error(shared, g, side, err)
}

fn connection_error<'a>(
    shared: &'a Arc<Shared>,
    mut g: Guard<'a>,
    side: Side,
    err: ClientError,
) -> Guard<'a> {
    match g.state {
        HandleState::Restart => {
            if let Some(t) = g.target_mut(side) {
                if t.state != TargetState::Closed {
                    t.state = TargetState::Fault;
                }
            }
            return g;
        }
        HandleState::Abort | HandleState::Failure | HandleState::Finalize => return g,
        _ => {}
    }
    g.set_error(err);
    g.state = HandleState::Failure;
    if g.op != Operation::Transfer {
        if let Some(t) = g.target_mut(side) {
            t.state = TargetState::Fault;
        }
        return transfer_complete(shared, g);
    }
    let other_busy = g.target_state(side.other()).is_some_and(|s| {
        !matches!(
            s,
            TargetState::Start
                | TargetState::SetupConnection
                | TargetState::Closed
                | TargetState::CompletedOperation
        )
    });
    let mut closing = close_target(shared, &mut g, side);
    if other_busy {
        closing |= close_target(shared, &mut g, side.other());
    }
    if closing {
        g
    } else {
        transfer_complete(shared, g)
    }
}

/// Force-closes a target that is not already going down and marks it
/// faulted. Returns whether a close callback is now on its way.
fn close_target(shared: &Arc<Shared>, g: &mut Inner, side: Side) -> bool {
    let Some(t) = g.target_mut(side) else {
        return false;
    };
    if matches!(t.state, TargetState::Fault | TargetState::Closed) {
        return false;
    }
    t.state = TargetState::Fault;
    force_close_target(shared, t);
    true
}

/// Tears the connection down; the close callback always follows, faked
/// through the reactor when there is no connection to close.
pub(super) fn force_close_target(shared: &Arc<Shared>, t: &Target) {
    let closing = match &t.control {
        Some(control) => control.force_close(close_callback(shared, t.id)).is_ok(),
        None => false,
    };
    if closing {
        return;
    }
    let on_closed = close_callback(shared, t.id);
    if let Err(e) = shared
        .reactor
        .register_oneshot(Duration::ZERO, Box::new(move || on_closed()))
    {
        shared.log(Level::Error, &format!("cannot schedule close of {}: {}", t.url.endpoint(), e));
    }
}

fn force_close_callback(shared: &Arc<Shared>, id: TargetId) {
    let mut g = shared.lock();
    let Some(side) = g.side_of(id) else {
        return finish(g);
    };
    if let Some(t) = g.target_mut(side) {
        t.state = TargetState::Closed;
    }
    if g.op == Operation::Transfer {
        let source = g.target_state(Side::Source);
        let dest = g.target_state(Side::Dest);
        let both_closed = source == Some(TargetState::Closed) && dest == Some(TargetState::Closed);
        let busy = |s: Option<TargetState>| {
            s.is_some_and(|s| {
                !matches!(
                    s,
                    TargetState::Closed
                        | TargetState::Start
                        | TargetState::CompletedOperation
                        | TargetState::SetupConnection
                )
            })
        };
        if !both_closed && (busy(source) || busy(dest)) {
            return finish(g);
        }
    }
    g = if g.state == HandleState::Restart {
        restart::resume_after_close(shared, g)
    } else {
        transfer_complete(shared, g)
    };
    finish(g);
}

/// Ends the operation: tells plugins, hands the targets back to the cache
/// and queues the completion callback for delivery by `finish`.
pub(super) fn transfer_complete<'a>(shared: &'a Arc<Shared>, mut g: Guard<'a>) -> Guard<'a> {
    g.state = HandleState::Finalize;
    g = notify(shared, g, PluginEvent::Complete, CommandMask::ALL);
    if !can_reuse_data_conn(&g) {
        for side in [Side::Source, Side::Dest] {
            if let Some(t) = g.target_mut(side) {
                t.cached_data_conn = CachedDataConn::default();
            }
        }
    }
    release_targets(&mut g);
    let callback = g.callback.take();
    let result = match g.err.take() {
        Some(e) => Err(e),
        None => Ok(g.output.take().unwrap_or(Completion::Done)),
    };
    match &result {
        Ok(_) => shared.log(Level::Debug, &format!("{} complete", g.op)),
        Err(e) => shared.log(Level::Info, &format!("{} failed: {}", g.op, e)),
    }
    g.reset();
    g.completed = callback.map(|cb| (cb, result));
    g
}

pub(super) fn release_targets(g: &mut Inner) {
    for side in [Side::Source, Side::Dest] {
        if let Some(t) = g.slot(side).take() {
            if let Released::Evicted(t) = g.cache.release(t) {
                shutdown_target(t);
            }
        }
    }
}

/// Closes the connection of a target nobody keeps: politely when it is
/// healthy, forcibly when it faulted.
pub(super) fn shutdown_target(target: Target) {
    let Some(control) = target.control else {
        return;
    };
    match target.state {
        TargetState::Closed => {}
        TargetState::Fault => {
            let _ = control.force_close(Box::new(|| {}));
        }
        _ => {
            if control.quit(Box::new(|| {})).is_err() {
                let _ = control.force_close(Box::new(|| {}));
            }
        }
    }
}

/// Whether the data connection left open by the previous operation may
/// carry this one: extended-block mode on every side, and the same
/// targets in the same roles as last time.
pub(super) fn can_reuse_data_conn(g: &Inner) -> bool {
    let eb = |t: &Target| t.attr.mode == Mode::ExtendedBlock;
    match g.op {
        op if op.is_retrieve() => g.source.as_ref().is_some_and(|s| {
            eb(s) && s.cached_data_conn.source == Some(s.id)
                && s.cached_data_conn.operation == Operation::Get
        }),
        Operation::Put => g.dest.as_ref().is_some_and(|d| {
            eb(d) && d.cached_data_conn.dest == Some(d.id)
                && d.cached_data_conn.operation == Operation::Put
        }),
        Operation::Transfer => match (g.source.as_ref(), g.dest.as_ref()) {
            (Some(s), Some(d)) => {
                let pair = CachedDataConn {
                    source: Some(s.id),
                    dest: Some(d.id),
                    operation: Operation::Transfer,
                };
                eb(s) && eb(d) && s.cached_data_conn == pair && d.cached_data_conn == pair
            }
            _ => false,
        },
        _ => false,
    }
}

/// Cancels the operation in flight.
pub(super) fn abort(shared: &Arc<Shared>) -> Result<(), ClientError> {
    let mut g = shared.lock();
    if g.op == Operation::Idle {
        return Err(ClientError::ObjectNotInUse("handle"));
    }
    shared.log(Level::Debug, &format!("aborting {} in {:?}", g.op, g.state));
    match g.state {
        HandleState::Finalize | HandleState::Abort | HandleState::Failure => {
            return Err(ClientError::ObjectNotInUse("handle"));
        }
        HandleState::Start => {
            // the entry point is still running and finishes the abort itself
            g.state = HandleState::Abort;
            g.err = Some(ClientError::OperationAborted);
            g = notify_abort(shared, g);
        }
        HandleState::Restart => {
            g.state = HandleState::Abort;
            g.err = Some(ClientError::OperationAborted);
            match g.restart_timer.take() {
                Some(timer) if shared.reactor.unregister(timer) => {
                    let weak = Arc::downgrade(shared);
                    let scheduled = shared.reactor.register_oneshot(
                        Duration::ZERO,
                        Box::new(move || {
                            if let Some(shared) = weak.upgrade() {
                                restart::abort_callback(&shared);
                            }
                        }),
                    );
                    if scheduled.is_err() {
                        g = notify_abort(shared, g);
                        g.restart_info = None;
                        g = transfer_complete(shared, g);
                    }
                }
                // the timer already fired and will see the abort
                Some(_) => {}
                // still waiting for connections to close
                None => g = notify_abort(shared, g),
            }
        }
        HandleState::ThirdPartyTransferOneComplete => {
            for side in [Side::Source, Side::Dest] {
                if g.target_state(side) != Some(TargetState::CompletedOperation) {
                    abort_close(shared, &mut g, side);
                }
            }
            g.state = HandleState::Abort;
            g.err = Some(ClientError::OperationAborted);
            g = notify_abort(shared, g);
        }
        state => {
            let dest_phase = matches!(
                state,
                HandleState::DestConnect
                    | HandleState::DestSetupConnection
                    | HandleState::DestStoreOrEsto
            );
            if dest_phase {
                abort_close(shared, &mut g, Side::Dest);
            } else {
                abort_close(shared, &mut g, Side::Source);
                if g.op == Operation::Transfer {
                    abort_close(shared, &mut g, Side::Dest);
                }
            }
            g.state = HandleState::Abort;
            g.err = Some(ClientError::OperationAborted);
            g = notify_abort(shared, g);
        }
    }
    finish(g);
    Ok(())
}

fn abort_close(shared: &Arc<Shared>, g: &mut Inner, side: Side) {
    if let Some(t) = g.target_mut(side) {
        if t.state != TargetState::Closed {
            t.state = TargetState::Fault;
            force_close_target(shared, t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::OperationAttributes;
    use crate::config::EngineConfig;
    use crate::url::FtpUrl;

    fn target(url: &str, mode: Mode) -> Target {
        let mut attr = OperationAttributes::new();
        attr.set_mode(mode);
        Target::new(&FtpUrl::parse(url).unwrap(), Some(&attr), &EngineConfig::default())
    }

    fn inner(op: Operation, source: Option<Target>, dest: Option<Target>) -> Inner {
        let mut inner = Inner::new();
        inner.op = op;
        inner.source = source;
        inner.dest = dest;
        inner
    }

    #[test]
    fn test_reuse_needs_extended_block_and_same_target() {
        let mut s = target("gsiftp://h/a", Mode::ExtendedBlock);
        s.cached_data_conn = CachedDataConn {
            source: Some(s.id),
            dest: None,
            operation: Operation::Get,
        };
        let g = inner(Operation::Get, Some(s), None);
        assert!(can_reuse_data_conn(&g));

        let mut s = target("gsiftp://h/a", Mode::Stream);
        s.cached_data_conn = CachedDataConn {
            source: Some(s.id),
            dest: None,
            operation: Operation::Get,
        };
        let g = inner(Operation::Get, Some(s), None);
        assert!(!can_reuse_data_conn(&g));

        let s = target("gsiftp://h/a", Mode::ExtendedBlock);
        let g = inner(Operation::Get, Some(s), None);
        assert!(!can_reuse_data_conn(&g));
    }

    #[test]
    fn test_reuse_third_party_needs_same_pair() {
        let mut s = target("gsiftp://a/x", Mode::ExtendedBlock);
        let mut d = target("gsiftp://b/y", Mode::ExtendedBlock);
        let pair = CachedDataConn {
            source: Some(s.id),
            dest: Some(d.id),
            operation: Operation::Transfer,
        };
        s.cached_data_conn = pair;
        d.cached_data_conn = pair;
        let g = inner(Operation::Transfer, Some(s), Some(d));
        assert!(can_reuse_data_conn(&g));

        let mut g = g;
        let other = target("gsiftp://b/y", Mode::ExtendedBlock);
        if let Some(d) = g.dest.as_mut() {
            d.cached_data_conn.dest = Some(other.id);
        }
        assert!(!can_reuse_data_conn(&g));
    }

    #[test]
    fn test_no_reuse_without_data_channel() {
        let mut s = target("gsiftp://h/a", Mode::ExtendedBlock);
        s.cached_data_conn = CachedDataConn {
            source: Some(s.id),
            dest: None,
            operation: Operation::Get,
        };
        let g = inner(Operation::Mkdir, Some(s), None);
        assert!(!can_reuse_data_conn(&g));
    }

    #[test]
    fn test_plans() {
        let mut s = target("gsiftp://h/a", Mode::Stream);
        s.current.data_type = Some(DataType::Image);
        s.current.mode = Some(Mode::Stream);
        let mut g = inner(Operation::Get, Some(s), None);
        g.marker.set_offset(10);
        let plan = build_plan(&g, Side::Source, false);
        assert_eq!(
            plan,
            VecDeque::from(vec![
                Step::Pasv,
                Step::Rest(g.marker.clone()),
                Step::Verb
            ])
        );

        g.op = Operation::Move;
        let plan = build_plan(&g, Side::Source, false);
        assert_eq!(plan, VecDeque::from(vec![Step::Rnfr("/a".into()), Step::Verb]));

        g.op = Operation::Mkdir;
        assert_eq!(build_plan(&g, Side::Source, false), VecDeque::from(vec![Step::Verb]));
    }

    #[test]
    fn test_third_party_plans() {
        let s = target("gsiftp://a/x", Mode::ExtendedBlock);
        let mut attr = OperationAttributes::new();
        attr.set_mode(Mode::ExtendedBlock).set_allocated_size(4096);
        let d = Target::new(&FtpUrl::parse("gsiftp://b/y").unwrap(), Some(&attr), &EngineConfig::default());
        let g = inner(Operation::Transfer, Some(s), Some(d));
        let dest = build_plan(&g, Side::Dest, false);
        assert_eq!(dest.back(), Some(&Step::HandOff));
        assert!(dest.contains(&Step::Pasv));
        assert!(dest.contains(&Step::Allo(4096)));
        let source = build_plan(&g, Side::Source, false);
        assert_eq!(source.back(), Some(&Step::StartThirdParty));
        assert!(source.contains(&Step::Port));

        let reused = build_plan(&g, Side::Source, true);
        assert!(!reused.contains(&Step::Port));
    }

    #[test]
    fn test_verb_output_parsing() {
        let size = verb_output(Operation::Size, Some(&Reply::new(213, "213 42"))).unwrap();
        assert_eq!(size, Completion::Size(42));
        let err = verb_output(Operation::Size, Some(&Reply::new(213, "213 lots")));
        assert!(matches!(err, Err(ClientError::Protocol(_))));
        assert_eq!(
            verb_output(Operation::Mkdir, Some(&Reply::new(257, "257 ok"))).unwrap(),
            Completion::Done
        );
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(Ok(Some(Reply::new(350, "350 go on"))), true),
            Outcome::Positive(Some(_))
        ));
        assert!(matches!(
            classify(Ok(Some(Reply::new(350, "350 go on"))), false),
            Outcome::Negative(_)
        ));
        assert!(matches!(
            classify(Ok(Some(Reply::new(150, "150 opening"))), false),
            Outcome::Pending(_)
        ));
        assert!(matches!(classify(Ok(None), false), Outcome::Positive(None)));
    }
}
