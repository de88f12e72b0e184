//! Restarting the operation in flight on a plugin's request.
//!
//! A restart closes whatever connections are busy, waits for the closes,
//! then sleeps until the requested time on a reactor timer and runs the
//! same verb again with the replacement arguments. The completion callback
//! only fires for the attempt that finally succeeds or fails.

use std::sync::Arc;
use std::time::Instant;

use super::{
    finish, notify_abort, notify_restart, ops, state, Guard, Handle, HandleState, Operation,
    RestartInfo, Shared, Side,
};
use crate::attr::OperationAttributes;
use crate::error::ClientError;
use crate::logging::Level;
use crate::restart_marker::RestartMarker;
use crate::target::TargetState;
use crate::url::FtpUrl;

type Endpoint<'a> = Option<(&'a str, Option<&'a OperationAttributes>)>;

fn restart_operation(
    shared: &Arc<Shared>,
    source: Endpoint<'_>,
    dest: Endpoint<'_>,
    marker: Option<&RestartMarker>,
    when: Option<Instant>,
) -> Result<(), ClientError> {
    let source = source
        .map(|(url, attr)| Ok::<_, ClientError>((FtpUrl::parse(url)?, attr.cloned())))
        .transpose()?;
    let dest = dest
        .map(|(url, attr)| Ok::<_, ClientError>((FtpUrl::parse(url)?, attr.cloned())))
        .transpose()?;

    let mut g = shared.lock();
    if g.op == Operation::Idle {
        return Err(ClientError::InvalidOperation(g.op));
    }
    if matches!(
        g.state,
        HandleState::Abort | HandleState::Failure | HandleState::Finalize
    ) {
        return Err(ClientError::InvalidOperation(g.op));
    }

    let (source_url, source_attr) = match source {
        Some((url, attr)) => (Some(url), attr.or_else(|| g.source_attr.clone())),
        None => (g.source_url.clone(), g.source_attr.clone()),
    };
    let (dest_url, dest_attr) = match dest {
        Some((url, attr)) => (Some(url), attr.or_else(|| g.dest_attr.clone())),
        None => (g.dest_url.clone(), g.dest_attr.clone()),
    };
    let mut info = RestartInfo {
        source_url,
        source_attr,
        dest_url,
        dest_attr,
        marker: marker.cloned().unwrap_or_else(|| g.marker.clone()),
        when: when.unwrap_or_else(Instant::now),
    };
    if g.op == Operation::Transfer {
        if let (Some(su), Some(du)) = (info.source_url.as_ref(), info.dest_url.as_ref()) {
            ops::normalize_third_party(su, &mut info.source_attr, du, &mut info.dest_attr)?;
        }
    }
    shared.log(Level::Info, &format!("restarting {}", g.op));

    if g.state == HandleState::Restart {
        // a newer request replaces the pending one
        g.restart_info = Some(info);
        if let Some(timer) = g.restart_timer.take() {
            if shared.reactor.unregister(timer) {
                g = schedule(shared, g);
            }
        }
        g = notify_restart(shared, g);
        finish(g);
        return Ok(());
    }

    let prior = g.state;
    g.restart_info = Some(info);
    g.state = HandleState::Restart;
    let mut closing = false;
    for side in [Side::Source, Side::Dest] {
        if let Some(t) = g.target_mut(side) {
            if !t.state.is_quiet() && t.state != TargetState::Fault {
                t.state = TargetState::Fault;
                state::force_close_target(shared, t);
                closing = true;
            }
        }
    }
    // the entry point still running in `Start` schedules the restart itself
    if prior != HandleState::Start && !closing {
        g = resume_after_close(shared, g);
    }
    g = notify_restart(shared, g);
    finish(g);
    Ok(())
}

/// Every connection the restart closed is down: return the targets and
/// wait out the delay.
pub(super) fn resume_after_close<'a>(shared: &'a Arc<Shared>, mut g: Guard<'a>) -> Guard<'a> {
    state::release_targets(&mut g);
    schedule(shared, g)
}

fn schedule<'a>(shared: &'a Arc<Shared>, mut g: Guard<'a>) -> Guard<'a> {
    let delay = g
        .restart_info
        .as_ref()
        .map(|info| info.when.saturating_duration_since(Instant::now()))
        .unwrap_or_default();
    let weak = Arc::downgrade(shared);
    let scheduled = shared.reactor.register_oneshot(
        delay,
        Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                restart_callback(&shared);
            }
        }),
    );
    match scheduled {
        Ok(timer) => {
            g.restart_timer = Some(timer);
            g
        }
        Err(e) => {
            g.err = Some(e);
            g.restart_info = None;
            g.state = HandleState::Failure;
            state::transfer_complete(shared, g)
        }
    }
}

/// Abort that arrived while the restart was pending.
pub(super) fn abort_callback(shared: &Arc<Shared>) {
    let mut g = shared.lock();
    if g.state != HandleState::Abort {
        return finish(g);
    }
    g = notify_abort(shared, g);
    g.restart_info = None;
    g = state::transfer_complete(shared, g);
    finish(g);
}

fn restart_callback(shared: &Arc<Shared>) {
    let mut g = shared.lock();
    g.restart_timer = None;
    if g.state == HandleState::Abort {
        drop(g);
        return abort_callback(shared);
    }
    if g.state != HandleState::Restart {
        return finish(g);
    }
    let Some(info) = g.restart_info.take() else {
        return finish(g);
    };
    g.source_url = info.source_url;
    g.source_attr = info.source_attr;
    g.dest_url = info.dest_url;
    g.dest_attr = info.dest_attr;
    g.marker = info.marker;
    g.err = None;
    g.output = None;
    g.state = HandleState::Start;
    ops::check_out_targets(shared, &mut g);
    shared.log(Level::Debug, &format!("running {} again", g.op));

    let (mut g, result) = ops::activate_operation(shared, g);
    if let Err(e) = result {
        if !g.interrupted() {
            g.set_error(e);
            g.state = HandleState::Failure;
            g = state::transfer_complete(shared, g);
        }
    }
    finish(g);
}

impl Handle {
    pub fn plugin_restart_get(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        marker: Option<&RestartMarker>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        restart_operation(&self.shared, Some((url, attr)), None, marker, when)
    }

    pub fn plugin_restart_put(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        marker: Option<&RestartMarker>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        restart_operation(&self.shared, None, Some((url, attr)), marker, when)
    }

    pub fn plugin_restart_third_party_transfer(
        &self,
        source_url: &str,
        source_attr: Option<&OperationAttributes>,
        dest_url: &str,
        dest_attr: Option<&OperationAttributes>,
        marker: Option<&RestartMarker>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        restart_operation(
            &self.shared,
            Some((source_url, source_attr)),
            Some((dest_url, dest_attr)),
            marker,
            when,
        )
    }

    pub fn plugin_restart_move(
        &self,
        source_url: &str,
        dest_url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        restart_operation(
            &self.shared,
            Some((source_url, attr)),
            Some((dest_url, attr)),
            None,
            when,
        )
    }

    pub fn plugin_restart_mkdir(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        self.plugin_restart_source(url, attr, when)
    }

    pub fn plugin_restart_rmdir(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        self.plugin_restart_source(url, attr, when)
    }

    pub fn plugin_restart_delete(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        self.plugin_restart_source(url, attr, when)
    }

    pub fn plugin_restart_chmod(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        self.plugin_restart_source(url, attr, when)
    }

    /// Covers `list`, `verbose_list` and `machine_list`.
    pub fn plugin_restart_list(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        self.plugin_restart_source(url, attr, when)
    }

    pub fn plugin_restart_mlst(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        self.plugin_restart_source(url, attr, when)
    }

    pub fn plugin_restart_stat(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        self.plugin_restart_source(url, attr, when)
    }

    pub fn plugin_restart_cwd(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        self.plugin_restart_source(url, attr, when)
    }

    pub fn plugin_restart_size(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        self.plugin_restart_source(url, attr, when)
    }

    pub fn plugin_restart_modification_time(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        self.plugin_restart_source(url, attr, when)
    }

    pub fn plugin_restart_cksm(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        self.plugin_restart_source(url, attr, when)
    }

    pub fn plugin_restart_feat(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        self.plugin_restart_source(url, attr, when)
    }

    fn plugin_restart_source(
        &self,
        url: &str,
        attr: Option<&OperationAttributes>,
        when: Option<Instant>,
    ) -> Result<(), ClientError> {
        restart_operation(&self.shared, Some((url, attr)), None, None, when)
    }

    /// Marker the pending restart of a get, put or transfer resumes from.
    pub fn plugin_restart_marker(&self) -> Result<RestartMarker, ClientError> {
        let g = self.shared.lock();
        let transfers = matches!(g.op, Operation::Get | Operation::Put | Operation::Transfer);
        if g.state != HandleState::Restart || !transfers {
            return Err(ClientError::NoRestartMarker);
        }
        g.restart_info
            .as_ref()
            .map(|info| info.marker.clone())
            .ok_or(ClientError::NoRestartMarker)
    }
}
