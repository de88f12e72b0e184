//! Automatic retry of failed operations.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::ClientError;
use crate::handle::{Handle, Operation};
use crate::logging::{self, Level};
use crate::plugin::{EventKind, EventSet, Plugin, PluginEvent, VerbEvent};

#[derive(Debug, Default)]
struct Attempts {
    verb: Option<VerbEvent>,
    retries: u32,
    delay: Duration,
}

/// Re-runs the current verb after a fault.
///
/// The first retry waits `interval`; with backoff every further retry
/// waits twice as long as the one before. Retrying stops once
/// `max_retries` attempts were made (a negative limit never stops) or once
/// the next attempt would start after `deadline`. The fault then reaches
/// the completion callback as usual.
#[derive(Debug)]
pub struct RestartPlugin {
    max_retries: i32,
    interval: Duration,
    backoff: bool,
    deadline: Option<Instant>,
    attempts: Mutex<Attempts>,
}

impl RestartPlugin {
    pub fn new(max_retries: i32, interval: Duration, backoff: bool) -> Self {
        RestartPlugin {
            max_retries,
            interval,
            backoff,
            deadline: None,
            attempts: Mutex::new(Attempts::default()),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Delay before the next retry, or `None` when retrying is over.
    /// Counts the retry as made.
    fn next_delay(&self, attempts: &mut Attempts, now: Instant) -> Option<Duration> {
        if self.max_retries >= 0 && attempts.retries >= self.max_retries as u32 {
            return None;
        }
        let delay = if attempts.retries == 0 {
            self.interval
        } else if self.backoff {
            attempts.delay.saturating_mul(2)
        } else {
            attempts.delay
        };
        if let Some(deadline) = self.deadline {
            if now + delay > deadline {
                return None;
            }
        }
        attempts.retries += 1;
        attempts.delay = delay;
        Some(delay)
    }

    fn on_fault(&self, handle: &Handle) {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(verb) = attempts.verb.clone() else {
            return;
        };
        let now = Instant::now();
        let Some(delay) = self.next_delay(&mut attempts, now) else {
            log(handle, Level::Info, &format!("giving up on {}", verb.operation));
            return;
        };
        let retry = attempts.retries;
        drop(attempts);

        log(
            handle,
            Level::Info,
            &format!(
                "retry {} of {} in {}ms",
                retry,
                verb.operation,
                delay.as_millis()
            ),
        );
        if let Err(e) = reissue(handle, &verb, now + delay) {
            log(handle, Level::Error, &format!("restart refused: {}", e));
        }
    }
}

fn log(handle: &Handle, level: Level, message: &str) {
    let _ = logging::log_handle(handle.id(), level, message);
}

/// Runs `verb` again at `when` with the endpoints it was announced with.
fn reissue(handle: &Handle, verb: &VerbEvent, when: Instant) -> Result<(), ClientError> {
    let source = verb
        .source
        .as_ref()
        .map(|e| (e.url.to_url_string(), &e.attr));
    let dest = verb.dest.as_ref().map(|e| (e.url.to_url_string(), &e.attr));
    let when = Some(when);
    let missing = ClientError::InvalidParameter("url");

    match (verb.operation, source, dest) {
        (Operation::Put, _, Some((url, attr))) => {
            handle.plugin_restart_put(&url, Some(attr), None, when)
        }
        (Operation::Transfer, Some((su, sa)), Some((du, da))) => {
            handle.plugin_restart_third_party_transfer(&su, Some(sa), &du, Some(da), None, when)
        }
        (Operation::Move, Some((su, sa)), Some((du, _))) => {
            handle.plugin_restart_move(&su, &du, Some(sa), when)
        }
        (op, Some((url, attr)), _) => {
            let attr = Some(attr);
            match op {
                Operation::Get => handle.plugin_restart_get(&url, attr, None, when),
                Operation::Mkdir => handle.plugin_restart_mkdir(&url, attr, when),
                Operation::Rmdir => handle.plugin_restart_rmdir(&url, attr, when),
                Operation::Delete => handle.plugin_restart_delete(&url, attr, when),
                Operation::Chmod => handle.plugin_restart_chmod(&url, attr, when),
                Operation::List | Operation::VerboseList | Operation::MachineList => {
                    handle.plugin_restart_list(&url, attr, when)
                }
                Operation::Mlst => handle.plugin_restart_mlst(&url, attr, when),
                Operation::Stat => handle.plugin_restart_stat(&url, attr, when),
                Operation::Cwd => handle.plugin_restart_cwd(&url, attr, when),
                Operation::Size => handle.plugin_restart_size(&url, attr, when),
                Operation::Mdtm => handle.plugin_restart_modification_time(&url, attr, when),
                Operation::Cksm => handle.plugin_restart_cksm(&url, attr, when),
                Operation::Feat => handle.plugin_restart_feat(&url, attr, when),
                Operation::Idle | Operation::Put | Operation::Transfer | Operation::Move => {
                    Err(missing)
                }
            }
        }
        _ => Err(missing),
    }
}

impl Plugin for RestartPlugin {
    fn name(&self) -> &str {
        "restart"
    }

    fn interests(&self) -> EventSet {
        EventSet::all_verbs() | EventKind::Fault | EventKind::Complete | EventKind::Abort
    }

    fn on_event(&self, handle: &Handle, event: &PluginEvent) {
        match event {
            PluginEvent::Verb(verb) => {
                let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
                if !verb.restart {
                    *attempts = Attempts::default();
                }
                attempts.verb = Some(verb.clone());
            }
            PluginEvent::Fault { .. } => self.on_fault(handle),
            PluginEvent::Complete | PluginEvent::Abort => {
                self.attempts
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .verb = None;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;
    use std::sync::Arc;

    use crate::config::EngineConfig;
    use crate::control::mock::MockFactory;
    use crate::data::SharedSink;
    use crate::handle::Completion;
    use crate::reactor::ThreadReactor;

    const WAIT: Duration = Duration::from_secs(10);

    fn fixture(plugin: RestartPlugin) -> (Handle, MockFactory) {
        let mock = MockFactory::new();
        let handle = Handle::with_parts(
            Arc::new(EngineConfig::default()),
            Arc::new(ThreadReactor::new()),
            Arc::new(mock.clone()),
        );
        handle.add_plugin(Arc::new(plugin)).unwrap();
        (handle, mock)
    }

    fn mkdir(handle: &Handle) -> Result<Completion, ClientError> {
        let (tx, rx) = mpsc::channel();
        handle
            .mkdir("ftp://h/a", None, move |r| {
                let _ = tx.send(r);
            })
            .unwrap();
        rx.recv_timeout(WAIT).unwrap()
    }

    #[test]
    fn test_delays_with_and_without_backoff() {
        let now = Instant::now();
        let ms = Duration::from_millis;

        let plugin = RestartPlugin::new(4, ms(100), true);
        let mut attempts = Attempts::default();
        let delays: Vec<_> = (0..5).map(|_| plugin.next_delay(&mut attempts, now)).collect();
        assert_eq!(
            delays,
            vec![Some(ms(100)), Some(ms(200)), Some(ms(400)), Some(ms(800)), None]
        );

        let plugin = RestartPlugin::new(-1, ms(50), false);
        let mut attempts = Attempts::default();
        for _ in 0..20 {
            assert_eq!(plugin.next_delay(&mut attempts, now), Some(ms(50)));
        }
    }

    #[test]
    fn test_deadline_stops_retries() {
        let now = Instant::now();
        let plugin = RestartPlugin::new(-1, Duration::from_secs(1), true)
            .with_deadline(now + Duration::from_millis(2500));
        let mut attempts = Attempts::default();
        assert!(plugin.next_delay(&mut attempts, now).is_some());
        // 1s then 2s: the second retry would land past the deadline
        assert!(plugin.next_delay(&mut attempts, now).is_none());
        assert_eq!(attempts.retries, 1);
    }

    #[test]
    fn test_retries_until_success() {
        let (handle, mock) = fixture(RestartPlugin::new(3, Duration::from_millis(10), true));
        mock.on("CONNECT", &[(421, "Too many users")]).times(2);
        assert!(mkdir(&handle).is_ok());
        assert_eq!(mock.opened(), 3);
        assert!(mock.log().iter().any(|l| l == "h MKD /a"));
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let (handle, mock) = fixture(RestartPlugin::new(2, Duration::from_millis(10), false));
        mock.on("CONNECT", &[(421, "Too many users")]);
        assert!(mkdir(&handle).is_err());
        assert_eq!(mock.opened(), 3);
        assert_eq!(handle.operation(), Operation::Idle);

        // a fresh verb starts counting from zero again
        assert!(mkdir(&handle).is_err());
        assert_eq!(mock.opened(), 6);
    }

    #[test]
    fn test_get_resumes_into_same_sink() {
        let (handle, mock) = fixture(RestartPlugin::new(1, Duration::from_millis(10), false));
        mock.on("CONNECT", &[(421, "Too many users")]).times(1);
        mock.set_payload(b"retried payload");

        let buf = Arc::new(Mutex::new(Cursor::new(Vec::new())));
        let sink: SharedSink = buf.clone();
        let (tx, rx) = mpsc::channel();
        handle
            .get("gsiftp://u@h/f", None, None, sink, move |r| {
                let _ = tx.send(r);
            })
            .unwrap();
        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
        assert_eq!(buf.lock().unwrap().get_ref().as_slice(), b"retried payload");
        assert_eq!(mock.opened(), 2);
    }
}
