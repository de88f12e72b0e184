//! Scripted in-memory control connections for exercising the state
//! machines without a server.
//!
//! Every connection runs a worker thread, so replies arrive asynchronously
//! exactly as they do from the real drivers. Commands get canned success
//! replies unless a rule registered with `MockFactory::on` matches.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::attr::AuthInfo;
use crate::command::Command;
use crate::config::EngineConfig;
use crate::control::{
    closed_error, CloseCallback, ControlConnection, ControlFactory, DataRequest, Direction, Job,
    ReplyCallback,
};
use crate::data::Block;
use crate::error::ClientError;
use crate::reply::Reply;
use crate::url::FtpUrl;

const SLICE: Duration = Duration::from_millis(5);

/// How a matching command is answered.
#[derive(Clone)]
pub struct Rule {
    prefix: String,
    host: Option<String>,
    replies: Vec<Reply>,
    delay: Duration,
    hang: bool,
    uses: Option<usize>,
}

impl Rule {
    /// Applies only to connections opened to `host`.
    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Never answers; the request only ends when the connection is closed.
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.uses = Some(n);
        self
    }
}

#[derive(Default)]
struct Shared {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<String>>,
    payload: Mutex<Vec<u8>>,
    stored: Mutex<Vec<u8>>,
    opened: AtomicUsize,
    refuse_open: AtomicBool,
}

impl Shared {
    fn record(&self, host: &str, entry: String) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{} {}", host, entry));
    }

    /// Consumes one use of the first rule matching `text` on `host`.
    fn rule_for(&self, host: &str, text: &str) -> Option<Rule> {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let index = rules.iter().position(|r| {
            text.starts_with(&r.prefix)
                && r.host.as_deref().map_or(true, |h| h == host)
                && r.uses != Some(0)
        })?;
        let rule = rules[index].clone();
        if let Some(n) = rules[index].uses.as_mut() {
            *n -= 1;
        }
        Some(rule)
    }
}

/// Opens mock connections that share one script and one command log.
#[derive(Clone, Default)]
pub struct MockFactory {
    shared: Arc<Shared>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands starting with `prefix` with `replies`
    /// (`(code, text)` pairs, text without the code).
    pub fn on(&self, prefix: &str, replies: &[(u32, &str)]) -> RuleGuard<'_> {
        RuleGuard {
            factory: self,
            rule: Some(Rule {
                prefix: prefix.to_string(),
                host: None,
                replies: replies
                    .iter()
                    .map(|(code, text)| Reply::new(*code, format!("{} {}", code, text)))
                    .collect(),
                delay: Duration::ZERO,
                hang: false,
                uses: None,
            }),
        }
    }

    /// Bytes served to every retrieve.
    pub fn set_payload(&self, data: &[u8]) {
        *self.shared.payload.lock().unwrap_or_else(PoisonError::into_inner) = data.to_vec();
    }

    /// Bytes received by the last store.
    pub fn stored(&self) -> Vec<u8> {
        self.shared.stored.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn refuse_open(&self, refuse: bool) {
        self.shared.refuse_open.store(refuse, Ordering::SeqCst);
    }

    /// Number of connections opened so far.
    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Every request seen, as `"<host> <command>"`.
    pub fn log(&self) -> Vec<String> {
        self.shared.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Commands sent to `host`, without the host prefix.
    pub fn commands(&self, host: &str) -> Vec<String> {
        let prefix = format!("{} ", host);
        self.log()
            .into_iter()
            .filter_map(|l| l.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

/// Adds the rule when dropped, after the builder calls.
pub struct RuleGuard<'a> {
    factory: &'a MockFactory,
    rule: Option<Rule>,
}

impl RuleGuard<'_> {
    fn map(mut self, f: impl FnOnce(Rule) -> Rule) -> Self {
        self.rule = self.rule.take().map(f);
        self
    }

    pub fn host(self, host: &str) -> Self {
        self.map(|r| r.host(host))
    }

    pub fn delay(self, delay: Duration) -> Self {
        self.map(|r| r.delay(delay))
    }

    pub fn hang(self) -> Self {
        self.map(Rule::hang)
    }

    pub fn times(self, n: usize) -> Self {
        self.map(|r| r.times(n))
    }
}

impl Drop for RuleGuard<'_> {
    fn drop(&mut self) {
        if let Some(rule) = self.rule.take() {
            self.factory
                .shared
                .rules
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(rule);
        }
    }
}

impl ControlFactory for MockFactory {
    fn open(
        &self,
        url: &FtpUrl,
        _config: &Arc<EngineConfig>,
    ) -> Result<Arc<dyn ControlConnection>, ClientError> {
        if self.shared.refuse_open.load(Ordering::SeqCst) {
            return Err(ClientError::UnsupportedFeature("mock transport".into()));
        }
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let worker = MockWorker {
            host: url.host.clone(),
            shared: Arc::clone(&self.shared),
            closed: Arc::clone(&closed),
        };
        thread::spawn(move || worker.run(rx));
        Ok(Arc::new(MockConnection {
            jobs: Mutex::new(tx),
            closed,
        }))
    }
}

pub struct MockConnection {
    jobs: Mutex<Sender<Job>>,
    closed: Arc<AtomicBool>,
}

impl MockConnection {
    fn enqueue(&self, job: Job) -> Result<(), ClientError> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(job)
            .map_err(|_| ClientError::Protocol("mock worker has exited".into()))
    }
}

impl ControlConnection for MockConnection {
    fn connect(&self, url: &FtpUrl, on_reply: ReplyCallback) -> Result<(), ClientError> {
        self.enqueue(Job::Connect {
            url: url.clone(),
            on_reply,
        })
    }

    fn authenticate(&self, auth: &AuthInfo, on_reply: ReplyCallback) -> Result<(), ClientError> {
        self.enqueue(Job::Authenticate {
            auth: auth.clone(),
            on_reply,
        })
    }

    fn send_command(&self, command: &Command, on_reply: ReplyCallback) -> Result<(), ClientError> {
        self.enqueue(Job::Command {
            text: command.to_string(),
            on_reply,
        })
    }

    fn transfer(
        &self,
        command: &Command,
        data: DataRequest,
        on_reply: ReplyCallback,
    ) -> Result<(), ClientError> {
        self.enqueue(Job::Transfer {
            text: command.to_string(),
            data,
            on_reply,
        })
    }

    fn quit(&self, on_done: CloseCallback) -> Result<(), ClientError> {
        self.enqueue(Job::Quit { on_done })
    }

    fn force_close(&self, on_closed: CloseCallback) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::SeqCst);
        self.enqueue(Job::Closed { on_closed })
    }
}

struct MockWorker {
    host: String,
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl MockWorker {
    fn run(self, rx: Receiver<Job>) {
        for job in rx {
            match job {
                Job::Closed { on_closed } => {
                    self.shared.record(&self.host, "FORCE_CLOSE".into());
                    on_closed();
                }
                Job::Quit { on_done } => {
                    self.shared.record(&self.host, "QUIT".into());
                    on_done();
                }
                Job::Connect { url, mut on_reply } => {
                    self.shared.record(&self.host, format!("CONNECT {}", url));
                    self.answer("CONNECT", vec![Reply::new(220, "220 mock ready")], &mut on_reply);
                }
                Job::Authenticate { auth, mut on_reply } => {
                    self.shared
                        .record(&self.host, format!("AUTH {}", auth.user_or_anonymous()));
                    self.answer("AUTH", vec![Reply::new(230, "230 logged in")], &mut on_reply);
                }
                Job::Command { text, mut on_reply } => {
                    self.shared.record(&self.host, text.clone());
                    let canned = canned_replies(&text, &self.shared);
                    self.answer(&text, canned, &mut on_reply);
                }
                Job::Transfer {
                    text,
                    data,
                    mut on_reply,
                } => {
                    self.shared.record(&self.host, text.clone());
                    self.transfer(&text, data, &mut on_reply);
                }
            }
        }
    }

    /// Waits out `delay`; false if the connection was closed meanwhile.
    fn wait(&self, delay: Duration, hang: bool) -> bool {
        let start = Instant::now();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            if !hang && start.elapsed() >= delay {
                return true;
            }
            thread::sleep(SLICE);
        }
    }

    fn answer(&self, text: &str, canned: Vec<Reply>, on_reply: &mut ReplyCallback) {
        let (replies, delay, hang) = match self.shared.rule_for(&self.host, text) {
            Some(rule) => (rule.replies, rule.delay, rule.hang),
            None => (canned, Duration::ZERO, false),
        };
        if !self.wait(delay, hang) {
            on_reply(Err(closed_error()));
            return;
        }
        for reply in replies {
            on_reply(Ok(reply));
        }
    }

    fn transfer(&self, text: &str, data: DataRequest, on_reply: &mut ReplyCallback) {
        if let Some(rule) = self.shared.rule_for(&self.host, text) {
            if !self.wait(rule.delay, rule.hang) {
                on_reply(Err(closed_error()));
                return;
            }
            for reply in rule.replies {
                on_reply(Ok(reply));
            }
            return;
        }
        if self.closed.load(Ordering::SeqCst) {
            on_reply(Err(closed_error()));
            return;
        }
        on_reply(Ok(Reply::new(150, "150 Opening data connection")));
        let DataRequest {
            direction,
            base_offset,
            mut on_block,
            ..
        } = data;
        let moved = match direction {
            Direction::Receive(sink) => {
                let payload = self
                    .shared
                    .payload
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                let start = usize::try_from(base_offset).unwrap_or(usize::MAX).min(payload.len());
                let chunk = &payload[start..];
                let written = sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .write_block(base_offset, chunk);
                written.map(|()| {
                    if !chunk.is_empty() {
                        on_block(Block::payload(base_offset, chunk));
                    }
                    on_block(Block::end_of_data(base_offset + chunk.len() as u64));
                })
            }
            Direction::Send { source, end, .. } => {
                let mut buf = Vec::new();
                let mut chunk = vec![0u8; 4096];
                let mut offset = base_offset;
                let result = loop {
                    let want = match end {
                        Some(end) if offset >= end => break Ok(()),
                        Some(end) => chunk.len().min((end - offset) as usize),
                        None => chunk.len(),
                    };
                    let n = match source
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .read_block(offset, &mut chunk[..want])
                    {
                        Ok(0) => break Ok(()),
                        Ok(n) => n,
                        Err(e) => break Err(e),
                    };
                    let _ = buf.write_all(&chunk[..n]);
                    on_block(Block::payload(offset, &chunk[..n]));
                    offset += n as u64;
                };
                *self.shared.stored.lock().unwrap_or_else(PoisonError::into_inner) = buf;
                result
            }
        };
        match moved {
            Ok(()) => on_reply(Ok(Reply::new(226, "226 Transfer complete"))),
            Err(e) => on_reply(Err(e.into())),
        }
    }
}

/// What a well-behaved server answers when no rule matches.
fn canned_replies(text: &str, shared: &Shared) -> Vec<Reply> {
    let verb = text.split_whitespace().next().unwrap_or("");
    let payload_len = shared.payload.lock().unwrap_or_else(PoisonError::into_inner).len();
    let reply = match verb {
        "SITE" if text == "SITE HELP" => Reply::new(
            214,
            "214-The following commands are recognized:\n    ERET ESTO SBUF DCAU PBSZ\n214 End",
        ),
        "FEAT" => Reply::new(
            211,
            "211-Extensions supported:\n SIZE\n MDTM\n MLST type*;size*;\n CKSM MD5\n DCAU\n PARALLEL\n REST STREAM\n211 END",
        ),
        "PASV" => Reply::new(227, "227 Entering Passive Mode (127,0,0,1,4,1)"),
        "REST" => Reply::new(350, "350 Restart marker accepted"),
        "RNFR" => Reply::new(350, "350 Ready for RNTO"),
        "SIZE" => Reply::new(213, format!("213 {}", payload_len)),
        "MDTM" => Reply::new(213, "213 20240102030405"),
        "CKSM" => Reply::new(213, "213 d41d8cd98f00b204e9800998ecf8427e"),
        "MLST" => Reply::new(
            250,
            format!(
                "250-Listing {}\n type=file;size={}; {}\n250 End",
                text.get(5..).unwrap_or(""),
                payload_len,
                text.get(5..).unwrap_or("")
            ),
        ),
        "STAT" => Reply::new(211, "211-Status\n mock server\n211 End"),
        "CWD" => Reply::new(
            250,
            format!("250 \"{}\" is current directory", text.get(4..).unwrap_or("")),
        ),
        "MKD" => Reply::new(257, "257 Directory created"),
        "RETR" | "ERET" | "STOR" | "ESTO" | "APPE" => {
            return vec![
                Reply::new(150, "150 Opening data connection"),
                Reply::new(226, "226 Transfer complete"),
            ]
        }
        "DELE" | "RMD" | "RNTO" => Reply::new(250, "250 OK"),
        _ => Reply::new(200, "200 OK"),
    };
    vec![reply]
}
