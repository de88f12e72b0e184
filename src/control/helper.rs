//! sshftp control connections tunnelled through a local helper program
//!
//! The helper is started as `<program> <url> <host> <port> [user]` with the
//! caller's environment and carries the control channel on its stdin and
//! stdout. Data channels are plain passive-mode TCP connections, the same
//! as for the suppaftp driver.

use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command as Process, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::attr::{AuthInfo, Mode};
use crate::command::Command;
use crate::config::EngineConfig;
use crate::control::{
    closed_error, pump, CloseCallback, ControlConnection, DataRequest, Job, ReplyCallback,
};
use crate::error::ClientError;
use crate::logging::log_with_thread;
use crate::reply::{read_reply, Reply};
use crate::url::FtpUrl;

static NEXT_HELPER: AtomicU64 = AtomicU64::new(1);

pub struct HelperDriver {
    jobs: Mutex<Sender<Job>>,
    child: Arc<Mutex<Option<Child>>>,
    data: Arc<Mutex<Option<TcpStream>>>,
    closed: Arc<AtomicBool>,
}

impl HelperDriver {
    /// Starts the worker thread. The helper itself is launched by `connect`.
    pub fn spawn(program: PathBuf, config: Arc<EngineConfig>) -> Result<HelperDriver, ClientError> {
        let (tx, rx) = mpsc::channel();
        let child = Arc::new(Mutex::new(None));
        let data = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            id: NEXT_HELPER.fetch_add(1, Ordering::SeqCst),
            program,
            config,
            child: Arc::clone(&child),
            data: Arc::clone(&data),
            closed: Arc::clone(&closed),
            stdin: None,
            stdout: None,
            data_conn: None,
        };
        thread::Builder::new()
            .name(format!("gridftp-sshftp-{}", worker.id))
            .spawn(move || worker.run(rx))?;
        Ok(HelperDriver {
            jobs: Mutex::new(tx),
            child,
            data,
            closed,
        })
    }

    fn enqueue(&self, job: Job) -> Result<(), ClientError> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(job)
            .map_err(|_| ClientError::Protocol("helper worker has exited".into()))
    }
}

impl ControlConnection for HelperDriver {
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
        // killing the helper ends its stdout, which unblocks a pending read
        if let Some(child) = self.child.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            let _ = child.kill();
        }
        if let Some(sock) = self.data.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = sock.shutdown(Shutdown::Both);
        }
        self.enqueue(Job::Closed { on_closed })
    }
}

struct Worker {
    id: u64,
    program: PathBuf,
    config: Arc<EngineConfig>,
    child: Arc<Mutex<Option<Child>>>,
    data: Arc<Mutex<Option<TcpStream>>>,
    closed: Arc<AtomicBool>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    data_conn: Option<TcpStream>,
}

impl Worker {
    fn run(mut self, rx: Receiver<Job>) {
        for job in rx {
            match job {
                Job::Closed { on_closed } => {
                    self.reap(true);
                    on_closed();
                }
                Job::Quit { on_done } => {
                    if self.stdin.is_some() {
                        let _ = self.exchange("QUIT");
                    }
                    self.reap(false);
                    on_done();
                }
                Job::Connect { url, mut on_reply } => {
                    if let Err(e) = self.guarded(|w| w.connect(&url, &mut on_reply)) {
                        on_reply(Err(e));
                    }
                }
                Job::Authenticate { auth, mut on_reply } => {
                    let result = self.guarded(|w| w.authenticate(&auth));
                    on_reply(result);
                }
                Job::Command { text, mut on_reply } => {
                    if let Err(e) = self.guarded(|w| w.command(&text, &mut on_reply)) {
                        on_reply(Err(e));
                    }
                }
                Job::Transfer {
                    text,
                    data,
                    mut on_reply,
                } => {
                    if let Err(e) = self.guarded(|w| w.transfer(&text, data, &mut on_reply)) {
                        on_reply(Err(e));
                    }
                }
            }
        }
        self.reap(true);
    }

    fn guarded<T>(
        &mut self,
        f: impl FnOnce(&mut Worker) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }
        let result = f(self);
        if self.closed.load(Ordering::SeqCst) {
            self.reap(true);
            return Err(closed_error());
        }
        result
    }

    /// Drops the pipes and waits for the helper, killing it first if asked.
    fn reap(&mut self, kill: bool) {
        self.stdin = None;
        self.stdout = None;
        self.data_conn = None;
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = None;
        let child = self.child.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut child) = child {
            if kill {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }

    fn connect(&mut self, url: &FtpUrl, on_reply: &mut ReplyCallback) -> Result<(), ClientError> {
        let mut process = Process::new(&self.program);
        process
            .arg(url.to_string())
            .arg(&url.host)
            .arg(url.port.to_string());
        if let Some(user) = &url.user {
            process.arg(user);
        }
        let mut child = process
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                let _ = log_with_thread(
                    &format!("Failed to start {}: {}", self.program.display(), e),
                    None,
                );
                ClientError::from(e)
            })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => {
                self.stdin = Some(stdin);
                self.stdout = Some(BufReader::new(stdout));
            }
            _ => return Err(ClientError::Protocol("helper pipes unavailable".into())),
        }
        let greeting = self.read()?;
        self.forward(greeting, on_reply)
    }

    fn authenticate(&mut self, auth: &AuthInfo) -> Result<Reply, ClientError> {
        let reply = self.exchange(&format!("USER {}", auth.user_or_anonymous()))?;
        if reply.code != 331 {
            return Ok(reply);
        }
        self.exchange(&format!("PASS {}", auth.password_or_empty()))
    }

    fn command(&mut self, text: &str, on_reply: &mut ReplyCallback) -> Result<(), ClientError> {
        let first = self.exchange(text)?;
        self.forward(first, on_reply)
    }

    /// Forwards `first` and every reply after it up to a final one.
    fn forward(&mut self, first: Reply, on_reply: &mut ReplyCallback) -> Result<(), ClientError> {
        let mut reply = first;
        while reply.is_preliminary() {
            on_reply(Ok(reply));
            reply = self.read()?;
        }
        on_reply(Ok(reply));
        Ok(())
    }

    fn exchange(&mut self, text: &str) -> Result<Reply, ClientError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ClientError::Protocol("control connection is not open".into()))?;
        stdin.write_all(format!("{}\r\n", text).as_bytes())?;
        stdin.flush()?;
        self.read()
    }

    fn read(&mut self) -> Result<Reply, ClientError> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| ClientError::Protocol("control connection is not open".into()))?;
        Ok(read_reply(stdout)?)
    }

    fn transfer(
        &mut self,
        text: &str,
        data: DataRequest,
        on_reply: &mut ReplyCallback,
    ) -> Result<(), ClientError> {
        let DataRequest {
            address,
            mode,
            direction,
            base_offset,
            mut on_block,
        } = data;
        let mut conn = match address {
            Some(addr) => {
                self.data_conn = None;
                TcpStream::connect_timeout(&addr, self.config.connect_timeout())?
            }
            None => self
                .data_conn
                .take()
                .ok_or_else(|| ClientError::Protocol("no data connection to reuse".into()))?,
        };
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = conn.try_clone().ok();

        let first = self.exchange(text)?;
        let started = first.is_preliminary();
        on_reply(Ok(first));
        if !started {
            *self.data.lock().unwrap_or_else(PoisonError::into_inner) = None;
            return Ok(());
        }

        let moved = pump(&mut conn, mode, direction, base_offset, &mut on_block);
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = None;
        moved?;
        if mode == Mode::ExtendedBlock {
            self.data_conn = Some(conn);
        }

        let reply = self.read()?;
        self.forward(reply, on_reply)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::mpsc::channel;
    use std::time::Duration;
    use tempfile::tempdir;

    const SCRIPT: &str = "#!/bin/sh\n\
printf '220 helper ready\\r\\n'\n\
while read line; do\n\
  case \"$line\" in\n\
    USER*) printf '331 password please\\r\\n' ;;\n\
    PASS*) printf '230 logged in\\r\\n' ;;\n\
    QUIT*) printf '221 bye\\r\\n'; exit 0 ;;\n\
    *) printf '200 %s %s\\r\\n' \"$2\" \"$3\" ;;\n\
  esac\n\
done\n";

    fn helper_script(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("gridftp-ssh");
        {
            let mut file = File::create(&path).unwrap();
            file.write_all(SCRIPT.as_bytes()).unwrap();
            file.sync_all().unwrap();
        }
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn reply_channel() -> (ReplyCallback, mpsc::Receiver<Result<Reply, ClientError>>) {
        let (tx, rx) = channel();
        (
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
            rx,
        )
    }

    #[test]
    fn test_helper_session() {
        let dir = tempdir().unwrap();
        let program = helper_script(dir.path());
        let driver = HelperDriver::spawn(program, Arc::new(EngineConfig::default())).unwrap();
        let url = FtpUrl::parse("sshftp://example.org/data/file").unwrap();
        let wait = Duration::from_secs(10);

        let (cb, rx) = reply_channel();
        driver.connect(&url, cb).unwrap();
        assert_eq!(rx.recv_timeout(wait).unwrap().unwrap().code, 220);

        let (cb, rx) = reply_channel();
        driver
            .authenticate(&AuthInfo::new(Some("alice"), Some("secret")), cb)
            .unwrap();
        assert_eq!(rx.recv_timeout(wait).unwrap().unwrap().code, 230);

        let (cb, rx) = reply_channel();
        driver.send_command(&Command::Noop, cb).unwrap();
        let reply = rx.recv_timeout(wait).unwrap().unwrap();
        assert_eq!(reply.code, 200);
        assert_eq!(reply.message(), "example.org 22");

        let (tx, rx) = channel();
        driver.quit(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(wait).unwrap();
    }

    #[test]
    fn test_force_close_kills_helper() {
        let dir = tempdir().unwrap();
        let program = helper_script(dir.path());
        let driver = HelperDriver::spawn(program, Arc::new(EngineConfig::default())).unwrap();
        let url = FtpUrl::parse("sshftp://example.org/").unwrap();

        let (cb, rx) = reply_channel();
        driver.connect(&url, cb).unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();

        let (tx, rx) = channel();
        driver.force_close(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap();

        let (cb, rx) = reply_channel();
        driver.send_command(&Command::Noop, cb).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap_err().is_transport());
    }
}
