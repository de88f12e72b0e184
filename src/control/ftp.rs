//! suppaftp-backed control connection driver
//!
//! Each connection owns a worker thread fed by a job queue; the worker
//! holds the `FtpStream` (or `RustlsFtpStream` for secured gsiftp control
//! channels) and answers every job through its callback.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use suppaftp::{FtpError, FtpStream, RustlsConnector, RustlsFtpStream};

use crate::attr::{AuthInfo, Mode};
use crate::command::Command;
use crate::config::EngineConfig;
use crate::control::{
    closed_error, pump, CloseCallback, ControlConnection, DataRequest, Job, ReplyCallback,
};
use crate::error::ClientError;
use crate::logging::log_with_thread;
use crate::reply::Reply;
use crate::url::{FtpUrl, Scheme};

static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);

// Module for insecure certificate verification (for self-signed certs)
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    /// Certificate verifier that accepts any certificate
    ///
    /// WARNING: only for test servers with self-signed certificates.
    #[derive(Debug)]
    pub struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

enum Session {
    Plain(FtpStream),
    Secure(RustlsFtpStream),
}

/// Runs `$body` against whichever stream type the session holds.
macro_rules! with_stream {
    ($session:expr, $s:ident => $body:expr) => {
        match $session {
            Session::Plain($s) => $body,
            Session::Secure($s) => $body,
        }
    };
}

/// Sockets the caller side can shut down while the worker is blocked.
#[derive(Default)]
struct Sockets {
    control: Mutex<Option<TcpStream>>,
    data: Mutex<Option<TcpStream>>,
}

impl Sockets {
    fn shutdown(&self) {
        for slot in [&self.control, &self.data] {
            if let Some(sock) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = sock.shutdown(Shutdown::Both);
            }
        }
    }

    fn set_control(&self, sock: Option<TcpStream>) {
        *self.control.lock().unwrap_or_else(PoisonError::into_inner) = sock;
    }

    fn set_data(&self, sock: Option<TcpStream>) {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = sock;
    }
}

pub struct FtpDriver {
    jobs: Mutex<Sender<Job>>,
    sockets: Arc<Sockets>,
    closed: Arc<AtomicBool>,
}

impl FtpDriver {
    /// Starts the worker thread. No network I/O happens until `connect`.
    pub fn spawn(config: Arc<EngineConfig>) -> Result<FtpDriver, ClientError> {
        let (tx, rx) = mpsc::channel();
        let sockets = Arc::new(Sockets::default());
        let closed = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            id: NEXT_WORKER.fetch_add(1, Ordering::SeqCst),
            config,
            session: None,
            data_conn: None,
            sockets: Arc::clone(&sockets),
            closed: Arc::clone(&closed),
        };
        thread::Builder::new()
            .name(format!("gridftp-control-{}", worker.id))
            .spawn(move || worker.run(rx))?;
        Ok(FtpDriver {
            jobs: Mutex::new(tx),
            sockets,
            closed,
        })
    }

    fn enqueue(&self, job: Job) -> Result<(), ClientError> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(job)
            .map_err(|_| ClientError::Protocol("control connection worker has exited".into()))
    }
}

impl ControlConnection for FtpDriver {
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
        self.sockets.shutdown();
        self.enqueue(Job::Closed { on_closed })
    }
}

struct Worker {
    id: u64,
    config: Arc<EngineConfig>,
    session: Option<Session>,
    /// Extended-block data connection kept open for the next transfer.
    data_conn: Option<TcpStream>,
    sockets: Arc<Sockets>,
    closed: Arc<AtomicBool>,
}

impl Worker {
    fn run(mut self, rx: Receiver<Job>) {
        for job in rx {
            match job {
                Job::Closed { on_closed } => {
                    self.session = None;
                    self.data_conn = None;
                    self.sockets.set_control(None);
                    self.sockets.set_data(None);
                    on_closed();
                }
                Job::Quit { on_done } => {
                    if let Some(mut session) = self.session.take() {
                        let _ = with_stream!(&mut session, s => s.quit());
                    }
                    self.data_conn = None;
                    self.sockets.set_control(None);
                    on_done();
                }
                Job::Connect { url, mut on_reply } => {
                    let result = self.guarded(|w| w.connect(&url));
                    on_reply(result);
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
            self.session = None;
            self.data_conn = None;
            self.sockets.shutdown();
            return Err(closed_error());
        }
        result
    }

    fn session(&mut self) -> Result<&mut Session, ClientError> {
        self.session
            .as_mut()
            .ok_or_else(|| ClientError::Protocol("control connection is not open".into()))
    }

    fn connect(&mut self, url: &FtpUrl) -> Result<Reply, ClientError> {
        let addrs: Vec<SocketAddr> = (url.host.as_str(), url.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "No addresses found").into());
        }
        let timeout = self.config.connect_timeout();
        let secure = url.scheme == Scheme::Gsiftp && self.config.secure_gsiftp_control;

        let mut last_error = None;
        for addr in addrs {
            let attempt = if secure {
                self.connect_secure(addr, &url.host, timeout)
            } else {
                FtpStream::connect_timeout(addr, timeout)
                    .map(Session::Plain)
                    .map_err(ClientError::from)
            };
            match attempt {
                Ok(session) => {
                    let sock = with_stream!(&session, s => s.get_ref().try_clone()).ok();
                    self.sockets.set_control(sock);
                    let welcome = with_stream!(&session, s => s.get_welcome_msg().map(str::to_string));
                    self.session = Some(session);
                    return Ok(greeting(welcome));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "No addresses available").into()
        }))
    }

    fn connect_secure(
        &self,
        addr: SocketAddr,
        host: &str,
        timeout: Duration,
    ) -> Result<Session, ClientError> {
        let provider = rustls::crypto::ring::default_provider();
        let builder = rustls::ClientConfig::builder_with_provider(Arc::new(provider));

        let tls_config = if self.config.insecure_skip_verify {
            builder
                .with_safe_default_protocol_versions()
                .map_err(|e| ClientError::Tls(e.to_string()))?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
                .with_no_client_auth()
        } else {
            let mut root_store = rustls::RootCertStore::empty();
            let certs_result = rustls_native_certs::load_native_certs();
            for cert in certs_result.certs {
                root_store.add(cert).ok();
            }
            if !certs_result.errors.is_empty() {
                let _ = log_with_thread(
                    &format!(
                        "Warning: failed to load some native certificates: {:?}",
                        certs_result.errors
                    ),
                    None,
                );
            }
            builder
                .with_safe_default_protocol_versions()
                .map_err(|e| ClientError::Tls(e.to_string()))?
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        let stream = RustlsFtpStream::connect_timeout(addr, timeout)?;
        let connector = RustlsConnector::from(Arc::new(tls_config));
        let stream = stream.into_secure(connector, host)?;
        Ok(Session::Secure(stream))
    }

    fn authenticate(&mut self, auth: &AuthInfo) -> Result<Reply, ClientError> {
        let session = self.session()?;
        let user = auth.user_or_anonymous();
        let password = auth.password_or_empty();
        match with_stream!(session, s => s.login(user, password)) {
            Ok(()) => Ok(Reply::new(230, "230 User logged in")),
            Err(FtpError::UnexpectedResponse(resp)) => Ok(Reply::from_response(&resp)),
            Err(e) => Err(e.into()),
        }
    }

    /// Sends one command and forwards replies until a final one arrives.
    fn command(&mut self, text: &str, on_reply: &mut ReplyCallback) -> Result<(), ClientError> {
        let mut reply = self.send_raw(text)?;
        while reply.is_preliminary() {
            on_reply(Ok(reply));
            reply = self.next_reply()?;
        }
        on_reply(Ok(reply));
        Ok(())
    }

    fn send_raw(&mut self, text: &str) -> Result<Reply, ClientError> {
        let session = self.session()?;
        match with_stream!(session, s => s.custom_command(text, &[])) {
            Ok(resp) => Ok(Reply::from_response(&resp)),
            Err(FtpError::UnexpectedResponse(resp)) => Ok(Reply::from_response(&resp)),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the reply that follows a preliminary one.
    fn next_reply(&mut self) -> Result<Reply, ClientError> {
        let session = self.session()?;
        match with_stream!(session, s => s.finalize_retr_stream(io::empty())) {
            Ok(()) => Ok(Reply::new(226, "226 Transfer complete")),
            Err(FtpError::UnexpectedResponse(resp)) => Ok(Reply::from_response(&resp)),
            Err(e) => Err(e.into()),
        }
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
        self.sockets.set_data(conn.try_clone().ok());

        let first = self.send_raw(text)?;
        let started = first.is_preliminary();
        on_reply(Ok(first));
        if !started {
            self.sockets.set_data(None);
            return Ok(());
        }

        let moved = pump(&mut conn, mode, direction, base_offset, &mut on_block);
        self.sockets.set_data(None);
        moved?;
        if mode == Mode::ExtendedBlock {
            self.data_conn = Some(conn);
        } else {
            drop(conn);
        }

        let mut reply = self.next_reply()?;
        while reply.is_preliminary() {
            on_reply(Ok(reply));
            reply = self.next_reply()?;
        }
        on_reply(Ok(reply));
        Ok(())
    }
}

fn greeting(welcome: Option<String>) -> Reply {
    let text = welcome.unwrap_or_default();
    let text = text.trim_end();
    let has_code = text.len() >= 3 && text.as_bytes()[..3].iter().all(u8::is_ascii_digit);
    if has_code {
        Reply::new(220, text)
    } else if text.is_empty() {
        Reply::new(220, "220 Service ready")
    } else {
        Reply::new(220, format!("220 {}", text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_driver_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FtpDriver>();
    }

    #[test]
    fn test_greeting_keeps_or_adds_code() {
        assert_eq!(greeting(Some("220 GridFTP Server ready".into())).message(), "GridFTP Server ready");
        assert_eq!(greeting(Some("Welcome".into())).text, "220 Welcome");
        assert_eq!(greeting(None).code, 220);
    }

    #[test]
    fn test_connect_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let driver = FtpDriver::spawn(Arc::new(EngineConfig::default())).unwrap();
        let url = FtpUrl::parse(&format!("ftp://127.0.0.1:{}/x", port)).unwrap();
        let (tx, rx) = channel();
        driver
            .connect(&url, Box::new(move |r| tx.send(r).unwrap()))
            .unwrap();
        let result = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(result.unwrap_err().is_transport());
    }

    #[test]
    fn test_force_close_fails_later_jobs() {
        let driver = FtpDriver::spawn(Arc::new(EngineConfig::default())).unwrap();
        let (tx, rx) = channel();
        driver.force_close(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (tx, rx) = channel();
        driver
            .send_command(&Command::Noop, Box::new(move |r| tx.send(r).unwrap()))
            .unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.unwrap_err().is_transport());
    }
}
