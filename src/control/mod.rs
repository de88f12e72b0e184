//! Control connection drivers
//!
//! The state machines talk to servers only through `ControlConnection`.
//! A driver queues every request and answers through the supplied
//! callback from one of its own threads, never from inside the call, so
//! callers may hold the handle lock while issuing requests.

pub mod ftp;
pub mod helper;
#[cfg(test)]
pub mod mock;

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use crate::attr::{AuthInfo, Mode};
use crate::command::Command;
use crate::config::EngineConfig;
use crate::data::{self, Block, SharedSink, SharedSource};
use crate::error::ClientError;
use crate::reply::Reply;
use crate::restart_marker::Range;
use crate::url::{FtpUrl, Scheme};

/// Receives every reply to one request: preliminary ones first, then the
/// final one. An error ends the exchange.
pub type ReplyCallback = Box<dyn FnMut(Result<Reply, ClientError>) + Send>;

/// Runs once a quit or forced close has finished.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// Reports each block moved over the data channel.
pub type BlockCallback = Box<dyn FnMut(Block) + Send>;

pub enum Direction {
    Receive(SharedSink),
    Send {
        source: SharedSource,
        end: Option<u64>,
        skip: Vec<Range>,
    },
}

/// Data channel half of a transfer command.
pub struct DataRequest {
    /// Address from the last `PASV`; `None` reuses the open data connection.
    pub address: Option<SocketAddr>,
    pub mode: Mode,
    pub direction: Direction,
    pub base_offset: u64,
    pub on_block: BlockCallback,
}

pub trait ControlConnection: Send + Sync {
    /// Opens the control channel; the callback gets the greeting.
    fn connect(&self, url: &FtpUrl, on_reply: ReplyCallback) -> Result<(), ClientError>;

    fn authenticate(&self, auth: &AuthInfo, on_reply: ReplyCallback) -> Result<(), ClientError>;

    fn send_command(&self, command: &Command, on_reply: ReplyCallback) -> Result<(), ClientError>;

    /// Sends a data command and moves the data; the final reply arrives
    /// after the data channel is done.
    fn transfer(
        &self,
        command: &Command,
        data: DataRequest,
        on_reply: ReplyCallback,
    ) -> Result<(), ClientError>;

    fn quit(&self, on_done: CloseCallback) -> Result<(), ClientError>;

    /// Tears the connection down, interrupting whatever is in progress.
    fn force_close(&self, on_closed: CloseCallback) -> Result<(), ClientError>;
}

/// Work queued for a driver's worker thread.
enum Job {
    Connect {
        url: FtpUrl,
        on_reply: ReplyCallback,
    },
    Authenticate {
        auth: AuthInfo,
        on_reply: ReplyCallback,
    },
    Command {
        text: String,
        on_reply: ReplyCallback,
    },
    Transfer {
        text: String,
        data: DataRequest,
        on_reply: ReplyCallback,
    },
    Quit {
        on_done: CloseCallback,
    },
    Closed {
        on_closed: CloseCallback,
    },
}

fn closed_error() -> ClientError {
    io::Error::new(io::ErrorKind::ConnectionAborted, "control connection closed").into()
}

/// Moves the data of one transfer over an open data connection.
fn pump(
    conn: &mut TcpStream,
    mode: Mode,
    direction: Direction,
    base_offset: u64,
    on_block: &mut BlockCallback,
) -> io::Result<u64> {
    match direction {
        Direction::Receive(sink) => data::receive(conn, mode, &sink, base_offset, &mut **on_block),
        Direction::Send { source, end, skip } => {
            data::send(conn, mode, &source, base_offset, end, &skip, &mut **on_block)
        }
    }
}

/// Opens control connections for targets.
pub trait ControlFactory: Send + Sync {
    fn open(
        &self,
        url: &FtpUrl,
        config: &Arc<EngineConfig>,
    ) -> Result<Arc<dyn ControlConnection>, ClientError>;
}

/// Picks the suppaftp driver for `ftp`/`gsiftp` and the helper program
/// driver for `sshftp`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultControlFactory;

impl ControlFactory for DefaultControlFactory {
    fn open(
        &self,
        url: &FtpUrl,
        config: &Arc<EngineConfig>,
    ) -> Result<Arc<dyn ControlConnection>, ClientError> {
        match url.scheme {
            Scheme::Ftp | Scheme::Gsiftp => Ok(Arc::new(ftp::FtpDriver::spawn(Arc::clone(config))?)),
            Scheme::Sshftp => {
                let program = config
                    .find_ssh_client_program()
                    .ok_or_else(|| ClientError::UnsupportedFeature("sshftp helper program".into()))?;
                Ok(Arc::new(helper::HelperDriver::spawn(program, Arc::clone(config))?))
            }
        }
    }
}
