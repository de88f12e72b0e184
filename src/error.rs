//! Error taxonomy surfaced by the client engine.
//!
//! Synchronous failures (bad arguments, busy handle) come back from the
//! entry point itself. Everything that happens after an operation is
//! accepted reaches the caller through the completion callback.

use std::io;
use std::sync::Arc;

use crate::handle::Operation;
use crate::reply::Reply;

/// Errors produced by handles, targets, caches and plugins.
///
/// The type is `Clone` because the handle keeps the first error of an
/// operation as its sticky result while plugins receive their own copy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("a NULL value for {0} was used")]
    NullParameter(&'static str),

    #[error("an invalid value for {0} was used")]
    InvalidParameter(&'static str),

    #[error("{0} operation is not valid in this state")]
    InvalidOperation(Operation),

    #[error("{0} was already in use")]
    ObjectInUse(&'static str),

    #[error("{0} was not in use")]
    ObjectNotInUse(&'static str),

    #[error("the operation was aborted")]
    OperationAborted,

    #[error("a memory allocation failed")]
    OutOfMemory,

    #[error("the server responded with an error: {code} {text}")]
    Response { code: u32, text: String },

    #[error("the server doesn't support the {0} feature")]
    UnsupportedFeature(String),

    #[error("no restart marker is available")]
    NoRestartMarker,

    #[error("the requested action was already done")]
    AlreadyDone,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection error: {0}")]
    Transport(Arc<io::Error>),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl ClientError {
    /// Builds a `Response` error from a negative server reply.
    pub fn from_reply(reply: &Reply) -> Self {
        ClientError::Response {
            code: reply.code,
            text: reply.message().to_string(),
        }
    }

    /// True for errors raised by the transport rather than the server.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Tls(_))
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Transport(Arc::new(err))
    }
}

impl From<suppaftp::FtpError> for ClientError {
    fn from(err: suppaftp::FtpError) -> Self {
        match err {
            suppaftp::FtpError::ConnectionError(e) => ClientError::Transport(Arc::new(e)),
            suppaftp::FtpError::UnexpectedResponse(resp) => {
                ClientError::from_reply(&Reply::from_response(&resp))
            }
            suppaftp::FtpError::SecureError(msg) => ClientError::Tls(msg),
            other => ClientError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_error_keeps_code_and_text() {
        let reply = Reply::new(550, "550 No such file or directory.");
        let err = ClientError::from_reply(&reply);
        match &err {
            ClientError::Response { code, text } => {
                assert_eq!(*code, 550);
                assert_eq!(text, "No such file or directory.");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().contains("550"));
        assert!(!err.is_transport());
    }

    #[test]
    fn test_io_error_is_transport() {
        let err: ClientError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_transport());
        let copy = err.clone();
        assert!(copy.to_string().contains("reset"));
    }
}
