//! Error handling for the http server

use std::io;

/// A Result for internal operations.
pub type Result<T> = ::std::result::Result<T, Error>;

/// All errors which might arise within the application
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("path is not in origin form")]
    PathNotInOriginForm,
    #[error("illegal percent-encoding in path")]
    IllegalPercentEncoding,
    #[error("path escapes the document root")]
    PathTraversal,
    #[error("could not spawn CGI process: {0}")]
    Spawn(#[source] io::Error),
    #[error("no listening socket could be bound")]
    NoListeners,
}
