use std::io;
use std::net::SocketAddr;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to bind {addr}, {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to resolve host {host:?}, {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("bootstrap has not been started")]
    NotStarted,
    #[error("chain is already initialized")]
    AlreadyInitialized,
    #[error("chain has not been initialized")]
    NotInitialized,
    #[error("chain has been destroyed")]
    Destroyed,
    #[error("listening connection is already listening")]
    AlreadyListening,
    #[error("listening connection is not listening")]
    NotListening,
}

impl Error {
    /// Returns the underlying I/O error kind, if any
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::Io(e) => Some(e.kind()),
            Error::Bind { source, .. } | Error::Resolve { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}
