use std::io;
use thiserror::Error;

/// The error taxonomy from the connection-handling design: each variant maps
/// to one policy line in the error-handling table (retry, drop, log-and-close,
/// fail-to-start).
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("config: {0}")]
    Config(String),

    #[error("bad mtproto secret: {0}")]
    BadSecret(String),

    #[error("peek timeout")]
    PeekTimeout,

    #[error("peek i/o: {0}")]
    PeekIo(#[source] io::Error),

    #[error("classifier mismatch")]
    NoMatch,

    #[error("dial failed: {0}")]
    Dial(#[source] io::Error),

    #[error("websocket handshake failed: {0}")]
    WsHandshake(String),

    #[error("copy i/o: {0}")]
    CopyIo(#[source] io::Error),

    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TunnelError>;
