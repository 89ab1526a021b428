use thiserror::Error;

/// Errors produced by the mole tunnel layer.
#[derive(Debug, Error)]
pub enum MoleError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("tunnel {0} already registered")]
    DuplicateTunnel(u64),

    #[error("tunnel not found: {0}")]
    TunnelNotFound(u64),

    #[error("tunnel {0} is closed")]
    TunnelClosed(u64),

    #[error("tunnel {tunnel_id}: {pending} chunks waiting for sequence {expected}")]
    ReassemblyOverflow {
        tunnel_id: u64,
        expected: u64,
        pending: usize,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("remote error {code}: {message}")]
    Remote { code: u32, message: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for MoleError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        MoleError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for MoleError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        MoleError::Codec(e.to_string())
    }
}

pub type MoleResult<T> = Result<T, MoleError>;
