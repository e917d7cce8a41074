//! Error categories surfaced by the core (§7).

/// A single error category. Kept separate from `Error` so handlers can match
/// on "what kind of thing went wrong" without caring about the attached
/// operational context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadPassword,
    NotInitialized,
    UnknownUuid,
    Corruption,
    Network,
    Tls,
    ProtocolMismatch,
    KmipFailure,
    ConfigInvalid,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad password")]
    BadPassword,

    #[error("server has no password hash configured; only Ping/GetSalt are available")]
    NotInitialized,

    #[error("unknown key uuid {uuid}")]
    UnknownUuid { uuid: String },

    #[error("record file corrupt: {path} ({reason})")]
    Corruption { path: String, reason: String },

    #[error("network error talking to {peer}: {source}")]
    Network {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error talking to {peer}: {reason}")]
    Tls { peer: String, reason: String },

    #[error("KMIP protocol mismatch: {reason}")]
    ProtocolMismatch { reason: String },

    #[error("KMIP operation failed: status={status} {text}")]
    KmipFailure { status: i32, text: String },

    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadPassword => ErrorKind::BadPassword,
            Error::NotInitialized => ErrorKind::NotInitialized,
            Error::UnknownUuid { .. } => ErrorKind::UnknownUuid,
            Error::Corruption { .. } => ErrorKind::Corruption,
            Error::Network { .. } => ErrorKind::Network,
            Error::Tls { .. } => ErrorKind::Tls,
            Error::ProtocolMismatch { .. } => ErrorKind::ProtocolMismatch,
            Error::KmipFailure { .. } => ErrorKind::KmipFailure,
            Error::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            Error::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn corruption(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Corruption { path: path.into(), reason: reason.into() }
    }

    pub fn config_invalid(reason: impl Into<String>) -> Self {
        Error::ConfigInvalid { reason: reason.into() }
    }

    pub fn unknown_uuid(uuid: impl Into<String>) -> Self {
        Error::UnknownUuid { uuid: uuid.into() }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }

    pub fn network(peer: impl std::fmt::Display, source: std::io::Error) -> Self {
        Error::Network { peer: peer.to_string(), source }
    }

    pub fn tls(peer: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Error::Tls { peer: peer.to_string(), reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
