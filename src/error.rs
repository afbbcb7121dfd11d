//! Daemon error types

use thiserror::Error;

/// NNTP protocol, store, and connection errors
#[derive(Error, Debug)]
pub enum NntpdError {
    /// IO error during network or blob operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Send or handshake timeout
    #[error("Timeout")]
    Timeout,

    /// Peer closed the connection unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// Message-ID failed validation
    #[error("Malformed message-id: {0}")]
    MalformedId(String),

    /// Headers did not terminate or required fields are missing
    #[error("Malformed article: {0}")]
    MalformedArticle(String),

    /// Signature present but verification failed
    #[error("Bad signature on {0}")]
    BadSignature(String),

    /// A blob for this message-id already exists
    #[error("Duplicate article: {0}")]
    DuplicateArticle(String),

    /// GROUP for a newsgroup we do not carry
    #[error("No such newsgroup: {0}")]
    UnknownGroup(String),

    /// POST without prior XSECRET authorization
    #[error("Posting not permitted")]
    Unauthorized,

    /// Unexpected response from an outbound peer
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// SOCKS4a handshake failed
    #[error("Proxy failure: {0}")]
    ProxyFailure(String),

    /// Invalid configuration (bad policy rule, bad address, missing section)
    #[error("Config error: {0}")]
    Config(String),

    /// Relational index error
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// Result type alias using NntpdError
pub type Result<T> = std::result::Result<T, NntpdError>;
