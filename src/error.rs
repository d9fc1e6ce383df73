use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration, unknown method, inconsistent asset list.
    #[error("configuration is invalid - {0}")]
    ConfigInvalid(String),

    #[error("missing an argument - {0}")]
    MissingParameter(&'static str),

    #[error("this mode is unimplemented - {0}")]
    Unimplemented(&'static str),

    /// Input missing or unreadable, JWE validation failure, or an unseal that
    /// gave up waiting on the server.
    #[error("source data is unavailable - {0}")]
    SourceUnavailable(String),

    #[error("malformed JWE - {0}")]
    JweParse(String),

    #[error("cryptographic failure - {0}")]
    Crypto(String),

    /// The server will never answer positively (406/418, or no usable CA
    /// bundle on this host).
    #[error("permanent failure from tang - {0}")]
    PermanentTangFailure(String),

    /// Transport problems and unexpected statuses. Retried by the unseal loop
    /// until its give-up deadline.
    #[error("error communicating with tang - {0}")]
    TransientTangFailure(String),

    #[error("failed to open {path} - {detail}")]
    Open { path: String, detail: String },

    #[error("other end broke the pipe for {0}")]
    BrokenPipe(String),

    #[error("generic error for {path} - {detail}")]
    GenericIo {
        path: String,
        detail: String,
        #[source]
        cause: Option<Box<Error>>,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("json error - {0}")]
    Json(#[from] serde_json::Error),

    #[error("jose error - {0}")]
    Jose(#[from] josekit::JoseError),

    #[error("base64 error - {0}")]
    Base64(#[from] base64ct::Error),
}
