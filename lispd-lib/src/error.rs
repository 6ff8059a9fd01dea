use thiserror::Error;

/// Errors that can occur in the control plane
#[derive(Error, Debug)]
pub enum LispError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] crate::msg::DecodeError),

    #[error("authentication error: {0}")]
    Auth(#[from] crate::auth::AuthError),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
}

pub type Result<T> = std::result::Result<T, LispError>;
