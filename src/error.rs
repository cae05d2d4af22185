use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("capture file error: {0}")]
    Capture(String),

    #[error("shutdown timed out: {0}")]
    ShutdownTimeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;
