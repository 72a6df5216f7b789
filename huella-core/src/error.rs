use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported format: {0}")]
    Format(String),

    #[error("audio too short: need at least {needed} samples per channel, got {got}")]
    InputTooShort { needed: usize, got: usize },

    #[error("bad key: {0}")]
    BadKey(String),

    #[error("unsupported short payload size: {0} bits")]
    ShortCodeUnsupported(usize),

    #[error("no watermark detected")]
    DecodeFail,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
