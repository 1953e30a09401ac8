use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("device communication error: {0}")]
    Comm(String),
    #[error("device timeout")]
    Timeout,
    #[error("target outside stage travel: {0}")]
    Travel(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
