#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
