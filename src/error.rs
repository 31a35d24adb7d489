use thiserror::Error;

#[derive(Debug, Error)]
pub enum SniffError {
    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),

    #[error("no capture device available")]
    NoDevice,

    #[error("unsupported link type: {0}")]
    UnsupportedLink(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("process table error: {0}")]
    ProcessTable(String),

    #[error("snapshot export failed: {0}")]
    Export(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SniffError>;
