/// Error type shared by all host-networking operations.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command '{cmd}' failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type NetworkResult<T> = Result<T, NetworkError>;
