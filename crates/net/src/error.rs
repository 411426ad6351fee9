use std::io;
use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("No address known for {0}")]
    AddressNotFound(Ipv4Addr),

    #[error("Non-contiguous subnet mask {0}")]
    InvalidSubnetMask(Ipv4Addr),

    #[error("Invalid rule on line {line}: {reason}")]
    InvalidRule { line: usize, reason: String },

    #[error("Connection error: {0}")]
    Connection(String),
}

impl NetError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        NetError::MalformedHeader(reason.into())
    }
}
