use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DomainError {
    /// An append would grow a packet past its declared maximum size. The
    /// packet is left untouched when this is returned.
    #[error("packet maximum size exceeded")]
    ExceedsMaxSize,

    #[error("packet too short")]
    PacketTooShort,

    #[error("malformed packet: {0}")]
    BadPacket(String),

    #[error("invalid DNS name: {0}")]
    BadName(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("timeout talking to {0}")]
    Timeout(String),
}
