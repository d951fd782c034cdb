use crate::proto::State;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown socket descriptor {0}")]
    InvalidSocket(i32),

    #[error("Socket table is full")]
    TableFull,

    #[error("Operation not available in state {0:?}")]
    WrongState(State),

    #[error("Underlying datagram send failed")]
    Transport,

    #[error("Handshake gave up after {0} attempts")]
    HandshakeTimeout(u32),

    #[error("Channel too unreliable ({0:.1}% loss)")]
    PeerTooUnreliable(f32),

    #[error("Malformed PDU")]
    Malformed,
}
