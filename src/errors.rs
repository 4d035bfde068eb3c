use thiserror::Error;

/// Malformed bytes on the wire. Fatal to the connection that produced them.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown frame prefix: 0x{0:02x}")]
    UnknownPrefix(u8),
    #[error("malformed {0} header")]
    BadHeader(&'static str),
    #[error("bulk string payload not terminated by CRLF")]
    UnterminatedBulk,
    #[error("stream closed in the middle of a frame")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Known verb with the wrong arity or argument shape. Answered with an error
/// frame; the connection stays open.
#[derive(Error, Debug)]
pub enum ArgumentError {
    #[error("Argument Error: {0}")]
    General(String),
}

/// Failure while attaching to the leader. Fatal to a follower process.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("failed to connect to leader at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("unexpected reply in state {state}: {got}")]
    UnexpectedReply { state: &'static str, got: String },
    #[error("leader closed the connection during handshake")]
    Disconnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
