use crate::resp::Value;
use bytes::Bytes;

/// Builds the array-of-bulk-strings frame for a command, e.g. the handshake
/// sends and the ack probe/reply traffic.
pub fn command_frame(args: &[&[u8]]) -> Bytes {
    Value::Array(
        args.iter()
            .map(|arg| Value::BulkString(Bytes::copy_from_slice(arg)))
            .collect(),
    )
    .encode()
}
