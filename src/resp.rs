use crate::errors::ProtocolError;
use crate::protocol_constants::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// One RESP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    NullBulk,
    Array(Vec<Value>),
    /// Emitted verbatim, no framing. Only used for the snapshot transfer,
    /// whose payload deliberately carries no trailing CRLF.
    Raw(Bytes),
}

impl Value {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.write_to(&mut out);
        out.freeze()
    }

    fn write_to(&self, out: &mut BytesMut) {
        match self {
            Value::SimpleString(text) => {
                out.put_u8(SIMPLE_STRING_PREFIX);
                out.put_slice(text.as_bytes());
                out.put_slice(CRLF.as_bytes());
            }
            Value::Error(text) => {
                out.put_u8(ERROR_PREFIX);
                out.put_slice(text.as_bytes());
                out.put_slice(CRLF.as_bytes());
            }
            Value::Integer(n) => {
                out.put_u8(INTEGER_PREFIX);
                out.put_slice(n.to_string().as_bytes());
                out.put_slice(CRLF.as_bytes());
            }
            Value::BulkString(payload) => {
                out.put_u8(BULK_STRING_PREFIX);
                out.put_slice(payload.len().to_string().as_bytes());
                out.put_slice(CRLF.as_bytes());
                out.put_slice(payload);
                out.put_slice(CRLF.as_bytes());
            }
            Value::NullBulk => {
                out.put_slice(b"$-1\r\n");
            }
            Value::Array(items) => {
                out.put_u8(ARRAY_PREFIX);
                out.put_slice(items.len().to_string().as_bytes());
                out.put_slice(CRLF.as_bytes());
                for item in items {
                    item.write_to(out);
                }
            }
            Value::Raw(payload) => {
                out.put_slice(payload);
            }
        }
    }
}

/// A decoded frame together with the exact bytes it was decoded from.
///
/// `raw.len()` is the consumed on-wire byte count. Offset bookkeeping uses it
/// directly; re-encoding the value could canonicalize and differ by a byte.
#[derive(Debug, Clone)]
pub struct Frame {
    pub value: Value,
    pub raw: Bytes,
}

impl Frame {
    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }
}

/// Incremental frame reader over a byte stream. Frames need not align with
/// read boundaries; partial frames stay buffered until completed.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Reads one complete frame. `Ok(None)` means the peer closed the stream
    /// cleanly between frames; closing mid-frame is a protocol error.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if let Some((value, len)) = parse_at(&self.buf, 0)? {
                let raw = self.buf.split_to(len).freeze();
                return Ok(Some(Frame { value, raw }));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::UnexpectedEof);
            }
        }
    }

    /// Consumes a snapshot transfer: `$len\r\n` followed by exactly `len`
    /// binary bytes and no trailing CRLF. The payload is discarded; only the
    /// count is reported.
    pub async fn read_snapshot(&mut self) -> Result<usize, ProtocolError> {
        let len = loop {
            if !self.buf.is_empty() && self.buf[0] != BULK_STRING_PREFIX {
                return Err(ProtocolError::BadHeader("snapshot"));
            }
            let header = match find_line(&self.buf, 1) {
                Some((line, after)) => {
                    let len: usize = std::str::from_utf8(line)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or(ProtocolError::BadHeader("snapshot"))?;
                    Some((len, after))
                }
                None => None,
            };
            if let Some((len, after)) = header {
                self.buf.advance(after);
                break len;
            }
            if self.fill().await? == 0 {
                return Err(ProtocolError::UnexpectedEof);
            }
        };

        while self.buf.len() < len {
            if self.fill().await? == 0 {
                return Err(ProtocolError::UnexpectedEof);
            }
        }
        self.buf.advance(len);
        Ok(len)
    }

    async fn fill(&mut self) -> Result<usize, ProtocolError> {
        Ok(self.reader.read_buf(&mut self.buf).await?)
    }
}

/// Tries to decode one frame starting at `pos`. `Ok(None)` means more bytes
/// are needed; `Ok(Some((value, end)))` hands back the position just past the
/// frame.
fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(Value, usize)>, ProtocolError> {
    let Some(&prefix) = buf.get(pos) else {
        return Ok(None);
    };
    match prefix {
        SIMPLE_STRING_PREFIX => Ok(find_line(buf, pos + 1).map(|(line, end)| {
            (
                Value::SimpleString(String::from_utf8_lossy(line).into_owned()),
                end,
            )
        })),
        ERROR_PREFIX => Ok(find_line(buf, pos + 1).map(|(line, end)| {
            (Value::Error(String::from_utf8_lossy(line).into_owned()), end)
        })),
        INTEGER_PREFIX => match find_line(buf, pos + 1) {
            Some((line, end)) => {
                let n: i64 = std::str::from_utf8(line)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(ProtocolError::BadHeader("integer"))?;
                Ok(Some((Value::Integer(n), end)))
            }
            None => Ok(None),
        },
        BULK_STRING_PREFIX => {
            let Some((line, after)) = find_line(buf, pos + 1) else {
                return Ok(None);
            };
            let declared: i64 = std::str::from_utf8(line)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(ProtocolError::BadHeader("bulk string"))?;
            if declared == -1 {
                return Ok(Some((Value::NullBulk, after)));
            }
            if declared < 0 {
                return Err(ProtocolError::BadHeader("bulk string"));
            }
            let len = declared as usize;
            let end = after + len + 2;
            if buf.len() < end {
                return Ok(None);
            }
            if &buf[after + len..end] != CRLF.as_bytes() {
                return Err(ProtocolError::UnterminatedBulk);
            }
            Ok(Some((
                Value::BulkString(Bytes::copy_from_slice(&buf[after..after + len])),
                end,
            )))
        }
        ARRAY_PREFIX => {
            let Some((line, after)) = find_line(buf, pos + 1) else {
                return Ok(None);
            };
            let count: i64 = std::str::from_utf8(line)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(ProtocolError::BadHeader("array"))?;
            if count < 0 {
                return Err(ProtocolError::BadHeader("array"));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut at = after;
            for _ in 0..count {
                match parse_at(buf, at)? {
                    Some((item, next)) => {
                        items.push(item);
                        at = next;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Value::Array(items), at)))
        }
        other => Err(ProtocolError::UnknownPrefix(other)),
    }
}

/// Returns the line starting at `from` (without its CRLF) and the position
/// just past the CRLF, or `None` if the terminator is not buffered yet.
fn find_line(buf: &[u8], from: usize) -> Option<(&[u8], usize)> {
    if from > buf.len() {
        return None;
    }
    let rel = buf[from..].windows(2).position(|w| w == CRLF.as_bytes())?;
    Some((&buf[from..from + rel], from + rel + 2))
}
