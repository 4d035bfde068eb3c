use crate::command::{Command, CommandKind, ReplconfCommand};
use crate::errors::{HandshakeError, ProtocolError};
use crate::protocol_constants::*;
use crate::replication::ReplicationState;
use crate::resp::{FrameReader, Value};
use crate::store::Store;
use crate::util::command_frame;
use regex::Regex;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const FULLRESYNC_PATTERN: &str = r"^FULLRESYNC ([0-9a-fA-F]{40}) (\d+)$";

/// Follower attach sequence. Each state names the reply being awaited;
/// anything but the expected shape is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Greeting,
    ConfListeningPort,
    ConfCapa,
    Psyncing,
    Syncing,
    Streaming,
}

impl HandshakeState {
    fn name(self) -> &'static str {
        match self {
            HandshakeState::Greeting => "Greeting",
            HandshakeState::ConfListeningPort => "ConfListeningPort",
            HandshakeState::ConfCapa => "ConfCapa",
            HandshakeState::Psyncing => "Psyncing",
            HandshakeState::Syncing => "Syncing",
            HandshakeState::Streaming => "Streaming",
        }
    }
}

/// Connects to the leader, runs the handshake to completion, and spawns the
/// task that applies the replication stream. An error here is fatal: a
/// follower cannot make progress without its leader.
pub async fn attach_to_leader(
    addr: &str,
    listening_port: u16,
    store: Arc<Store>,
    repl: Arc<ReplicationState>,
) -> Result<JoinHandle<()>, HandshakeError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| HandshakeError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = write_half;

    handshake(&mut reader, &mut writer, listening_port, &repl).await?;
    println!("Attached to leader at {}", addr);

    Ok(tokio::spawn(async move {
        if let Err(e) = stream_from_leader(&mut reader, &mut writer, &store, &repl).await {
            eprintln!("Replication link lost: {}", e);
        }
    }))
}

/// The four-step exchange, terminated by the snapshot transfer. On return
/// the connection is in the Streaming state and `replica_offset` is 0.
async fn handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    listening_port: u16,
    repl: &ReplicationState,
) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut state = HandshakeState::Greeting;
    send(writer, &command_frame(&[b"PING"])).await?;
    let reply = expect_simple(reader, state).await?;
    if reply != PONG_RESPONSE {
        return Err(unexpected(state, &reply));
    }

    state = HandshakeState::ConfListeningPort;
    let port = listening_port.to_string();
    send(
        writer,
        &command_frame(&[b"REPLCONF", b"listening-port", port.as_bytes()]),
    )
    .await?;
    let reply = expect_simple(reader, state).await?;
    if reply != OK_RESPONSE {
        return Err(unexpected(state, &reply));
    }

    state = HandshakeState::ConfCapa;
    send(
        writer,
        &command_frame(&[b"REPLCONF", b"capa", PSYNC2_CAPA.as_bytes()]),
    )
    .await?;
    let reply = expect_simple(reader, state).await?;
    if reply != OK_RESPONSE {
        return Err(unexpected(state, &reply));
    }

    state = HandshakeState::Psyncing;
    send(writer, &command_frame(&[b"PSYNC", b"?", b"-1"])).await?;
    let reply = expect_simple(reader, state).await?;
    let replid = Regex::new(FULLRESYNC_PATTERN)
        .ok()
        .and_then(|re| re.captures(&reply).map(|captures| captures[1].to_string()))
        .ok_or_else(|| unexpected(state, &reply))?;
    repl.set_replid(replid);

    state = HandshakeState::Syncing;
    let snapshot_len = match reader.read_snapshot().await {
        Ok(len) => len,
        Err(e) => return Err(unexpected(state, &e.to_string())),
    };
    println!("Discarded a {} byte snapshot from the leader", snapshot_len);

    state = HandshakeState::Streaming;
    println!("Handshake complete, connection is {}", state.name());
    Ok(())
}

/// Applies the replication stream. Mutations land in the local store with no
/// reply; probes are answered; every consumed frame advances
/// `replica_offset` by its raw length — except that a GETACK's own length is
/// added only after the ACK reply carrying the pre-GETACK offset went out.
async fn stream_from_leader<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    store: &Store,
    repl: &ReplicationState,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(frame) = reader.read_frame().await? else {
            return Ok(());
        };
        let frame_len = frame.raw_len() as u64;

        let cmd = match Command::from_frame(frame) {
            Ok(cmd) => cmd,
            Err(e) => {
                eprintln!("Bad command on the replication link: {}", e);
                repl.advance_offset(frame_len);
                continue;
            }
        };

        match cmd.kind {
            CommandKind::Set {
                key,
                value,
                expiry_ms,
            } => {
                store.set(key, value, expiry_ms);
            }
            CommandKind::Ping => {
                let reply = Value::SimpleString(PONG_RESPONSE.into());
                writer.write_all(&reply.encode()).await?;
            }
            CommandKind::Echo(message) => {
                writer.write_all(&Value::BulkString(message).encode()).await?;
            }
            CommandKind::Get(key) => {
                let reply = match store.get(&key) {
                    Some(value) => Value::BulkString(value),
                    None => Value::NullBulk,
                };
                writer.write_all(&reply.encode()).await?;
            }
            CommandKind::Info => {
                let info = repl.replication_info();
                writer
                    .write_all(&Value::BulkString(info.into()).encode())
                    .await?;
            }
            CommandKind::Replconf(ReplconfCommand::GetAck) => {
                let offset = repl.repl_offset().to_string();
                let ack = command_frame(&[b"REPLCONF", b"ACK", offset.as_bytes()]);
                writer.write_all(&ack).await?;
            }
            CommandKind::Replconf(_) | CommandKind::Psync | CommandKind::Wait { .. } => {}
            CommandKind::Unknown(verb) => {
                eprintln!("Unknown command on the replication link ignored: {:?}", verb);
            }
        }

        repl.advance_offset(frame_len);
    }
}

async fn send<W>(writer: &mut W, frame: &[u8]) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(frame)
        .await
        .map_err(|e| HandshakeError::Protocol(ProtocolError::Io(e)))
}

async fn expect_simple<R>(
    reader: &mut FrameReader<R>,
    state: HandshakeState,
) -> Result<String, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_frame().await? {
        None => Err(HandshakeError::Disconnected),
        Some(frame) => match frame.value {
            Value::SimpleString(text) => Ok(text),
            other => Err(HandshakeError::UnexpectedReply {
                state: state.name(),
                got: format!("{:?}", other),
            }),
        },
    }
}

fn unexpected(state: HandshakeState, got: &str) -> HandshakeError {
    HandshakeError::UnexpectedReply {
        state: state.name(),
        got: got.to_string(),
    }
}
