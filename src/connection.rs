use crate::command::{Command, CommandKind, ReplconfCommand};
use crate::errors::ProtocolError;
use crate::protocol_constants::*;
use crate::replication::{empty_snapshot, ReplicationState};
use crate::resp::{FrameReader, Value};
use crate::store::Store;
use crate::util::command_frame;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;

/// Drives one inbound connection: read a frame, classify it, dispatch it,
/// write the reply. If the peer turns out to be a follower (it completes the
/// PSYNC exchange), the connection switches into the mirror-stream loop and
/// stops replying to ordinary traffic.
pub async fn serve_connection<R, W>(
    reader: R,
    writer: W,
    store: Arc<Store>,
    repl: Arc<ReplicationState>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(reader);
    let mut writer = writer;
    let mut registered = None;

    let outcome = client_loop(&mut reader, &mut writer, &store, &repl, &mut registered).await;

    let outcome = match outcome {
        Ok(Some(mirror_rx)) => follower_loop(&mut reader, &mut writer, &repl, mirror_rx).await,
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    };

    if let Some(id) = registered {
        repl.remove_follower(id);
    }
    if let Err(e) = outcome {
        eprintln!("Connection closed: {}", e);
    }
}

/// The ordinary dispatch loop. Returns the mirror receiver once PSYNC
/// completes and this connection becomes a replication stream, or `None` on
/// a clean close.
async fn client_loop<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    store: &Store,
    repl: &ReplicationState,
    registered: &mut Option<u64>,
) -> Result<Option<UnboundedReceiver<Bytes>>, ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut mirror_rx = None;

    loop {
        let Some(frame) = reader.read_frame().await? else {
            return Ok(None);
        };

        let cmd = match Command::from_frame(frame) {
            Ok(cmd) => cmd,
            Err(e) => {
                let reply = Value::Error(format!("ERR {}", e));
                writer.write_all(&reply.encode()).await?;
                continue;
            }
        };

        let mirror = cmd.is_mutating() && repl.is_master();
        let Command { kind, frame } = cmd;

        match kind {
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
            CommandKind::Set {
                key,
                value,
                expiry_ms,
            } => {
                store.set(key, value, expiry_ms);
                if mirror {
                    repl.replicate(&frame.raw);
                }
                let reply = Value::SimpleString(OK_RESPONSE.into());
                writer.write_all(&reply.encode()).await?;
            }
            CommandKind::Info => {
                let info = Bytes::from(repl.replication_info());
                writer.write_all(&Value::BulkString(info).encode()).await?;
            }
            CommandKind::Replconf(ReplconfCommand::ListeningPort(port)) => {
                let (id, rx) = repl.register_follower();
                *registered = Some(id);
                mirror_rx = Some(rx);
                println!("Follower announced on port {}", port);
                let reply = Value::SimpleString(OK_RESPONSE.into());
                writer.write_all(&reply.encode()).await?;
            }
            CommandKind::Replconf(ReplconfCommand::Capa) => {
                let reply = Value::SimpleString(OK_RESPONSE.into());
                writer.write_all(&reply.encode()).await?;
            }
            CommandKind::Replconf(ReplconfCommand::GetAck) => {
                let offset = repl.repl_offset().to_string();
                let ack = command_frame(&[b"REPLCONF", b"ACK", offset.as_bytes()]);
                writer.write_all(&ack).await?;
            }
            CommandKind::Replconf(ReplconfCommand::Ack(offset)) => {
                repl.publish_ack(offset);
            }
            CommandKind::Psync => {
                let id = match *registered {
                    Some(id) => id,
                    None => {
                        // PSYNC without a prior listening-port announcement.
                        let (id, rx) = repl.register_follower();
                        *registered = Some(id);
                        mirror_rx = Some(rx);
                        id
                    }
                };

                let resync = Value::SimpleString(format!(
                    "{} {} 0",
                    FULLRESYNC_RESPONSE,
                    repl.replid()
                ));
                writer.write_all(&resync.encode()).await?;
                writer.write_all(&snapshot_frame()).await?;

                repl.mark_streaming(id);
                return Ok(mirror_rx);
            }
            CommandKind::Wait {
                required,
                timeout_ms,
            } => {
                let acks = repl.wait_for_acks(required, timeout_ms).await;
                let reply = Value::Integer(acks as i64);
                writer.write_all(&reply.encode()).await?;
            }
            CommandKind::Unknown(verb) => {
                eprintln!("Unknown command ignored: {:?}", verb);
            }
        }
    }
}

/// Post-PSYNC loop for a follower connection on the leader. Frames queued by
/// the mirror path are forwarded to the socket; the only traffic read back
/// is `REPLCONF ACK`, which feeds the wait aggregator. Nothing else on this
/// socket gets a reply.
async fn follower_loop<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    repl: &ReplicationState,
    mut mirror_rx: UnboundedReceiver<Bytes>,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            queued = mirror_rx.recv() => {
                match queued {
                    Some(frame) => writer.write_all(&frame).await?,
                    None => return Ok(()),
                }
            }
            inbound = reader.read_frame() => {
                match inbound? {
                    None => return Ok(()),
                    Some(frame) => {
                        if let Ok(cmd) = Command::from_frame(frame) {
                            if let CommandKind::Replconf(ReplconfCommand::Ack(offset)) = cmd.kind {
                                repl.publish_ack(offset);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// The full-resync payload: `$len\r\n` + snapshot bytes, deliberately
/// without a trailing CRLF.
fn snapshot_frame() -> Bytes {
    let blob = empty_snapshot();
    let mut framed = BytesMut::new();
    framed.put_u8(BULK_STRING_PREFIX);
    framed.put_slice(blob.len().to_string().as_bytes());
    framed.put_slice(CRLF.as_bytes());
    framed.put_slice(&blob);
    Value::Raw(framed.freeze()).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Role;
    use crate::store::test_clock::TestClock;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn leader_state() -> (Arc<Store>, Arc<ReplicationState>) {
        (
            Arc::new(Store::new()),
            Arc::new(ReplicationState::new(Role::Master)),
        )
    }

    fn connect(store: &Arc<Store>, repl: &Arc<ReplicationState>) -> DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(server);
        tokio::spawn(serve_connection(
            read_half,
            write_half,
            store.clone(),
            repl.clone(),
        ));
        client
    }

    async fn exchange(client: &mut DuplexStream, request: &[u8], reply_len: usize) -> Vec<u8> {
        client.write_all(request).await.unwrap();
        let mut reply = vec![0u8; reply_len];
        client.read_exact(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let (store, repl) = leader_state();
        let mut client = connect(&store, &repl);
        let reply = exchange(&mut client, b"*1\r\n$4\r\nPING\r\n", 7).await;
        assert_eq!(reply, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn echo_replies_only_the_first_argument() {
        let (store, repl) = leader_state();
        let mut client = connect(&store, &repl);
        let reply = exchange(
            &mut client,
            b"*3\r\n$4\r\nECHO\r\n$5\r\nhello\r\n$5\r\nworld\r\n",
            11,
        )
        .await;
        assert_eq!(reply, b"$5\r\nhello\r\n");
    }

    #[tokio::test]
    async fn set_then_get_round_trips_over_the_wire() {
        let (store, repl) = leader_state();
        let mut client = connect(&store, &repl);

        let reply = exchange(
            &mut client,
            b"*3\r\n$3\r\nSET\r\n$5\r\nhello\r\n$5\r\nworld\r\n",
            5,
        )
        .await;
        assert_eq!(reply, b"+OK\r\n");

        let reply = exchange(&mut client, b"*2\r\n$3\r\nGET\r\n$5\r\nhello\r\n", 11).await;
        assert_eq!(reply, b"$5\r\nworld\r\n");

        let reply = exchange(&mut client, b"*2\r\n$3\r\nGET\r\n$7\r\nmissing\r\n", 5).await;
        assert_eq!(reply, b"$-1\r\n");
    }

    #[tokio::test]
    async fn px_expiry_is_honored_across_the_wire() {
        let clock = TestClock::new();
        let store = Arc::new(Store::with_nower(clock.nower()));
        let repl = Arc::new(ReplicationState::new(Role::Master));
        let mut client = connect(&store, &repl);

        let reply = exchange(
            &mut client,
            b"*5\r\n$3\r\nSET\r\n$5\r\nhello\r\n$5\r\nworld\r\n$2\r\nPX\r\n$4\r\n3000\r\n",
            5,
        )
        .await;
        assert_eq!(reply, b"+OK\r\n");

        clock.advance(Duration::from_millis(2999));
        let reply = exchange(&mut client, b"*2\r\n$3\r\nGET\r\n$5\r\nhello\r\n", 11).await;
        assert_eq!(reply, b"$5\r\nworld\r\n");

        clock.advance(Duration::from_millis(2));
        let reply = exchange(&mut client, b"*2\r\n$3\r\nGET\r\n$5\r\nhello\r\n", 5).await;
        assert_eq!(reply, b"$-1\r\n");
    }

    #[tokio::test]
    async fn info_reports_the_replication_block() {
        let (store, repl) = leader_state();
        let mut client = connect(&store, &repl);

        let expected = format!(
            "role:master\nmaster_replid:{}\nmaster_repl_offset:0",
            repl.replid()
        );
        let wire = format!("${}\r\n{}\r\n", expected.len(), expected);
        let reply = exchange(
            &mut client,
            b"*2\r\n$4\r\nINFO\r\n$11\r\nreplication\r\n",
            wire.len(),
        )
        .await;
        assert_eq!(reply, wire.as_bytes());
    }

    #[tokio::test]
    async fn argument_errors_keep_the_connection_open() {
        let (store, repl) = leader_state();
        let mut client = connect(&store, &repl);

        client.write_all(b"*2\r\n$3\r\nSET\r\n$1\r\nk\r\n").await.unwrap();
        let mut prefix = [0u8; 1];
        client.read_exact(&mut prefix).await.unwrap();
        assert_eq!(prefix[0], b'-');
        // Drain the rest of the error line.
        let mut byte = [0u8; 1];
        loop {
            client.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
        }

        let reply = exchange(&mut client, b"*1\r\n$4\r\nPING\r\n", 7).await;
        assert_eq!(reply, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn unknown_commands_are_ignored_without_a_reply() {
        let (store, repl) = leader_state();
        let mut client = connect(&store, &repl);

        client
            .write_all(b"*1\r\n$8\r\nFLUSHALL\r\n*1\r\n$4\r\nPING\r\n")
            .await
            .unwrap();
        let mut reply = vec![0u8; 7];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn framing_errors_close_the_connection() {
        let (store, repl) = leader_state();
        let mut client = connect(&store, &repl);

        client.write_all(b"@garbage\r\n").await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wait_with_zero_followers_replies_zero() {
        let (store, repl) = leader_state();
        let mut client = connect(&store, &repl);
        let reply = exchange(
            &mut client,
            b"*3\r\n$4\r\nWAIT\r\n$1\r\n0\r\n$3\r\n100\r\n",
            4,
        )
        .await;
        assert_eq!(reply, b":0\r\n");
    }

    #[tokio::test]
    async fn getack_from_an_ordinary_client_is_answered_with_the_offset() {
        let (store, repl) = leader_state();
        let mut client = connect(&store, &repl);

        let reply = exchange(
            &mut client,
            b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n",
            34,
        )
        .await;
        assert_eq!(reply, b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$1\r\n0\r\n");
        // Answering the probe does not move the offset.
        assert_eq!(repl.repl_offset(), 0);
    }

    /// Walks a follower through the whole attach sequence and checks that
    /// writes mirror, acks flow back, and WAIT observes them.
    #[tokio::test]
    async fn follower_attach_mirror_and_wait() {
        let (store, repl) = leader_state();
        let mut follower = connect(&store, &repl);

        let reply = exchange(&mut follower, b"*1\r\n$4\r\nPING\r\n", 7).await;
        assert_eq!(reply, b"+PONG\r\n");

        let reply = exchange(
            &mut follower,
            b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n",
            5,
        )
        .await;
        assert_eq!(reply, b"+OK\r\n");

        let reply = exchange(
            &mut follower,
            b"*3\r\n$8\r\nREPLCONF\r\n$4\r\ncapa\r\n$6\r\npsync2\r\n",
            5,
        )
        .await;
        assert_eq!(reply, b"+OK\r\n");

        // +FULLRESYNC {40-char id} 0\r\n
        follower
            .write_all(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
            .await
            .unwrap();
        let mut resync = vec![0u8; 56];
        follower.read_exact(&mut resync).await.unwrap();
        let resync = String::from_utf8(resync).unwrap();
        assert!(resync.starts_with("+FULLRESYNC "));
        assert!(resync.ends_with(" 0\r\n"));

        // $18\r\n + 18 snapshot bytes, no trailing CRLF.
        let mut snapshot = vec![0u8; 5 + 18];
        follower.read_exact(&mut snapshot).await.unwrap();
        assert!(snapshot.starts_with(b"$18\r\nREDIS0011"));

        // A write from an ordinary client mirrors verbatim.
        let mut client = connect(&store, &repl);
        let set_frame = b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n";
        let reply = exchange(&mut client, set_frame, 5).await;
        assert_eq!(reply, b"+OK\r\n");

        let mut mirrored = vec![0u8; set_frame.len()];
        follower.read_exact(&mut mirrored).await.unwrap();
        assert_eq!(mirrored, set_frame);
        assert_eq!(repl.repl_offset(), set_frame.len() as u64);

        // WAIT probes the follower; its ack satisfies the count target.
        let mut waiter = connect(&store, &repl);
        waiter
            .write_all(b"*3\r\n$4\r\nWAIT\r\n$1\r\n1\r\n$5\r\n60000\r\n")
            .await
            .unwrap();

        let probe = b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n";
        let mut probed = vec![0u8; probe.len()];
        follower.read_exact(&mut probed).await.unwrap();
        assert_eq!(probed, probe);

        follower
            .write_all(b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$2\r\n31\r\n")
            .await
            .unwrap();

        let mut reply = vec![0u8; 4];
        waiter.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b":1\r\n");
    }

    #[tokio::test]
    async fn set_on_a_replica_is_not_mirrored_or_counted() {
        let store = Arc::new(Store::new());
        let repl = Arc::new(ReplicationState::new(Role::Replica {
            leader_addr: "127.0.0.1:6379".into(),
        }));
        let mut client = connect(&store, &repl);

        let reply = exchange(&mut client, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n", 5).await;
        assert_eq!(reply, b"+OK\r\n");
        assert_eq!(repl.repl_offset(), 0);
        assert_eq!(store.get(b"k"), Some(Bytes::from_static(b"v")));
    }
}
