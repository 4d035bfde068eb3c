use crate::protocol_constants::*;
use crate::util::command_frame;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_64_REDIS};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{self, Duration, Instant};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica { leader_addr: String },
}

/// A follower attached to this leader. The sender drains to the follower's
/// socket from its connection task; `streaming` flips once PSYNC completes,
/// and only streaming entries receive mirrored frames.
struct FollowerHandle {
    id: u64,
    tx: UnboundedSender<Bytes>,
    streaming: bool,
}

/// Per-process replication state: the fixed role, the replication id, the
/// running byte offset of the stream, the attached followers, and the ack
/// channel the WAIT aggregator drains.
pub struct ReplicationState {
    role: Role,
    replid: Mutex<String>,
    repl_offset: AtomicU64,
    followers: Mutex<Vec<FollowerHandle>>,
    next_follower_id: AtomicU64,
    ack_tx: UnboundedSender<u64>,
    ack_rx: tokio::sync::Mutex<UnboundedReceiver<u64>>,
}

impl ReplicationState {
    pub fn new(role: Role) -> Self {
        let replid = match role {
            Role::Master => generate_replid(),
            // Placeholder until FULLRESYNC supplies the leader's id.
            Role::Replica { .. } => "?".repeat(REPLID_LEN),
        };
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        Self {
            role,
            replid: Mutex::new(replid),
            repl_offset: AtomicU64::new(0),
            followers: Mutex::new(Vec::new()),
            next_follower_id: AtomicU64::new(1),
            ack_tx,
            ack_rx: tokio::sync::Mutex::new(ack_rx),
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self.role, Role::Master)
    }

    pub fn role_name(&self) -> &'static str {
        match self.role {
            Role::Master => MASTER_ROLE,
            Role::Replica { .. } => SLAVE_ROLE,
        }
    }

    pub fn leader_addr(&self) -> Option<&str> {
        match &self.role {
            Role::Master => None,
            Role::Replica { leader_addr } => Some(leader_addr),
        }
    }

    pub fn replid(&self) -> String {
        self.replid.lock().unwrap().clone()
    }

    pub fn set_replid(&self, replid: String) {
        *self.replid.lock().unwrap() = replid;
    }

    pub fn repl_offset(&self) -> u64 {
        self.repl_offset.load(Ordering::SeqCst)
    }

    /// Follower side: account for a frame consumed from the leader.
    pub fn advance_offset(&self, n: u64) {
        self.repl_offset.fetch_add(n, Ordering::SeqCst);
    }

    pub fn replication_info(&self) -> String {
        format!(
            "role:{}\nmaster_replid:{}\nmaster_repl_offset:{}",
            self.role_name(),
            self.replid(),
            self.repl_offset()
        )
    }

    /// Registers a follower for the connection that announced its listening
    /// port. The returned receiver is drained to the socket by that
    /// connection's task.
    pub fn register_follower(&self) -> (u64, UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_follower_id.fetch_add(1, Ordering::SeqCst);
        self.followers.lock().unwrap().push(FollowerHandle {
            id,
            tx,
            streaming: false,
        });
        (id, rx)
    }

    /// PSYNC completed; the follower now receives the mirror stream.
    pub fn mark_streaming(&self, id: u64) {
        let mut followers = self.followers.lock().unwrap();
        if let Some(follower) = followers.iter_mut().find(|f| f.id == id) {
            follower.streaming = true;
        }
    }

    pub fn remove_follower(&self, id: u64) {
        self.followers.lock().unwrap().retain(|f| f.id != id);
    }

    pub fn streaming_followers(&self) -> usize {
        self.followers
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.streaming)
            .count()
    }

    /// Mirrors a frame's original bytes to every streaming follower and adds
    /// the byte count to the stream offset. Membership, iteration, and the
    /// offset addition share one lock, so frames per follower keep apply
    /// order and the offset grows in mirror order. A follower whose task
    /// died is dropped here; the rest continue.
    pub fn replicate(&self, frame: &Bytes) {
        let mut followers = self.followers.lock().unwrap();
        followers.retain(|follower| {
            if !follower.streaming {
                return true;
            }
            follower.tx.send(frame.clone()).is_ok()
        });
        self.repl_offset.fetch_add(frame.len() as u64, Ordering::SeqCst);
    }

    pub fn publish_ack(&self, offset: u64) {
        // The receiver lives as long as this state; a send cannot fail while
        // the process runs.
        let _ = self.ack_tx.send(offset);
    }

    /// The WAIT primitive. Broadcasts a GETACK probe to every streaming
    /// follower and counts ack events until the count target or the deadline
    /// is reached, whichever is first. Carried offsets are not inspected;
    /// raw replies are counted.
    pub async fn wait_for_acks(&self, required: usize, timeout_ms: u64) -> usize {
        if self.streaming_followers() == 0 {
            return 0;
        }

        let mut ack_rx = self.ack_rx.lock().await;
        // Acks from before this probe are not ours to count.
        while ack_rx.try_recv().is_ok() {}

        self.replicate(&command_frame(&[b"REPLCONF", b"GETACK", b"*"]));

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut acks = 0;
        while acks < required {
            match time::timeout_at(deadline, ack_rx.recv()).await {
                Ok(Some(_)) => acks += 1,
                Ok(None) | Err(_) => break,
            }
        }
        acks
    }
}

fn generate_replid() -> String {
    let mut raw = [0u8; REPLID_LEN / 2];
    rand::thread_rng().fill(&mut raw[..]);
    raw.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// The blob transmitted during full resync: an empty snapshot, assembled
/// once. Header, version, EOF opcode, CRC64 trailer in little-endian.
pub fn empty_snapshot() -> Bytes {
    let mut blob = BytesMut::new();
    blob.put_slice(MAGIC_NUMBER);
    blob.put_slice(SNAPSHOT_VERSION);
    blob.put_u8(OPCODE_EOF);
    let checksum = Crc::<u64>::new(&CRC_64_REDIS).checksum(&blob);
    let mut trailer = [0u8; 8];
    LittleEndian::write_u64(&mut trailer, checksum);
    blob.put_slice(&trailer);
    blob.freeze()
}
