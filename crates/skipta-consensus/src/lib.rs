use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use skipta_types::{Command, SkiptaError};

/// Accepted-for-replication receipt from [`ConsensusLog::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Started {
    pub index: u64,
    pub term: u64,
}

/// One element of the ordered decision stream a server consumes.
#[derive(Debug, Clone)]
pub enum Decision {
    /// A committed command to apply at `index`.
    Apply { index: u64, command: Command },
    /// A snapshot replacing everything up to and including `index`.
    InstallSnapshot { index: u64, blob: Vec<u8> },
}

/// The consensus/replication module, seen strictly at its interface.
///
/// Leader election, log replication and raw-log persistence live behind this
/// trait; the server only submits commands, consumes the ordered decision
/// stream handed out at construction time, and requests compaction.
///
/// Object safe on purpose: the server holds it as `Arc<dyn ConsensusLog>`.
pub trait ConsensusLog: Send + Sync + 'static {
    /// Submit a command for replication. Returns the log position it will
    /// commit at if this replica is the leader, `Err(NotLeader)` otherwise.
    fn start(&self, command: Command) -> Result<Started, SkiptaError>;

    /// Whether this replica currently believes itself leader. Periodic
    /// tasks re-check this every tick; a stale answer is harmless because
    /// all their effects are idempotent at the consensus layer.
    fn is_leader(&self) -> bool;

    /// Hand over a state snapshot covering the log up to `index`, allowing
    /// the module to discard entries at and below it.
    fn snapshot(&self, index: u64, blob: Vec<u8>);

    /// The most recent persisted snapshot blob, empty if none exists.
    fn read_snapshot(&self) -> Vec<u8>;

    /// Approximate size in bytes of the replicated state the module is
    /// holding; the server snapshots when this exceeds its threshold.
    fn state_size(&self) -> u64;
}

// ---------------------------------------------------------------------------
// LocalLog — single-replica, in-process consensus
// ---------------------------------------------------------------------------

fn encode_command(command: &Command) -> Result<Vec<u8>, SkiptaError> {
    bincode::serde::encode_to_vec(command, bincode::config::standard())
        .map_err(|e| SkiptaError::Consensus(e.to_string()))
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedSnapshot {
    index: u64,
    blob: Vec<u8>,
}

struct LocalLogInner {
    next_index: u64,
    term: u64,
    /// Encoded bytes appended since the last compaction.
    log_bytes: u64,
    snapshot_index: u64,
    snapshot: Vec<u8>,
}

/// A single-replica [`ConsensusLog`]: commands commit in submission order
/// and are delivered immediately on the decision channel.
///
/// This is the stand-in wired up by `skipta-node` and by the integration
/// tests; a real multi-replica module plugs in behind the same trait.
pub struct LocalLog {
    inner: Mutex<LocalLogInner>,
    leader: AtomicBool,
    tx: mpsc::UnboundedSender<Decision>,
    /// Snapshot persistence root; `None` keeps everything in memory.
    dir: Option<PathBuf>,
}

impl LocalLog {
    /// In-memory log, initially leader. Returns the decision stream the
    /// apply loop must consume.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Decision>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Arc::new(LocalLog {
            inner: Mutex::new(LocalLogInner {
                next_index: 1,
                term: 1,
                log_bytes: 0,
                snapshot_index: 0,
                snapshot: Vec::new(),
            }),
            leader: AtomicBool::new(true),
            tx,
            dir: None,
        });
        (log, rx)
    }

    /// Log with snapshot persistence under `dir`. An existing
    /// `snapshot.bin` is loaded so `read_snapshot` reflects the pre-restart
    /// state.
    pub fn open(dir: PathBuf) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Decision>), SkiptaError> {
        std::fs::create_dir_all(&dir).map_err(|e| SkiptaError::Consensus(e.to_string()))?;
        let path = dir.join("snapshot.bin");
        let (snapshot_index, snapshot) = match std::fs::read(&path) {
            Ok(bytes) => {
                let persisted: PersistedSnapshot =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map(|(v, _)| v)
                        .map_err(|e| SkiptaError::Consensus(e.to_string()))?;
                (persisted.index, persisted.blob)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (0, Vec::new()),
            Err(e) => return Err(SkiptaError::Consensus(e.to_string())),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let log = Arc::new(LocalLog {
            inner: Mutex::new(LocalLogInner {
                next_index: snapshot_index + 1,
                term: 1,
                log_bytes: 0,
                snapshot_index,
                snapshot,
            }),
            leader: AtomicBool::new(true),
            tx,
            dir: Some(dir),
        });
        Ok((log, rx))
    }

    /// Toggle leadership. Used by tests to exercise the leader-only paths;
    /// gaining leadership bumps the term.
    pub fn set_leader(&self, leader: bool) {
        let was = self.leader.swap(leader, Ordering::SeqCst);
        if leader && !was {
            self.inner.lock().unwrap().term += 1;
        }
    }

    fn persist(&self, index: u64, blob: &[u8]) {
        let Some(dir) = &self.dir else { return };
        let persisted = PersistedSnapshot { index, blob: blob.to_vec() };
        match bincode::serde::encode_to_vec(&persisted, bincode::config::standard()) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(dir.join("snapshot.bin"), bytes) {
                    tracing::warn!(error = %e, "failed to persist snapshot");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode snapshot for persistence"),
        }
    }
}

impl ConsensusLog for LocalLog {
    fn start(&self, command: Command) -> Result<Started, SkiptaError> {
        if !self.leader.load(Ordering::SeqCst) {
            return Err(SkiptaError::NotLeader { leader: None });
        }
        let encoded_len = encode_command(&command)?.len() as u64;
        let mut g = self.inner.lock().unwrap();
        let index = g.next_index;
        g.next_index += 1;
        g.log_bytes += encoded_len;
        let term = g.term;
        drop(g);
        // The receiver outliving the log is the normal shutdown order; a
        // closed channel just means no one is applying anymore.
        let _ = self.tx.send(Decision::Apply { index, command });
        Ok(Started { index, term })
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn snapshot(&self, index: u64, blob: Vec<u8>) {
        let mut g = self.inner.lock().unwrap();
        if index <= g.snapshot_index {
            return;
        }
        g.snapshot_index = index;
        g.snapshot = blob;
        g.log_bytes = 0;
        let snapshot = g.snapshot.clone();
        drop(g);
        self.persist(index, &snapshot);
    }

    fn read_snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().snapshot.clone()
    }

    fn state_size(&self) -> u64 {
        let g = self.inner.lock().unwrap();
        g.log_bytes + g.snapshot.len() as u64
    }
}
