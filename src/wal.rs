//! Append-only event log backing the engine.
//!
//! Record layout: `[u32 len][bincode Event][u32 crc32]`, little-endian, where
//! `len` counts payload bytes only. A torn or corrupt tail (crash mid-write) is
//! dropped on replay; everything before it is kept.
//!
//! Writes go through [`WalHandle`], which feeds a single writer task. The task
//! group-commits: it takes one append, drains whatever else is already queued,
//! then flushes and fsyncs once for the whole batch.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::model::Event;
use crate::observability;

const COMMAND_QUEUE: usize = 4096;

fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

enum Decoded {
    Event(Event),
    End,
    Torn(&'static str),
}

/// Fill `buf` completely, or report a clean end / short read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn decode_record(reader: &mut impl Read) -> io::Result<Decoded> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(Decoded::End);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(Decoded::Torn("short payload"));
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(Decoded::Torn("missing checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Decoded::Torn("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Decoded::Event(event)),
        Err(_) => Ok(Decoded::Torn("undecodable payload")),
    }
}

pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Buffer one record. Durable only after [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn snapshot_path(&self) -> PathBuf {
        self.path.with_extension("wal.snapshot")
    }

    /// Write `events` to a sibling file and fsync it. The live log is untouched.
    pub fn write_snapshot(&self, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(self.snapshot_path())?);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Atomically replace the live log with the snapshot and reopen it.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(self.snapshot_path(), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Every intact event in `path`, in append order. A missing file is empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        loop {
            match decode_record(&mut reader)? {
                Decoded::Event(event) => events.push(event),
                Decoded::End => break,
                Decoded::Torn(why) => {
                    warn!(path = %path.display(), kept = events.len(), "discarding log tail: {why}");
                    break;
                }
            }
        }
        Ok(events)
    }
}

// ── Group-commit writer ───────────────────────────────────────────

type Reply<T> = oneshot::Sender<io::Result<T>>;

enum WalCommand {
    Append { event: Event, reply: Reply<()> },
    Compact { events: Vec<Event>, reply: Reply<()> },
    AppendsSinceCompact { reply: oneshot::Sender<u64> },
}

/// Cloneable handle to the writer task. Dropping every handle stops the task.
#[derive(Clone)]
pub struct WalHandle {
    tx: mpsc::Sender<WalCommand>,
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "log writer shut down")
}

impl WalHandle {
    /// Spawn the writer task on the current tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    /// Resolves once the event is on disk.
    pub async fn append(&self, event: &Event) -> io::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append {
                event: event.clone(),
                reply,
            })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())?
    }

    /// Replace the log with `events`. Appends queued earlier land in the old
    /// file first; the caller must keep writers out until this returns.
    pub async fn compact(&self, events: Vec<Event>) -> io::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { events, reply })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(WalCommand::AppendsSinceCompact { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, reply } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, reply)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, reply } => batch.push((event, reply)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit(wal: &mut Wal, batch: Vec<(Event, Reply<()>)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes do not leak into
    // the next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for (_, reply) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = reply.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, reply } => {
            let result = wal.write_snapshot(&events).and_then(|()| wal.install_snapshot());
            let _ = reply.send(result);
        }
        WalCommand::AppendsSinceCompact { reply } => {
            let _ = reply.send(wal.appends_since_compact());
        }
        WalCommand::Append { reply, .. } => {
            let _ = reply.send(Err(io::Error::other("append routed to control path")));
        }
    }
}
