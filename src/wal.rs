//! Session snapshot log.
//!
//! Each entry is `[u32 len][bincode Session][u32 crc32]`, little endian. A
//! session is re-logged in full on every change, so replay keeps only the
//! newest snapshot per id. Bytes past the last intact entry are a torn
//! write; [`Wal::recover`] cuts them off before anything new is appended.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ulid::Ulid;

use crate::limits::MAX_WAL_ENTRY_BYTES;
use crate::model::Session;

const FRAME_OVERHEAD: u64 = 8;

fn encode(session: &Session) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(session).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_WAL_ENTRY_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("session {} snapshot is {} bytes", session.id, payload.len()),
        ));
    }
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(frame)
}

/// `Ok(false)` when the reader ran out first.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact entry and its framed size, or `None` at the end of the valid
/// prefix (clean EOF, torn frame, oversized length, bad CRC, undecodable).
fn next_entry(reader: &mut impl Read) -> io::Result<Option<(Session, u64)>> {
    let mut len_buf = [0u8; 4];
    if !fill(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_WAL_ENTRY_BYTES {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut payload)? || !fill(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Session>(&payload)
        .ok()
        .map(|session| (session, len as u64 + FRAME_OVERHEAD)))
}

/// Result of scanning a log file.
#[derive(Debug, Default)]
pub struct Replay {
    /// Newest snapshot per session, in order of first appearance.
    pub sessions: Vec<Session>,
    /// Intact entries read, superseded snapshots included.
    pub entries: usize,
    /// Length of the intact prefix.
    pub valid_len: u64,
    pub file_len: u64,
}

impl Replay {
    pub fn discarded_bytes(&self) -> u64 {
        self.file_len - self.valid_len
    }
}

pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful fsync.
    durable_len: u64,
    buffered_len: u64,
    buffered_appends: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Scan the log without touching it. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut replay = Replay {
            file_len,
            ..Default::default()
        };
        let mut slots: HashMap<Ulid, usize> = HashMap::new();
        while let Some((session, size)) = next_entry(&mut reader)? {
            replay.entries += 1;
            replay.valid_len += size;
            match slots.get(&session.id) {
                Some(&slot) => replay.sessions[slot] = session,
                None => {
                    slots.insert(session.id, replay.sessions.len());
                    replay.sessions.push(session);
                }
            }
        }
        Ok(replay)
    }

    /// Replay the log, truncate any torn tail, and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Replay)> {
        let replay = Self::replay(path)?;
        if replay.discarded_bytes() > 0 {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = replay.discarded_bytes(),
                "truncated torn WAL tail"
            );
        }
        let wal = Self::open_at(path, replay.valid_len)?;
        Ok((wal, replay))
    }

    fn open_at(path: &Path, durable_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len,
            buffered_len: 0,
            buffered_appends: 0,
            appends_since_compact: 0,
        })
    }

    /// Buffer one snapshot; nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, session: &Session) -> io::Result<()> {
        let frame = encode(session)?;
        self.writer.write_all(&frame)?;
        self.buffered_len += frame.len() as u64;
        self.buffered_appends += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.buffered_len;
        self.appends_since_compact += self.buffered_appends;
        self.buffered_len = 0;
        self.buffered_appends = 0;
        Ok(())
    }

    /// Drop whatever was appended since the last successful flush, on disk
    /// and in the buffer, so a failed batch leaves no partial frame behind.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // The old writer may still push its buffer out when dropped; the
        // truncation below removes it.
        self.writer = BufWriter::new(file.try_clone()?);
        self.buffered_len = 0;
        self.buffered_appends = 0;
        file.set_len(self.durable_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write one snapshot per session to a side file and fsync it. The live
    /// log is untouched until [`Wal::swap_compact_file`].
    pub fn write_compact_file(path: &Path, sessions: &[Session]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for session in sessions {
            writer.write_all(&encode(session)?)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.flush_sync()?;
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let durable_len = fs::metadata(&self.path)?.len();
        *self = Self::open_at(&self.path, durable_len)?;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}
