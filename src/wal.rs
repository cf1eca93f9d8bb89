use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Larger length prefixes can only come from corruption.
const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little-endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes; `Ok(false)` on a clean or torn end of file.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Result of reading a WAL back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// A torn or corrupt tail was found and ignored.
    pub discarded_tail: bool,
    /// Bytes of intact frames at the head of the file.
    pub valid_len: u64,
}

/// Append-only log of shop events.
///
/// A crash mid-write leaves at most one torn frame at the end; replay stops at
/// the first frame whose length, checksum or payload does not check out, and
/// [`Wal::recover`] cuts it off before new frames are appended.
pub struct Wal {
    file: File,
    /// Frames encoded since the last `flush_sync`.
    pending: Vec<u8>,
    pending_frames: u64,
    /// File length as of the last successful flush.
    committed_len: u64,
    /// A failed flush could not be rolled back; nothing more may be appended.
    poisoned: bool,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            file,
            pending: Vec::new(),
            pending_frames: 0,
            committed_len,
            poisoned: false,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Replay `path`, truncate any torn tail, and open the log for appends.
    pub fn recover(path: &Path) -> io::Result<(Self, Replay)> {
        let replay = Self::replay(path)?;
        if replay.discarded_tail {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
            tracing::info!(path = %path.display(), len = replay.valid_len, "truncated WAL tail");
        }
        Ok((Self::open(path)?, replay))
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event; nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.pending, event)?;
        self.pending_frames += 1;
        Ok(())
    }

    /// Write and fsync everything buffered. On failure the file is cut back to
    /// its last committed length, so a batch is durable whole or not at all.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            self.pending.clear();
            self.pending_frames = 0;
            return Err(io::Error::other("WAL is unusable after a failed rollback"));
        }
        if self.pending.is_empty() {
            return Ok(());
        }
        let written = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.sync_data());
        let len = self.pending.len() as u64;
        let frames = self.pending_frames;
        self.pending.clear();
        self.pending_frames = 0;

        match written {
            Ok(()) => {
                self.committed_len += len;
                self.appends_since_compact += frames;
                Ok(())
            }
            Err(e) => {
                let rollback = self
                    .file
                    .set_len(self.committed_len)
                    .and_then(|()| self.file.sync_all());
                if let Err(rollback) = rollback {
                    self.poisoned = true;
                    tracing::error!(path = %self.path.display(), error = %rollback, "could not roll back failed WAL write");
                }
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a snapshot to the side file and fsync it. Slow; runs before the swap.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.file = file;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            let mut len_buf = [0u8; 4];
            let mut first = [0u8; 1];
            // Distinguish a clean end of file from a torn length prefix.
            if !read_or_eof(&mut reader, &mut first)? {
                break;
            }
            len_buf[0] = first[0];
            if !read_or_eof(&mut reader, &mut len_buf[1..])? {
                replay.discarded_tail = true;
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_RECORD_BYTES {
                replay.discarded_tail = true;
                break;
            }

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            if !read_or_eof(&mut reader, &mut payload)? || !read_or_eof(&mut reader, &mut crc_buf)? {
                replay.discarded_tail = true;
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                replay.discarded_tail = true;
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => {
                    replay.events.push(event);
                    replay.valid_len += 8 + len as u64;
                }
                Err(_) => {
                    replay.discarded_tail = true;
                    break;
                }
            }
        }

        if replay.discarded_tail {
            tracing::warn!(
                path = %path.display(),
                recovered = replay.events.len(),
                "WAL tail was torn or corrupt; ignoring it"
            );
        }
        Ok(replay)
    }
}
