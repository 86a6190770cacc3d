use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

const MAGIC: &[u8; 8] = b"SLOTWAL1";

/// Upper bound on a single record; anything larger is treated as corruption.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Encode one record as `[u32 len][bincode Event][u32 crc32]`.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Result of scanning a log file.
#[derive(Debug)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix (header + whole records).
    pub valid_len: u64,
}

/// Log length and append count at a batch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalMark {
    len: u64,
    appends: u64,
}

/// Append-only booking log.
///
/// A file starts with an 8-byte magic header followed by records. A torn or
/// corrupt tail (crash mid-write) is cut off when the log is opened, so new
/// records never land behind unreadable bytes.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay `path` (creating it if missing), trim any torn tail and position
    /// for appends. Returns the log and the recovered events.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let on_disk = file.metadata()?.len();
        if replay.valid_len == 0 {
            file.set_len(0)?;
            file.write_all(MAGIC)?;
            file.sync_all()?;
        } else if replay.valid_len < on_disk {
            warn!(
                "{}: discarding {} trailing bytes after {} intact records",
                path.display(),
                on_disk - replay.valid_len,
                replay.events.len()
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok((
            Self {
                writer: BufWriter::new(file),
                path: path.to_path_buf(),
                appends_since_compact: 0,
            },
            replay.events,
        ))
    }

    /// Buffer one record. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush buffered records and fsync.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Position to roll back to if the next batch fails.
    pub fn mark(&self) -> io::Result<WalMark> {
        Ok(WalMark {
            len: self.writer.get_ref().metadata()?.len(),
            appends: self.appends_since_compact,
        })
    }

    /// Drop anything buffered or written since `mark`, so a batch whose callers
    /// were told it failed never replays.
    pub fn rollback(&mut self, mark: WalMark) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(mark.len)?;
        file.sync_all()?;
        file.seek(SeekFrom::Start(mark.len))?;
        // into_parts hands back the old handle without flushing its buffer.
        let (_stale, _unwritten) = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        self.appends_since_compact = mark.appends;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn snapshot_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a full snapshot next to the log. Slow; runs before the swap.
    pub fn write_snapshot(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::snapshot_path(path))?);
        writer.write_all(MAGIC)?;
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and continue appending to it.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::snapshot_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact record. Stops at the first truncated or corrupt one.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay { events: Vec::new(), valid_len: 0 });
            }
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 8];
        match reader.read_exact(&mut header) {
            Ok(()) if &header == MAGIC => {}
            Ok(()) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{} is not a slotwise log", path.display()),
                ));
            }
            // Crashed while creating the file.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(Replay { events: Vec::new(), valid_len: 0 });
            }
            Err(e) => return Err(e),
        }

        let mut events = Vec::new();
        let mut valid_len = MAGIC.len() as u64;
        while let Some((event, consumed)) = read_record(&mut reader)? {
            events.push(event);
            valid_len += consumed;
        }
        Ok(Replay { events, valid_len })
    }
}

/// Next record and its byte length, or `None` at a clean or torn end.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut payload)? || !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, 8 + len as u64))),
        Err(_) => Ok(None),
    }
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
