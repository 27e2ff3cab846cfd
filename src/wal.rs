use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Write one entry as `[u32 len][bincode Event][u32 crc32]`, little endian.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Entries are single events; anything larger is garbage, not data.
const MAX_ENTRY_LEN: usize = 16 * 1024 * 1024;

/// Outcome of reading one entry during replay.
enum Entry {
    Event(Event),
    /// Clean end of file.
    End,
    /// Truncated or corrupt tail; everything from here on is ignored.
    Torn(&'static str),
}

/// Fill `buf` completely, or report how many bytes were available before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_entry(reader: &mut impl Read) -> io::Result<Entry> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf)? {
        0 => return Ok(Entry::End),
        4 => {}
        _ => return Ok(Entry::Torn("truncated length prefix")),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_ENTRY_LEN {
        return Ok(Entry::Torn("oversized entry"));
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? != len {
        return Ok(Entry::Torn("truncated payload"));
    }

    let mut crc_buf = [0u8; 4];
    if read_full(reader, &mut crc_buf)? != 4 {
        return Ok(Entry::Torn("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Entry::Torn("checksum mismatch"));
    }

    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Entry::Event(event)),
        Err(_) => Ok(Entry::Torn("undecodable payload")),
    }
}

/// Append-only write-ahead log of directory and ledger events.
///
/// A crash can leave at most a torn final entry; the length prefix and CRC
/// let replay detect it and stop there.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single event. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
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

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write compacted events to a temp file next to the WAL and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Replay every valid event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        loop {
            match read_entry(&mut reader)? {
                Entry::Event(event) => events.push(event),
                Entry::End => break,
                Entry::Torn(reason) => {
                    warn!(
                        "WAL {} ends in a torn entry ({reason}); replayed {} events",
                        path.display(),
                        events.len()
                    );
                    break;
                }
            }
        }
        Ok(events)
    }
}
