use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::limits::MAX_WAL_RECORD_LEN;

/// Length prefix plus CRC trailer.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single record to [len][bincode][crc32] format. Returns bytes written.
fn encode_record<E: Serialize>(writer: &mut impl Write, record: &E) -> io::Result<u64> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_WAL_RECORD_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(FRAME_OVERHEAD + u64::from(len))
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: record][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is discarded via length-prefix + CRC check, and
///   `recover` cuts it off the file so later appends are not stranded behind it.
///
/// The log is untyped on disk; callers pick the record type on append and replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length as of the last successful `flush_sync`.
    committed_len: u64,
    /// Bytes and records buffered since then.
    pending_len: u64,
    pending_records: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            committed_len,
            pending_len: 0,
            pending_records: 0,
        })
    }

    /// Replay `path`, cut any torn or corrupt tail off the file, and open it for appends.
    pub fn recover<E: DeserializeOwned>(path: &Path) -> io::Result<(Self, Vec<E>)> {
        let (records, valid_len) = Self::replay_valid(path)?;
        let mut wal = Self::open(path)?;
        if wal.committed_len > valid_len {
            tracing::warn!(
                "truncating {} bytes of torn tail from {}",
                wal.committed_len - valid_len,
                path.display()
            );
            let file = wal.writer.get_ref();
            file.set_len(valid_len)?;
            file.sync_all()?;
            wal.committed_len = valid_len;
        }
        Ok((wal, records))
    }

    /// Append a single record and fsync. Used by tests only;
    /// production code uses `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append<E: Serialize>(&mut self, record: &E) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Append a single record to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered records.
    pub fn append_buffered<E: Serialize>(&mut self, record: &E) -> io::Result<()> {
        self.pending_records += 1;
        self.appends_since_compact += 1;
        self.pending_len += encode_record(&mut self.writer, record)?;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len += self.pending_len;
        self.pending_len = 0;
        self.pending_records = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`, both the
    /// buffered bytes and whatever already reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the unwritten buffer instead of flushing it.
        let _ = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.committed_len)?;
        file.sync_all()?;
        self.appends_since_compact = self
            .appends_since_compact
            .saturating_sub(self.pending_records);
        self.pending_len = 0;
        self.pending_records = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted records to a temp file and fsync.
    pub fn write_compact_file<E: Serialize>(path: &Path, records: &[E]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending_len = 0;
        self.pending_records = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact<E: Serialize>(&mut self, records: &[E]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid records.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay<E: DeserializeOwned>(path: &Path) -> io::Result<Vec<E>> {
        Self::replay_valid(path).map(|(records, _)| records)
    }

    /// Like `replay`, also returning the byte length of the valid prefix.
    pub fn replay_valid<E: DeserializeOwned>(path: &Path) -> io::Result<(Vec<E>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf);
            if len > MAX_WAL_RECORD_LEN {
                // Garbage length prefix
                break;
            }

            let mut payload = vec![0u8; len as usize];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                // Corrupt entry, stop replaying
                break;
            }

            match bincode::deserialize::<E>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            valid_len += FRAME_OVERHEAD + u64::from(len);
        }

        Ok((records, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn registered() -> Event {
        Event::SpaceRegistered {
            id: Ulid::new(),
            tenant_id: Ulid::new(),
            label: Some("A-01".into()),
            at: 1_000,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            registered(),
            Event::MaintenanceSet {
                space_id: Ulid::new(),
                at: 2_000,
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let event = registered();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }
        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_before_appending() {
        let path = tmp_path("recover_torn_tail.wal");
        let first = registered();
        let second = registered();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let valid = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0x2a, 0, 0, 0, 1, 2, 3]).unwrap();
        }
        {
            let (mut wal, records) = Wal::recover::<Event>(&path).unwrap();
            assert_eq!(records, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), valid);
            wal.append(&second).unwrap();
        }
        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_length_prefix_is_a_torn_tail() {
        let path = tmp_path("oversized_len.wal");
        let event = registered();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[7u8; 16]).unwrap();
        }
        let (records, valid_len) = Wal::replay_valid::<Event>(&path).unwrap();
        assert_eq!(records, vec![event]);
        assert_eq!(valid_len + 20, fs::metadata(&path).unwrap().len());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_failed_batch() {
        let path = tmp_path("rollback.wal");
        let kept = Span::new(0, 10);
        let lost = Span::new(10, 20);
        let after = Span::new(20, 30);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            wal.append_buffered(&lost).unwrap();
            // Bytes reach the file but the batch is reported failed.
            wal.writer.flush().unwrap();
            wal.rollback().unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
            wal.append_buffered(&lost).unwrap();
            wal.rollback().unwrap();
            wal.append(&after).unwrap();
        }
        let replayed: Vec<Span> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![kept, after]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        {
            let payload = bincode::serialize(&registered()).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let space_id = Ulid::new();
        let first = Event::SpaceRegistered {
            id: space_id,
            tenant_id: Ulid::new(),
            label: None,
            at: 0,
        };
        let later = Event::MaintenanceSet { space_id, at: 5 };
        {
            let mut wal = Wal::open(&path).unwrap();
            for at in 0..20 {
                wal.append(&Event::MaintenanceCleared { space_id, at }).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&[first.clone()]).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&later).unwrap();
        }
        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let spans: Vec<Span> = (0..5).map(|i| Span::new(i * 10, i * 10 + 5)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for s in &spans {
                wal.append_buffered(s).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        let replayed: Vec<Span> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, spans);
        let _ = fs::remove_file(&path);
    }
}
