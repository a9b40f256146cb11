//! A segmented write-ahead log of opaque records, used to persist Raft log
//! entries and state for a single Raft group.
//!
//! The log is a directory of segment files named by a sequence number, e.g.
//! 00000000000000000001.wal. Records are only ever appended to the last
//! segment, which is rotated once it exceeds the configured size. Each record
//! is framed as:
//!
//! - Payload length as big-endian u32.
//! - CRC32 checksum of the payload as big-endian u32.
//! - Payload bytes.
//!
//! A crash may leave a partially written frame at the end of the last segment.
//! This torn tail is detected via the length and checksum and truncated away
//! when the log is opened. Corruption anywhere else is an error.

use crate::errdata;
use crate::error::Result;

use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// The maximum size of a single record. Larger lengths are assumed to be
/// garbage from a torn write.
const MAX_RECORD_SIZE: u32 = 256 << 20;

/// The file extension of WAL segments.
const SEGMENT_EXT: &str = "wal";

/// A position in the log: the segment and the byte offset within it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub segment: u64,
    pub offset: u64,
}

/// A record read during replay, with the position just past it.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub end: Position,
    pub data: Vec<u8>,
}

/// Writes a framed record to the writer, returning the number of bytes written.
pub(crate) fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<u64> {
    let len = u32::try_from(payload.len())?;
    if len > MAX_RECORD_SIZE {
        return errdata!("record of {len} bytes exceeds maximum size");
    }
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend(len.to_be_bytes());
    frame.extend(crc32fast::hash(payload).to_be_bytes());
    frame.extend(payload);
    writer.write_all(&frame)?;
    Ok(frame.len() as u64)
}

/// Reads a framed record from the reader. Returns None at the end of the
/// input, or if the remaining input is a torn or corrupt frame.
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 8];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(header[0..4].try_into()?);
    let checksum = u32::from_be_bytes(header[4..8].try_into()?);
    if len > MAX_RECORD_SIZE {
        return Ok(None);
    }
    let mut payload = vec![0; len as usize];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    if crc32fast::hash(&payload) != checksum {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Reads all valid frames from a file, returning them along with the byte
/// length of the valid prefix.
pub(crate) fn read_frames(path: &Path) -> Result<(Vec<Vec<u8>>, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut frames = Vec::new();
    let mut valid = 0;
    while let Some(payload) = read_frame(&mut reader)? {
        valid += payload.len() as u64 + 8;
        frames.push(payload);
    }
    Ok((frames, valid))
}

/// A segmented write-ahead log.
pub struct Wal {
    /// The log directory.
    dir: PathBuf,
    /// Rotate to a new segment once the current one reaches this size.
    segment_size: u64,
    /// Whether to fsync appends.
    sync: bool,
    /// Defers fsyncs of appends until sync() is called.
    deferred: bool,
    /// Whether there are appends awaiting a deferred fsync.
    dirty: bool,
    /// The current segment number, and its file opened for appending.
    segment: u64,
    file: File,
    /// The current write offset in the segment.
    offset: u64,
}

impl Wal {
    /// Opens the log in the given directory, creating it if necessary, and
    /// returns all records in it. A torn tail in the last segment is truncated.
    pub fn open(dir: &Path, segment_size: u64, sync: bool) -> Result<(Self, Vec<Frame>)> {
        std::fs::create_dir_all(dir)?;
        let segments = Self::list_segments(dir)?;
        let mut frames = Vec::new();
        for (i, &segment) in segments.iter().enumerate() {
            let path = Self::segment_path(dir, segment);
            let (records, valid) = read_frames(&path)?;
            let len = std::fs::metadata(&path)?.len();
            if valid < len {
                if i + 1 < segments.len() {
                    return errdata!(
                        "corrupt record in WAL segment {} at offset {valid}",
                        path.display()
                    );
                }
                warn!(
                    "Truncating torn tail of WAL segment {} from {len} to {valid} bytes",
                    path.display()
                );
                OpenOptions::new().write(true).open(&path)?.set_len(valid)?;
            }
            let mut offset = 0;
            for data in records {
                offset += data.len() as u64 + 8;
                frames.push(Frame { end: Position { segment, offset }, data });
            }
        }

        let segment = segments.last().copied().unwrap_or(1);
        let path = Self::segment_path(dir, segment);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let offset = file.metadata()?.len();
        debug!("Opened WAL {} at segment {segment} offset {offset}", dir.display());
        let wal = Self {
            dir: dir.to_path_buf(),
            segment_size,
            sync,
            deferred: false,
            dirty: false,
            segment,
            file,
            offset,
        };
        Ok((wal, frames))
    }

    /// Appends a record, returning the position just past it. Rotates the
    /// segment afterwards if it is full.
    pub fn append(&mut self, payload: &[u8]) -> Result<Position> {
        self.offset += write_frame(&mut self.file, payload)?;
        match self.deferred {
            true => self.dirty = true,
            false if self.sync => self.file.sync_data()?,
            false => {}
        }
        let position = Position { segment: self.segment, offset: self.offset };
        if self.offset >= self.segment_size {
            self.rotate()?;
        }
        Ok(position)
    }

    /// Defers fsyncs of subsequent appends until the next sync(). Rotation
    /// still syncs the sealed segment.
    pub fn defer_sync(&mut self, deferred: bool) {
        self.deferred = deferred;
    }

    /// Fsyncs appends made since deferring, if the log syncs at all.
    pub fn sync(&mut self) -> Result<()> {
        if self.dirty && self.sync {
            self.file.sync_data()?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Returns the current write position.
    pub fn position(&self) -> Position {
        Position { segment: self.segment, offset: self.offset }
    }

    /// Starts a new segment.
    fn rotate(&mut self) -> Result<()> {
        self.file.sync_all()?;
        self.dirty = false;
        self.segment += 1;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::segment_path(&self.dir, self.segment))?;
        self.offset = 0;
        debug!("Rotated WAL {} to segment {}", self.dir.display(), self.segment);
        Ok(())
    }

    /// Forces a rotation, such that all previous segments become removable.
    /// Does nothing if the current segment is empty.
    pub fn seal(&mut self) -> Result<()> {
        if self.offset > 0 {
            self.rotate()?;
        }
        Ok(())
    }

    /// Removes all segments before the given one. The current segment is never
    /// removed. Returns the number of segments removed.
    pub fn remove_segments_before(&mut self, segment: u64) -> Result<usize> {
        let mut removed = 0;
        for s in Self::list_segments(&self.dir)? {
            if s < segment && s < self.segment {
                std::fs::remove_file(Self::segment_path(&self.dir, s))?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Removed {removed} WAL segments before {segment} in {}", self.dir.display());
        }
        Ok(removed)
    }

    /// Returns the sorted segment numbers in the directory.
    fn list_segments(dir: &Path) -> Result<Vec<u64>> {
        let mut segments = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).map(str::parse::<u64>) {
                Some(Ok(segment)) => segments.push(segment),
                _ => warn!("Ignoring unexpected file {} in WAL directory", path.display()),
            }
        }
        segments.sort_unstable();
        Ok(segments)
    }

    /// Returns the path of a segment file.
    fn segment_path(dir: &Path, segment: u64) -> PathBuf {
        dir.join(format!("{segment:020}.{SEGMENT_EXT}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn payloads(frames: &[Frame]) -> Vec<Vec<u8>> {
        frames.iter().map(|f| f.data.clone()).collect()
    }

    #[test]
    fn append_and_replay() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut wal, frames) = Wal::open(dir.path(), 1 << 20, false)?;
        assert!(frames.is_empty());

        let p1 = wal.append(b"foo")?;
        let p2 = wal.append(b"")?;
        let p3 = wal.append(b"bar")?;
        assert_eq!(p1, Position { segment: 1, offset: 11 });
        assert_eq!(p2, Position { segment: 1, offset: 19 });
        assert_eq!(p3, Position { segment: 1, offset: 30 });
        drop(wal);

        let (wal, frames) = Wal::open(dir.path(), 1 << 20, false)?;
        assert_eq!(payloads(&frames), vec![b"foo".to_vec(), vec![], b"bar".to_vec()]);
        assert_eq!(frames.iter().map(|f| f.end).collect::<Vec<_>>(), vec![p1, p2, p3]);
        assert_eq!(wal.position(), p3);
        Ok(())
    }

    #[test]
    fn rotation_and_removal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut wal, _) = Wal::open(dir.path(), 20, false)?;
        for i in 0..5u8 {
            wal.append(&[i; 10])?;
        }
        // Segments rotate after every second 18-byte frame.
        assert_eq!(wal.position().segment, 3);
        assert_eq!(wal.remove_segments_before(2)?, 1);
        drop(wal);

        let (_, frames) = Wal::open(dir.path(), 20, false)?;
        assert_eq!(payloads(&frames), vec![vec![2; 10], vec![3; 10], vec![4; 10]]);
        assert_eq!(frames[0].end, Position { segment: 2, offset: 18 });
        Ok(())
    }

    #[test]
    fn deferred_sync() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut wal, _) = Wal::open(dir.path(), 1 << 20, true)?;
        wal.defer_sync(true);
        wal.append(b"a")?;
        wal.append(b"b")?;
        assert!(wal.dirty);
        wal.sync()?;
        assert!(!wal.dirty);
        wal.defer_sync(false);
        wal.append(b"c")?;
        assert!(!wal.dirty);
        drop(wal);

        let (_, frames) = Wal::open(dir.path(), 1 << 20, true)?;
        assert_eq!(payloads(&frames), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        Ok(())
    }

    #[test]
    fn torn_tail_is_truncated() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut wal, _) = Wal::open(dir.path(), 1 << 20, false)?;
        wal.append(b"complete")?;
        let end = wal.position();
        drop(wal);

        // Simulate a torn write: a header claiming 100 bytes, with only 3.
        let path = Wal::segment_path(dir.path(), 1);
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&100u32.to_be_bytes())?;
        file.write_all(&[0, 0, 0, 0, 1, 2, 3])?;
        drop(file);

        let (mut wal, frames) = Wal::open(dir.path(), 1 << 20, false)?;
        assert_eq!(payloads(&frames), vec![b"complete".to_vec()]);
        assert_eq!(wal.position(), end);
        assert_eq!(std::fs::metadata(&path)?.len(), end.offset);

        wal.append(b"next")?;
        drop(wal);
        let (_, frames) = Wal::open(dir.path(), 1 << 20, false)?;
        assert_eq!(payloads(&frames), vec![b"complete".to_vec(), b"next".to_vec()]);
        Ok(())
    }

    #[test]
    fn checksum_mismatch_is_torn() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut wal, _) = Wal::open(dir.path(), 1 << 20, false)?;
        wal.append(b"a")?;
        wal.append(b"b")?;
        drop(wal);

        // Flip the last payload byte.
        let path = Wal::segment_path(dir.path(), 1);
        let mut bytes = std::fs::read(&path)?;
        if let Some(last) = bytes.last_mut() {
            *last ^= 0xff;
        }
        std::fs::write(&path, bytes)?;

        let (_, frames) = Wal::open(dir.path(), 1 << 20, false)?;
        assert_eq!(payloads(&frames), vec![b"a".to_vec()]);
        Ok(())
    }
}
