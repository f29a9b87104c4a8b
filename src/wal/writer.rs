//! WAL writer.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::options::SyncMode;
use crate::util::crc::{crc32_multi, mask_crc};
use crate::Result;

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};

// Zeros for padding block tails shorter than a header.
const ZEROES: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

/// Appends logical records to a block-framed log file.
pub struct WalWriter {
    /// Buffered writer for the log file.
    writer: BufWriter<File>,
    /// Offset within the current block.
    block_offset: usize,
    /// Sync policy applied after each record.
    sync_mode: SyncMode,
    /// Bytes appended since the last sync.
    bytes_since_sync: usize,
}

impl WalWriter {
    /// Create a new log file, truncating any existing one.
    pub fn new(path: &Path, sync_mode: SyncMode) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            writer: BufWriter::with_capacity(BLOCK_SIZE * 4, file),
            block_offset: 0,
            sync_mode,
            bytes_since_sync: 0,
        })
    }

    /// Open an existing log for appending, resuming the block cursor from
    /// the current file length.
    pub fn open_for_append(path: &Path, sync_mode: SyncMode) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let block_offset = file.metadata()?.len() as usize % BLOCK_SIZE;

        Ok(Self {
            writer: BufWriter::with_capacity(BLOCK_SIZE * 4, file),
            block_offset,
            sync_mode,
            bytes_since_sync: 0,
        })
    }

    /// Append one logical record.
    ///
    /// The payload is fragmented across blocks as needed. An empty payload
    /// still produces one zero-length Full record.
    pub fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut left = data;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Not even a header fits; pad out the block.
                if leftover > 0 {
                    self.writer.write_all(&ZEROES[..leftover])?;
                    self.bytes_since_sync += leftover;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = std::cmp::min(left.len(), avail);
            let end = fragment_length == left.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &left[..fragment_length])?;

            left = &left[fragment_length..];
            begin = false;
            if end {
                break;
            }
        }

        self.maybe_sync()
    }

    fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 0xFFFF);
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        let type_byte = record_type.to_byte();
        let crc = mask_crc(crc32_multi(&[&[type_byte], data]));

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&crc.to_le_bytes());
        header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        header[6] = type_byte;

        self.writer.write_all(&header)?;
        self.writer.write_all(data)?;

        let record_size = HEADER_SIZE + data.len();
        self.block_offset += record_size;
        self.bytes_since_sync += record_size;
        Ok(())
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_mode {
            SyncMode::Always => self.sync(),
            SyncMode::Bytes { bytes } => {
                if self.bytes_since_sync >= bytes {
                    self.sync()
                } else {
                    Ok(())
                }
            }
            SyncMode::None => Ok(()),
        }
    }

    /// Flush buffered data to the OS without forcing it to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Force all appended records to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.bytes_since_sync = 0;
        Ok(())
    }

    /// Flush, sync and close the writer.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_writer_single_record_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let mut writer = WalWriter::new(&path, SyncMode::None).unwrap();
        writer.add_record(b"hello").unwrap();
        writer.close().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), HEADER_SIZE + 5);
        assert_eq!(u16::from_le_bytes([raw[4], raw[5]]), 5);
        assert_eq!(raw[6], RecordType::Full.to_byte());
        assert_eq!(&raw[7..], b"hello");

        // Stored CRC is masked over type + payload.
        let expected = mask_crc(crc32_multi(&[&[RecordType::Full.to_byte()], b"hello"]));
        assert_eq!(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]), expected);
    }

    #[test]
    fn test_writer_empty_record_emits_full() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let mut writer = WalWriter::new(&path, SyncMode::None).unwrap();
        writer.add_record(b"").unwrap();
        writer.close().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), HEADER_SIZE);
        assert_eq!(u16::from_le_bytes([raw[4], raw[5]]), 0);
        assert_eq!(raw[6], RecordType::Full.to_byte());
    }

    #[test]
    fn test_writer_fragments_across_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let large = vec![b'x'; BLOCK_SIZE + 1000];
        let mut writer = WalWriter::new(&path, SyncMode::None).unwrap();
        writer.add_record(&large).unwrap();
        writer.close().unwrap();

        let raw = std::fs::read(&path).unwrap();

        // First fragment fills the first block exactly.
        assert_eq!(raw[6], RecordType::First.to_byte());
        let first_len = u16::from_le_bytes([raw[4], raw[5]]) as usize;
        assert_eq!(first_len, BLOCK_SIZE - HEADER_SIZE);

        // Second fragment starts at the next block boundary.
        assert_eq!(raw[BLOCK_SIZE + 6], RecordType::Last.to_byte());
        let second_len =
            u16::from_le_bytes([raw[BLOCK_SIZE + 4], raw[BLOCK_SIZE + 5]]) as usize;
        assert_eq!(first_len + second_len, large.len());
    }

    #[test]
    fn test_writer_pads_short_block_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        // Leave 3 bytes in the block, then write again: the tail must be
        // zero-padded and the record start on the next block.
        let first_len = BLOCK_SIZE - HEADER_SIZE - 3;
        let mut writer = WalWriter::new(&path, SyncMode::None).unwrap();
        writer.add_record(&vec![b'a'; first_len]).unwrap();
        writer.add_record(b"next").unwrap();
        writer.close().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[BLOCK_SIZE - 3..BLOCK_SIZE], &[0, 0, 0]);
        assert_eq!(raw[BLOCK_SIZE + 6], RecordType::Full.to_byte());
        assert_eq!(&raw[BLOCK_SIZE + HEADER_SIZE..BLOCK_SIZE + HEADER_SIZE + 4], b"next");
    }

    #[test]
    fn test_writer_reopen_for_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let mut writer = WalWriter::new(&path, SyncMode::None).unwrap();
        writer.add_record(b"one").unwrap();
        writer.close().unwrap();

        let mut writer = WalWriter::open_for_append(&path, SyncMode::None).unwrap();
        writer.add_record(b"two").unwrap();
        writer.close().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 2 * HEADER_SIZE + 6);
        assert_eq!(&raw[HEADER_SIZE..HEADER_SIZE + 3], b"one");
    }

    #[test]
    fn test_writer_sync_always() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let mut writer = WalWriter::new(&path, SyncMode::Always).unwrap();
        writer.add_record(b"synced").unwrap();

        // Data must be on disk without an explicit close.
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[HEADER_SIZE..], b"synced");
    }
}
