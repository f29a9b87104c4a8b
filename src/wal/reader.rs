//! WAL reader.
//!
//! Reads logical records back out of a block-framed log, reassembling
//! fragments and resynchronising past damage. Corruption never aborts a
//! scan: damaged regions are dropped and reported to a caller-supplied
//! [`Reporter`] with the number of bytes skipped, and reading continues at
//! the next parseable record.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use bytes::Bytes;

use crate::util::crc::{crc32, unmask_crc};
use crate::Result;

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Receives corruption notifications during a scan.
pub trait Reporter {
    /// Roughly `bytes` of log were dropped for `reason`.
    fn corruption(&mut self, bytes: usize, reason: &str);
}

/// Outcome of reading one physical record.
enum Physical {
    /// A record with its raw type byte and payload.
    Record(u8, Vec<u8>),
    /// No more data.
    Eof,
    /// Damaged or skippable region; keep scanning.
    Bad,
}

/// Reads logical records from a log file.
pub struct WalReader {
    file: BufReader<File>,
    reporter: Option<Box<dyn Reporter>>,
    checksum: bool,
    /// Block-sized scratch the current window points into.
    backing: Vec<u8>,
    buffer_start: usize,
    buffer_end: usize,
    eof: bool,
    /// Physical start offset of the last record returned.
    last_record_offset: u64,
    /// File offset just past the end of the buffered window.
    end_of_buffer_offset: u64,
    /// Skip all records that physically start before this offset.
    initial_offset: u64,
    /// Discarding fragments until the next record boundary.
    resyncing: bool,
}

impl WalReader {
    /// Open a log for scanning from the beginning, verifying checksums.
    pub fn new(path: &Path) -> Result<Self> {
        Self::with_options(path, None, true, 0)
    }

    /// Open a log with full control.
    ///
    /// `initial_offset` restricts the scan to records whose physical start
    /// is at or past that offset; the reader aligns to the containing
    /// block and resynchronises on the first Full or Last record.
    pub fn with_options(
        path: &Path,
        reporter: Option<Box<dyn Reporter>>,
        checksum: bool,
        initial_offset: u64,
    ) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file: BufReader::with_capacity(BLOCK_SIZE * 4, file),
            reporter,
            checksum,
            backing: vec![0u8; BLOCK_SIZE],
            buffer_start: 0,
            buffer_end: 0,
            eof: false,
            last_record_offset: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        })
    }

    /// Physical start offset of the last record returned by
    /// [`WalReader::read_record`].
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// Read the next logical record, or None at the end of the log.
    ///
    /// A fragment sequence cut short by the end of the file is dropped
    /// silently: the writer died mid-record, which is a clean end of log.
    pub fn read_record(&mut self) -> Option<Bytes> {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return None;
        }

        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;
        // Offset of the logical record being assembled.
        let mut prospective_record_offset = 0u64;

        loop {
            let outcome = self.read_physical_record();

            if self.resyncing {
                match &outcome {
                    Physical::Record(t, _) if *t == RecordType::Middle.to_byte() => continue,
                    Physical::Record(t, _) if *t == RecordType::Last.to_byte() => {
                        self.resyncing = false;
                        continue;
                    }
                    _ => self.resyncing = false,
                }
            }

            match outcome {
                Physical::Record(type_byte, fragment) => {
                    let physical_record_offset = self.end_of_buffer_offset
                        - self.buffer_len() as u64
                        - HEADER_SIZE as u64
                        - fragment.len() as u64;

                    match RecordType::from_byte(type_byte) {
                        Some(RecordType::Full) => {
                            if in_fragmented_record && !scratch.is_empty() {
                                // Earlier writers could emit an empty First
                                // at a block tail; an empty scratch is that
                                // artifact, anything else lost its end.
                                self.report_corruption(
                                    scratch.len() as u64,
                                    "partial record without end(1)",
                                );
                            }
                            self.last_record_offset = physical_record_offset;
                            return Some(Bytes::from(fragment));
                        }
                        Some(RecordType::First) => {
                            if in_fragmented_record && !scratch.is_empty() {
                                self.report_corruption(
                                    scratch.len() as u64,
                                    "partial record without end(2)",
                                );
                            }
                            prospective_record_offset = physical_record_offset;
                            scratch = fragment;
                            in_fragmented_record = true;
                        }
                        Some(RecordType::Middle) => {
                            if !in_fragmented_record {
                                self.report_corruption(
                                    fragment.len() as u64,
                                    "missing start of fragmented record(1)",
                                );
                            } else {
                                scratch.extend_from_slice(&fragment);
                            }
                        }
                        Some(RecordType::Last) => {
                            if !in_fragmented_record {
                                self.report_corruption(
                                    fragment.len() as u64,
                                    "missing start of fragmented record(2)",
                                );
                            } else {
                                scratch.extend_from_slice(&fragment);
                                self.last_record_offset = prospective_record_offset;
                                return Some(Bytes::from(scratch));
                            }
                        }
                        Some(RecordType::Zero) | None => {
                            let dropped = fragment.len()
                                + if in_fragmented_record { scratch.len() } else { 0 };
                            self.report_corruption(
                                dropped as u64,
                                &format!("unknown record type {}", type_byte),
                            );
                            in_fragmented_record = false;
                            scratch.clear();
                        }
                    }
                }
                Physical::Eof => {
                    // A dangling fragment means the writer crashed after a
                    // physical record but before the next; not corruption.
                    return None;
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report_corruption(scratch.len() as u64, "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
            }
        }
    }

    fn buffer_len(&self) -> usize {
        self.buffer_end - self.buffer_start
    }

    fn clear_buffer(&mut self) {
        self.buffer_start = 0;
        self.buffer_end = 0;
    }

    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.buffer_len() < HEADER_SIZE {
                if !self.eof {
                    // Last read was a full block, so this is a trailer.
                    self.clear_buffer();
                    if !self.read_block() {
                        return Physical::Eof;
                    }
                    continue;
                }
                // A truncated header at the end of the file: the writer
                // crashed mid-header. Treated as a clean end.
                self.clear_buffer();
                return Physical::Eof;
            }

            let buf = &self.backing[self.buffer_start..self.buffer_end];
            let length = buf[4] as usize | ((buf[5] as usize) << 8);
            let type_byte = buf[6];

            if HEADER_SIZE + length > buf.len() {
                let drop_size = buf.len() as u64;
                self.clear_buffer();
                if !self.eof {
                    self.report_corruption(drop_size, "bad record length");
                    return Physical::Bad;
                }
                // The writer died before finishing the payload.
                return Physical::Eof;
            }

            if type_byte == RecordType::Zero.to_byte() && length == 0 {
                // Preallocated-file padding; skip the rest of the block
                // without reporting.
                self.clear_buffer();
                return Physical::Bad;
            }

            if self.checksum {
                let expected = unmask_crc(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]));
                // The type byte immediately precedes the payload.
                let actual = crc32(&buf[6..HEADER_SIZE + length]);
                if actual != expected {
                    // The length field itself may be corrupt; trusting it
                    // could resynchronise onto garbage, so drop the rest
                    // of the block.
                    let drop_size = buf.len() as u64;
                    self.clear_buffer();
                    self.report_corruption(drop_size, "checksum mismatch");
                    return Physical::Bad;
                }
            }

            let data = self.backing
                [self.buffer_start + HEADER_SIZE..self.buffer_start + HEADER_SIZE + length]
                .to_vec();
            self.buffer_start += HEADER_SIZE + length;

            // Skip physical records that started before initial_offset.
            if (self.end_of_buffer_offset as i64
                - self.buffer_len() as i64
                - HEADER_SIZE as i64
                - length as i64) < self.initial_offset as i64
            {
                return Physical::Bad;
            }

            return Physical::Record(type_byte, data);
        }
    }

    /// Refill the window with the next block. Returns false at end of file.
    fn read_block(&mut self) -> bool {
        match self.read_full_block() {
            Ok(n) => {
                self.buffer_start = 0;
                self.buffer_end = n;
                self.end_of_buffer_offset += n as u64;
                if n == 0 {
                    self.eof = true;
                    return false;
                }
                if n < BLOCK_SIZE {
                    self.eof = true;
                }
                true
            }
            Err(err) => {
                self.clear_buffer();
                self.report_drop(BLOCK_SIZE as u64, &err.to_string());
                self.eof = true;
                false
            }
        }
    }

    fn read_full_block(&mut self) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read(&mut self.backing[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Position the file at the start of the block containing
    /// `initial_offset`, stepping past the block trailer if the offset
    /// lands inside one.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = (self.initial_offset % BLOCK_SIZE as u64) as usize;
        let mut block_start = self.initial_offset - offset_in_block as u64;

        // Offsets in the trailing 6 bytes can never start a record.
        if offset_in_block > BLOCK_SIZE - 6 {
            block_start += BLOCK_SIZE as u64;
        }

        self.end_of_buffer_offset = block_start;

        if block_start > 0 {
            if let Err(err) = self.file.seek(SeekFrom::Start(block_start)) {
                self.report_drop(block_start, &err.to_string());
                return false;
            }
        }
        true
    }

    fn report_corruption(&mut self, bytes: u64, reason: &str) {
        self.report_drop(bytes, reason);
    }

    fn report_drop(&mut self, bytes: u64, reason: &str) {
        // Suppress reports for regions entirely before initial_offset.
        let drop_start =
            self.end_of_buffer_offset as i64 - self.buffer_len() as i64 - bytes as i64;
        if let Some(reporter) = &mut self.reporter {
            if drop_start >= self.initial_offset as i64 {
                reporter.corruption(bytes as usize, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::WalWriter;
    use super::*;
    use crate::options::SyncMode;
    use crate::util::crc::{crc32_multi, mask_crc};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct CountingReporter {
        reports: Arc<Mutex<Vec<(usize, String)>>>,
    }

    impl Reporter for CountingReporter {
        fn corruption(&mut self, bytes: usize, reason: &str) {
            self.reports.lock().unwrap().push((bytes, reason.to_string()));
        }
    }

    fn write_records(path: &std::path::Path, records: &[Vec<u8>]) {
        let mut writer = WalWriter::new(path, SyncMode::None).unwrap();
        for record in records {
            writer.add_record(record).unwrap();
        }
        writer.close().unwrap();
    }

    /// Append a hand-crafted physical record to a raw log image.
    fn emit_raw(buf: &mut Vec<u8>, record_type: RecordType, payload: &[u8]) {
        let crc = mask_crc(crc32_multi(&[&[record_type.to_byte()], payload]));
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.push(record_type.to_byte());
        buf.extend_from_slice(payload);
    }

    #[test]
    fn test_empty_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        write_records(&path, &[]);

        let mut reader = WalReader::new(&path).unwrap();
        assert!(reader.read_record().is_none());
    }

    #[test]
    fn test_roundtrip_with_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let records = vec![b"first".to_vec(), b"second".to_vec(), Vec::new(), b"third".to_vec()];
        write_records(&path, &records);

        let mut reader = WalReader::new(&path).unwrap();
        let mut expected_offset = 0u64;
        for record in &records {
            let got = reader.read_record().unwrap();
            assert_eq!(&got[..], &record[..]);
            assert_eq!(reader.last_record_offset(), expected_offset);
            expected_offset += (HEADER_SIZE + record.len()) as u64;
        }
        assert!(reader.read_record().is_none());
    }

    #[test]
    fn test_fragmented_record_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        // 10-byte, 40000-byte (First+Middle or Last across blocks), 7-byte.
        let records = vec![
            vec![b'a'; 10],
            (0..40000u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>(),
            vec![b'c'; 7],
        ];
        write_records(&path, &records);

        let mut reader = WalReader::new(&path).unwrap();
        for record in &records {
            let got = reader.read_record().unwrap();
            assert_eq!(&got[..], &record[..]);
        }
        assert!(reader.read_record().is_none());
    }

    #[test]
    fn test_corrupt_middle_record_is_skipped_and_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let records = vec![vec![b'a'; 10], vec![b'b'; 40000], vec![b'c'; 7]];
        write_records(&path, &records);

        // Flip one payload byte inside the second record.
        let mut raw = std::fs::read(&path).unwrap();
        let target = HEADER_SIZE + 10 + HEADER_SIZE + 100;
        raw[target] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let reporter = CountingReporter::default();
        let reports = Arc::clone(&reporter.reports);
        let mut reader =
            WalReader::with_options(&path, Some(Box::new(reporter)), true, 0).unwrap();

        let first = reader.read_record().unwrap();
        assert_eq!(&first[..], &records[0][..]);

        // Record two is gone; record three survives.
        let third = reader.read_record().unwrap();
        assert_eq!(&third[..], &records[2][..]);
        assert!(reader.read_record().is_none());

        let reports = reports.lock().unwrap();
        assert!(!reports.is_empty());
        let dropped: usize = reports.iter().map(|(bytes, _)| bytes).sum();
        assert!(dropped >= records[1].len(), "dropped {} bytes", dropped);
    }

    #[test]
    fn test_truncated_tail_is_clean_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        write_records(&path, &[b"complete".to_vec(), vec![b'x'; 5000]]);

        // Cut the file mid-way through the second record's payload.
        let mut raw = std::fs::read(&path).unwrap();
        raw.truncate(HEADER_SIZE + 8 + HEADER_SIZE + 100);
        std::fs::write(&path, &raw).unwrap();

        let reporter = CountingReporter::default();
        let reports = Arc::clone(&reporter.reports);
        let mut reader =
            WalReader::with_options(&path, Some(Box::new(reporter)), true, 0).unwrap();

        let first = reader.read_record().unwrap();
        assert_eq!(&first[..], b"complete");
        assert!(reader.read_record().is_none());

        // A writer crash is not corruption.
        assert!(reports.lock().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_header_is_clean_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        write_records(&path, &[b"one".to_vec(), b"two".to_vec()]);

        let mut raw = std::fs::read(&path).unwrap();
        raw.truncate(HEADER_SIZE + 3 + 4); // 4 bytes into the next header
        std::fs::write(&path, &raw).unwrap();

        let mut reader = WalReader::new(&path).unwrap();
        assert_eq!(&reader.read_record().unwrap()[..], b"one");
        assert!(reader.read_record().is_none());
    }

    #[test]
    fn test_initial_offset_skips_earlier_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let records = vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()];
        write_records(&path, &records);

        // Start exactly at the second record's physical offset.
        let second_offset = (HEADER_SIZE + records[0].len()) as u64;
        let mut reader = WalReader::with_options(&path, None, true, second_offset).unwrap();

        assert_eq!(&reader.read_record().unwrap()[..], b"beta");
        assert_eq!(reader.last_record_offset(), second_offset);
        assert_eq!(&reader.read_record().unwrap()[..], b"gamma");
        assert!(reader.read_record().is_none());

        // An offset one past a record start skips that record too.
        let mut reader =
            WalReader::with_options(&path, None, true, second_offset + 1).unwrap();
        assert_eq!(&reader.read_record().unwrap()[..], b"gamma");
    }

    #[test]
    fn test_initial_offset_in_block_trailer_advances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        // Fill the first block so the second starts a fresh record.
        let filler = vec![b'f'; BLOCK_SIZE - HEADER_SIZE - 3];
        write_records(&path, &[filler, b"target".to_vec()]);

        // Any offset inside the first block's trailing 6 bytes rounds up
        // to the next block.
        let offset = (BLOCK_SIZE - 2) as u64;
        let mut reader = WalReader::with_options(&path, None, true, offset).unwrap();
        assert_eq!(&reader.read_record().unwrap()[..], b"target");
        assert!(reader.read_record().is_none());
    }

    #[test]
    fn test_resync_drops_tail_of_straddling_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        // A record spanning blocks, then a small one.
        let records = vec![vec![b'x'; BLOCK_SIZE + 500], b"after".to_vec()];
        write_records(&path, &records);

        // Start inside the spanning record's second block: its Last
        // fragment must be discarded, not surfaced as a record.
        let mut reader =
            WalReader::with_options(&path, None, true, BLOCK_SIZE as u64).unwrap();
        assert_eq!(&reader.read_record().unwrap()[..], b"after");
        assert!(reader.read_record().is_none());
    }

    #[test]
    fn test_tolerates_empty_first_at_block_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        // Old writers could emit an empty First when exactly a header fit
        // at the block tail, then restart the record in the next block.
        let filler = vec![b'f'; BLOCK_SIZE - 2 * HEADER_SIZE];
        let mut raw = Vec::new();
        emit_raw(&mut raw, RecordType::Full, &filler);
        emit_raw(&mut raw, RecordType::First, b"");
        assert_eq!(raw.len(), BLOCK_SIZE);
        emit_raw(&mut raw, RecordType::Full, b"payload");
        std::fs::write(&path, &raw).unwrap();

        let reporter = CountingReporter::default();
        let reports = Arc::clone(&reporter.reports);
        let mut reader =
            WalReader::with_options(&path, Some(Box::new(reporter)), true, 0).unwrap();

        assert_eq!(&reader.read_record().unwrap()[..], &filler[..]);
        assert_eq!(&reader.read_record().unwrap()[..], b"payload");
        assert!(reader.read_record().is_none());
        assert!(reports.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dangling_first_without_end_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let mut raw = Vec::new();
        emit_raw(&mut raw, RecordType::First, b"lost");
        emit_raw(&mut raw, RecordType::Full, b"found");
        std::fs::write(&path, &raw).unwrap();

        let reporter = CountingReporter::default();
        let reports = Arc::clone(&reporter.reports);
        let mut reader =
            WalReader::with_options(&path, Some(Box::new(reporter)), true, 0).unwrap();

        assert_eq!(&reader.read_record().unwrap()[..], b"found");
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, 4);
        assert!(reports[0].1.contains("partial record without end"));
    }

    #[test]
    fn test_orphan_middle_and_last_are_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let mut raw = Vec::new();
        emit_raw(&mut raw, RecordType::Middle, b"mid");
        emit_raw(&mut raw, RecordType::Last, b"last");
        emit_raw(&mut raw, RecordType::Full, b"ok");
        std::fs::write(&path, &raw).unwrap();

        let reporter = CountingReporter::default();
        let reports = Arc::clone(&reporter.reports);
        let mut reader =
            WalReader::with_options(&path, Some(Box::new(reporter)), true, 0).unwrap();

        assert_eq!(&reader.read_record().unwrap()[..], b"ok");
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].1.contains("missing start"));
        assert!(reports[1].1.contains("missing start"));
    }

    #[test]
    fn test_unknown_record_type_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let mut raw = Vec::new();
        // Type 9 with a valid checksum.
        let payload = b"junk";
        let crc = mask_crc(crc32_multi(&[&[9u8], payload]));
        raw.extend_from_slice(&crc.to_le_bytes());
        raw.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        raw.push(9);
        raw.extend_from_slice(payload);
        emit_raw(&mut raw, RecordType::Full, b"good");
        std::fs::write(&path, &raw).unwrap();

        let reporter = CountingReporter::default();
        let reports = Arc::clone(&reporter.reports);
        let mut reader =
            WalReader::with_options(&path, Some(Box::new(reporter)), true, 0).unwrap();

        assert_eq!(&reader.read_record().unwrap()[..], b"good");
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].1.contains("unknown record type"));
    }

    #[test]
    fn test_checksum_disabled_accepts_damage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        write_records(&path, &[b"fragile".to_vec()]);

        let mut raw = std::fs::read(&path).unwrap();
        raw[HEADER_SIZE] ^= 0x01; // flip a payload byte
        std::fs::write(&path, &raw).unwrap();

        let mut reader = WalReader::with_options(&path, None, false, 0).unwrap();
        let record = reader.read_record().unwrap();
        assert_eq!(&record[..1], b"e"); // 'f' ^ 0x01
    }
}
