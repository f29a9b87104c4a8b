//! Table construction.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use bytes::Bytes;

use crate::options::{Options, INDEX_BLOCK_RESTART_INTERVAL};
use crate::util::comparator::BytewiseComparator;
use crate::util::crc::{crc32_multi, mask_crc};
use crate::Result;

use super::block_builder::BlockBuilder;
use super::filter_block::FilterBlockBuilder;
use super::{
    BlockHandle, CompressionType, Footer, COMPARATOR_KEY, FILTER_KEY_PREFIX, FOOTER_SIZE,
};

/// Builds a sorted table file from keys supplied in comparator order.
///
/// Data blocks are cut when their estimate passes the configured target;
/// each cut block gets one index entry keyed by a shortened separator
/// computed once the following key is known.
pub struct SSTableWriter {
    file: BufWriter<File>,
    options: Options,
    /// Bytes written so far; the offset the next block lands at.
    offset: u64,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: Option<FilterBlockBuilder>,
    last_key: Vec<u8>,
    num_entries: u64,
    /// A data block was cut and awaits its index entry.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
    closed: bool,
}

impl SSTableWriter {
    /// Create a table file at `path`.
    pub fn new(path: &Path, options: Options) -> Result<Self> {
        let file = File::create(path)?;

        let mut filter_block = options
            .filter_policy
            .clone()
            .map(FilterBlockBuilder::new);
        if let Some(fb) = &mut filter_block {
            fb.start_block(0);
        }

        Ok(Self {
            file: BufWriter::with_capacity(options.block_size * 4, file),
            data_block: BlockBuilder::new(
                options.block_restart_interval,
                options.comparator.clone(),
            ),
            index_block: BlockBuilder::new(
                INDEX_BLOCK_RESTART_INTERVAL,
                options.comparator.clone(),
            ),
            filter_block,
            options,
            offset: 0,
            last_key: Vec::new(),
            num_entries: 0,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
            closed: false,
        })
    }

    /// Number of entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Size the file would have if finished now.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    /// Append an entry. `key` must order strictly after every key added
    /// before it.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.closed);
        debug_assert!(
            self.num_entries == 0
                || self.options.comparator.compare(key, &self.last_key)
                    == std::cmp::Ordering::Greater,
            "keys must be added in order"
        );

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            // The separator only needs to sort between the finished
            // block's last key and this one, so it can be much shorter
            // than either.
            self.options
                .comparator
                .find_shortest_separator(&mut self.last_key, key);
            let handle = self.pending_handle.encode();
            self.index_block.add(&self.last_key, &handle);
            self.pending_index_entry = false;
        }

        if let Some(fb) = &mut self.filter_block {
            fb.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Cut the current data block and write it out.
    pub fn flush(&mut self) -> Result<()> {
        debug_assert!(!self.closed);
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let contents = self.data_block.finish();
        self.data_block.reset();
        self.pending_handle = self.write_block(contents, self.options.compression)?;
        self.pending_index_entry = true;
        self.file.flush()?;

        if let Some(fb) = &mut self.filter_block {
            fb.start_block(self.offset);
        }
        Ok(())
    }

    /// Compress (when worthwhile) and write a block plus its trailer.
    fn write_block(
        &mut self,
        contents: Bytes,
        compression: CompressionType,
    ) -> Result<BlockHandle> {
        // A codec is only worth the decompression cost if it saves at
        // least an eighth of the block.
        let threshold = contents.len() - contents.len() / 8;

        let (data, block_type) = match compression {
            CompressionType::None => (contents, CompressionType::None),
            CompressionType::Snappy => {
                match snap::raw::Encoder::new().compress_vec(&contents) {
                    Ok(compressed) if compressed.len() < threshold => {
                        (Bytes::from(compressed), CompressionType::Snappy)
                    }
                    _ => (contents, CompressionType::None),
                }
            }
            CompressionType::Lz4 => {
                let compressed = lz4_flex::compress_prepend_size(&contents);
                if compressed.len() < threshold {
                    (Bytes::from(compressed), CompressionType::Lz4)
                } else {
                    (contents, CompressionType::None)
                }
            }
        };

        self.write_raw_block(&data, block_type)
    }

    fn write_raw_block(
        &mut self,
        data: &[u8],
        block_type: CompressionType,
    ) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, data.len() as u64);
        self.file.write_all(data)?;

        // Trailer: type byte, then masked CRC over contents + type.
        let type_byte = block_type.to_byte();
        let crc = mask_crc(crc32_multi(&[data, &[type_byte]]));
        self.file.write_all(&[type_byte])?;
        self.file.write_all(&crc.to_le_bytes())?;

        self.offset += data.len() as u64 + 5;
        Ok(handle)
    }

    /// Write the filter, metaindex and index blocks plus the footer, then
    /// sync and close the file.
    pub fn finish(mut self) -> Result<SSTableInfo> {
        self.flush()?;
        debug_assert!(!self.closed);
        self.closed = true;

        // Filter block, never compressed.
        let filter_handle = match self.filter_block.take() {
            Some(fb) => Some(self.write_raw_block(&fb.finish(), CompressionType::None)?),
            None => None,
        };

        // Metaindex: comparator name, then the filter mapping. Keys are
        // plain strings, ordered bytewise.
        let mut metaindex = BlockBuilder::new(
            INDEX_BLOCK_RESTART_INTERVAL,
            std::sync::Arc::new(BytewiseComparator::new()),
        );
        metaindex.add(
            COMPARATOR_KEY.as_bytes(),
            self.options.comparator.name().as_bytes(),
        );
        if let Some(handle) = filter_handle {
            let mut key = String::from(FILTER_KEY_PREFIX);
            if let Some(policy) = &self.options.filter_policy {
                key.push_str(policy.name());
            }
            metaindex.add(key.as_bytes(), &handle.encode());
        }
        let metaindex_contents = metaindex.finish();
        let metaindex_handle = self.write_block(metaindex_contents, self.options.compression)?;

        // Index block, with the final entry keyed past the last key.
        if self.pending_index_entry {
            self.options
                .comparator
                .find_short_successor(&mut self.last_key);
            let handle = self.pending_handle.encode();
            self.index_block.add(&self.last_key, &handle);
            self.pending_index_entry = false;
        }
        let index_contents = self.index_block.finish();
        let index_handle = self.write_block(index_contents, self.options.compression)?;

        let footer = Footer::new(metaindex_handle, index_handle);
        self.file.write_all(&footer.encode())?;
        self.offset += FOOTER_SIZE as u64;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        Ok(SSTableInfo {
            file_size: self.offset,
            num_entries: self.num_entries,
        })
    }
}

/// Summary of a finished table file.
#[derive(Debug, Clone, Copy)]
pub struct SSTableInfo {
    /// Total file size in bytes.
    pub file_size: u64,
    /// Number of entries written.
    pub num_entries: u64,
}
