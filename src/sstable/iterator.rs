//! Two-level table iteration.
//!
//! Composes the index-block iterator with on-demand data-block iterators
//! into a single ordered cursor over the whole table. Only one data
//! block is materialised at a time; when it came from the block cache,
//! the iterator holds its pin until it moves on.

use crate::options::ReadOptions;
use crate::Result;

use super::reader::{BlockEntry, SSTableReader};
use super::BlockIterator;

/// Ordered cursor over every entry of a table.
pub struct SSTableIterator<'a> {
    table: &'a SSTableReader,
    opts: ReadOptions,
    index_iter: BlockIterator,
    data_iter: Option<BlockIterator>,
    /// Pin for the current data block.
    data_entry: Option<BlockEntry>,
    /// Index value the current data iterator was opened from.
    data_block_handle: Vec<u8>,
    status: Result<()>,
}

impl<'a> SSTableIterator<'a> {
    pub(crate) fn new(
        table: &'a SSTableReader,
        index_iter: BlockIterator,
        opts: ReadOptions,
    ) -> Self {
        Self {
            table,
            opts,
            index_iter,
            data_iter: None,
            data_entry: None,
            data_block_handle: Vec::new(),
            status: Ok(()),
        }
    }

    /// Whether the cursor is positioned at an entry.
    pub fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|iter| iter.valid())
    }

    /// First deferred error, if any step hit one.
    pub fn status(&self) -> Result<()> {
        self.status.clone()?;
        self.index_iter.status()?;
        if let Some(iter) = &self.data_iter {
            iter.status()?;
        }
        Ok(())
    }

    /// The current key. Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.data_iter.as_ref().expect("valid iterator").key()
    }

    /// The current value. Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.data_iter.as_ref().expect("valid iterator").value()
    }

    /// Position at the first entry >= target.
    pub fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(iter) = &mut self.data_iter {
            iter.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    /// Position at the first entry.
    pub fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(iter) = &mut self.data_iter {
            iter.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    /// Position at the last entry.
    pub fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(iter) = &mut self.data_iter {
            iter.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    /// Advance. Requires `valid()`.
    pub fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = &mut self.data_iter {
            iter.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    /// Retreat. Requires `valid()`.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = &mut self.data_iter {
            iter.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |iter| !iter.valid()) {
            if !self.index_iter.valid() {
                self.clear_data_block();
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(iter) = &mut self.data_iter {
                iter.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |iter| !iter.valid()) {
            if !self.index_iter.valid() {
                self.clear_data_block();
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(iter) = &mut self.data_iter {
                iter.seek_to_last();
            }
        }
    }

    fn clear_data_block(&mut self) {
        self.data_iter = None;
        self.data_entry = None;
        self.data_block_handle.clear();
    }

    /// Open the data block the index currently points at, reusing the
    /// existing iterator when it is already the right one.
    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.clear_data_block();
            return;
        }

        let handle = self.index_iter.value();
        if self.data_iter.is_some() && self.data_block_handle == handle {
            return;
        }

        match self.table.block_reader(&self.opts, handle) {
            Ok(entry) => {
                self.data_block_handle = handle.to_vec();
                self.data_iter = Some(entry.block().iter(self.table.comparator()));
                self.data_entry = Some(entry);
            }
            Err(err) => {
                if self.status.is_ok() {
                    self.status = Err(err);
                }
                self.clear_data_block();
            }
        }
    }
}
