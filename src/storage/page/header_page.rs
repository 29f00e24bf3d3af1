use bytes::{Buf, BufMut};

use crate::common::{BirchError, PageId, Result, PAGE_SIZE};

const MAGIC_NUMBER: u32 = 0x4243_4844; // "BCHD"
const VERSION: u32 = 1;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const RECORD_COUNT_OFFSET: usize = 8;
const RECORDS_OFFSET: usize = 12;

/// Longest index name a record can hold
pub const MAX_INDEX_NAME_LEN: usize = 32;
const RECORD_SIZE: usize = MAX_INDEX_NAME_LEN + 4; // name (32, zero padded) + root page id (4)
pub const MAX_HEADER_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

fn read_u32(data: &[u8], offset: usize) -> u32 {
    (&data[offset..offset + 4]).get_u32_le()
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    (&mut data[offset..offset + 4]).put_u32_le(value);
}

fn record_offset(index: usize) -> usize {
    RECORDS_OFFSET + index * RECORD_SIZE
}

fn record_name(data: &[u8], index: usize) -> &[u8] {
    let offset = record_offset(index);
    let raw = &data[offset..offset + MAX_INDEX_NAME_LEN];
    let len = raw.iter().position(|&b| b == 0).unwrap_or(MAX_INDEX_NAME_LEN);
    &raw[..len]
}

fn find_record(data: &[u8], name: &str) -> Option<usize> {
    let count = read_u32(data, RECORD_COUNT_OFFSET) as usize;
    (0..count).find(|&i| record_name(data, i) == name.as_bytes())
}

fn root_id_at(data: &[u8], index: usize) -> PageId {
    PageId::new(read_u32(data, record_offset(index) + MAX_INDEX_NAME_LEN))
}

/// Page 0 of a database file: a table of (index name, root page id) records.
///
/// Every tree stored in the file registers its root here so it can be found
/// again after a restart.
pub struct HeaderPage<'a> {
    data: &'a mut [u8],
}

impl<'a> HeaderPage<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    /// Formats an empty header page.
    pub fn init(&mut self) {
        self.data.fill(0);
        write_u32(self.data, MAGIC_OFFSET, MAGIC_NUMBER);
        write_u32(self.data, VERSION_OFFSET, VERSION);
        write_u32(self.data, RECORD_COUNT_OFFSET, 0);
    }

    pub fn is_valid(&self) -> bool {
        HeaderPageRef::new(self.data).is_valid()
    }

    pub fn record_count(&self) -> usize {
        read_u32(self.data, RECORD_COUNT_OFFSET) as usize
    }

    fn set_record_count(&mut self, count: usize) {
        write_u32(self.data, RECORD_COUNT_OFFSET, count as u32);
    }

    fn check_name(name: &str) -> Result<()> {
        if name.len() > MAX_INDEX_NAME_LEN || name.as_bytes().contains(&0) {
            return Err(BirchError::IndexNameTooLong(name.to_string()));
        }
        Ok(())
    }

    fn set_record(&mut self, index: usize, name: &str, root_id: PageId) {
        let offset = record_offset(index);
        let slot = &mut self.data[offset..offset + MAX_INDEX_NAME_LEN];
        slot.fill(0);
        slot[..name.len()].copy_from_slice(name.as_bytes());
        write_u32(self.data, offset + MAX_INDEX_NAME_LEN, root_id.as_u32());
    }

    /// Adds a record for `name`.
    pub fn insert_record(&mut self, name: &str, root_id: PageId) -> Result<()> {
        Self::check_name(name)?;
        if find_record(self.data, name).is_some() {
            return Err(BirchError::RecordAlreadyExists(name.to_string()));
        }

        let count = self.record_count();
        if count >= MAX_HEADER_RECORDS {
            return Err(BirchError::HeaderPageFull);
        }

        self.set_record(count, name, root_id);
        self.set_record_count(count + 1);
        Ok(())
    }

    /// Changes the root page id recorded for `name`.
    pub fn update_record(&mut self, name: &str, root_id: PageId) -> Result<()> {
        let index = find_record(self.data, name)
            .ok_or_else(|| BirchError::RecordNotFound(name.to_string()))?;
        write_u32(self.data, record_offset(index) + MAX_INDEX_NAME_LEN, root_id.as_u32());
        Ok(())
    }

    /// Removes the record for `name`, moving the last record into its slot.
    pub fn delete_record(&mut self, name: &str) -> Result<PageId> {
        let index = find_record(self.data, name)
            .ok_or_else(|| BirchError::RecordNotFound(name.to_string()))?;
        let root_id = root_id_at(self.data, index);

        let last = self.record_count() - 1;
        if index < last {
            let src = record_offset(last);
            self.data
                .copy_within(src..src + RECORD_SIZE, record_offset(index));
        }
        let tail = record_offset(last);
        self.data[tail..tail + RECORD_SIZE].fill(0);
        self.set_record_count(last);
        Ok(root_id)
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        find_record(self.data, name).map(|i| root_id_at(self.data, i))
    }
}

/// Read-only view of a header page.
pub struct HeaderPageRef<'a> {
    data: &'a [u8],
}

impl<'a> HeaderPageRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn is_valid(&self) -> bool {
        read_u32(self.data, MAGIC_OFFSET) == MAGIC_NUMBER
            && read_u32(self.data, VERSION_OFFSET) == VERSION
            && self.record_count() <= MAX_HEADER_RECORDS
    }

    pub fn record_count(&self) -> usize {
        read_u32(self.data, RECORD_COUNT_OFFSET) as usize
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        find_record(self.data, name).map(|i| root_id_at(self.data, i))
    }

    /// All (name, root page id) records in slot order.
    pub fn records(&self) -> Vec<(String, PageId)> {
        (0..self.record_count())
            .map(|i| {
                let name = String::from_utf8_lossy(record_name(self.data, i)).into_owned();
                (name, root_id_at(self.data, i))
            })
            .collect()
    }
}
