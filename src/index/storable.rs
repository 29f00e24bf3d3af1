use std::fmt;

use bytes::{Buf, BufMut};

use crate::common::{PageId, RecordId, SlotId};

/// Fixed-width binary encoding for keys and values stored in index pages.
///
/// `encode` must write exactly `ENCODED_SIZE` bytes and `decode` must read
/// exactly as many.
pub trait Storable: Clone + fmt::Debug + Send + Sync + 'static {
    const ENCODED_SIZE: usize;

    fn encode<B: BufMut>(&self, buf: &mut B);

    fn decode<B: Buf>(buf: &mut B) -> Self;
}

impl Storable for i32 {
    const ENCODED_SIZE: usize = 4;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(*self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        buf.get_i32_le()
    }
}

impl Storable for i64 {
    const ENCODED_SIZE: usize = 8;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64_le(*self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        buf.get_i64_le()
    }
}

impl Storable for u32 {
    const ENCODED_SIZE: usize = 4;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(*self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        buf.get_u32_le()
    }
}

impl Storable for u64 {
    const ENCODED_SIZE: usize = 8;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(*self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        buf.get_u64_le()
    }
}

impl Storable for PageId {
    const ENCODED_SIZE: usize = 4;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.as_u32());
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        PageId::new(buf.get_u32_le())
    }
}

/// Encoded as page id (4 bytes) followed by slot id (2 bytes).
impl Storable for RecordId {
    const ENCODED_SIZE: usize = 6;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.page_id.as_u32());
        buf.put_u16_le(self.slot_id.as_u16());
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        let page_id = PageId::new(buf.get_u32_le());
        let slot_id = SlotId::new(buf.get_u16_le());
        RecordId::new(page_id, slot_id)
    }
}

/// Opaque fixed-width key of `N` bytes.
///
/// Ordering is supplied by a comparator: `BytewiseComparator` compares the raw
/// bytes, `IntegerComparator` reads the first eight bytes as a little-endian
/// `i64`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericKey<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> GenericKey<N> {
    /// Copies up to `N` bytes of `bytes`, zero padding the rest.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = [0u8; N];
        let len = bytes.len().min(N);
        data[..len].copy_from_slice(&bytes[..len]);
        Self { data }
    }

    /// Stores `value` little-endian in the leading bytes.
    pub fn from_i64(value: i64) -> Self {
        Self::from_bytes(&value.to_le_bytes())
    }

    /// Reads the leading (up to eight) bytes as a little-endian `i64`.
    pub fn to_i64(&self) -> i64 {
        let mut raw = [0u8; 8];
        let len = N.min(8);
        raw[..len].copy_from_slice(&self.data[..len]);
        i64::from_le_bytes(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl<const N: usize> Default for GenericKey<N> {
    fn default() -> Self {
        Self { data: [0u8; N] }
    }
}

impl<const N: usize> AsRef<[u8]> for GenericKey<N> {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl<const N: usize> fmt::Debug for GenericKey<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GenericKey<{}>({})", N, self.to_i64())
    }
}

impl<const N: usize> Storable for GenericKey<N> {
    const ENCODED_SIZE: usize = N;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.data);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        let mut data = [0u8; N];
        buf.copy_to_slice(&mut data);
        Self { data }
    }
}
