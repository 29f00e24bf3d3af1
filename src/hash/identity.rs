use std::hash::{BuildHasherDefault, Hasher};

/// Hasher that passes integer keys through unchanged.
///
/// Page ids are handed out sequentially, so their low bits are already evenly
/// spread across directory slots. Arbitrary byte input is folded FNV-style.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityHasher {
    state: u64,
}

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
        for &byte in bytes {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    fn write_u8(&mut self, n: u8) {
        self.state = n as u64;
    }

    fn write_u16(&mut self, n: u16) {
        self.state = n as u64;
    }

    fn write_u32(&mut self, n: u32) {
        self.state = n as u64;
    }

    fn write_u64(&mut self, n: u64) {
        self.state = n;
    }

    fn write_usize(&mut self, n: usize) {
        self.state = n as u64;
    }
}

pub type IdentityHashBuilder = BuildHasherDefault<IdentityHasher>;
