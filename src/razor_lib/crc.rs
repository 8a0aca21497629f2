/// Table-driven CRC-32 (IEEE, polynomial 0xEDB88320).
///
/// Every checksum in the image and journal formats goes through this one
/// implementation so the on-disk contract has a single source of truth.
use lazy_static::lazy_static;

const CRC32_POLY: u32 = 0xEDB88320;

lazy_static! {
    static ref CRC_TABLE: [u32; 256] = build_table();
}

fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut crc = i as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ CRC32_POLY;
            } else {
                crc >>= 1;
            }
        }
        *slot = crc;
    }
    table
}

/// Incremental CRC-32 state, for checksums over discontiguous parts
/// (record header followed by its payload).
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    pub fn new() -> Self {
        Self { state: 0xFFFFFFFF }
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        for &b in data {
            let idx = ((self.state ^ b as u32) & 0xFF) as usize;
            self.state = (self.state >> 8) ^ CRC_TABLE[idx];
        }
        self
    }

    pub fn finish(&self) -> u32 {
        self.state ^ 0xFFFFFFFF
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot checksum over a contiguous buffer.
pub fn crc32(data: &[u8]) -> u32 {
    let mut c = Crc32::new();
    c.update(data);
    c.finish()
}
