/// Deduplicated, append-only storage of names.
///
/// Offsets handed out are stable for the lifetime of the instance: the byte
/// region only ever grows, so a reader holding an old offset always finds the
/// bytes it was given, terminated by the zero the writer appended.
use std::collections::HashMap;
use std::sync::RwLock;

use log::warn;

use crate::razor_lib::errors::{FsError, FsResult};

/// Longest name that may be interned (bytes, without terminator).
pub const MAX_STRING_LENGTH: usize = 4096;
/// Upper bound on the whole table.
pub const MAX_STRING_TABLE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Default)]
struct StringTableInner {
    data: Vec<u8>,
    offsets: HashMap<String, u32>,
}

pub struct StringTable {
    inner: RwLock<StringTableInner>,
}

impl StringTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StringTableInner::default()),
        }
    }

    /// Intern `name`, returning the stable offset of its bytes.
    pub fn intern(&self, name: &str) -> FsResult<u32> {
        if name.is_empty() {
            return Err(FsError::InvalidArgument("empty name".into()));
        }
        if name.len() > MAX_STRING_LENGTH {
            return Err(FsError::InvalidArgument(format!(
                "name of {} bytes exceeds limit",
                name.len()
            )));
        }
        {
            let inner = self.inner.read().unwrap();
            if let Some(&off) = inner.offsets.get(name) {
                return Ok(off);
            }
        }
        let mut inner = self.inner.write().unwrap();
        // Double check: another writer may have interned it meanwhile.
        if let Some(&off) = inner.offsets.get(name) {
            return Ok(off);
        }
        if inner.data.len() + name.len() + 1 > MAX_STRING_TABLE_SIZE {
            warn!("string table full at {} bytes", inner.data.len());
            return Err(FsError::NoSpace);
        }
        let off = inner.data.len() as u32;
        inner.data.extend_from_slice(name.as_bytes());
        inner.data.push(0);
        inner.offsets.insert(name.to_string(), off);
        Ok(off)
    }

    /// Read the name stored at `offset`.
    pub fn get(&self, offset: u32) -> FsResult<String> {
        let inner = self.inner.read().unwrap();
        let off = offset as usize;
        if off >= inner.data.len() {
            return Err(FsError::Corruption(format!(
                "string offset {} beyond table of {} bytes",
                off,
                inner.data.len()
            )));
        }
        let tail = &inner.data[off..];
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FsError::Corruption("unterminated string record".into()))?;
        String::from_utf8(tail[..end].to_vec())
            .map_err(|_| FsError::Corruption(format!("non-UTF-8 string at offset {}", off)))
    }

    /// Byte image of the table, written verbatim into the persistence image.
    pub fn serialize(&self) -> Vec<u8> {
        self.inner.read().unwrap().data.clone()
    }

    /// Rebuild the table from an image slice.
    pub fn load(&self, bytes: &[u8]) -> FsResult<()> {
        if !bytes.is_empty() && *bytes.last().unwrap() != 0 {
            return Err(FsError::Corruption(
                "string table does not end with a terminator".into(),
            ));
        }
        let mut inner = self.inner.write().unwrap();
        inner.data = bytes.to_vec();
        inner.offsets.clear();
        // Re-index by scanning zero-terminated records.
        let mut start = 0usize;
        for (i, &b) in bytes.iter().enumerate() {
            if b == 0 {
                if i > start {
                    if let Ok(s) = String::from_utf8(bytes[start..i].to_vec()) {
                        inner.offsets.entry(s).or_insert(start as u32);
                    }
                }
                start = i + 1;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.data.clear();
        inner.offsets.clear();
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn intern_is_idempotent() -> Result<()> {
        let t = StringTable::new();
        let a = t.intern("hello")?;
        let b = t.intern("hello")?;
        assert_eq!(a, b);
        assert_eq!(t.get(a)?, "hello");
        Ok(())
    }

    #[test]
    fn distinct_names_distinct_offsets() -> Result<()> {
        let t = StringTable::new();
        let a = t.intern("alpha")?;
        let b = t.intern("beta")?;
        assert_ne!(a, b);
        assert_eq!(t.get(a)?, "alpha");
        assert_eq!(t.get(b)?, "beta");
        Ok(())
    }

    #[test]
    fn rejects_empty_and_oversized() {
        let t = StringTable::new();
        assert!(matches!(t.intern(""), Err(FsError::InvalidArgument(_))));
        let big = "x".repeat(MAX_STRING_LENGTH + 1);
        assert!(matches!(t.intern(&big), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn out_of_range_offset_is_corruption() {
        let t = StringTable::new();
        t.intern("one").unwrap();
        assert!(matches!(t.get(10_000), Err(FsError::Corruption(_))));
    }

    #[test]
    fn serialize_then_load_round_trip() -> Result<()> {
        let t = StringTable::new();
        let a = t.intern("/dir/file.txt")?;
        let b = t.intern("/dir")?;
        let image = t.serialize();

        let u = StringTable::new();
        u.load(&image).map_err(|e| anyhow::anyhow!("{}", e))?;
        assert_eq!(u.get(a)?, "/dir/file.txt");
        assert_eq!(u.get(b)?, "/dir");
        // Loading re-indexes, so re-interning keeps the old offset.
        assert_eq!(u.intern("/dir")?, b);
        Ok(())
    }

    #[test]
    fn load_rejects_unterminated_data() {
        let t = StringTable::new();
        assert!(matches!(
            t.load(b"no-terminator"),
            Err(FsError::Corruption(_))
        ));
    }
}
