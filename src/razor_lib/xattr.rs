/// Extended attribute storage.
///
/// Attributes live in chains owned by the filesystem; an inode's
/// `xattr_head` names its chain (biased by one, 0 = no attributes), so the
/// 64-byte inode carries only a handle.
use std::sync::RwLock;

use crate::razor_lib::errors::{FsError, FsResult};

pub const XATTR_NAME_MAX: usize = 255;
pub const XATTR_VALUE_MAX: usize = 4096;
const XATTR_CHAIN_MAX: usize = u16::MAX as usize - 1;

#[derive(Debug, Clone)]
struct XattrEntry {
    name: String,
    value: Vec<u8>,
}

#[derive(Default)]
struct XattrInner {
    chains: Vec<Option<Vec<XattrEntry>>>,
    free: Vec<u16>,
}

pub struct XattrTable {
    inner: RwLock<XattrInner>,
}

impl XattrTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(XattrInner::default()),
        }
    }

    fn check_name(name: &str) -> FsResult<()> {
        if name.is_empty() || name.len() > XATTR_NAME_MAX {
            return Err(FsError::InvalidArgument(format!(
                "xattr name of {} bytes",
                name.len()
            )));
        }
        Ok(())
    }

    /// Set `name=value` on the chain at `head`, allocating a chain when the
    /// inode has none yet. Returns the (possibly new) head.
    pub fn set(&self, head: u16, name: &str, value: &[u8]) -> FsResult<u16> {
        Self::check_name(name)?;
        if value.len() > XATTR_VALUE_MAX {
            return Err(FsError::NoSpace);
        }
        let mut inner = self.inner.write().unwrap();
        let idx = if head == 0 {
            match inner.free.pop() {
                Some(i) => {
                    inner.chains[i as usize] = Some(Vec::new());
                    i
                }
                None => {
                    if inner.chains.len() >= XATTR_CHAIN_MAX {
                        return Err(FsError::NoSpace);
                    }
                    inner.chains.push(Some(Vec::new()));
                    (inner.chains.len() - 1) as u16
                }
            }
        } else {
            head - 1
        };
        let chain = inner.chains[idx as usize]
            .as_mut()
            .ok_or_else(|| FsError::Corruption("dangling xattr chain".into()))?;
        match chain.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.value = value.to_vec(),
            None => chain.push(XattrEntry {
                name: name.to_string(),
                value: value.to_vec(),
            }),
        }
        Ok(idx + 1)
    }

    pub fn get(&self, head: u16, name: &str) -> FsResult<Vec<u8>> {
        Self::check_name(name)?;
        if head == 0 {
            return Err(FsError::NotFound);
        }
        let inner = self.inner.read().unwrap();
        let chain = inner
            .chains
            .get(head as usize - 1)
            .and_then(|c| c.as_ref())
            .ok_or(FsError::NotFound)?;
        chain
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.clone())
            .ok_or(FsError::NotFound)
    }

    pub fn list(&self, head: u16) -> Vec<String> {
        if head == 0 {
            return Vec::new();
        }
        let inner = self.inner.read().unwrap();
        inner
            .chains
            .get(head as usize - 1)
            .and_then(|c| c.as_ref())
            .map(|c| c.iter().map(|e| e.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Remove one attribute. Returns the new head (0 once the chain empties).
    pub fn remove(&self, head: u16, name: &str) -> FsResult<u16> {
        Self::check_name(name)?;
        if head == 0 {
            return Err(FsError::NotFound);
        }
        let mut inner = self.inner.write().unwrap();
        let idx = head as usize - 1;
        let chain = inner
            .chains
            .get_mut(idx)
            .and_then(|c| c.as_mut())
            .ok_or(FsError::NotFound)?;
        let before = chain.len();
        chain.retain(|e| e.name != name);
        if chain.len() == before {
            return Err(FsError::NotFound);
        }
        if chain.is_empty() {
            inner.chains[idx] = None;
            inner.free.push(idx as u16);
            return Ok(0);
        }
        Ok(head)
    }

    /// Drop a whole chain when its inode is freed.
    pub fn release(&self, head: u16) {
        if head == 0 {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        let idx = head as usize - 1;
        if idx < inner.chains.len() && inner.chains[idx].is_some() {
            inner.chains[idx] = None;
            inner.free.push(idx as u16);
        }
    }
}

impl Default for XattrTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn set_get_list_remove() -> Result<()> {
        let table = XattrTable::new();
        let head = table.set(0, "user.color", b"blue")?;
        assert_ne!(head, 0);
        let head = table.set(head, "user.shape", b"round")?;
        assert_eq!(table.get(head, "user.color")?, b"blue");
        let mut names = table.list(head);
        names.sort();
        assert_eq!(names, vec!["user.color", "user.shape"]);

        let head = table.remove(head, "user.color")?;
        assert_eq!(table.get(head, "user.color"), Err(FsError::NotFound));
        let head = table.remove(head, "user.shape")?;
        assert_eq!(head, 0);
        Ok(())
    }

    #[test]
    fn overwrite_replaces_value() -> Result<()> {
        let table = XattrTable::new();
        let head = table.set(0, "user.k", b"one")?;
        let head2 = table.set(head, "user.k", b"two")?;
        assert_eq!(head, head2);
        assert_eq!(table.get(head2, "user.k")?, b"two");
        assert_eq!(table.list(head2).len(), 1);
        Ok(())
    }

    #[test]
    fn released_chains_are_reused() -> Result<()> {
        let table = XattrTable::new();
        let head = table.set(0, "user.a", b"1")?;
        table.release(head);
        let head2 = table.set(0, "user.b", b"2")?;
        assert_eq!(head, head2);
        assert_eq!(table.get(head2, "user.a"), Err(FsError::NotFound));
        Ok(())
    }

    #[test]
    fn bad_names_rejected() {
        let table = XattrTable::new();
        assert!(table.set(0, "", b"x").is_err());
        let long = "x".repeat(XATTR_NAME_MAX + 1);
        assert!(table.set(0, &long, b"x").is_err());
    }
}
