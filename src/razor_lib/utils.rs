#![allow(dead_code)]

use std::env;
use std::slice::from_raw_parts;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, Utc};

/// View a record struct as its raw bytes.
///
/// # Safety
///
/// `T` must be a `#[repr(C)]` type with no padding whose bit patterns are
/// all valid to observe (plain integers and byte arrays).
pub unsafe fn serialize_row<T: Sized>(src: &T) -> &[u8] {
    from_raw_parts((src as *const T) as *const u8, std::mem::size_of::<T>())
}

/// Read a record struct back out of raw bytes.
///
/// # Safety
///
/// `src` must hold at least `size_of::<T>()` bytes and `T` must be a
/// packed `#[repr(C)]` type valid for any bit pattern.
pub unsafe fn deserialize_row<T>(src: &[u8]) -> T {
    assert!(src.len() >= std::mem::size_of::<T>());
    std::ptr::read_unaligned(src.as_ptr() as *const T)
}

/// Seconds since the epoch as the on-disk u32 timestamp.
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Milliseconds since the epoch for image/journal headers.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Convert a stored u32 timestamp back into a `SystemTime`.
pub fn utc_time(timestamp_seconds: u32) -> SystemTime {
    match NaiveDateTime::from_timestamp_millis(timestamp_seconds as i64 * 1000) {
        Some(naive) => {
            let datetime: DateTime<Utc> = DateTime::from_utc(naive, Utc);
            SystemTime::from(datetime)
        }
        None => UNIX_EPOCH,
    }
}

pub fn system_time_secs(t: SystemTime) -> u32 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Initialize env_logger once; `RUST_LOG` wins over the default filter.
pub fn init_logs() {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    let _ = env_logger::builder().try_init();
}

/// Reply with the mapped errno and return on error, otherwise bind the value.
#[macro_export]
macro_rules! rep {
    ($reply:expr, $res:expr) => {
        match $res {
            Ok(_) => {}
            Err(e) => {
                log::debug!("op failed: {}", e);
                $reply.error(e.errno());
                return;
            }
        }
    };
    ($reply:expr, $name:ident, $res:expr) => {
        let $name = match $res {
            Ok(v) => v,
            Err(e) => {
                log::debug!("op failed: {}", e);
                $reply.error(e.errno());
                return;
            }
        };
    };
}

/// Convert a core result into the c_int form FUSE init wants.
pub fn ret<T>(res: crate::razor_lib::errors::FsResult<T>) -> Result<T, std::os::raw::c_int> {
    res.map_err(|e| {
        log::error!("fatal: {}", e);
        e.errno()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    #[repr(C, packed)]
    struct Rec {
        a: u32,
        b: u16,
        c: [u8; 2],
    }

    #[test]
    fn serialize_round_trip() {
        let rec = Rec {
            a: 0x11223344,
            b: 0x5566,
            c: [7, 8],
        };
        let bytes = unsafe { serialize_row(&rec) }.to_vec();
        assert_eq!(bytes.len(), 8);
        let back: Rec = unsafe { deserialize_row(&bytes) };
        assert_eq!(back, rec);
    }

    #[test]
    fn utc_time_round_trip() {
        let t = utc_time(1_700_000_000);
        assert_eq!(system_time_secs(t), 1_700_000_000);
    }
}
