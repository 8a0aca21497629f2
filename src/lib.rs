pub mod razor_lib;

use std::sync::RwLock;

use lazy_static::lazy_static;
pub use razor_lib::*;

lazy_static! {
    // Mount point and image path kept for the signal handler's unmount hook.
    pub static ref MOUNT_POINT: RwLock<String> = RwLock::new(String::new());
    pub static ref IMAGE_FILE: RwLock<String> = RwLock::new(String::new());
}
