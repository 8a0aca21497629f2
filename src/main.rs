use std::fs;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction};
use execute::Execute;
use fork::{fork, Fork};
use log::*;
use nix::sys::signal;
use retry::delay::Fixed;
use retry::{retry_with_index, OperationResult};

use razorfs::razor_lib::persist::PersistenceMode;
use razorfs::razor_lib::utils::init_logs;
use razorfs::{FsConfig, RazorFS, IMAGE_FILE, MOUNT_POINT};

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(arg!([mountpoint] "Mountpoint to mount on")
            .default_value("tests/mnt"))
        .arg(arg!(-f --front "Keep daemon running in front").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(--format "Start from an empty filesystem, discarding any image").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue)
            .required(false))
        .arg(
            arg!(-d --device <FILE> "Image path (filesystem storage file)")
                .required(false)
                .default_value("razorfs.img"),
        )
        .arg(
            arg!(--mode <MODE> "Persistence mode: sync, async or journal")
                .required(false)
                .default_value("sync"),
        )
        .arg(
            arg!(--sync_interval <MS> "Auto-sync interval for async mode, in milliseconds")
                .required(false)
                .default_value("5000"),
        )
        .arg(
            arg!(--blocks <N> "Backing region size in blocks")
                .required(false)
                .default_value("16384"),
        )
        .arg(
            arg!(--block_size <N> "Block size in bytes")
                .required(false)
                .default_value("4096"),
        )
        .get_matches();

    if matches.get_flag("verbose") {
        std::env::set_var("RUST_LOG", "debug");
    }
    init_logs();
    let mountpoint = matches.get_one::<String>("mountpoint").unwrap();
    let device = matches.get_one::<String>("device").unwrap();
    let path_mountpoint = fs::canonicalize(mountpoint)?;
    let abspath_mountpoint = path_mountpoint
        .to_str()
        .ok_or_else(|| anyhow!("bad mountpoint"))?;
    info!("Image: {}", device);

    let mode = match matches.get_one::<String>("mode").unwrap().as_str() {
        "sync" => PersistenceMode::Synchronous,
        "async" => PersistenceMode::Asynchronous,
        "journal" => PersistenceMode::JournalOnly,
        other => return Err(anyhow!("unknown persistence mode {:?}", other)),
    };
    let config = FsConfig {
        image_path: PathBuf::from(device),
        mode,
        auto_sync_ms: matches
            .get_one::<String>("sync_interval")
            .unwrap()
            .parse()?,
        total_blocks: matches.get_one::<String>("blocks").unwrap().parse()?,
        block_size: matches.get_one::<String>("block_size").unwrap().parse()?,
        ..Default::default()
    };

    if matches.get_flag("format") {
        warn!("Discarding previous image and journal!");
        let _ = fs::remove_file(&config.image_path);
        let _ = fs::remove_file(format!("{}.journal", config.image_path.display()));
    }

    *MOUNT_POINT.write().unwrap() = abspath_mountpoint.to_string();
    *IMAGE_FILE.write().unwrap() = device.clone();

    macro_rules! umount {
        () => {
            {
                use log::*;
                info!("Unmounting {}", MOUNT_POINT.read().unwrap().clone());
                let mut command = execute::command_args!("fusermount", "-u", MOUNT_POINT.read().unwrap().clone());
                command.stdout(Stdio::piped());
                let output = command.execute_output().unwrap();
                info!("fusermount output: {}", String::from_utf8(output.stdout).unwrap());
            }
        };
    }

    pub extern "C" fn signal_handler(_: i32) {
        unsafe { println!("[{}] Received signal and will umount.", libc::getpid()); }
        umount!();
        unsafe { println!("[{}] All Done.", libc::getpid()); }
        std::process::exit(0);
    }

    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(signal_handler),
        signal::SaFlags::SA_NODEFER,
        signal::SigSet::empty(),
    );
    unsafe {
        match signal::sigaction(signal::SIGINT, &sig_action) {
            Ok(_) => {}
            Err(e) => {
                println!("SIGINT signal set failed, {:?}", e);
            }
        }
    }

    let options = [
        fuser::MountOption::RW,
        fuser::MountOption::FSName("razorfs".to_string()),
    ];
    let retry_times = 3;
    match if matches.get_flag("front") { Ok(Fork::Child) } else { fork() } {
        Ok(Fork::Parent(child)) => {
            info!("Daemon running at pid: {}", child);
            Ok(())
        }
        Ok(Fork::Child) => {
            match retry_with_index(Fixed::from_millis(100), |current_try| {
                info!("[try {}/{}] Mount to {}", current_try, retry_times, abspath_mountpoint);
                let fs = match RazorFS::new(config.clone()) {
                    Ok(fs) => fs,
                    Err(e) => {
                        return OperationResult::Err(format!("Filesystem init failed: {}", e));
                    }
                };
                let res = fuser::mount2(fs, abspath_mountpoint, &options);
                match res {
                    Ok(_) => {
                        info!("All Done.");
                        OperationResult::Ok(())
                    }
                    Err(e) => {
                        if current_try > retry_times {
                            OperationResult::Err(format!("Failed to mount after {} retries! Err: {}", retry_times, e))
                        } else {
                            umount!();
                            info!("Umount Done.");
                            OperationResult::Retry("Failed to mount, trying to umount...".to_string())
                        }
                    }
                }
            }) {
                Ok(_) => Ok(()),
                Err(e) => Err(anyhow!("Mount failed with {}", e)),
            }
        }
        Err(e) => Err(anyhow!("Fork returns error {}", e)),
    }
}
