//! Mounted hmdfs instances
//!
//! A `MountPoint` is a value describing one mounted hmdfs instance; the
//! actual syscalls live behind `MountInterface` so the mount lifecycle can
//! be exercised without privileges.

use std::ffi::CString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{info, warn};

use hmdfsd_core::{MountArgument, MountError, HMDFS_FS_TYPE};

static NEXT_MOUNT_ID: AtomicU32 = AtomicU32::new(1);

/// One hmdfs instance, mounted or about to be
#[derive(Debug)]
pub struct MountPoint {
    id: u32,
    arg: MountArgument,
}

impl MountPoint {
    pub fn new(arg: MountArgument) -> Self {
        Self {
            id: NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed),
            arg,
        }
    }

    /// Process-unique id of this mount point
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mount_argument(&self) -> &MountArgument {
        &self.arg
    }

    pub fn ctrl_path(&self) -> PathBuf {
        self.arg.ctrl_path()
    }

    pub fn is_account_less(&self) -> bool {
        self.arg.accountless
    }
}

/// Two mount points are the same instance when they resolve to the same
/// destination
impl PartialEq for MountPoint {
    fn eq(&self, other: &Self) -> bool {
        self.arg.full_dst() == other.arg.full_dst()
    }
}

impl Eq for MountPoint {}

impl std::fmt::Display for MountPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mp {} -> {}", self.id, self.arg.full_dst())
    }
}

/// Mount/unmount syscall seam
pub trait MountInterface: Send + Sync {
    fn mount(&self, arg: &MountArgument) -> Result<(), MountError>;
    fn umount(&self, arg: &MountArgument) -> Result<(), MountError>;
}

/// The real thing: `mount(2)` of fstype hmdfs and `umount2(2, MNT_DETACH)`
pub struct HmdfsMounter;

fn cstring(s: &str) -> Result<CString, MountError> {
    CString::new(s).map_err(|_| MountError::Syscall {
        syscall: "mount",
        path: s.to_string(),
        source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
    })
}

impl MountInterface for HmdfsMounter {
    fn mount(&self, arg: &MountArgument) -> Result<(), MountError> {
        let src = arg.full_src();
        let dst = arg.full_dst();

        if arg.need_init_dir {
            for dir in [&src, &dst, &arg.cache_path()] {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    warn!("failed to prepare {dir}: {e}");
                }
            }
        }

        let c_src = cstring(&src)?;
        let c_dst = cstring(&dst)?;
        let c_type = cstring(HMDFS_FS_TYPE)?;
        let options = arg.options_string();
        let c_opts = cstring(&options)?;

        let ret = unsafe {
            libc::mount(
                c_src.as_ptr(),
                c_dst.as_ptr(),
                c_type.as_ptr(),
                arg.flags() as libc::c_ulong,
                c_opts.as_ptr().cast(),
            )
        };
        if ret != 0 {
            return Err(MountError::Syscall {
                syscall: "mount",
                path: dst,
                source: std::io::Error::last_os_error(),
            });
        }
        info!("mounted hmdfs at {dst} ({options})");
        Ok(())
    }

    fn umount(&self, arg: &MountArgument) -> Result<(), MountError> {
        let dst = arg.full_dst();
        let c_dst = cstring(&dst)?;

        let ret = unsafe { libc::umount2(c_dst.as_ptr(), libc::MNT_DETACH) };
        if ret != 0 {
            return Err(MountError::Syscall {
                syscall: "umount2",
                path: dst,
                source: std::io::Error::last_os_error(),
            });
        }
        info!("unmounted hmdfs at {dst}");
        Ok(())
    }
}
