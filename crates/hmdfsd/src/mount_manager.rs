//! Mount lifecycle serialization
//!
//! The mount manager is the only place hmdfs instances are mounted and
//! unmounted. It keeps the device manager in lockstep with the mounted
//! groups: every successful mount joins a group, every unmount quits it,
//! and teardown unwinds in reverse insertion order so overlapping mounts
//! come apart dependencies-last.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use hmdfsd_core::{MountArgumentDescriptors, MountError};

use crate::mount_point::{MountInterface, MountPoint};

/// Group membership side of the mount lifecycle, implemented by the device
/// manager
pub trait GroupNotifier: Send + Sync {
    fn join_group(&self, mp: Arc<MountPoint>);
    fn quit_group(&self, mp: Arc<MountPoint>);
}

pub struct MountManager {
    mounter: Box<dyn MountInterface>,
    notifier: Arc<dyn GroupNotifier>,
    mount_points: Mutex<Vec<Arc<MountPoint>>>,
    cur_user: Mutex<Option<i32>>,
}

impl MountManager {
    pub fn new(mounter: Box<dyn MountInterface>, notifier: Arc<dyn GroupNotifier>) -> Self {
        Self {
            mounter,
            notifier,
            mount_points: Mutex::new(Vec::new()),
            cur_user: Mutex::new(None),
        }
    }

    /// Mount one hmdfs instance and join its group.
    ///
    /// A stale instance at the same destination is unmounted best-effort
    /// first, clearing leftover kernel state from a previous run.
    pub fn mount(&self, mp: MountPoint) -> Result<Arc<MountPoint>, MountError> {
        let mut mounted = self.mount_points.lock();
        if mounted.iter().any(|cur| **cur == mp) {
            let dst = mp.mount_argument().full_dst();
            error!("mount an existent mountpoint {dst}");
            return Err(MountError::AlreadyMounted(dst));
        }

        if let Err(e) = self.mounter.umount(mp.mount_argument()) {
            info!("pre-umount skipped: {e}");
        }
        self.mounter.mount(mp.mount_argument())?;

        let mp = Arc::new(mp);
        self.notifier.join_group(Arc::clone(&mp));
        mounted.push(Arc::clone(&mp));
        info!("mounted {mp}");
        Ok(mp)
    }

    /// Unmount a tracked instance and quit its group
    pub fn umount(&self, mp: &MountPoint) -> Result<(), MountError> {
        let mut mounted = self.mount_points.lock();
        let Some(idx) = mounted.iter().position(|cur| **cur == *mp) else {
            let dst = mp.mount_argument().full_dst();
            error!("umount a non-existent mountpoint {dst}");
            return Err(MountError::NotMounted(dst));
        };

        info!("umount begin for {mp}");
        self.mounter.umount(mp.mount_argument())?;
        let removed = mounted.remove(idx);
        self.notifier.quit_group(removed);
        info!("umount end");
        Ok(())
    }

    /// Unmount the accountless instance serving an auth group
    pub fn umount_by_group_id(&self, group_id: &str) -> Result<(), MountError> {
        if group_id.is_empty() {
            warn!("empty group id, no auth group to unmount");
            return Ok(());
        }
        let target = self
            .mount_points
            .lock()
            .iter()
            .find(|mp| {
                mp.is_account_less() && mp.mount_argument().relative_path == group_id
            })
            .cloned()
            .ok_or_else(|| MountError::UnknownGroup(group_id.to_string()))?;
        self.umount(&target)
    }

    /// Account switch: tear down the previous user's instance, then mount
    /// the default instance of the new user
    pub fn on_user_changed(&self, user_id: i32, account: &str) -> Result<(), MountError> {
        let previous = {
            let mut cur = self.cur_user.lock();
            let previous = *cur;
            *cur = Some(user_id);
            previous
        };
        info!("user changed to {user_id}");

        if let Some(old_id) = previous {
            let old = self
                .mount_points
                .lock()
                .iter()
                .find(|mp| mp.mount_argument().user_id == old_id && !mp.is_account_less())
                .cloned();
            match old {
                Some(old) => {
                    if let Err(e) = self.umount(&old) {
                        warn!("failed to stop user {old_id}'s instance: {e}");
                    }
                }
                None => warn!("no instance found for previous user {old_id}"),
            }
        }

        self.mount(MountPoint::new(MountArgumentDescriptors::alpha(
            user_id, account,
        )))?;
        Ok(())
    }

    /// Unmount everything, newest first
    pub fn teardown(&self) {
        let mut mounted = self.mount_points.lock();
        while let Some(mp) = mounted.pop() {
            if let Err(e) = self.mounter.umount(mp.mount_argument()) {
                warn!("teardown umount of {mp} failed: {e}");
            }
            self.notifier.quit_group(mp);
        }
    }

    /// Number of tracked instances
    pub fn mounted_count(&self) -> usize {
        self.mount_points.lock().len()
    }
}

impl Drop for MountManager {
    fn drop(&mut self) {
        self.teardown();
    }
}
